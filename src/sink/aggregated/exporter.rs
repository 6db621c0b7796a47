use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::sink::manifest::AppManifest;

/// File name suffix shared by every manifest.
pub const MANIFEST_STEM_SUFFIX: &str = ".integrations";

/// Serialization format of written manifests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestFormat {
    #[default]
    Yaml,
    Json,
}

impl ManifestFormat {
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Yaml => "yaml",
            Self::Json => "json",
        }
    }
}

/// Errors from writing a single manifest.
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("creating output directory {}: {source}", path.display())]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("serializing manifest for {app}: {message}")]
    Serialize { app: String, message: String },

    #[error("writing manifest {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
}

/// Writes one manifest file per application into a directory.
///
/// Files are written to a hidden temp file first and renamed into place, so a
/// reader never sees a partially written manifest.
#[derive(Debug, Clone)]
pub struct FileExporter {
    dir: PathBuf,
    format: ManifestFormat,
}

impl FileExporter {
    pub fn new(dir: impl Into<PathBuf>, format: ManifestFormat) -> Self {
        Self {
            dir: dir.into(),
            format,
        }
    }

    /// Returns the exporter name for logging.
    pub fn name(&self) -> &str {
        "file"
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Final path of the manifest for `app`.
    pub fn manifest_path(&self, app: &str) -> PathBuf {
        self.dir.join(self.file_name(app))
    }

    fn file_name(&self, app: &str) -> String {
        format!(
            "{}{MANIFEST_STEM_SUFFIX}.{}",
            safe_filename(app),
            self.format.extension()
        )
    }

    /// Serialize and write `manifest`, replacing any previous version.
    pub async fn export(&self, manifest: &AppManifest) -> Result<PathBuf, ExportError> {
        let body = self.encode(manifest)?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| ExportError::CreateDir {
                path: self.dir.clone(),
                source,
            })?;

        let file_name = self.file_name(&manifest.application);
        let path = self.dir.join(&file_name);
        let tmp = self.dir.join(format!(".{file_name}.tmp"));

        if let Err(source) = tokio::fs::write(&tmp, &body).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(ExportError::Write { path: tmp, source });
        }

        if let Err(source) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(ExportError::Write { path, source });
        }

        debug!(
            app = %manifest.application,
            path = %path.display(),
            bytes = body.len(),
            "wrote manifest"
        );

        Ok(path)
    }

    fn encode(&self, manifest: &AppManifest) -> Result<Vec<u8>, ExportError> {
        let err = |message: String| ExportError::Serialize {
            app: manifest.application.clone(),
            message,
        };

        match self.format {
            ManifestFormat::Yaml => serde_yaml::to_string(manifest)
                .map(String::into_bytes)
                .map_err(|e| err(e.to_string())),
            ManifestFormat::Json => {
                let mut body =
                    serde_json::to_vec_pretty(manifest).map_err(|e| err(e.to_string()))?;
                body.push(b'\n');
                Ok(body)
            }
        }
    }
}

/// Encodes an application identity for use as a file name.
///
/// Bytes in `[A-Za-z0-9_.:@=+-]` pass through; every other byte of the UTF-8
/// encoding becomes `%XX`. A leading `.` is encoded too so manifests are never
/// hidden files. The mapping is injective: distinct identities never share a
/// manifest file.
pub fn safe_filename(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for (i, b) in s.bytes().enumerate() {
        match b {
            b'.' if i == 0 => out.push_str("%2E"),
            b'a'..=b'z'
            | b'A'..=b'Z'
            | b'0'..=b'9'
            | b'_'
            | b'.'
            | b':'
            | b'@'
            | b'='
            | b'-'
            | b'+' => out.push(char::from(b)),
            _ => {
                let _ = write!(out, "%{b:02X}");
            }
        }
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    use crate::sink::manifest::SocketEntry;

    fn manifest(app: &str) -> AppManifest {
        AppManifest {
            application: app.to_string(),
            generated_at: DateTime::<Utc>::UNIX_EPOCH,
            databases: Vec::new(),
            filesystem: Vec::new(),
            sockets: vec![SocketEntry {
                port: 5432,
                first_seen: DateTime::<Utc>::UNIX_EPOCH,
                last_seen: DateTime::<Utc>::UNIX_EPOCH,
                count: 2,
            }],
            http: Vec::new(),
        }
    }

    #[test]
    fn test_safe_filename() {
        assert_eq!(safe_filename("orders"), "orders");
        assert_eq!(safe_filename("svc-1.prod@eu:v2+x=y"), "svc-1.prod@eu:v2+x=y");
        assert_eq!(safe_filename("../../etc/passwd"), "%2E.%2F..%2Fetc%2Fpasswd");
        assert_eq!(safe_filename("a b/c"), "a%20b%2Fc");
        assert_eq!(safe_filename("100%"), "100%25");
        assert_eq!(safe_filename("caf\u{e9}"), "caf%C3%A9");
        assert_eq!(safe_filename("."), "%2E");
        assert_eq!(safe_filename(".."), "%2E.");
        assert_eq!(safe_filename("a.b"), "a.b");
    }

    #[test]
    fn test_safe_filename_distinct_identities_stay_distinct() {
        let ids = ["team a", "team/a", "team_a", "team%20a", "team%2Fa", "team\ta"];
        let names: std::collections::HashSet<_> = ids.iter().map(|id| safe_filename(id)).collect();
        assert_eq!(names.len(), ids.len());
    }

    #[test]
    fn test_manifest_path() {
        let e = FileExporter::new("/out", ManifestFormat::Yaml);
        assert_eq!(
            e.manifest_path("orders"),
            PathBuf::from("/out/orders.integrations.yaml")
        );
        let e = FileExporter::new("/out", ManifestFormat::Json);
        assert_eq!(
            e.manifest_path("a/b"),
            PathBuf::from("/out/a%2Fb.integrations.json")
        );
    }

    #[tokio::test]
    async fn test_export_yaml_creates_dir_and_file() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("nested/out");
        let e = FileExporter::new(&dir, ManifestFormat::Yaml);

        let path = e.export(&manifest("orders")).await.unwrap();
        assert_eq!(path, dir.join("orders.integrations.yaml"));

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("application: orders"));
        assert!(text.contains("port: 5432"));

        let leftovers: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_export_json_roundtrips() {
        let tmp = tempfile::tempdir().unwrap();
        let e = FileExporter::new(tmp.path(), ManifestFormat::Json);

        let path = e.export(&manifest("billing")).await.unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(value["application"], "billing");
        assert_eq!(value["sockets"][0]["count"], 2);
        assert_eq!(value["http"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_export_overwrites_previous() {
        let tmp = tempfile::tempdir().unwrap();
        let e = FileExporter::new(tmp.path(), ManifestFormat::Yaml);

        let mut m = manifest("orders");
        e.export(&m).await.unwrap();
        m.sockets[0].count = 9;
        let path = e.export(&m).await.unwrap();

        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.contains("count: 9"));
    }

    #[tokio::test]
    async fn test_export_fails_when_dir_is_a_file() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();

        let e = FileExporter::new(&blocker, ManifestFormat::Yaml);
        let err = e.export(&manifest("orders")).await.unwrap_err();
        assert!(matches!(err, ExportError::CreateDir { .. }));
    }
}
