//! Per-application manifest document.
//!
//! [`ManifestBuilder::build`] is a pure function of an [`AppSnapshot`]; it
//! performs no I/O and reads no clocks, so the caller supplies `generated_at`.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::clock::ClockAnchor;
use crate::sink::aggregated::aggregate::Observation;
use crate::sink::aggregated::store::AppSnapshot;

/// Manifest describing the integrations one application exercised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppManifest {
    pub application: String,
    pub generated_at: DateTime<Utc>,
    pub databases: Vec<DbQueryEntry>,
    pub filesystem: Vec<FsOpEntry>,
    pub sockets: Vec<SocketEntry>,
    /// No probe produces HTTP calls yet; always empty.
    pub http: Vec<HttpCallEntry>,
}

impl AppManifest {
    pub fn entry_count(&self) -> usize {
        self.databases.len() + self.filesystem.len() + self.sockets.len() + self.http.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DbQueryEntry {
    pub db_type: String,
    pub query: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FsOpEntry {
    pub path: String,
    pub flags: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SocketEntry {
    pub port: u16,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HttpCallEntry {
    pub direction: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub method: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub url: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub count: u64,
}

/// Converts aggregate snapshots into manifests.
#[derive(Debug, Clone, Copy)]
pub struct ManifestBuilder {
    sort_entries: bool,
    anchor: ClockAnchor,
}

impl ManifestBuilder {
    pub fn new(sort_entries: bool, anchor: ClockAnchor) -> Self {
        Self {
            sort_entries,
            anchor,
        }
    }

    pub fn build(
        &self,
        app: &str,
        snapshot: &AppSnapshot,
        generated_at: DateTime<Utc>,
    ) -> AppManifest {
        let mut databases: Vec<DbQueryEntry> = snapshot
            .databases
            .iter()
            .map(|d| {
                let (first_seen, last_seen, count) = self.times(&d.seen);
                DbQueryEntry {
                    db_type: d.db_type.to_string(),
                    query: d.query.clone(),
                    first_seen,
                    last_seen,
                    count,
                }
            })
            .collect();

        let mut filesystem: Vec<FsOpEntry> = snapshot
            .filesystem
            .iter()
            .map(|f| {
                let (first_seen, last_seen, count) = self.times(&f.seen);
                FsOpEntry {
                    path: f.path.clone(),
                    flags: f.flags,
                    first_seen,
                    last_seen,
                    count,
                }
            })
            .collect();

        let mut sockets: Vec<SocketEntry> = snapshot
            .sockets
            .iter()
            .map(|s| {
                let (first_seen, last_seen, count) = self.times(&s.seen);
                SocketEntry {
                    port: s.port,
                    first_seen,
                    last_seen,
                    count,
                }
            })
            .collect();

        if self.sort_entries {
            databases.sort_unstable_by(|a, b| a.query.cmp(&b.query));
            filesystem.sort_unstable_by(|a, b| a.path.cmp(&b.path));
            sockets.sort_unstable_by_key(|s| s.port);
        }

        AppManifest {
            application: app.to_string(),
            generated_at,
            databases,
            filesystem,
            sockets,
            http: Vec::new(),
        }
    }

    fn times(&self, seen: &Observation) -> (DateTime<Utc>, DateTime<Utc>, u64) {
        (
            self.anchor.to_datetime(seen.first_seen_ns),
            self.anchor.to_datetime(seen.last_seen_ns),
            seen.count,
        )
    }
}
