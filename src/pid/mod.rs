//! Process id to application identity resolution.
//!
//! A process opts in by exporting the identity variable (`CODEINT_SERVICE` by
//! default). The first lookup for a pid reads `/proc/<pid>/environ`; every
//! later lookup, including a failed one, is served from the cache. Entries are
//! never evicted, so a recycled pid keeps the identity of its first owner.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::trace;

/// Default environment variable carrying the application identity.
pub const DEFAULT_IDENTITY_VAR: &str = "CODEINT_SERVICE";

/// Resolved identity of a process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    /// The process opted in under this application name.
    Known(Arc<str>),
    /// The process is gone, unreadable, or did not opt in.
    Unknown,
}

impl Identity {
    pub fn app(&self) -> Option<&Arc<str>> {
        match self {
            Self::Known(app) => Some(app),
            Self::Unknown => None,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Self::Known(_))
    }
}

/// Source of raw `environ` blobs.
pub trait EnvironSource: Send + Sync {
    /// Read the NUL-separated environment of `pid`.
    fn read_environ(&self, pid: u32) -> io::Result<Vec<u8>>;
}

/// Reads environments from a procfs mount.
pub struct ProcEnviron {
    root: PathBuf,
}

impl ProcEnviron {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for ProcEnviron {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl EnvironSource for ProcEnviron {
    fn read_environ(&self, pid: u32) -> io::Result<Vec<u8>> {
        std::fs::read(self.root.join(pid.to_string()).join("environ"))
    }
}

/// Caching pid → identity resolver. Safe to share across tasks.
pub struct IdentityResolver {
    source: Box<dyn EnvironSource>,
    var: String,
    cache: DashMap<u32, Identity>,
}

impl IdentityResolver {
    pub fn new(source: Box<dyn EnvironSource>, var: impl Into<String>) -> Self {
        Self {
            source,
            var: var.into(),
            cache: DashMap::with_capacity(64),
        }
    }

    /// Resolver backed by procfs at `proc_root`.
    pub fn from_proc(proc_root: impl Into<PathBuf>, var: impl Into<String>) -> Self {
        Self::new(Box::new(ProcEnviron::new(proc_root)), var)
    }

    /// Resolve the identity of `pid`, consulting the source at most once.
    pub fn resolve(&self, pid: u32) -> Identity {
        if let Some(hit) = self.cache.get(&pid) {
            return hit.value().clone();
        }

        // Concurrent first lookups for the same pid may both read the source;
        // the entry API keeps whichever result lands first.
        let identity = self.lookup(pid);
        self.cache.entry(pid).or_insert(identity).value().clone()
    }

    /// Number of pids with a cached result.
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    fn lookup(&self, pid: u32) -> Identity {
        let data = match self.source.read_environ(pid) {
            Ok(data) => data,
            Err(e) => {
                trace!(pid, error = %e, "environ unreadable");
                return Identity::Unknown;
            }
        };

        match parse_environ(&data, &self.var) {
            Some(app) => Identity::Known(Arc::from(app)),
            None => Identity::Unknown,
        }
    }
}

/// Extract `var` from a NUL-separated `KEY=VALUE` blob.
///
/// Returns `None` when the variable is absent or its value is empty. Values
/// are converted lossily to UTF-8.
pub fn parse_environ(data: &[u8], var: &str) -> Option<String> {
    let key = var.as_bytes();

    data.split(|&b| b == 0).find_map(|entry| {
        let value = entry.strip_prefix(key)?.strip_prefix(b"=")?;
        if value.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(value).into_owned())
        }
    })
}
