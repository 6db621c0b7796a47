/// Occurrence statistics shared by every aggregate entry kind.
///
/// `first_seen_ns`/`last_seen_ns` track the min/max of observed timestamps, so
/// `first_seen_ns <= last_seen_ns` holds even if per-CPU buffers deliver events
/// slightly out of order. For in-order delivery this is the same as setting
/// `last_seen_ns` to the latest event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub first_seen_ns: u64,
    pub last_seen_ns: u64,
    pub count: u64,
}

impl Observation {
    /// Observation for the first event of a new key.
    pub fn new(ts_ns: u64) -> Self {
        Self {
            first_seen_ns: ts_ns,
            last_seen_ns: ts_ns,
            count: 1,
        }
    }

    /// Folds one more event into the observation.
    pub fn record(&mut self, ts_ns: u64) {
        self.first_seen_ns = self.first_seen_ns.min(ts_ns);
        self.last_seen_ns = self.last_seen_ns.max(ts_ns);
        self.count = self.count.saturating_add(1);
    }
}

/// A distinct database query issued by an application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbQuery {
    pub db_type: &'static str,
    pub query: String,
    pub seen: Observation,
}

/// A distinct filesystem path opened by an application.
///
/// `flags` are the open flags of the first event for this path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsOp {
    pub path: String,
    pub flags: u64,
    pub seen: Observation,
}

/// A distinct destination port connected to by an application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketConnect {
    pub port: u16,
    pub seen: Observation,
}
