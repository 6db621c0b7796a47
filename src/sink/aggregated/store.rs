use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::tracer::event::{HookPayload, RawEvent, DB_TYPE_POSTGRES};

use super::aggregate::{DbQuery, FsOp, Observation, SocketConnect};

/// Result of folding one event into the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// A new entry was created for the event's key.
    Created,
    /// An existing entry was updated.
    Updated,
    /// The event's key was empty; nothing was recorded.
    Skipped,
}

/// Per-application aggregates, keyed per hook kind.
#[derive(Debug, Default)]
struct AppState {
    databases: HashMap<String, DbQuery>,
    filesystem: HashMap<String, FsOp>,
    sockets: HashMap<u16, SocketConnect>,
}

impl AppState {
    fn apply(&mut self, event: &RawEvent) -> MergeOutcome {
        let ts = event.timestamp_ns;

        match event.payload() {
            HookPayload::DbExec { query } => {
                if query.is_empty() {
                    return MergeOutcome::Skipped;
                }
                match self.databases.get_mut(query) {
                    Some(entry) => {
                        entry.seen.record(ts);
                        MergeOutcome::Updated
                    }
                    None => {
                        self.databases.insert(
                            query.to_owned(),
                            DbQuery {
                                db_type: DB_TYPE_POSTGRES,
                                query: query.to_owned(),
                                seen: Observation::new(ts),
                            },
                        );
                        MergeOutcome::Created
                    }
                }
            }
            HookPayload::OpenAt { path, flags } => {
                if path.is_empty() {
                    return MergeOutcome::Skipped;
                }
                match self.filesystem.get_mut(path) {
                    Some(entry) => {
                        entry.seen.record(ts);
                        MergeOutcome::Updated
                    }
                    None => {
                        self.filesystem.insert(
                            path.to_owned(),
                            FsOp {
                                path: path.to_owned(),
                                flags,
                                seen: Observation::new(ts),
                            },
                        );
                        MergeOutcome::Created
                    }
                }
            }
            HookPayload::Connect { port } => match self.sockets.get_mut(&port) {
                Some(entry) => {
                    entry.seen.record(ts);
                    MergeOutcome::Updated
                }
                None => {
                    self.sockets.insert(
                        port,
                        SocketConnect {
                            port,
                            seen: Observation::new(ts),
                        },
                    );
                    MergeOutcome::Created
                }
            },
        }
    }

    fn snapshot(&self) -> AppSnapshot {
        AppSnapshot {
            databases: self.databases.values().cloned().collect(),
            filesystem: self.filesystem.values().cloned().collect(),
            sockets: self.sockets.values().cloned().collect(),
        }
    }
}

/// Point-in-time copy of one application's aggregates.
///
/// Entry order is unspecified; the manifest builder imposes any ordering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppSnapshot {
    pub databases: Vec<DbQuery>,
    pub filesystem: Vec<FsOp>,
    pub sockets: Vec<SocketConnect>,
}

impl AppSnapshot {
    pub fn entry_count(&self) -> usize {
        self.databases.len() + self.filesystem.len() + self.sockets.len()
    }
}

/// Shared aggregation state for every observed application.
///
/// One mutex covers all applications. A merge holds it for a single map
/// update and a snapshot for a copy of the maps, so the flush task never
/// blocks ingestion for longer than a clone.
#[derive(Debug, Default)]
pub struct AggregationStore {
    apps: Mutex<HashMap<Arc<str>, AppState>>,
}

impl AggregationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds `event` into the aggregates of `app`.
    ///
    /// The application is registered even when the event itself is skipped.
    pub fn merge(&self, app: &Arc<str>, event: &RawEvent) -> MergeOutcome {
        let mut apps = self.lock();
        apps.entry(Arc::clone(app)).or_default().apply(event)
    }

    /// Copy of one application's aggregates, if it has been seen.
    pub fn snapshot(&self, app: &str) -> Option<AppSnapshot> {
        self.lock().get(app).map(AppState::snapshot)
    }

    /// Copies of every application's aggregates, taken under one lock.
    pub fn snapshot_all(&self) -> Vec<(Arc<str>, AppSnapshot)> {
        self.lock()
            .iter()
            .map(|(app, state)| (Arc::clone(app), state.snapshot()))
            .collect()
    }

    /// Number of applications with state.
    pub fn app_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Arc<str>, AppState>> {
        // Merges never panic mid-update, so a poisoned map is still consistent.
        self.apps.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
