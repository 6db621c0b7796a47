use std::sync::atomic::{AtomicU64, Ordering};

use super::event::{HookKind, MAX_HOOK_KIND};

/// Lock-free ingestion counters.
///
/// `snapshot()` atomically reads and resets all counters, making it
/// suitable for periodic reporting without contention.
pub struct EventStats {
    by_hook: [AtomicU64; MAX_HOOK_KIND + 1],
    decode_errors: AtomicU64,
    unattributed: AtomicU64,
}

/// Counters drained by [`EventStats::snapshot`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Non-zero per-hook counts in numeric hook order.
    pub by_hook: Vec<(HookKind, u64)>,
    pub decode_errors: u64,
    pub unattributed: u64,
}

impl StatsSnapshot {
    /// Total decoded events across all hook kinds.
    pub fn decoded(&self) -> u64 {
        self.by_hook.iter().map(|(_, n)| n).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hook.is_empty() && self.decode_errors == 0 && self.unattributed == 0
    }
}

impl EventStats {
    /// Create a new zeroed EventStats.
    pub fn new() -> Self {
        Self {
            by_hook: std::array::from_fn(|_| AtomicU64::new(0)),
            decode_errors: AtomicU64::new(0),
            unattributed: AtomicU64::new(0),
        }
    }

    /// Increment the counter for the given hook kind by one.
    pub fn record(&self, hook: HookKind) {
        if let Some(counter) = self.by_hook.get(hook as usize) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unattributed(&self) {
        self.unattributed.fetch_add(1, Ordering::Relaxed);
    }

    /// Atomically read and reset all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        let mut by_hook = Vec::new();

        for (i, counter) in self.by_hook.iter().enumerate() {
            let v = counter.swap(0, Ordering::Relaxed);
            if v > 0 {
                if let Some(hook) = u32::try_from(i).ok().and_then(HookKind::from_u32) {
                    by_hook.push((hook, v));
                }
            }
        }

        StatsSnapshot {
            by_hook,
            decode_errors: self.decode_errors.swap(0, Ordering::Relaxed),
            unattributed: self.unattributed.swap(0, Ordering::Relaxed),
        }
    }
}

impl Default for EventStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let stats = EventStats::new();
        stats.record(HookKind::OpenAt);
        stats.record(HookKind::OpenAt);
        stats.record(HookKind::Connect);
        stats.record_decode_error();

        let snap = stats.snapshot();
        assert_eq!(
            snap.by_hook,
            vec![(HookKind::Connect, 1), (HookKind::OpenAt, 2)]
        );
        assert_eq!(snap.decoded(), 3);
        assert_eq!(snap.decode_errors, 1);
        assert_eq!(snap.unattributed, 0);
    }

    #[test]
    fn test_snapshot_resets_counters() {
        let stats = EventStats::new();
        stats.record(HookKind::DbExec);
        stats.record_unattributed();

        let snap1 = stats.snapshot();
        assert!(!snap1.is_empty());

        let snap2 = stats.snapshot();
        assert!(snap2.is_empty());
    }
}
