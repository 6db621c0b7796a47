//! Translation of probe timestamps into wall-clock time.
//!
//! Probes stamp records with `bpf_ktime_get_ns()`, a monotonic clock that
//! starts at boot. In `raw` mode the value is rendered as if it were
//! nanoseconds since the Unix epoch. In `monotonic` mode a wall-minus-monotonic
//! offset captured once at startup is added first.

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How record timestamps map onto wall-clock time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampMode {
    /// Timestamps are already nanoseconds since the Unix epoch.
    #[default]
    Raw,
    /// Timestamps come from `CLOCK_MONOTONIC` and need anchoring.
    Monotonic,
}

/// Fixed offset applied to every record timestamp before rendering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockAnchor {
    offset_ns: i64,
}

impl ClockAnchor {
    /// Anchor with an explicit offset.
    pub const fn with_offset(offset_ns: i64) -> Self {
        Self { offset_ns }
    }

    /// Capture the anchor for `mode` from the current clocks.
    pub fn capture(mode: TimestampMode) -> Self {
        match mode {
            TimestampMode::Raw => Self::default(),
            TimestampMode::Monotonic => {
                let wall = wall_ns();
                let mono = monotonic_ns();
                Self::with_offset(wall.saturating_sub(mono))
            }
        }
    }

    pub fn offset_ns(&self) -> i64 {
        self.offset_ns
    }

    /// Wall-clock instant of a record timestamp.
    pub fn to_datetime(&self, ts_ns: u64) -> DateTime<Utc> {
        let ts = i64::try_from(ts_ns).unwrap_or(i64::MAX);
        DateTime::from_timestamp_nanos(ts.saturating_add(self.offset_ns))
    }
}

fn wall_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Returns current monotonic clock value in nanoseconds.
#[allow(clippy::unnecessary_cast)]
fn monotonic_ns() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `clock_gettime(CLOCK_MONOTONIC, ...)` is thread-safe and does not
    // require any Rust-side invariants besides a valid pointer.
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } == 0 {
        (ts.tv_sec as i64)
            .saturating_mul(1_000_000_000)
            .saturating_add(ts.tv_nsec as i64)
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_mode_is_identity() {
        let anchor = ClockAnchor::capture(TimestampMode::Raw);
        assert_eq!(anchor.offset_ns(), 0);
        assert_eq!(anchor.to_datetime(0), DateTime::<Utc>::UNIX_EPOCH);
        assert_eq!(
            anchor.to_datetime(1_500_000_000).timestamp_nanos_opt(),
            Some(1_500_000_000)
        );
    }

    #[test]
    fn test_offset_applied() {
        let anchor = ClockAnchor::with_offset(1_000);
        assert_eq!(anchor.to_datetime(5).timestamp_nanos_opt(), Some(1_005));
    }

    #[test]
    fn test_monotonic_anchor_lands_near_now() {
        let anchor = ClockAnchor::capture(TimestampMode::Monotonic);
        let rendered = anchor.to_datetime(u64::try_from(monotonic_ns()).unwrap_or(0));
        let drift = (Utc::now() - rendered).num_seconds().abs();
        assert!(drift < 5, "drift {drift}s");
    }

    #[test]
    fn test_huge_timestamp_does_not_panic() {
        let anchor = ClockAnchor::with_offset(i64::MAX);
        let _ = anchor.to_datetime(u64::MAX);
    }
}
