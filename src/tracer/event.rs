use std::fmt;

/// HookKind identifies which probe produced a record.
/// Values must match the `hook_id` field written by the instrumentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum HookKind {
    Connect = 1,
    OpenAt = 2,
    DbExec = 3,
}

/// Maximum HookKind value, used for array sizing.
pub const MAX_HOOK_KIND: usize = 3;

impl HookKind {
    /// Returns the canonical metric/log label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::OpenAt => "openat",
            Self::DbExec => "db_exec",
        }
    }

    /// Convert from the raw wire tag.
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::Connect),
            2 => Some(Self::OpenAt),
            3 => Some(Self::DbExec),
            _ => None,
        }
    }

    /// Return all hook kinds in numeric order.
    pub fn all() -> &'static [Self] {
        &[Self::Connect, Self::OpenAt, Self::DbExec]
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Database flavour recorded for `DbExec` entries. Only libpq is probed today.
pub const DB_TYPE_POSTGRES: &str = "postgres";

/// A decoded instrumentation record.
///
/// `num1`, `num2`, `text1` and `text2` are kept verbatim; their meaning depends
/// on `hook` and is exposed through [`RawEvent::payload`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub timestamp_ns: u64,
    pub pid: u32,
    pub tid: u32,
    pub hook: HookKind,
    pub num1: u64,
    pub num2: u64,
    /// Path (OpenAt) or query text (DbExec). At most 127 bytes.
    pub text1: String,
    /// Reserved for request bodies. At most 255 bytes.
    pub text2: String,
}

/// Hook-specific view of a [`RawEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPayload<'a> {
    Connect { port: u16 },
    OpenAt { path: &'a str, flags: u64 },
    DbExec { query: &'a str },
}

impl RawEvent {
    /// Interprets the generic numeric and text fields for this hook kind.
    pub fn payload(&self) -> HookPayload<'_> {
        match self.hook {
            HookKind::Connect => HookPayload::Connect {
                port: (self.num2 & 0xFFFF) as u16,
            },
            HookKind::OpenAt => HookPayload::OpenAt {
                path: &self.text1,
                flags: self.num2,
            },
            HookKind::DbExec => HookPayload::DbExec { query: &self.text1 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(hook: HookKind, num2: u64, text1: &str) -> RawEvent {
        RawEvent {
            timestamp_ns: 10,
            pid: 100,
            tid: 101,
            hook,
            num1: 0,
            num2,
            text1: text1.to_string(),
            text2: String::new(),
        }
    }

    #[test]
    fn test_hook_kind_roundtrip() {
        for i in 1..=MAX_HOOK_KIND as u32 {
            let hook = HookKind::from_u32(i).expect("valid hook kind");
            assert_eq!(hook as u32, i);
        }
        assert!(HookKind::from_u32(0).is_none());
        assert!(HookKind::from_u32(4).is_none());
    }

    #[test]
    fn test_hook_kind_display() {
        assert_eq!(HookKind::Connect.to_string(), "connect");
        assert_eq!(HookKind::OpenAt.to_string(), "openat");
        assert_eq!(HookKind::DbExec.to_string(), "db_exec");
        assert_eq!(HookKind::all().len(), MAX_HOOK_KIND);
    }

    #[test]
    fn test_connect_payload_uses_low_16_bits() {
        let ev = event(HookKind::Connect, 0xABCD_0000_1538, "ignored");
        assert_eq!(ev.payload(), HookPayload::Connect { port: 5432 });
    }

    #[test]
    fn test_openat_payload() {
        let ev = event(HookKind::OpenAt, 0o2101, "/etc/passwd");
        assert_eq!(
            ev.payload(),
            HookPayload::OpenAt {
                path: "/etc/passwd",
                flags: 0o2101
            }
        );
    }

    #[test]
    fn test_db_exec_payload() {
        let ev = event(HookKind::DbExec, 7, "SELECT 1");
        assert_eq!(ev.payload(), HookPayload::DbExec { query: "SELECT 1" });
    }
}
