//! Decoding of fixed-width instrumentation records.
//!
//! Every record is exactly [`RECORD_SIZE`] bytes, little-endian, laid out as
//! `struct event` in the probe sources. The length check happens once up
//! front, then fixed-width reads use unchecked unaligned loads.

use thiserror::Error;

use super::event::{HookKind, RawEvent};

/// Width of the `text1` field including its terminator.
pub const TEXT1_LEN: usize = 128;

/// Width of the `text2` field including its terminator.
pub const TEXT2_LEN: usize = 256;

/// Total wire size of one record: 8+4+4+4+8+8+128+256.
pub const RECORD_SIZE: usize = 36 + TEXT1_LEN + TEXT2_LEN;

const OFF_TIMESTAMP: usize = 0;
const OFF_PID: usize = 8;
const OFF_TID: usize = 12;
const OFF_HOOK: usize = 16;
const OFF_NUM1: usize = 20;
const OFF_NUM2: usize = 28;
const OFF_TEXT1: usize = 36;
const OFF_TEXT2: usize = OFF_TEXT1 + TEXT1_LEN;

/// Errors that can occur while decoding a record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("record too short: {size} bytes")]
    Truncated { size: usize },

    #[error("unknown hook kind: {raw}")]
    UnknownHookKind { raw: u32 },
}

impl DecodeError {
    /// Short label used for the `error_type` metric dimension.
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Truncated { .. } => "truncated",
            Self::UnknownHookKind { .. } => "unknown_hook",
        }
    }
}

/// Decode a raw record into a [`RawEvent`].
///
/// Trailing bytes past [`RECORD_SIZE`] are ignored. Text fields accept any
/// byte pattern: they are cut at the first NUL (or one byte short of the field
/// width) and converted lossily to UTF-8.
pub fn decode(data: &[u8]) -> Result<RawEvent, DecodeError> {
    if data.len() < RECORD_SIZE {
        return Err(DecodeError::Truncated { size: data.len() });
    }

    let hook_raw = read_u32_le(data, OFF_HOOK);
    let hook =
        HookKind::from_u32(hook_raw).ok_or(DecodeError::UnknownHookKind { raw: hook_raw })?;

    Ok(RawEvent {
        timestamp_ns: read_u64_le(data, OFF_TIMESTAMP),
        pid: read_u32_le(data, OFF_PID),
        tid: read_u32_le(data, OFF_TID),
        hook,
        num1: read_u64_le(data, OFF_NUM1),
        num2: read_u64_le(data, OFF_NUM2),
        text1: read_text(data, OFF_TEXT1, TEXT1_LEN),
        text2: read_text(data, OFF_TEXT2, TEXT2_LEN),
    })
}

// ---------------------------------------------------------------------------
// Byte-reading helpers (no indexing, no panics)
// ---------------------------------------------------------------------------

#[inline(always)]
fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(read_fixed::<4>(data, offset))
}

#[inline(always)]
fn read_u64_le(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(read_fixed::<8>(data, offset))
}

#[inline(always)]
fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    debug_assert!(offset + N <= data.len());
    // Safety: `decode` verifies `data.len() >= RECORD_SIZE` and every offset
    // plus width used here lies within RECORD_SIZE.
    unsafe { (data.as_ptr().add(offset) as *const [u8; N]).read_unaligned() }
}

/// Reads a NUL-terminated text field of `width` bytes.
///
/// At most `width - 1` bytes are kept, so the result never needs the final
/// terminator byte and never contains an embedded NUL.
fn read_text(data: &[u8], offset: usize, width: usize) -> String {
    let field = data.get(offset..offset + width - 1).unwrap_or(&[]);
    if field.first().copied().unwrap_or(0) == 0 {
        return String::new();
    }

    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    let trimmed = field.get(..end).unwrap_or(&[]);

    match std::str::from_utf8(trimmed) {
        Ok(s) => s.to_owned(),
        Err(_) => String::from_utf8_lossy(trimmed).into_owned(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
