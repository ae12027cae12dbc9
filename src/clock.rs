//! Wall-clock timestamps in the operator's local offset.
//!
//! The local offset can only be read reliably while the process is still
//! single-threaded, so the binary captures it once before starting the
//! runtime. Without that, each call tries the OS and falls back to UTC.

use std::sync::OnceLock;

use time::{OffsetDateTime, UtcOffset};

static LOCAL_OFFSET: OnceLock<UtcOffset> = OnceLock::new();

/// Capture the local UTC offset. Call before spawning any threads. Later
/// calls keep the first value.
pub fn init_local_offset() -> UtcOffset {
    *LOCAL_OFFSET.get_or_init(|| UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC))
}

/// The cached offset, if one was captured.
pub fn local_offset() -> Option<UtcOffset> {
    LOCAL_OFFSET.get().copied()
}

/// Current time in the local offset, or UTC when it cannot be determined.
pub fn now() -> OffsetDateTime {
    match local_offset() {
        Some(offset) => OffsetDateTime::now_utc().to_offset(offset),
        None => OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc()),
    }
}
