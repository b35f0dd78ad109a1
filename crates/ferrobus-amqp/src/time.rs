//! Broker tick-time conversion and server timeout adjustment.
//!
//! The broker encodes UTC instants as ticks: 100-nanosecond intervals since
//! 0001-01-01T00:00:00Z. Lock expirations in link properties and management
//! responses arrive in that encoding.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Ticks per second (one tick is 100ns).
const TICKS_PER_SECOND: u64 = 10_000_000;
/// Tick count at the UNIX epoch (seconds from 0001-01-01 to 1970-01-01).
const EPOCH_IN_TICKS: u64 = 62_135_596_800 * TICKS_PER_SECOND;
/// Head start the client keeps so its own deadline fires after the server's.
const SERVER_TIMEOUT_BUFFER: Duration = Duration::from_millis(200);

/// Converts broker ticks to a `SystemTime`.
///
/// Values at or before the UNIX epoch collapse to the epoch itself, which
/// callers treat as "unknown".
pub fn ticks_to_system_time(ticks: i64) -> SystemTime {
    let ticks = u64::try_from(ticks).unwrap_or(0);
    let since_epoch = ticks.saturating_sub(EPOCH_IN_TICKS);
    UNIX_EPOCH + Duration::from_nanos(since_epoch.saturating_mul(100))
}

/// Converts a `SystemTime` to broker ticks.
pub fn system_time_to_ticks(time: SystemTime) -> i64 {
    let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or_default();
    let ticks = EPOCH_IN_TICKS + (since_epoch.as_nanos() / 100) as u64;
    i64::try_from(ticks).unwrap_or(i64::MAX)
}

/// Shortens a client-side operation timeout for transmission to the server,
/// so the server gives up slightly before the client does.
pub fn adjust_server_timeout(client_timeout: Duration) -> Duration {
    if client_timeout > SERVER_TIMEOUT_BUFFER * 2 {
        client_timeout - SERVER_TIMEOUT_BUFFER
    } else {
        client_timeout
    }
}
