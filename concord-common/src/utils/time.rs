use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current UNIX timestamp in milliseconds.
///
/// Used to stamp outgoing heartbeats and log entries. Protocol timing
/// (timeouts, staleness) is driven by the monotonic clock of the node loop,
/// never by this value. Returns 0 if the system clock is before the epoch.
pub fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
