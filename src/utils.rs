use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch.
pub fn get_epoch_time_in_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Seconds elapsed since an epoch-milliseconds timestamp.
pub fn get_elapsed_secs(since_epoch_ms: u64) -> f64 {
    let now = get_epoch_time_in_ms();
    now.saturating_sub(since_epoch_ms) as f64 / 1000.0
}
