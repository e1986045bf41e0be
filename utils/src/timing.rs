// Timekeeping helpers
//
// Austin Shafer - 2020
use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current time in milliseconds since the epoch.
///
/// This is used to stamp log messages and to measure rough
/// CPU-side frame timings.
pub fn get_current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("System time is before the unix epoch")
        .as_millis() as u64
}
