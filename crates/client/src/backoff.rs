//! Reconnect delay schedule.
//!
//! `delay(n) = min(INITIAL * MULTIPLIER^n, MAX)`.

use std::time::Duration;

pub const INITIAL_DELAY_MS: f64 = 1000.0;
pub const MULTIPLIER: f64 = 1.5;
pub const MAX_DELAY_MS: f64 = 30_000.0;

/// Delay before reconnect attempt number `attempt` (0-based).
pub fn reconnect_delay(attempt: u32) -> Duration {
    // 1.5^64 is far past the cap; clamping keeps the cast to i32 safe
    let exponent = attempt.min(64) as i32;
    let ms = (INITIAL_DELAY_MS * MULTIPLIER.powi(exponent)).min(MAX_DELAY_MS);
    Duration::from_millis(ms as u64)
}
