//! Reconnect delay computation.

use crate::config::ReconnectConfig;
use rand::Rng;
use std::time::Duration;

/// Delay before reconnect attempt `attempt` (0-indexed):
/// `min(max_delay, base_delay * 2^attempt) + uniform(0, delay * jitter)`.
pub fn reconnect_delay(attempt: u32, config: &ReconnectConfig) -> Duration {
    let base = config.base_delay.as_millis() as u64;
    let max = config.max_delay.as_millis() as u64;
    let delay = base
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(max);
    let jitter_cap = (delay as f64 * config.jitter_factor) as u64;
    let jitter = if jitter_cap == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter_cap)
    };
    Duration::from_millis(delay + jitter)
}
