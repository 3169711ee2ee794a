use serde::Deserialize;

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryBackoffConfig {
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryBackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 200,
            backoff_factor: 2.0,
            max_delay_ms: 10_000,
            jitter: true,
        }
    }
}

/// Delay before retry number `attempt` (1-based). A provider supplied
/// `retry_after_ms` hint wins when it is longer than the computed delay.
pub fn delay_for_attempt_ms(
    attempt: u32,
    config: &RetryBackoffConfig,
    jitter_seed: u64,
    retry_after_ms: Option<u64>,
) -> u64 {
    let exp = (attempt.saturating_sub(1)) as i32;
    let base = (config.initial_delay_ms as f64) * config.backoff_factor.powi(exp);
    let mut delay = base.min(config.max_delay_ms as f64);
    if config.jitter {
        delay *= jitter_factor(attempt, jitter_seed);
    }
    let delay = delay.round().max(0.0) as u64;
    match retry_after_ms {
        Some(hint) => delay.max(hint.min(config.max_delay_ms)),
        None => delay,
    }
}

fn jitter_factor(attempt: u32, jitter_seed: u64) -> f64 {
    let mut x = jitter_seed ^ ((attempt as u64) << 32) ^ 0x9E3779B97F4A7C15;
    x ^= x >> 12;
    x ^= x << 25;
    x ^= x >> 27;
    let r = x.wrapping_mul(0x2545F4914F6CDD1D);
    let unit = (r as f64) / (u64::MAX as f64);
    0.5 + unit
}
