use std::time::Duration;

use rand::Rng;

use crate::config::LeafRetryConfig;

fn base_delay_ms(config: &LeafRetryConfig, attempt: u32) -> u64 {
    if attempt == 0 {
        return 0;
    }

    let exp = attempt.saturating_sub(1).min(62) as i32;
    let scaled = (config.backoff_base_ms as f64) * 2f64.powi(exp);
    let capped = scaled.min(config.backoff_max_ms as f64);
    capped.max(0.0) as u64
}

fn jittered_delay_ms(config: &LeafRetryConfig, attempt: u32, rng: &mut impl Rng) -> u64 {
    let base = base_delay_ms(config, attempt);
    if base == 0 {
        return 0;
    }

    let upper_cap = config.backoff_max_ms.max(1);
    let capped = base.min(upper_cap);
    let spread = capped as f64 * f64::from(config.jitter_ratio.max(0.0));
    if spread < 1.0 {
        return capped;
    }
    let lower = (capped as f64 - spread).max(1.0);
    let upper = (capped as f64 + spread).min(upper_cap as f64);
    if upper <= lower {
        return lower.round() as u64;
    }

    rng.random_range(lower..=upper).round() as u64
}

/// How long a leaf must wait after starting attempt number `attempt`.
pub fn leaf_backoff(config: &LeafRetryConfig, attempt: u32) -> Duration {
    Duration::from_millis(jittered_delay_ms(config, attempt, &mut rand::rng()))
}
