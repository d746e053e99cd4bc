//! Exponential reconnect backoff with jitter.

use std::time::Duration;

use rand::Rng;

use crate::config::schema::ReconnectConfig;

/// Delay before reconnect attempt `attempt` (1-based). Attempt 0 is immediate.
///
/// `base * 2^(attempt-1)`, capped at `max`, plus up to 10% jitter.
pub fn reconnect_delay(config: &ReconnectConfig, attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let factor = 2u64.saturating_pow(attempt - 1);
    let capped = config
        .base_delay_ms
        .saturating_mul(factor)
        .min(config.max_delay_ms);

    let jitter_range = capped / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ReconnectConfig {
        ReconnectConfig {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 1000,
        }
    }

    #[test]
    fn first_attempt_is_immediate() {
        assert_eq!(reconnect_delay(&config(), 0), Duration::ZERO);
    }

    #[test]
    fn doubles_per_attempt() {
        let d1 = reconnect_delay(&config(), 1).as_millis();
        assert!((100..110).contains(&d1));
        let d3 = reconnect_delay(&config(), 3).as_millis();
        assert!((400..440).contains(&d3));
    }

    #[test]
    fn capped_at_max() {
        let d = reconnect_delay(&config(), 30).as_millis();
        assert!((1000..1100).contains(&d));
    }
}
