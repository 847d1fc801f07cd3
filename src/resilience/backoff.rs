//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

/// Delay before retry number `attempt` (1-based).
///
/// Grows as `min * factor^(attempt - 1)`, capped at `max`, plus 0-10% jitter.
pub fn calculate_backoff(attempt: u32, min: Duration, max: Duration, factor: f64) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let base_ms = min.as_millis() as f64;
    let max_ms = max.as_millis() as f64;
    let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
    let delay_ms = base_ms * factor.max(1.0).powi(exponent);
    let capped_delay = if delay_ms.is_finite() {
        delay_ms.min(max_ms) as u64
    } else {
        max_ms as u64
    };

    // Apply jitter (0 to 10% of the delay)
    let jitter_range = capped_delay / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped_delay + jitter)
}

/// Parse a `Retry-After` header given in seconds.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_backoff_calculation() {
        let b1 = calculate_backoff(1, ms(100), ms(2000), 2.0);
        assert!(b1 >= ms(100) && b1 < ms(110));

        let b2 = calculate_backoff(2, ms(100), ms(2000), 2.0);
        assert!(b2 >= ms(200) && b2 < ms(220));

        let max = calculate_backoff(10, ms(100), ms(1000), 2.0);
        assert!(max >= ms(1000) && max < ms(1100));
    }

    #[test]
    fn test_backoff_factor_and_overflow() {
        let b3 = calculate_backoff(3, ms(100), ms(60_000), 3.0);
        assert!(b3 >= ms(900) && b3 < ms(990));

        let huge = calculate_backoff(u32::MAX, ms(500), ms(30_000), 2.0);
        assert!(huge >= ms(30_000));
        assert_eq!(calculate_backoff(0, ms(500), ms(30_000), 2.0), Duration::ZERO);
    }

    #[test]
    fn test_retry_after_seconds() {
        assert_eq!(parse_retry_after(" 3 "), Some(Duration::from_secs(3)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }
}
