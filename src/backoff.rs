use std::cmp::min;
use std::time::Duration;

/// Schedule for retransmitting unacknowledged messages: the delay before retransmission
///  `n + 1` grows geometrically from the initial delay, up to a configured maximum.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RetryBackoff {
    initial: Duration,
    factor_eighths: u32,
    max: Duration,
}

impl RetryBackoff {
    pub fn new(initial: Duration, factor_eighths: u32, max: Duration) -> RetryBackoff {
        assert!(factor_eighths >= 8);
        RetryBackoff {
            initial,
            factor_eighths,
            max,
        }
    }

    /// The delay to wait for an acknowledgement after `retries_so_far` retransmissions
    pub fn delay(&self, retries_so_far: u32) -> Duration {
        let mut result = self.initial;
        for _ in 0..retries_so_far {
            if result >= self.max {
                break;
            }
            result = result * self.factor_eighths / 8;
        }
        min(result, self.max)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::constant_initial(100, 8, 1000, 0, 100)]
    #[case::constant_later(100, 8, 1000, 5, 100)]
    #[case::double_initial(100, 16, 1000, 0, 100)]
    #[case::double_1(100, 16, 1000, 1, 200)]
    #[case::double_3(100, 16, 1000, 3, 800)]
    #[case::double_capped(100, 16, 1000, 4, 1000)]
    #[case::double_capped_far(100, 16, 1000, 1000, 1000)]
    #[case::factor_1_5(100, 12, 1000, 2, 225)]
    fn test_delay(
        #[case] initial_millis: u64,
        #[case] factor_eighths: u32,
        #[case] max_millis: u64,
        #[case] retries_so_far: u32,
        #[case] expected_millis: u64,
    ) {
        let backoff = RetryBackoff::new(Duration::from_millis(initial_millis), factor_eighths, Duration::from_millis(max_millis));
        assert_eq!(backoff.delay(retries_so_far), Duration::from_millis(expected_millis));
    }
}
