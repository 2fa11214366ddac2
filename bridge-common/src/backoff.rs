use std::time;

use crate::metrics_consts::SINK_BACKOFF_WAIT_SECONDS;

#[derive(Copy, Clone, Debug, PartialEq)]
/// The backoff policy the retrying sink uses to decide how long to wait before re-pushing failed messages.
pub struct ExponentialBackoff {
    /// Rate to multiply initial_interval with for every past attempt.
    backoff_rate: f64,
    /// The backoff interval for the first retry.
    initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: time::Duration,
}

impl ExponentialBackoff {
    pub fn new(
        backoff_rate: f64,
        initial_interval: time::Duration,
        maximum_interval: time::Duration,
    ) -> Self {
        Self {
            backoff_rate,
            initial_interval,
            maximum_interval,
        }
    }

    /// Calculate the time to wait before the retry following `attempt` failed attempts.
    ///
    /// Grows as `initial_interval * backoff_rate^attempt` and is clamped at `maximum_interval`.
    pub fn next(&self, attempt: u32) -> time::Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let candidate_nanos =
            self.initial_interval.as_nanos() as f64 * self.backoff_rate.powi(exponent);
        let maximum_nanos = self.maximum_interval.as_nanos() as f64;

        if !candidate_nanos.is_finite() || candidate_nanos >= maximum_nanos {
            return self.maximum_interval;
        }

        time::Duration::from_nanos(candidate_nanos.max(0.0) as u64)
    }

    /// Suspend the caller for `delay`. Nothing else runs on the consumer loop meanwhile.
    pub async fn wait(&self, delay: time::Duration) {
        metrics::histogram!(SINK_BACKOFF_WAIT_SECONDS).record(delay.as_secs_f64());
        tokio::time::sleep(delay).await;
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            backoff_rate: 2.0,
            initial_interval: time::Duration::from_millis(10),
            maximum_interval: time::Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_grows_exponentially_and_clamps() {
        let backoff = ExponentialBackoff::new(
            2.0,
            time::Duration::from_millis(100),
            time::Duration::from_millis(10000),
        );

        let waits: Vec<u128> = (0..10).map(|attempt| backoff.next(attempt).as_millis()).collect();

        assert_eq!(
            waits,
            vec![100, 200, 400, 800, 1600, 3200, 6400, 10000, 10000, 10000]
        );
    }

    #[test]
    fn test_next_never_decreases_for_large_attempts() {
        let backoff = ExponentialBackoff::new(
            3.0,
            time::Duration::from_millis(7),
            time::Duration::from_secs(5),
        );

        let mut previous = time::Duration::ZERO;
        for attempt in [0, 1, 2, 10, 100, 1000, u32::MAX] {
            let delay = backoff.next(attempt);
            assert!(delay >= previous);
            assert!(delay <= time::Duration::from_secs(5));
            previous = delay;
        }
        assert_eq!(backoff.next(u32::MAX), time::Duration::from_secs(5));
    }

    #[test]
    fn test_fractional_rate() {
        let backoff = ExponentialBackoff::new(
            1.5,
            time::Duration::from_millis(1000),
            time::Duration::from_millis(3000),
        );

        assert_eq!(backoff.next(0), time::Duration::from_millis(1000));
        assert_eq!(backoff.next(1), time::Duration::from_millis(1500));
        assert_eq!(backoff.next(2), time::Duration::from_millis(2250));
        assert_eq!(backoff.next(3), time::Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_sleeps_for_the_delay() {
        let backoff = ExponentialBackoff::default();
        let start = tokio::time::Instant::now();

        backoff.wait(time::Duration::from_millis(250)).await;

        assert!(start.elapsed() >= time::Duration::from_millis(250));
    }
}
