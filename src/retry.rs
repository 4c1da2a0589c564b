use std::thread;
use std::time::Duration;

use tracing::warn;

/// Retry with a delay that grows linearly: `base * attempt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearBackoff {
    /// Retries after the first attempt.
    pub retries: u32,
    pub base_delay: Duration,
}

impl LinearBackoff {
    pub fn new(retries: u32, base_delay: Duration) -> Self {
        Self {
            retries,
            base_delay,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }

    /// Call `op` until it succeeds, `retryable` rejects the error, or the
    /// retries run out. `on_retry` sees each retried error.
    pub fn run<T, E, F, R, N>(&self, mut op: F, retryable: R, mut on_retry: N) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        R: Fn(&E) -> bool,
        N: FnMut(u32, &E),
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.retries && retryable(&err) => {
                    attempt += 1;
                    let delay = self.delay(attempt);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "Retrying");
                    on_retry(attempt, &err);
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_linearly() {
        let backoff = LinearBackoff::new(3, Duration::from_secs(3));
        assert_eq!(backoff.delay(1), Duration::from_secs(3));
        assert_eq!(backoff.delay(3), Duration::from_secs(9));
    }

    #[test]
    fn gives_up_after_retries() {
        let backoff = LinearBackoff::new(2, Duration::ZERO);
        let mut calls = 0;
        let mut seen = Vec::new();
        let result: Result<(), String> = backoff.run(
            || {
                calls += 1;
                Err("flaky".to_string())
            },
            |_| true,
            |attempt, _| seen.push(attempt),
        );
        assert!(result.is_err());
        assert_eq!(calls, 3);
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn non_retryable_errors_return_immediately() {
        let backoff = LinearBackoff::new(5, Duration::ZERO);
        let mut calls = 0;
        let result: Result<(), String> = backoff.run(
            || {
                calls += 1;
                Err("fatal".to_string())
            },
            |err| err != "fatal",
            |_, _| {},
        );
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
