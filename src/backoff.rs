//! Retry with bounded backoff.
//!
//! One policy object covers every retry site in the client: message sends,
//! local socket writes, local dials. The canonical schedule is
//! `delay_n = min(base * 2^n, max)`, optionally replaced by a uniform
//! sample from `[delay/2, 3*delay/2]`. Dial sites use a linear schedule
//! (`base * (n+1)`) without jitter.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Growth {
    Exponential,
    Linear,
}

/// A retry policy: schedule shape, cap, attempt budget, jitter.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Option<Duration>,
    max_attempts: u32,
    jitter: bool,
    growth: Growth,
}

impl Backoff {
    /// Exponential schedule with jitter, capped at `max`.
    #[must_use]
    pub fn exponential(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max: Some(max),
            max_attempts,
            jitter: true,
            growth: Growth::Exponential,
        }
    }

    /// Fixed delay between attempts, no jitter.
    #[must_use]
    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            base: delay,
            max: Some(delay),
            max_attempts,
            jitter: false,
            growth: Growth::Exponential,
        }
    }

    /// Linear schedule (`base * (attempt + 1)`), no jitter.
    #[must_use]
    pub fn linear(base: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max: None,
            max_attempts,
            jitter: false,
            growth: Growth::Linear,
        }
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Unjittered delay after the zero-indexed `attempt`.
    fn unjittered(&self, attempt: u32) -> Duration {
        let raw = match self.growth {
            Growth::Exponential => {
                let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
                self.base.checked_mul(factor).unwrap_or(Duration::MAX)
            }
            Growth::Linear => self
                .base
                .checked_mul(attempt + 1)
                .unwrap_or(Duration::MAX),
        };
        match self.max {
            Some(max) => raw.min(max),
            None => raw,
        }
    }

    /// Delay to sleep after the zero-indexed `attempt` fails.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.unjittered(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        // Uniform sample from [delay/2, 3*delay/2].
        let millis = delay.as_millis().max(1) as u64;
        let jittered = rand::thread_rng().gen_range(millis / 2..=millis + millis / 2);
        Duration::from_millis(jittered.max(1))
    }

    /// Run `op` until it succeeds or the attempt budget is exhausted.
    /// On exhaustion the last error comes back wrapped with the attempt
    /// count. No sleep follows the final failure.
    pub async fn retry<T, E, F, Fut>(&self, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut last = None;
        for attempt in 0..self.max_attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    last = Some(e);
                    if attempt + 1 < self.max_attempts {
                        tokio::time::sleep(self.delay_for(attempt)).await;
                    }
                }
            }
        }
        Err(RetryError {
            attempts: self.max_attempts,
            last: last.expect("retry with zero attempts"),
        })
    }
}

/// The last error from an exhausted retry budget.
#[derive(Debug)]
pub struct RetryError<E> {
    pub attempts: u32,
    pub last: E,
}

impl<E: std::fmt::Display> std::fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed after {} attempts: {}", self.attempts, self.last)
    }
}

impl<E: std::fmt::Display + std::fmt::Debug> std::error::Error for RetryError<E> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn exponential_delays_double_then_cap() {
        let policy = Backoff::exponential(Duration::from_millis(50), Duration::from_secs(2), 8);
        let unjittered: Vec<Duration> = (0..8).map(|n| policy.unjittered(n)).collect();
        assert_eq!(unjittered[0], Duration::from_millis(50));
        assert_eq!(unjittered[1], Duration::from_millis(100));
        assert_eq!(unjittered[4], Duration::from_millis(800));
        assert_eq!(unjittered[6], Duration::from_secs(2));
        assert_eq!(unjittered[7], Duration::from_secs(2));
        // Non-decreasing up to the cap.
        for pair in unjittered.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
    }

    #[test]
    fn jitter_stays_within_half_to_one_and_a_half() {
        let policy = Backoff::exponential(Duration::from_millis(100), Duration::from_secs(2), 5);
        for attempt in 0..5 {
            let raw = policy.unjittered(attempt).as_millis() as u64;
            for _ in 0..200 {
                let jittered = policy.delay_for(attempt).as_millis() as u64;
                assert!(jittered >= raw / 2, "{jittered} < {}", raw / 2);
                assert!(jittered <= raw + raw / 2, "{jittered} > {}", raw + raw / 2);
            }
        }
    }

    #[test]
    fn linear_delays_scale_with_attempt() {
        let policy = Backoff::linear(Duration::from_millis(200), 5);
        assert_eq!(policy.delay_for(0), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_returns_first_success() {
        let policy = Backoff::exponential(Duration::from_millis(10), Duration::from_millis(100), 5);
        let calls = AtomicU32::new(0);
        let result: Result<u32, RetryError<&str>> = policy
            .retry(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("not yet")
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_exhaustion_reports_attempt_count() {
        let policy = Backoff::fixed(Duration::from_millis(100), 3);
        let calls = AtomicU32::new(0);
        let result: Result<(), RetryError<&str>> = policy
            .retry(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("down") }
            })
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(err.last, "down");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
