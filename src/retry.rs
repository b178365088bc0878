// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Policy
//!
//! Exponential backoff with optional jitter, a generic async retry runner and the
//! classification of transient failures. The same strategy type drives publish
//! retries and broker reconnection.

use crate::errors::EventHubError;
use rand::Rng;
use std::{fmt::Display, future::Future, time::Duration};
use tracing::debug;

/// Fraction of the computed delay used as the jitter range, in both directions.
pub const JITTER_RATIO: f64 = 0.25;

/// Message fragments that mark a failure as transient.
const RETRYABLE_PATTERNS: &[&str] = &[
    "econnrefused",
    "connection refused",
    "enotfound",
    "failed to lookup address",
    "name or service not known",
    "etimedout",
    "timed out",
    "econnreset",
    "connection reset",
    "epipe",
    "broken pipe",
    "channel closed",
    "connection closed",
];

/// Hook invoked before every retry with the 1-based attempt number, the failure
/// and the delay about to be waited.
pub type OnRetry = dyn Fn(u32, &EventHubError, Duration) + Send + Sync;

/// Backoff configuration. Holds no mutable state and can be shared freely.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryStrategy {
    /// Number of retries after the first attempt. `None` retries forever.
    pub max_retries: Option<u32>,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any computed delay.
    pub max_delay: Duration,
    /// Growth factor applied per attempt.
    pub multiplier: f64,
    /// Whether to spread delays by up to 25% either way.
    pub jitter: bool,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryStrategy {
    /// Strategy that retries until the operation succeeds.
    pub fn unbounded(initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_retries: None,
            initial_delay,
            max_delay,
            multiplier,
            jitter: true,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }
}

/// Computes the delay before retrying after the given 0-based attempt.
///
/// The value is `min(initial_delay * multiplier^attempt, max_delay)`. With jitter
/// enabled a uniform offset within ±25% of that value is added. The result is
/// floored to whole milliseconds and never negative.
pub fn calculate_delay(attempt: u32, strategy: &RetryStrategy) -> Duration {
    calculate_delay_with_rng(attempt, strategy, &mut rand::thread_rng())
}

/// Same as [`calculate_delay`] with an explicit random source.
pub fn calculate_delay_with_rng<R: Rng + ?Sized>(
    attempt: u32,
    strategy: &RetryStrategy,
    rng: &mut R,
) -> Duration {
    let initial_ms = strategy.initial_delay.as_millis() as f64;
    let max_ms = strategy.max_delay.as_millis() as f64;

    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let mut delay_ms = (initial_ms * strategy.multiplier.powi(exponent)).min(max_ms);

    if strategy.jitter {
        let offset = rng.gen_range(-JITTER_RATIO..=JITTER_RATIO);
        delay_ms += delay_ms * offset;
    }

    if !delay_ms.is_finite() || delay_ms <= 0.0 {
        return Duration::ZERO;
    }

    Duration::from_millis(delay_ms.floor() as u64)
}

/// Tells whether an error message describes a transient network condition.
pub fn is_retryable_error<E: Display + ?Sized>(error: &E) -> bool {
    let message = error.to_string().to_lowercase();
    RETRYABLE_PATTERNS
        .iter()
        .any(|pattern| message.contains(pattern))
}

/// Runs `operation` until it succeeds or the strategy's retry budget is spent.
///
/// The operation is invoked at most `max_retries + 1` times. Running out of
/// retries yields [`EventHubError::RetriesExhausted`] wrapping the last failure.
pub async fn with_retry<T, F, Fut>(
    strategy: &RetryStrategy,
    operation: F,
    on_retry: Option<&OnRetry>,
) -> Result<T, EventHubError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EventHubError>>,
{
    run(strategy, operation, on_retry, |_| true).await
}

/// Like [`with_retry`], but gives up at once on errors that are not transient.
///
/// A permanent failure is returned as-is, without waiting and without wrapping.
pub async fn with_retry_if_retryable<T, F, Fut>(
    strategy: &RetryStrategy,
    operation: F,
    on_retry: Option<&OnRetry>,
) -> Result<T, EventHubError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EventHubError>>,
{
    run(strategy, operation, on_retry, EventHubError::is_retryable).await
}

/// Like [`with_retry`], but only retries failures accepted by `should_retry`.
///
/// A rejected failure is returned as-is, without waiting and without wrapping.
pub async fn with_retry_when<T, F, Fut, C>(
    strategy: &RetryStrategy,
    operation: F,
    on_retry: Option<&OnRetry>,
    should_retry: C,
) -> Result<T, EventHubError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EventHubError>>,
    C: Fn(&EventHubError) -> bool,
{
    run(strategy, operation, on_retry, should_retry).await
}

async fn run<T, F, Fut, C>(
    strategy: &RetryStrategy,
    mut operation: F,
    on_retry: Option<&OnRetry>,
    should_retry: C,
) -> Result<T, EventHubError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EventHubError>>,
    C: Fn(&EventHubError) -> bool,
{
    let mut attempt: u32 = 0;

    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !should_retry(&err) {
            debug!(error = err.to_string(), "permanent failure, not retrying");
            return Err(err);
        }

        if let Some(max) = strategy.max_retries {
            if attempt >= max {
                return Err(EventHubError::RetriesExhausted {
                    retries: max,
                    source: Box::new(err),
                });
            }
        }

        let delay = calculate_delay(attempt, strategy);
        attempt = attempt.saturating_add(1);

        if let Some(hook) = on_retry {
            hook(attempt, &err, delay);
        }

        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    fn strategy(jitter: bool) -> RetryStrategy {
        RetryStrategy {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(5_000),
            multiplier: 2.0,
            jitter,
        }
    }

    #[test]
    fn delay_without_jitter_is_exact() {
        let strategy = strategy(false);

        assert_eq!(calculate_delay(0, &strategy), Duration::from_millis(100));
        assert_eq!(calculate_delay(1, &strategy), Duration::from_millis(200));
        assert_eq!(calculate_delay(2, &strategy), Duration::from_millis(400));
        assert_eq!(calculate_delay(5, &strategy), Duration::from_millis(3_200));
    }

    #[test]
    fn delay_is_capped_at_max_delay() {
        let strategy = strategy(false);

        assert_eq!(calculate_delay(6, &strategy), Duration::from_millis(5_000));
        assert_eq!(calculate_delay(60, &strategy), Duration::from_millis(5_000));
        assert_eq!(calculate_delay(u32::MAX, &strategy), Duration::from_millis(5_000));
    }

    #[test]
    fn jitter_stays_within_a_quarter_of_the_base_delay() {
        let jittered = strategy(true);
        let exact = strategy(false);
        let mut rng = StdRng::seed_from_u64(42);

        for attempt in 0..12 {
            let base = calculate_delay(attempt, &exact).as_millis() as f64;
            for _ in 0..50 {
                let delay = calculate_delay_with_rng(attempt, &jittered, &mut rng).as_millis() as f64;
                assert!(delay >= (base * 0.75).floor(), "{delay} below range of {base}");
                assert!(delay <= base * 1.25, "{delay} above range of {base}");
            }
        }
    }

    #[test]
    fn zero_initial_delay_never_goes_negative() {
        let strategy = strategy(true).with_initial_delay(Duration::ZERO);
        assert_eq!(calculate_delay(3, &strategy), Duration::ZERO);
    }

    #[test]
    fn classifies_transient_messages() {
        for message in [
            "connect ECONNREFUSED 127.0.0.1:5672",
            "getaddrinfo ENOTFOUND rabbitmq",
            "ETIMEDOUT",
            "read ECONNRESET",
            "Channel closed",
            "Connection closed: 320 (CONNECTION-FORCED)",
            "Connection refused (os error 111)",
            "Broken pipe (os error 32)",
        ] {
            assert!(is_retryable_error(message), "{message}");
        }

        for message in [
            "invalid event: missing field `type`",
            "failure to parse payload: expected value at line 1 column 1",
            "ACCESS_REFUSED",
        ] {
            assert!(!is_retryable_error(message), "{message}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_operation_runs_max_retries_plus_one_times() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> = with_retry(
            &strategy(true),
            || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(EventHubError::ChannelClosed) }
            },
            None,
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let err = result.unwrap_err();
        assert!(err.to_string().contains("after 3 retries"));
        assert!(err.to_string().contains("channel closed"));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeding_on_kth_call_stops_there() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = with_retry(
            &strategy(false),
            || {
                let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if call < 3 {
                        Err(EventHubError::ConnectionClosed)
                    } else {
                        Ok(call)
                    }
                }
            },
            None,
        )
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn on_retry_sees_attempt_numbers_and_delays() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let hook = move |attempt: u32, _: &EventHubError, delay: Duration| {
            sink.lock().push((attempt, delay));
        };

        let _: Result<(), _> = with_retry(
            &strategy(false).with_max_retries(2),
            || async { Err(EventHubError::ChannelClosed) },
            Some(&hook),
        )
        .await;

        assert_eq!(
            *seen.lock(),
            vec![
                (1, Duration::from_millis(100)),
                (2, Duration::from_millis(200))
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> = with_retry_if_retryable(
            &strategy(false),
            || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(EventHubError::InvalidEvent("missing field `type`".to_owned())) }
            },
            None,
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            result,
            Err(EventHubError::InvalidEvent("missing field `type`".to_owned()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_when_classified() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> = with_retry_if_retryable(
            &strategy(false).with_max_retries(1),
            || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(EventHubError::ConfirmTimeout(10)) }
            },
            None,
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(
            result,
            Err(EventHubError::RetriesExhausted { retries: 1, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn custom_predicate_decides_what_is_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> = with_retry_when(
            &strategy(false),
            || {
                let call = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call == 0 {
                        Err(EventHubError::PublishNacked("order.created".to_owned()))
                    } else {
                        Err(EventHubError::ManagerClosed)
                    }
                }
            },
            None,
            |err| matches!(err, EventHubError::PublishNacked(_)),
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(result, Err(EventHubError::ManagerClosed));
    }
}
