//! Activity execution: per-attempt liveness supervision, start-to-close deadlines and the
//! retry policy applied between attempts.

pub mod error;
pub mod heartbeat;

use std::{future::Future, time::Duration};

use tokio::{
    sync::watch,
    time::{Instant, sleep, sleep_until},
};
use tracing::{info, warn};

pub use self::error::ActivityError;
pub use self::heartbeat::Heartbeat;
use crate::{config::Config, observability::metrics::Metrics};

/// Exponential retry schedule between activity attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub maximum_interval: Duration,
    /// Total attempts including the first one.
    pub maximum_attempts: u32,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    #[must_use]
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let capped = scaled.min(self.maximum_interval.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.maximum_interval
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActivityOptions {
    pub start_to_close: Duration,
    /// `None` disables liveness supervision.
    pub heartbeat_timeout: Option<Duration>,
    pub retry: RetryPolicy,
}

impl ActivityOptions {
    /// Options for stage activities.
    #[must_use]
    pub fn stage(config: &Config) -> Self {
        Self {
            start_to_close: config.activity_start_to_close(),
            heartbeat_timeout: Some(config.activity_heartbeat_timeout()),
            retry: RetryPolicy {
                initial_interval: config.activity_retry_initial(),
                backoff_coefficient: config.activity_retry_backoff(),
                maximum_interval: config.activity_retry_max(),
                maximum_attempts: config.activity_max_attempts(),
            },
        }
    }

    /// Options for compensation activities.
    #[must_use]
    pub fn compensation(config: &Config) -> Self {
        Self {
            start_to_close: config.compensation_start_to_close(),
            heartbeat_timeout: None,
            retry: RetryPolicy {
                initial_interval: config.activity_retry_initial(),
                backoff_coefficient: config.activity_retry_backoff(),
                maximum_interval: config.activity_retry_max(),
                maximum_attempts: config.compensation_max_attempts(),
            },
        }
    }
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            start_to_close: Duration::from_secs(15 * 60),
            heartbeat_timeout: Some(Duration::from_secs(60)),
            retry: RetryPolicy {
                initial_interval: Duration::from_secs(1),
                backoff_coefficient: 2.0,
                maximum_interval: Duration::from_secs(60),
                maximum_attempts: 3,
            },
        }
    }
}

/// Identity of one activity attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityInfo {
    pub workflow_id: String,
    pub activity: &'static str,
    pub attempt: u32,
    pub max_attempts: u32,
}

/// Handed to the activity body for each attempt.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    info: ActivityInfo,
    heartbeat: Heartbeat,
}

impl ActivityContext {
    #[must_use]
    pub fn new(info: ActivityInfo, heartbeat: Heartbeat) -> Self {
        Self { info, heartbeat }
    }

    /// A context with no supervisor attached, for invoking an activity directly.
    #[must_use]
    pub fn detached(workflow_id: impl Into<String>, activity: &'static str) -> Self {
        let (heartbeat, _) = Heartbeat::channel(None);
        Self::new(
            ActivityInfo {
                workflow_id: workflow_id.into(),
                activity,
                attempt: 1,
                max_attempts: 1,
            },
            heartbeat,
        )
    }

    pub fn heartbeat(&self, detail: &str) {
        self.heartbeat.beat(detail);
    }

    #[must_use]
    pub fn info(&self) -> &ActivityInfo {
        &self.info
    }

    #[must_use]
    pub fn workflow_id(&self) -> &str {
        &self.info.workflow_id
    }

    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.info.attempt
    }

    #[must_use]
    pub fn is_final_attempt(&self) -> bool {
        self.info.attempt >= self.info.max_attempts
    }
}

/// Runs `body` under `options`, retrying retryable failures until attempts run out.
///
/// Each attempt gets a fresh [`ActivityContext`]. An attempt that outlives its start-to-close
/// deadline, or stays silent longer than the heartbeat timeout, is dropped and reported as a
/// retryable timeout.
///
/// # Errors
/// The last attempt's error, or the first non-retryable one.
pub async fn run_activity<T, F, Fut>(
    activity: &'static str,
    workflow_id: &str,
    options: &ActivityOptions,
    metrics: &Metrics,
    mut body: F,
) -> Result<T, ActivityError>
where
    F: FnMut(ActivityContext) -> Fut,
    Fut: Future<Output = Result<T, ActivityError>>,
{
    let max_attempts = options.retry.maximum_attempts.max(1);
    let mut attempt = 1;

    loop {
        let (heartbeat, beats) = Heartbeat::channel(Some(metrics.heartbeats.clone()));
        // Keeps the channel open even if the body drops its context early.
        let keepalive = heartbeat.clone();
        let ctx = ActivityContext::new(
            ActivityInfo {
                workflow_id: workflow_id.to_string(),
                activity,
                attempt,
                max_attempts,
            },
            heartbeat,
        );

        let outcome = supervise(body(ctx), beats, options).await;
        drop(keepalive);

        match outcome {
            Ok(value) => {
                if attempt > 1 {
                    info!(workflow_id, activity, attempt, "activity succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) if error.is_retryable() && attempt < max_attempts => {
                let delay = options.retry.delay_for_retry(attempt);
                warn!(
                    workflow_id,
                    activity,
                    attempt,
                    max_attempts,
                    category = error.category(),
                    error = %error,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "activity attempt failed, retrying"
                );
                metrics.activity_retries.with_label_values(&[activity]).inc();
                sleep(delay).await;
                attempt += 1;
            }
            Err(error) => {
                warn!(
                    workflow_id,
                    activity,
                    attempt,
                    retryable = error.is_retryable(),
                    category = error.category(),
                    error = %error,
                    "activity failed"
                );
                return Err(error);
            }
        }
    }
}

async fn supervise<T>(
    attempt: impl Future<Output = Result<T, ActivityError>>,
    mut beats: watch::Receiver<u64>,
    options: &ActivityOptions,
) -> Result<T, ActivityError> {
    let deadline = Instant::now() + options.start_to_close;
    tokio::pin!(attempt);

    loop {
        let liveness = options
            .heartbeat_timeout
            .map(|timeout| (Instant::now() + timeout, timeout));
        let wake = liveness.map_or(deadline, |(at, _)| at.min(deadline));

        tokio::select! {
            biased;
            result = &mut attempt => return result,
            changed = beats.changed(), if liveness.is_some() => {
                if changed.is_err() {
                    return attempt.await;
                }
            }
            () = sleep_until(wake) => {
                return Err(match liveness {
                    Some((at, timeout)) if at < deadline => ActivityError::HeartbeatTimeout(timeout),
                    _ => ActivityError::StartToCloseTimeout(options.start_to_close),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    use anyhow::anyhow;
    use prometheus::Registry;

    use super::*;

    fn metrics() -> Metrics {
        Metrics::new(Arc::new(Registry::new())).expect("metrics")
    }

    fn options(max_attempts: u32) -> ActivityOptions {
        ActivityOptions {
            retry: RetryPolicy {
                maximum_attempts: max_attempts,
                ..ActivityOptions::default().retry
            },
            ..ActivityOptions::default()
        }
    }

    #[test]
    fn retry_delays_grow_and_cap() {
        let policy = ActivityOptions::default().retry;
        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_retry(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_retry(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_retry(10), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failures_are_retried_until_success() {
        let metrics = metrics();
        let attempts = Arc::new(AtomicU32::new(0));

        let result = run_activity("flaky", "wf-1", &options(3), &metrics, |ctx| {
            let attempts = Arc::clone(&attempts);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                if ctx.attempt() < 3 {
                    Err(ActivityError::Bookkeeping(anyhow!("connection reset")))
                } else {
                    Ok(ctx.is_final_attempt())
                }
            }
        })
        .await;

        assert!(matches!(result, Ok(true)));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(
            (metrics.activity_retries.with_label_values(&["flaky"]).get() - 2.0).abs()
                < f64::EPSILON
        );
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_failures_stop_immediately() {
        let metrics = metrics();
        let attempts = Arc::new(AtomicU32::new(0));

        let result: Result<(), _> = run_activity("nsfw", "wf-2", &options(3), &metrics, |_ctx| {
            let attempts = Arc::clone(&attempts);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(ActivityError::ProviderFailed("NSFW content detected".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(ActivityError::ProviderFailed(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_attempts_fail_with_heartbeat_timeout() {
        let metrics = metrics();
        let attempts = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let result: Result<(), _> = run_activity("silent", "wf-3", &options(2), &metrics, |_ctx| {
            let attempts = Arc::clone(&attempts);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_secs(120)).await;
                Ok(())
            }
        })
        .await;

        assert!(matches!(result, Err(ActivityError::HeartbeatTimeout(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        // two 60s liveness windows plus one 1s backoff
        assert_eq!(started.elapsed(), Duration::from_secs(121));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_keep_long_attempts_alive() {
        let metrics = metrics();

        let result = run_activity("chatty", "wf-4", &options(1), &metrics, |ctx| async move {
            for _ in 0..40 {
                sleep(Duration::from_secs(5)).await;
                ctx.heartbeat("polling");
            }
            Ok::<_, ActivityError>("done")
        })
        .await;

        assert!(matches!(result, Ok("done")));
        assert!((metrics.heartbeats.get() - 40.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn start_to_close_bounds_each_attempt() {
        let metrics = metrics();
        let opts = ActivityOptions {
            start_to_close: Duration::from_secs(30),
            heartbeat_timeout: None,
            ..options(1)
        };

        let result: Result<(), _> = run_activity("slow", "wf-5", &opts, &metrics, |_ctx| async {
            sleep(Duration::from_secs(45)).await;
            Ok(())
        })
        .await;

        assert!(matches!(
            result,
            Err(ActivityError::StartToCloseTimeout(d)) if d == Duration::from_secs(30)
        ));
    }
}
