//! Exponential backoff with jitter and a bounded attempt counter
//!
//! Schedule: each retry waits the current interval, after which the interval
//! becomes `min(2 * interval + jitter, max_interval)` with jitter drawn
//! uniformly from `0..=max_jitter`. `max_attempts` bounds the number of
//! retries (calls after the first one); unset means unbounded.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tcdrop_core::config::RetryConfig;
use tcdrop_core::{TcdropError, TcdropResult};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_START_INTERVAL: Duration = Duration::from_millis(250);
pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_JITTER: Duration = Duration::from_millis(1000);

type FailFn = Box<dyn FnMut() + Send>;

pub struct RetryHandler {
    start_interval: Duration,
    max_interval: Duration,
    max_jitter: Duration,
    max_attempts: Option<u32>,
    interval: Duration,
    attempts: u32,
    pending: Option<AbortHandle>,
    cancel: CancellationToken,
    on_fail: Option<FailFn>,
}

impl Default for RetryHandler {
    fn default() -> Self {
        Self::new(DEFAULT_START_INTERVAL, DEFAULT_MAX_INTERVAL)
    }
}

impl RetryHandler {
    pub fn new(start_interval: Duration, max_interval: Duration) -> Self {
        Self {
            start_interval,
            max_interval,
            max_jitter: DEFAULT_MAX_JITTER,
            max_attempts: None,
            interval: start_interval,
            attempts: 0,
            pending: None,
            cancel: CancellationToken::new(),
            on_fail: None,
        }
    }

    pub fn from_config(cfg: &RetryConfig) -> Self {
        let mut handler = Self::new(
            Duration::from_millis(cfg.start_interval_ms),
            Duration::from_millis(cfg.max_interval_ms),
        )
        .with_max_jitter(Duration::from_millis(cfg.max_jitter_ms));
        handler.max_attempts = cfg.max_attempts;
        handler
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_max_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    /// Callback invoked by `retry` (and `run`) once the attempt limit is hit.
    pub fn on_fail(mut self, f: impl FnMut() + Send + 'static) -> Self {
        self.on_fail = Some(Box::new(f));
        self
    }

    /// The interval the next retry will wait.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn limit_reached(&self) -> bool {
        self.max_attempts.is_some_and(|max| self.attempts >= max)
    }

    /// Token that cancels an in-progress `run` from another task.
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Consume the current interval and step the schedule forward.
    fn advance(&mut self) -> Duration {
        let scheduled = self.interval;
        let jitter_ms = match u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX) {
            0 => 0,
            max => rand::thread_rng().gen_range(0..=max),
        };
        self.interval = self
            .interval
            .saturating_mul(2)
            .saturating_add(Duration::from_millis(jitter_ms))
            .min(self.max_interval);
        self.attempts = self.attempts.saturating_add(1);
        scheduled
    }

    fn fail(&mut self) {
        if let Some(f) = self.on_fail.as_mut() {
            f();
        }
    }

    /// Schedule `action` on the runtime after the current interval.
    ///
    /// Returns the interval it was scheduled with, or `None` when the attempt
    /// limit has been reached, in which case the `on_fail` callback runs
    /// instead and nothing is scheduled. A previously scheduled action that
    /// has not fired yet is replaced.
    pub fn retry<F>(&mut self, action: F) -> Option<Duration>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.limit_reached() {
            warn!(attempts = self.attempts, "retry limit reached");
            self.fail();
            return None;
        }
        let delay = self.advance();
        if let Some(previous) = self.pending.take() {
            previous.abort();
        }
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            action.await;
        });
        self.pending = Some(task.abort_handle());
        debug!(attempt = self.attempts, delay_ms = delay.as_millis() as u64, "retry scheduled");
        Some(delay)
    }

    /// Restore the initial interval and attempt counter (call on success).
    ///
    /// A cancel token that already fired is replaced; handles taken before
    /// the reset no longer reach this handler.
    pub fn reset(&mut self) {
        self.interval = self.start_interval;
        self.attempts = 0;
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }
    }

    /// Abort a scheduled retry that has not fired yet. Has no other effect.
    pub fn cancel(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
    }

    /// Drive `op` until it succeeds, sleeping per the schedule between
    /// attempts.
    ///
    /// Only transient failures (oracle, transport, I/O) are retried; anything
    /// else is returned immediately. Succeeding resets the schedule. When the
    /// limit is reached or the cancel token fires, the last error is returned.
    pub async fn run<T, F, Fut>(&mut self, mut op: F) -> TcdropResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = TcdropResult<T>>,
    {
        loop {
            let err = match op().await {
                Ok(value) => {
                    self.reset();
                    return Ok(value);
                }
                Err(e) if is_transient(&e) => e,
                Err(e) => return Err(e),
            };

            if self.limit_reached() {
                warn!(attempts = self.attempts, error = %err, "giving up after retries");
                self.fail();
                return Err(err);
            }

            let delay = self.advance();
            warn!(
                attempt = self.attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient failure, retrying"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => {
                    debug!("retry cancelled");
                    return Err(err);
                }
            }
        }
    }
}

impl Drop for RetryHandler {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn is_transient(e: &TcdropError) -> bool {
    matches!(
        e,
        TcdropError::Oracle(_) | TcdropError::Transport(_) | TcdropError::Io(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    fn no_jitter(start_ms: u64, max_ms: u64) -> RetryHandler {
        RetryHandler::new(Duration::from_millis(start_ms), Duration::from_millis(max_ms))
            .with_max_jitter(Duration::ZERO)
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_doubles_and_caps() {
        let mut retry = no_jitter(250, 1500);
        let scheduled: Vec<u64> = (0..5)
            .map(|_| retry.retry(async {}).unwrap().as_millis() as u64)
            .collect();
        assert_eq!(scheduled, vec![250, 500, 1000, 1500, 1500]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_jitter_is_bounded() {
        let mut retry = RetryHandler::new(Duration::from_millis(100), Duration::from_secs(3600));
        retry.retry(async {});
        let next = retry.interval().as_millis();
        assert!((200..=1200).contains(&next), "got {next}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_restores_initial_state() {
        let mut retry = no_jitter(250, 60_000);
        retry.retry(async {});
        retry.retry(async {});
        assert_eq!(retry.attempts(), 2);

        retry.reset();
        assert_eq!(retry.attempts(), 0);
        assert_eq!(retry.interval(), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_action_fires() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let mut retry = no_jitter(250, 60_000);
        retry.retry(async move { flag.store(true, Ordering::SeqCst) });

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_scheduled_action() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let mut retry = no_jitter(250, 60_000);
        retry.retry(async move { flag.store(true, Ordering::SeqCst) });
        retry.cancel();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_invokes_on_fail() {
        let failed = Arc::new(AtomicBool::new(false));
        let flag = failed.clone();
        let mut retry = no_jitter(10, 100)
            .with_max_attempts(2)
            .on_fail(move || flag.store(true, Ordering::SeqCst));

        assert!(retry.retry(async {}).is_some());
        assert!(retry.retry(async {}).is_some());
        assert!(retry.limit_reached());
        assert!(retry.retry(async {}).is_none());
        assert!(failed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let mut retry = no_jitter(250, 60_000).with_max_attempts(5);

        let value = retry
            .run(|| async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TcdropError::Oracle("503".into()))
                } else {
                    Ok(42)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retry.attempts(), 0, "success must reset the schedule");
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_gives_up_at_limit() {
        let calls = AtomicU32::new(0);
        let mut retry = no_jitter(10, 100).with_max_attempts(2);

        let result: TcdropResult<()> = retry
            .run(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TcdropError::Oracle("down".into()))
            })
            .await;

        assert!(matches!(result, Err(TcdropError::Oracle(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3, "first call plus two retries");
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_does_not_retry_permanent_errors() {
        let calls = AtomicU32::new(0);
        let mut retry = no_jitter(10, 100);

        let result: TcdropResult<()> = retry
            .run(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TcdropError::PasswordIncorrect)
            })
            .await;

        assert!(matches!(result, Err(TcdropError::PasswordIncorrect)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_honours_cancel_handle() {
        let mut retry = no_jitter(10_000, 60_000);
        let cancel = retry.cancel_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let result: TcdropResult<()> = retry
            .run(|| async { Err(TcdropError::Transport("reset".into())) })
            .await;
        assert!(matches!(result, Err(TcdropError::Transport(_))));
        assert_eq!(retry.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_after_cancel_allows_retries_again() {
        let mut retry = no_jitter(10, 100);
        retry.cancel_handle().cancel();
        let result: TcdropResult<()> = retry
            .run(|| async { Err(TcdropError::Oracle("down".into())) })
            .await;
        assert!(result.is_err());
        assert_eq!(retry.attempts(), 1);

        retry.reset();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = retry
            .run(|| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(TcdropError::Oracle("flaky".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
