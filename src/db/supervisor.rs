//! Connection acquisition with bounded exponential backoff.
//!
//! Transient failures are retried with `base × 2^(attempt-1)` delays. Fatal ones
//! (authentication, bad configuration) surface immediately.

use crate::config::{InitConfig, PoolSpec};
use crate::db::pool::InitConnection;
use crate::error::{DbError, DbResult};
use crate::models::masked_dsn;
use rand::Rng;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Retry schedule for connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Add up to 25% random extra delay per step.
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            jitter: false,
        }
    }

    /// Delay slept after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        if self.jitter {
            let extra = rand::thread_rng().gen_range(0.0..=0.25);
            delay.saturating_add(delay.mul_f64(extra))
        } else {
            delay
        }
    }
}

#[derive(Debug)]
pub struct ConnectionSupervisor {
    policy: RetryPolicy,
    connect_timeout: Duration,
    init_spec: PoolSpec,
    last_delays: Mutex<Vec<Duration>>,
}

impl ConnectionSupervisor {
    pub fn new(policy: RetryPolicy, connect_timeout: Duration, init_spec: PoolSpec) -> Self {
        Self {
            policy,
            connect_timeout,
            init_spec,
            last_delays: Mutex::new(Vec::new()),
        }
    }

    pub fn from_config(config: &InitConfig) -> Self {
        let policy = RetryPolicy {
            max_attempts: config.max_connect_attempts,
            base_delay: config.backoff_base(),
            jitter: config.backoff_jitter,
        };
        Self::new(policy, config.connect_timeout(), config.pools.init.clone())
    }

    /// Delays slept during the most recent retry run.
    pub fn last_delays(&self) -> Vec<Duration> {
        self.last_delays
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    /// Open the dedicated init connection, retrying transient failures.
    ///
    /// Returns `RetriesExhausted` once `max_attempts` transient failures occur.
    pub async fn connect_with_retry(&self, dsn: &str) -> DbResult<InitConnection> {
        let masked = masked_dsn(dsn);
        let spec = &self.init_spec;
        let timeout = self.connect_timeout;
        let conn = self
            .retry(move |attempt| {
                debug!(attempt, "Connecting to database");
                InitConnection::connect(dsn, spec, timeout)
            })
            .await?;
        info!(dsn = %masked, db_type = %conn.db_type(), "Connected to database");
        Ok(conn)
    }

    /// Run `op` until it succeeds, fails fatally, or exhausts the attempt budget.
    pub async fn retry<T, F, Fut>(&self, mut op: F) -> DbResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        self.record_delays(Vec::new());
        let mut delays = Vec::new();
        let max_attempts = self.policy.max_attempts.max(1);

        let mut attempt = 0;

        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(value) => {
                    self.record_delays(delays);
                    return Ok(value);
                }
                Err(e) if e.is_retryable() => {
                    if attempt == max_attempts {
                        warn!(attempts = attempt, error = %e, "Connection retries exhausted");
                        self.record_delays(delays);
                        return Err(DbError::retries_exhausted(attempt, e.to_string()));
                    }
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient connection failure, backing off"
                    );
                    delays.push(delay);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Fatal connection error, not retrying");
                    self.record_delays(delays);
                    return Err(e);
                }
            }
        }
    }

    fn record_delays(&self, delays: Vec<Duration>) {
        if let Ok(mut last) = self.last_delays.lock() {
            *last = delays;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn supervisor(max_attempts: u32, base_ms: u64) -> ConnectionSupervisor {
        ConnectionSupervisor::new(
            RetryPolicy::new(max_attempts, Duration::from_millis(base_ms)),
            Duration::from_secs(1),
            PoolSpec::init(),
        )
    }

    #[test]
    fn test_delay_doubles() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_saturates() {
        let policy = RetryPolicy::new(100, Duration::from_secs(1));
        assert!(policy.delay_for(64) >= policy.delay_for(32));
    }

    #[test]
    fn test_jitter_bounded() {
        let policy = RetryPolicy {
            jitter: true,
            ..RetryPolicy::new(3, Duration::from_millis(100))
        };
        for _ in 0..50 {
            let d = policy.delay_for(2);
            assert!(d >= Duration::from_millis(200));
            assert!(d <= Duration::from_millis(250));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_strictly_increase_until_success() {
        let sup = supervisor(5, 100);
        let calls = AtomicU32::new(0);
        let mut attempt_times = Vec::new();

        let result = sup
            .retry(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                attempt_times.push(Instant::now());
                async move {
                    if attempt < 4 {
                        Err(DbError::connection("refused", "retry"))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        let waits: Vec<Duration> = attempt_times.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(waits.len(), 3);
        assert!(waits.windows(2).all(|w| w[1] > w[0]), "waits: {waits:?}");
        assert_eq!(sup.last_delays(), waits);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_not_retried() {
        let sup = supervisor(5, 100);
        let calls = AtomicU32::new(0);

        let result: DbResult<()> = sup
            .retry(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(DbError::fatal_connection("password rejected", "fix it")) }
            })
            .await;

        assert!(matches!(result, Err(DbError::FatalConnection { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(sup.last_delays().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_after_max_attempts() {
        let sup = supervisor(3, 100);
        let calls = AtomicU32::new(0);

        let result: DbResult<()> = sup
            .retry(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(DbError::connection("refused", "retry")) }
            })
            .await;

        assert!(matches!(
            result,
            Err(DbError::RetriesExhausted { attempts: 3, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            sup.last_delays(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    #[tokio::test]
    async fn test_connect_with_retry_fatal_on_bad_scheme() {
        let sup = supervisor(3, 10);
        let err = sup.connect_with_retry("oracle://nowhere").await.unwrap_err();
        assert!(matches!(err, DbError::FatalConnection { .. }));
    }
}
