use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};

const MAX_BACKOFF_EXPONENT: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    /// Each wait adds up to 1.5x this bound of random jitter.
    pub jitter_bound: Duration,
}

impl RetryPolicy {
    pub fn text(config: &AppConfig) -> Self {
        Self {
            max_retries: config.text_max_retries,
            initial_delay: Duration::from_millis(config.retry_initial_delay_ms),
            jitter_bound: Duration::from_millis(config.retry_jitter_ms),
        }
    }

    pub fn image(config: &AppConfig) -> Self {
        Self {
            max_retries: config.image_max_retries,
            ..Self::text(config)
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (zero-based): doubled per retry plus jitter.
    pub fn backoff_delay(&self, retry: u32, rng: &mut impl Rng) -> Duration {
        let factor = 1_u32 << retry.min(MAX_BACKOFF_EXPONENT);
        let base = self.initial_delay.saturating_mul(factor);
        let jitter_ms = u64::try_from(self.jitter_bound.as_millis()).unwrap_or(u64::MAX);
        let jitter_cap = jitter_ms.saturating_mul(3) / 2;
        let jitter = if jitter_cap == 0 {
            0
        } else {
            rng.gen_range(0..=jitter_cap)
        };
        base.saturating_add(Duration::from_millis(jitter))
    }
}

#[derive(Clone)]
pub struct ResilientInvoker {
    policy: RetryPolicy,
    jitter_rng: Arc<Mutex<StdRng>>,
}

impl ResilientInvoker {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_rng(policy, StdRng::from_entropy())
    }

    pub fn with_rng(policy: RetryPolicy, rng: StdRng) -> Self {
        Self {
            policy,
            jitter_rng: Arc::new(Mutex::new(rng)),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Runs `operation`, retrying while `is_retryable` accepts the failure and the
    /// attempt budget lasts. The last failure is returned as-is.
    pub async fn run<T, F, Fut, P>(&self, mut operation: F, is_retryable: P) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AppResult<T>>,
        P: Fn(&AppError) -> bool,
    {
        let mut retry = 0;
        loop {
            match operation().await {
                Ok(value) => {
                    if retry > 0 {
                        debug!(attempts = retry + 1, "remote call succeeded after retrying");
                    }
                    return Ok(value);
                }
                Err(err) if retry < self.policy.max_retries && is_retryable(&err) => {
                    let delay = {
                        let mut rng = self.jitter_rng.lock();
                        self.policy.backoff_delay(retry, &mut *rng)
                    };
                    warn!(
                        ?err,
                        attempt = retry + 1,
                        "remote call rate limited; retrying after {:?}",
                        delay
                    );
                    sleep(delay).await;
                    retry += 1;
                }
                Err(err) => {
                    if is_retryable(&err) {
                        warn!(?err, attempts = retry + 1, "retry budget exhausted");
                    }
                    return Err(err);
                }
            }
        }
    }

    /// `run` with the default quota-failure predicate.
    pub async fn run_quota_aware<T, F, Fut>(&self, operation: F) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        self.run(operation, AppError::is_quota_failure).await
    }
}

#[cfg(test)]
pub(crate) fn instant_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        initial_delay: Duration::ZERO,
        jitter_bound: Duration::ZERO,
    }
}
