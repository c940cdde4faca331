//! The attempt loop around one logical outbound call
//!
//! For each attempt the orchestrator asks the [`RateLimiter`] and the
//! [`CircuitBreaker`] for admission, invokes the transport exactly once,
//! reports the outcome to the breaker and then either returns or backs off
//! and goes round again. The only suspension points are store I/O and the
//! backoff sleep, which blocks the calling task alone.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitPolicy};
use crate::error::{GuardError, RateLimitedError};
use crate::observability::GuardMetrics;
use crate::rate_limiter::{ConcurrencyPermit, RateLimitPolicy, RateLimiter};
use crate::retry::{FailureClass, RetryPolicy, TransportFailure};
use crate::store::Store;
use crate::time::{Clock, SystemClock};

/// Result of [`RetryOrchestrator::execute_with_outcome`] with loop statistics
#[derive(Debug)]
pub struct ExecutionOutcome<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub result: Result<T, GuardError<E>>,
    /// Attempts consumed, including ones spent waiting out a rate limit
    pub attempts: u32,
    /// Time spent sleeping between attempts
    pub total_delay: Duration,
}

impl<T, E> ExecutionOutcome<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Drop the bookkeeping and keep the result
    pub fn into_result(self) -> Result<T, GuardError<E>> {
        self.result
    }

    /// Get the average delay between attempts.
    pub fn average_delay(&self) -> Duration {
        if self.attempts <= 1 {
            return Duration::ZERO;
        }
        self.total_delay / (self.attempts - 1)
    }
}

/// Single entry point for guarded outbound calls
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
///
/// use tollgate::{
///     CircuitPolicy, GuardError, MemoryStore, RateLimitPolicy, RetryOrchestrator, RetryPolicy,
///     TransportFailure,
/// };
///
/// #[derive(Debug, thiserror::Error)]
/// #[error("connection reset")]
/// struct Reset;
///
/// impl TransportFailure for Reset {}
///
/// # async fn example() -> Result<(), GuardError<Reset>> {
/// let orchestrator = RetryOrchestrator::new(Arc::new(MemoryStore::new()));
///
/// let body = orchestrator
///     .execute(
///         "api.example.com",
///         || async { Ok::<_, Reset>("pong") },
///         &RetryPolicy::default(),
///         &CircuitPolicy::default(),
///         &RateLimitPolicy::default(),
///     )
///     .await?;
/// assert_eq!(body, "pong");
/// # Ok(())
/// # }
/// ```
pub struct RetryOrchestrator<C: Clock = SystemClock> {
    rate_limiter: RateLimiter<C>,
    circuit_breaker: CircuitBreaker<C>,
    metrics: Arc<GuardMetrics>,
}

impl<C: Clock> Clone for RetryOrchestrator<C> {
    fn clone(&self) -> Self {
        Self {
            rate_limiter: self.rate_limiter.clone(),
            circuit_breaker: self.circuit_breaker.clone(),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

impl<C: Clock> std::fmt::Debug for RetryOrchestrator<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryOrchestrator").field("metrics", &self.metrics.snapshot()).finish()
    }
}

impl RetryOrchestrator<SystemClock> {
    /// Create an orchestrator whose limiter and breaker share `store`
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_clock(store, SystemClock)
    }
}

impl<C: Clock> RetryOrchestrator<C> {
    /// Create an orchestrator with a custom clock (useful for testing)
    pub fn with_clock(store: Arc<dyn Store>, clock: C) -> Self {
        let clock = Arc::new(clock);
        Self {
            rate_limiter: RateLimiter::from_shared(Arc::clone(&store), Arc::clone(&clock)),
            circuit_breaker: CircuitBreaker::from_shared(store, clock),
            metrics: Arc::new(GuardMetrics::new()),
        }
    }

    /// The limiter consulted before every attempt
    pub fn rate_limiter(&self) -> &RateLimiter<C> {
        &self.rate_limiter
    }

    /// The breaker consulted before every attempt
    pub fn circuit_breaker(&self) -> &CircuitBreaker<C> {
        &self.circuit_breaker
    }

    pub fn metrics(&self) -> &GuardMetrics {
        &self.metrics
    }

    /// Run `attempt` under the given policies until it succeeds, fails
    /// fatally, is cancelled, is denied admission or runs out of attempts
    ///
    /// Transport failures are returned verbatim inside [`GuardError`].
    pub async fn execute<F, Fut, T, E>(
        &self,
        key: &str,
        attempt: F,
        retry_policy: &RetryPolicy<E>,
        circuit_policy: &CircuitPolicy,
        rate_limit_policy: &RateLimitPolicy,
    ) -> Result<T, GuardError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: TransportFailure,
    {
        self.execute_with_outcome(key, attempt, retry_policy, circuit_policy, rate_limit_policy)
            .await
            .into_result()
    }

    /// Like [`execute`](Self::execute), also reporting attempts and delay
    #[instrument(
        skip_all,
        fields(scope = key, max_attempts = retry_policy.max_attempts)
    )]
    pub async fn execute_with_outcome<F, Fut, T, E>(
        &self,
        key: &str,
        mut attempt: F,
        retry_policy: &RetryPolicy<E>,
        circuit_policy: &CircuitPolicy,
        rate_limit_policy: &RateLimitPolicy,
    ) -> ExecutionOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: TransportFailure,
    {
        self.metrics.record_call();
        let max_attempts = retry_policy.max_attempts.max(1);
        let mut attempt_number = 1;
        let mut total_delay = Duration::ZERO;
        let mut last_failure: Option<E> = None;

        let outcome =
            |result: Result<T, GuardError<E>>, attempts: u32, total_delay: Duration| {
                ExecutionOutcome { result, attempts, total_delay }
            };

        loop {
            let permit = match self.acquire_quota(key, rate_limit_policy).await {
                Ok(permit) => permit,
                Err(limited) => {
                    if attempt_number == 1 || attempt_number >= max_attempts {
                        if let Some(failure) = last_failure.take() {
                            let attempts = attempt_number - 1;
                            let err = self.cut_short(attempts, failure, "rate limited");
                            return outcome(Err(err), attempts, total_delay);
                        }
                        self.metrics.record_rate_limited();
                        warn!(
                            attempt = attempt_number,
                            retry_after_seconds = limited.retry_after_seconds,
                            "Call rate limited"
                        );
                        return outcome(Err(limited.into()), attempt_number, total_delay);
                    }
                    // A throttled retry waits out the window and spends the attempt
                    let delay = Duration::from_secs(limited.retry_after_seconds);
                    debug!(attempt = attempt_number, ?delay, "Retry rate limited, waiting");
                    self.sleep(delay).await;
                    total_delay += delay;
                    attempt_number += 1;
                    continue;
                }
            };

            if let Err(open) = self.circuit_breaker.allow_request(key, circuit_policy).await {
                release(permit).await;
                if let Some(failure) = last_failure.take() {
                    let attempts = attempt_number - 1;
                    let err = self.cut_short(attempts, failure, "circuit open");
                    return outcome(Err(err), attempts, total_delay);
                }
                self.metrics.record_circuit_rejected();
                warn!(
                    attempt = attempt_number,
                    retry_after_seconds = open.retry_after_seconds,
                    "Call rejected by open circuit"
                );
                return outcome(Err(open.into()), attempt_number, total_delay);
            }

            debug!("Executing attempt {}/{}", attempt_number, max_attempts);
            self.metrics.record_attempt();
            let result = attempt().await;
            release(permit).await;

            let failure = match result {
                Ok(value) => {
                    self.circuit_breaker.record_success(key, circuit_policy).await;
                    self.metrics.record_success();
                    if attempt_number > 1 {
                        debug!("Call succeeded after {} attempts", attempt_number);
                    }
                    return outcome(Ok(value), attempt_number, total_delay);
                }
                Err(failure) => failure,
            };

            match retry_policy.classify(&failure) {
                FailureClass::Cancelled => {
                    self.metrics.record_cancelled();
                    debug!(attempt = attempt_number, "Attempt cancelled, aborting retries");
                    return outcome(
                        Err(GuardError::Cancelled { attempt: attempt_number, source: failure }),
                        attempt_number,
                        total_delay,
                    );
                }
                FailureClass::Fatal => {
                    self.circuit_breaker.record_failure(key, circuit_policy).await;
                    self.metrics.record_fatal();
                    warn!(attempt = attempt_number, error = %failure, "Non-retryable failure");
                    return outcome(
                        Err(GuardError::Fatal { attempt: attempt_number, source: failure }),
                        attempt_number,
                        total_delay,
                    );
                }
                FailureClass::Retryable => {
                    self.circuit_breaker.record_failure(key, circuit_policy).await;
                    if attempt_number >= max_attempts {
                        self.metrics.record_exhausted();
                        warn!(
                            attempts = attempt_number,
                            error = %failure,
                            "All retry attempts exhausted"
                        );
                        return outcome(
                            Err(GuardError::RetryExhausted {
                                attempts: attempt_number,
                                last_failure: failure,
                            }),
                            attempt_number,
                            total_delay,
                        );
                    }

                    let delay = retry_policy.delay_for(attempt_number, &failure);
                    warn!(
                        "Attempt {} failed, retrying after {:?}: {}",
                        attempt_number, delay, failure
                    );
                    last_failure = Some(failure);
                    self.sleep(delay).await;
                    total_delay += delay;
                    attempt_number += 1;
                }
            }
        }
    }

    /// A retry denied admission after the transport already failed
    fn cut_short<E: TransportFailure>(
        &self,
        attempts: u32,
        last_failure: E,
        denied_by: &'static str,
    ) -> GuardError<E> {
        self.metrics.record_exhausted();
        warn!(attempts, denied_by, error = %last_failure, "Retry denied, returning last failure");
        GuardError::RetryExhausted { attempts, last_failure }
    }

    async fn acquire_quota(
        &self,
        key: &str,
        policy: &RateLimitPolicy,
    ) -> Result<Option<ConcurrencyPermit>, RateLimitedError> {
        self.rate_limiter.try_acquire(key, policy).await.into_result(key)?;
        self.rate_limiter.acquire_concurrency(key, policy).await
    }

    async fn sleep(&self, delay: Duration) {
        self.metrics.record_backoff(delay);
        tokio::time::sleep(delay).await;
    }
}

async fn release(permit: Option<ConcurrencyPermit>) {
    if let Some(permit) = permit {
        permit.release().await;
    }
}
