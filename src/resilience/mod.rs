//! Resilience primitives: retry policy and per-group circuit breaking.

use crate::errors::{HarborError, HarborResult};
use crate::request::EndpointGroup;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// Retry configuration for exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries after the initial attempt.
    pub max_retries: u32,
    /// Initial backoff duration.
    pub initial_backoff: Duration,
    /// Maximum backoff duration.
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff.
    pub multiplier: f64,
    /// Whether to add jitter to backoff.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Do not retry; surface the error as-is.
    No,
    /// Retry after waiting the given delay.
    After(Duration),
}

/// Decides whether a failed attempt should be retried.
///
/// Only retryable failure classes (timeouts, connection loss, 408/429/5xx)
/// are retried, and only for idempotent requests: GET, or mutations the
/// caller explicitly marked with an idempotency key.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Creates a retry policy.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Decides whether to retry after `attempt` completed attempts.
    ///
    /// A request is attempted at most `max_retries + 1` times. A
    /// server-supplied retry-after hint overrides the computed delay.
    pub fn should_retry(&self, attempt: u32, error: &HarborError, idempotent: bool) -> RetryDecision {
        if !idempotent || !error.is_retryable() || attempt > self.config.max_retries {
            return RetryDecision::No;
        }
        let delay = error
            .retry_after()
            .unwrap_or_else(|| calculate_backoff(attempt, &self.config));
        RetryDecision::After(delay)
    }
}

/// Calculates backoff duration for a retry attempt.
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let base = config.initial_backoff.as_secs_f64();
    let exp = config.multiplier.powi(attempt.saturating_sub(1) as i32);
    let mut delay = base * exp;

    let max = config.max_backoff.as_secs_f64();
    if delay > max {
        delay = max;
    }

    if config.jitter {
        use rand::Rng;
        let jitter = rand::thread_rng().gen_range(0.0..=delay * 0.1);
        delay += jitter;
    }

    Duration::from_secs_f64(delay)
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Time the circuit stays open before admitting one trial call.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests pass through.
    Closed,
    /// Requests are rejected without a network call.
    Open,
    /// One trial call is admitted to test recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_started: Option<Instant>,
}

/// Consecutive-failure circuit breaker for one endpoint group.
///
/// Closed → Open after `failure_threshold` consecutive failures;
/// Open → HalfOpen after `cooldown`, admitting exactly one trial call;
/// HalfOpen → Closed on trial success, → Open on trial failure.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Creates a closed circuit breaker.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_started: None,
            }),
        }
    }

    /// Asks to pass one call through the circuit.
    ///
    /// Returns false while the circuit is open and the cooldown has not
    /// elapsed, and while a half-open trial call is already in flight.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.cooldown)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_started = Some(Instant::now());
                    tracing::info!("Circuit breaker half-open, admitting trial call");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                // A trial abandoned by cancellation frees the slot after
                // another cooldown.
                let stale = inner
                    .trial_started
                    .map(|at| at.elapsed() >= self.config.cooldown)
                    .unwrap_or(true);
                if stale {
                    inner.trial_started = Some(Instant::now());
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Records a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.trial_started = None;
                tracing::info!("Circuit breaker closed");
            }
            CircuitState::Open => {}
        }
    }

    /// Records a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    tracing::warn!(
                        failures = inner.consecutive_failures,
                        "Circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.trial_started = None;
                tracing::warn!("Circuit breaker reopened after failed trial");
            }
            CircuitState::Open => {}
        }
    }

    /// Returns the current state, reporting half-open once the cooldown
    /// has elapsed.
    pub fn state(&self) -> CircuitState {
        let inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.cooldown)
                    .unwrap_or(true);
                if elapsed {
                    CircuitState::HalfOpen
                } else {
                    CircuitState::Open
                }
            }
            other => other,
        }
    }
}

/// Per-endpoint-group circuit breakers.
///
/// Breaker state is keyed per logical endpoint group, not globally, so a
/// failing subsystem does not block unrelated calls.
pub struct BreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<EndpointGroup, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    /// Creates an empty registry.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the breaker for a group, creating it on first use.
    pub fn breaker(&self, group: EndpointGroup) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().unwrap().get(&group) {
            return breaker.clone();
        }
        let mut breakers = self.breakers.write().unwrap();
        breakers
            .entry(group)
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config.clone())))
            .clone()
    }

    /// Fails fast with `CircuitOpen` if the group's circuit rejects the call.
    pub fn check(&self, group: EndpointGroup) -> HarborResult<()> {
        if self.breaker(group).try_acquire() {
            Ok(())
        } else {
            Err(HarborError::CircuitOpen { group })
        }
    }

    /// Records a successful call against the group.
    pub fn record_success(&self, group: EndpointGroup) {
        self.breaker(group).record_success();
    }

    /// Records a failed call against the group.
    pub fn record_failure(&self, group: EndpointGroup) {
        self.breaker(group).record_failure();
    }

    /// Returns the state of the group's breaker.
    pub fn state(&self, group: EndpointGroup) -> CircuitState {
        self.breaker(group).state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout() -> HarborError {
        HarborError::Timeout("deadline exceeded".to_string())
    }

    #[test]
    fn test_backoff_grows_exponentially() {
        let config = RetryConfig {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: false,
        };

        assert_eq!(calculate_backoff(1, &config), Duration::from_secs(1));
        assert_eq!(calculate_backoff(2, &config), Duration::from_secs(2));
        assert_eq!(calculate_backoff(3, &config), Duration::from_secs(4));
    }

    #[test]
    fn test_backoff_honors_ceiling() {
        let config = RetryConfig {
            max_retries: 10,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(calculate_backoff(10, &config), Duration::from_secs(10));
    }

    #[test]
    fn test_retry_policy_caps_attempts() {
        let policy = RetryPolicy::new(RetryConfig {
            max_retries: 3,
            jitter: false,
            ..Default::default()
        });

        assert!(matches!(
            policy.should_retry(1, &timeout(), true),
            RetryDecision::After(_)
        ));
        assert!(matches!(
            policy.should_retry(3, &timeout(), true),
            RetryDecision::After(_)
        ));
        assert_eq!(policy.should_retry(4, &timeout(), true), RetryDecision::No);
    }

    #[test]
    fn test_retry_policy_skips_non_idempotent() {
        let policy = RetryPolicy::new(RetryConfig::default());
        assert_eq!(policy.should_retry(1, &timeout(), false), RetryDecision::No);
    }

    #[test]
    fn test_retry_policy_skips_non_retryable() {
        let policy = RetryPolicy::new(RetryConfig::default());
        let error = HarborError::ClientError {
            status: 404,
            body: String::new(),
        };
        assert_eq!(policy.should_retry(1, &error, true), RetryDecision::No);
    }

    #[test]
    fn test_retry_after_hint_overrides_backoff() {
        let policy = RetryPolicy::new(RetryConfig {
            initial_backoff: Duration::from_secs(1),
            jitter: false,
            ..Default::default()
        });
        let error = HarborError::ServerError {
            status: 429,
            body: String::new(),
            retry_after: Some(Duration::from_secs(9)),
        };
        assert_eq!(
            policy.should_retry(1, &error, true),
            RetryDecision::After(Duration::from_secs(9))
        );
    }

    #[test]
    fn test_breaker_opens_after_threshold() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        });

        for _ in 0..4 {
            breaker.record_failure();
            assert_eq!(breaker.state(), CircuitState::Closed);
        }
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.try_acquire());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
        });

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_admits_single_trial() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_millis(20),
        });

        breaker.record_failure();
        assert!(!breaker.try_acquire());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // First caller gets the trial slot; a second is rejected.
        assert!(breaker.try_acquire());
        assert!(!breaker.try_acquire());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_acquire());
    }

    #[tokio::test]
    async fn test_failed_trial_reopens() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_millis(20),
        });

        breaker.record_failure();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(breaker.try_acquire());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.try_acquire());
    }

    #[test]
    fn test_registry_isolates_groups() {
        let registry = BreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_secs(30),
        });

        registry.record_failure(EndpointGroup::Feed);
        assert!(registry.check(EndpointGroup::Feed).is_err());
        assert!(registry.check(EndpointGroup::Marketplace).is_ok());
        assert_eq!(registry.state(EndpointGroup::Marketplace), CircuitState::Closed);
    }
}
