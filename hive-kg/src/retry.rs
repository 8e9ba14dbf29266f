//! Error classification and retry with exponential backoff
//!
//! Classification is a pure function from [`Neo4jError`] to a closed set of
//! [`ErrorKind`]s. The retry loop consumes an explicit [`Outcome`] per
//! attempt instead of reacting to whatever error happens to propagate.
//!
//! # Backoff Schedule (defaults)
//!
//! | Retry | Delay (base) | With jitter     |
//! |-------|--------------|-----------------|
//! | 1     | 100ms        | 100–200ms       |
//! | 2     | 200ms        | 200–400ms       |
//! | 3     | 400ms        | 400–800ms       |
//!
//! Delays are capped at `max_delay` before jitter is added.

use crate::circuit_breaker::CircuitFailure;
use crate::driver::Params;
use crate::error::Neo4jError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Closed set of failure kinds the resilience layer distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transaction aborted by the server's deadlock detector
    Deadlock,
    /// Connection reset, refused or broken mid-flight
    Connection,
    /// Server reachable but not serving (restart, leader switch)
    ServiceUnavailable,
    /// Round-trip exceeded the transaction timeout
    Timeout,
    /// Other server-declared transient failure (lock client stopped, memory pressure)
    Transient,
    /// Uniqueness/existence constraint rejected a write
    ConstraintViolation,
    /// Syntax error, wrong access mode, bad parameters
    MalformedQuery,
    /// Credentials rejected
    Authentication,
    /// No pooled session within the acquire timeout, or pool closed
    ResourceExhausted,
    /// Rejected by the circuit breaker
    CircuitOpen,
    /// Configuration, serialization and anything unrecognised
    Unknown,
}

impl ErrorKind {
    /// Transient kinds are retried per strategy.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Deadlock
                | ErrorKind::Connection
                | ErrorKind::ServiceUnavailable
                | ErrorKind::Timeout
                | ErrorKind::Transient
        )
    }

    /// Kinds after which the session must not be reused.
    pub fn requires_reconnect(self) -> bool {
        matches!(
            self,
            ErrorKind::Connection | ErrorKind::ServiceUnavailable | ErrorKind::Timeout
        )
    }

    /// Kinds that say something about the health of the database.
    ///
    /// Caller mistakes (constraint violations, malformed queries) and local
    /// pool pressure never open the circuit.
    pub fn trips_circuit(self) -> bool {
        !matches!(
            self,
            ErrorKind::ConstraintViolation
                | ErrorKind::MalformedQuery
                | ErrorKind::ResourceExhausted
                | ErrorKind::CircuitOpen
        )
    }
}

/// Classify an error into an [`ErrorKind`].
pub fn classify(error: &Neo4jError) -> ErrorKind {
    match error {
        Neo4jError::Deadlock(_) => ErrorKind::Deadlock,
        Neo4jError::TransientError(_) => ErrorKind::Transient,
        Neo4jError::ConnectionError(_) => ErrorKind::Connection,
        Neo4jError::ServiceUnavailable(_) => ErrorKind::ServiceUnavailable,
        Neo4jError::TimeoutError { .. } => ErrorKind::Timeout,
        Neo4jError::ConstraintViolation(_) => ErrorKind::ConstraintViolation,
        Neo4jError::QueryError(_) => ErrorKind::MalformedQuery,
        Neo4jError::AuthenticationError(_) => ErrorKind::Authentication,
        Neo4jError::AcquisitionTimeout { .. } | Neo4jError::PoolClosed => {
            ErrorKind::ResourceExhausted
        }
        Neo4jError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
        Neo4jError::TransactionFailed { source, .. } => classify(source),
        Neo4jError::DriverError(e) => classify(&Neo4jError::from_server_message(e.to_string())),
        Neo4jError::ConfigError(_)
        | Neo4jError::SerializationError(_)
        | Neo4jError::Other(_) => ErrorKind::Unknown,
    }
}

impl CircuitFailure for Neo4jError {
    fn trips_circuit(&self) -> bool {
        classify(self).trips_circuit()
    }
}

/// Context handed to the classifier on every failure
#[derive(Debug, Clone, Serialize)]
pub struct ErrorContext {
    /// Logical operation name (e.g. "write transaction")
    pub operation: String,
    /// Retries performed before this failure
    pub retry_count: u32,
    /// Session the failing attempt ran on, if one was acquired
    pub session_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub params: Option<Params>,
}

impl ErrorContext {
    pub fn new(operation: impl Into<String>, retry_count: u32) -> Self {
        Self {
            operation: operation.into(),
            retry_count,
            session_id: None,
            timestamp: Utc::now(),
            params: None,
        }
    }

    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = Some(params);
        self
    }
}

/// What the retry loop does after a failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorRecoveryAction {
    /// Sleep, then retry on a session from the pool
    Retry { delay: Duration },
    /// Discard the session, sleep, then retry on a fresh one
    ReconnectAndRetry { delay: Duration, reason: String },
    /// Reject without touching the database
    FailFast { reason: String },
    /// Surface the error to the caller
    Fail { reason: String },
}

impl ErrorRecoveryAction {
    /// Backoff delay, for the retrying variants.
    pub fn delay(&self) -> Option<Duration> {
        match self {
            ErrorRecoveryAction::Retry { delay }
            | ErrorRecoveryAction::ReconnectAndRetry { delay, .. } => Some(*delay),
            ErrorRecoveryAction::FailFast { .. } | ErrorRecoveryAction::Fail { .. } => None,
        }
    }

    pub fn is_retry(&self) -> bool {
        self.delay().is_some()
    }
}

/// Backoff policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryStrategy {
    /// Retries after the first attempt (total attempts = max_retries + 1)
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Cap applied before jitter
    pub max_delay: Duration,
    /// Double the delay on every retry
    pub exponential_backoff: bool,
    /// Add uniform random jitter in `[0, delay)`
    pub jitter: bool,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            exponential_backoff: true,
            jitter: true,
        }
    }
}

impl RetryStrategy {
    /// A strategy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Delay before retry number `retry` (1-based), without jitter.
    ///
    /// Formula: `min(base_delay * 2^(retry-1), max_delay)` with exponential
    /// backoff, `base_delay` otherwise.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if !self.exponential_backoff {
            return self.base_delay;
        }

        let exponent = retry.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }

    /// Delay before retry number `retry`, with jitter when enabled.
    pub fn backoff(&self, retry: u32) -> Duration {
        let delay = self.delay_for_retry(retry);
        if !self.jitter || delay.is_zero() {
            return delay;
        }

        let jitter = delay.mul_f64(rand::random::<f64>());
        delay + jitter
    }

    /// Validate the strategy
    pub fn validate(&self) -> Result<(), String> {
        if self.max_delay < self.base_delay {
            return Err("max_delay must not be smaller than base_delay".to_string());
        }
        Ok(())
    }
}

/// Decide how to proceed after a failure.
///
/// `context.retry_count` is the number of retries already performed.
pub fn recovery_action(
    error: &Neo4jError,
    context: &ErrorContext,
    strategy: &RetryStrategy,
) -> ErrorRecoveryAction {
    let kind = classify(error);

    if kind == ErrorKind::CircuitOpen {
        return ErrorRecoveryAction::FailFast {
            reason: error.to_string(),
        };
    }

    if !kind.is_retryable() {
        return ErrorRecoveryAction::Fail {
            reason: format!("non-retryable {:?}: {}", kind, error),
        };
    }

    if context.retry_count >= strategy.max_retries {
        return ErrorRecoveryAction::Fail {
            reason: format!(
                "retries exhausted after {} attempt(s): {}",
                context.retry_count + 1,
                error
            ),
        };
    }

    let delay = strategy.backoff(context.retry_count + 1);
    if kind.requires_reconnect() {
        ErrorRecoveryAction::ReconnectAndRetry {
            delay,
            reason: format!("{:?}: {}", kind, error),
        }
    } else {
        ErrorRecoveryAction::Retry { delay }
    }
}

/// Result of one attempt, as seen by the retry loop
#[derive(Debug)]
pub enum Outcome<T> {
    Success(T),
    Retryable(Neo4jError),
    Fatal(Neo4jError),
}

impl<T> Outcome<T> {
    /// Classify an attempt result.
    pub fn from_result(result: std::result::Result<T, Neo4jError>) -> Self {
        match result {
            Ok(value) => Outcome::Success(value),
            Err(error) if classify(&error).is_retryable() => Outcome::Retryable(error),
            Err(error) => Outcome::Fatal(error),
        }
    }
}

/// A failed attempt together with the session it ran on
#[derive(Debug)]
pub struct AttemptFailure {
    pub error: Neo4jError,
    pub session_id: Option<String>,
}

impl AttemptFailure {
    pub fn new(error: Neo4jError, session_id: Option<String>) -> Self {
        Self { error, session_id }
    }
}

impl From<Neo4jError> for AttemptFailure {
    fn from(error: Neo4jError) -> Self {
        Self {
            error,
            session_id: None,
        }
    }
}

/// Counters collected by one retry loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryStats {
    /// Attempts made, including the first
    pub attempts: u32,
    /// Retries performed (attempts - 1 on eventual success)
    pub retries: u32,
    /// Failed attempts classified as deadlocks
    pub deadlocks: u32,
}

/// Successful retry loop
#[derive(Debug)]
pub struct Retried<T> {
    pub value: T,
    pub stats: RetryStats,
}

/// Terminal failure of a retry loop
#[derive(Debug)]
pub struct RetryFailure {
    /// Last underlying error
    pub error: Neo4jError,
    /// The action that ended the loop (`Fail` or `FailFast`)
    pub action: ErrorRecoveryAction,
    pub stats: RetryStats,
}

impl From<Neo4jError> for RetryFailure {
    fn from(error: Neo4jError) -> Self {
        let action = fatal_action(&error);
        Self {
            error,
            action,
            stats: RetryStats::default(),
        }
    }
}

impl CircuitFailure for RetryFailure {
    fn trips_circuit(&self) -> bool {
        self.error.trips_circuit()
    }
}

/// Execute `attempt_fn` with classification and backoff.
///
/// `attempt_fn` receives the 1-based attempt number. The first attempt runs
/// immediately; retryable failures are retried up to `strategy.max_retries`
/// times; anything else ends the loop.
pub async fn execute_with_retry<T, F, Fut>(
    operation: &str,
    strategy: &RetryStrategy,
    mut attempt_fn: F,
) -> Result<Retried<T>, RetryFailure>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, AttemptFailure>>,
{
    let mut stats = RetryStats::default();

    loop {
        stats.attempts += 1;
        let (outcome, session_id) = match attempt_fn(stats.attempts).await {
            Ok(value) => (Outcome::Success(value), None),
            Err(failure) => (Outcome::from_result(Err(failure.error)), failure.session_id),
        };

        let error = match outcome {
            Outcome::Success(value) => {
                if stats.retries > 0 {
                    debug!(
                        "{} succeeded after {} retries",
                        operation, stats.retries
                    );
                }
                return Ok(Retried { value, stats });
            }
            Outcome::Fatal(error) => {
                let action = fatal_action(&error);
                error!("{} failed (session {:?}): {:?}", operation, session_id, action);
                return Err(RetryFailure {
                    error,
                    action,
                    stats,
                });
            }
            Outcome::Retryable(error) => error,
        };

        if classify(&error) == ErrorKind::Deadlock {
            stats.deadlocks += 1;
        }

        let context = ErrorContext::new(operation, stats.retries).with_session(session_id);
        let action = recovery_action(&error, &context, strategy);

        match action.delay() {
            Some(delay) => {
                stats.retries += 1;
                warn!(
                    "{} failed (attempt {}/{}, session {:?}): {}; retrying in {:?}",
                    operation,
                    stats.attempts,
                    strategy.max_retries + 1,
                    context.session_id,
                    error,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            None => {
                warn!("{} giving up: {:?}", operation, action);
                return Err(RetryFailure {
                    error,
                    action,
                    stats,
                });
            }
        }
    }
}

fn fatal_action(error: &Neo4jError) -> ErrorRecoveryAction {
    match classify(error) {
        ErrorKind::CircuitOpen => ErrorRecoveryAction::FailFast {
            reason: error.to_string(),
        },
        kind => ErrorRecoveryAction::Fail {
            reason: format!("non-retryable {:?}: {}", kind, error),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_strategy(max_retries: u32) -> RetryStrategy {
        RetryStrategy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            exponential_backoff: true,
            jitter: false,
        }
    }

    #[test]
    fn test_classification() {
        assert_eq!(classify(&Neo4jError::Deadlock("x".into())), ErrorKind::Deadlock);
        assert_eq!(
            classify(&Neo4jError::ConnectionError("reset".into())),
            ErrorKind::Connection
        );
        assert_eq!(
            classify(&Neo4jError::TimeoutError {
                timeout_ms: 10,
                context: "t".into()
            }),
            ErrorKind::Timeout
        );
        assert_eq!(
            classify(&Neo4jError::ConstraintViolation("dup".into())),
            ErrorKind::ConstraintViolation
        );
        assert_eq!(
            classify(&Neo4jError::QueryError("syntax".into())),
            ErrorKind::MalformedQuery
        );
        assert_eq!(
            classify(&Neo4jError::AuthenticationError("bad".into())),
            ErrorKind::Authentication
        );
        assert_eq!(
            classify(&Neo4jError::AcquisitionTimeout {
                timeout_ms: 1,
                max_pool_size: 1
            }),
            ErrorKind::ResourceExhausted
        );
        assert_eq!(
            classify(&Neo4jError::CircuitOpen {
                failure_count: 5,
                retry_after_ms: 100
            }),
            ErrorKind::CircuitOpen
        );
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::Deadlock.is_retryable());
        assert!(ErrorKind::Connection.is_retryable());
        assert!(ErrorKind::ServiceUnavailable.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(!ErrorKind::ConstraintViolation.is_retryable());
        assert!(!ErrorKind::MalformedQuery.is_retryable());
        assert!(!ErrorKind::Authentication.is_retryable());
        assert!(!ErrorKind::ResourceExhausted.is_retryable());

        assert!(!ErrorKind::ConstraintViolation.trips_circuit());
        assert!(ErrorKind::Connection.trips_circuit());
    }

    #[test]
    fn test_backoff_schedule() {
        let strategy = RetryStrategy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(5000),
            exponential_backoff: true,
            jitter: false,
        };

        let delays: Vec<u128> = (1..=3)
            .map(|retry| strategy.delay_for_retry(retry).as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 400]);

        for retry in 1..=40 {
            assert!(strategy.delay_for_retry(retry) <= strategy.max_delay);
        }
        assert_eq!(strategy.delay_for_retry(20), Duration::from_millis(5000));
    }

    #[test]
    fn test_fixed_backoff() {
        let strategy = RetryStrategy {
            exponential_backoff: false,
            jitter: false,
            ..Default::default()
        };
        assert_eq!(strategy.delay_for_retry(1), Duration::from_millis(100));
        assert_eq!(strategy.delay_for_retry(3), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_bounds() {
        let strategy = RetryStrategy {
            jitter: true,
            ..Default::default()
        };

        for _ in 0..50 {
            let delay = strategy.backoff(2);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay < Duration::from_millis(400));
        }
    }

    #[test]
    fn test_recovery_actions() {
        let strategy = fast_strategy(2);

        let action = recovery_action(
            &Neo4jError::Deadlock("x".into()),
            &ErrorContext::new("op", 0),
            &strategy,
        );
        assert!(matches!(action, ErrorRecoveryAction::Retry { .. }));

        let action = recovery_action(
            &Neo4jError::ConnectionError("reset".into()),
            &ErrorContext::new("op", 1),
            &strategy,
        );
        assert!(matches!(action, ErrorRecoveryAction::ReconnectAndRetry { .. }));

        let action = recovery_action(
            &Neo4jError::Deadlock("x".into()),
            &ErrorContext::new("op", 2),
            &strategy,
        );
        assert!(matches!(action, ErrorRecoveryAction::Fail { .. }));

        let action = recovery_action(
            &Neo4jError::ConstraintViolation("dup".into()),
            &ErrorContext::new("op", 0),
            &strategy,
        );
        assert!(matches!(action, ErrorRecoveryAction::Fail { .. }));

        let action = recovery_action(
            &Neo4jError::CircuitOpen {
                failure_count: 5,
                retry_after_ms: 10,
            },
            &ErrorContext::new("op", 0),
            &strategy,
        );
        assert!(matches!(action, ErrorRecoveryAction::FailFast { .. }));
    }

    #[tokio::test]
    async fn test_succeeds_first_try() {
        let result = execute_with_retry("op", &fast_strategy(3), |_| async { Ok(42) }).await;
        let retried = result.unwrap();
        assert_eq!(retried.value, 42);
        assert_eq!(retried.stats.attempts, 1);
        assert_eq!(retried.stats.retries, 0);
    }

    #[tokio::test]
    async fn test_succeeds_after_retries() {
        let calls = AtomicU32::new(0);
        let result = execute_with_retry("op", &fast_strategy(5), |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(AttemptFailure::from(Neo4jError::Deadlock("lock".into())))
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        let retried = result.unwrap();
        assert_eq!(retried.value, "done");
        assert_eq!(retried.stats.attempts, 3);
        assert_eq!(retried.stats.retries, 2);
        assert_eq!(retried.stats.deadlocks, 2);
    }

    #[tokio::test]
    async fn test_exhausts_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<Retried<()>, RetryFailure> =
            execute_with_retry("op", &fast_strategy(3), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(AttemptFailure::from(Neo4jError::ServiceUnavailable("down".into()))) }
            })
            .await;

        let failure = result.unwrap_err();
        // max_retries=3 means 4 attempts total
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(failure.stats.attempts, 4);
        assert_eq!(failure.stats.retries, 3);
        assert!(matches!(failure.error, Neo4jError::ServiceUnavailable(_)));
        assert!(matches!(failure.action, ErrorRecoveryAction::Fail { .. }));
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<Retried<()>, RetryFailure> =
            execute_with_retry("op", &fast_strategy(5), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(AttemptFailure::from(Neo4jError::ConstraintViolation("dup".into()))) }
            })
            .await;

        let failure = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(failure.stats.attempts, 1);
        assert_eq!(failure.stats.retries, 0);
        assert!(matches!(failure.action, ErrorRecoveryAction::Fail { .. }));
    }

    #[tokio::test]
    async fn test_circuit_open_fails_fast_inside_loop() {
        let calls = AtomicU32::new(0);
        let result: Result<Retried<()>, RetryFailure> =
            execute_with_retry("op", &fast_strategy(5), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(AttemptFailure::from(Neo4jError::CircuitOpen {
                        failure_count: 5,
                        retry_after_ms: 100,
                    }))
                }
            })
            .await;

        let failure = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(failure.stats.retries, 0);
        assert!(matches!(failure.action, ErrorRecoveryAction::FailFast { .. }));
    }

    #[tokio::test]
    async fn test_transient_server_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let result = execute_with_retry("op", &fast_strategy(3), |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(AttemptFailure::from(Neo4jError::from_server_message(
                        "Neo.TransientError.Transaction.LockClientStopped: terminated",
                    )))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        let retried = result.unwrap();
        assert_eq!(retried.stats.attempts, 2);
        assert_eq!(retried.stats.deadlocks, 0);
    }

    #[test]
    fn test_unknown_database_errors_trip_without_retry() {
        let error =
            Neo4jError::from_server_message("Neo.DatabaseError.General.UnknownError: boom");
        let kind = classify(&error);
        assert_eq!(kind, ErrorKind::Unknown);
        assert!(!kind.is_retryable());
        assert!(error.trips_circuit());

        let transient = classify(&Neo4jError::from_server_message(
            "Neo.TransientError.General.OutOfMemoryError",
        ));
        assert_eq!(transient, ErrorKind::Transient);
        assert!(transient.is_retryable());
        assert!(transient.trips_circuit());
        assert!(!transient.requires_reconnect());
    }

    #[test]
    fn test_outcome_from_result() {
        assert!(matches!(Outcome::from_result(Ok::<_, Neo4jError>(1)), Outcome::Success(1)));
        assert!(matches!(
            Outcome::<()>::from_result(Err(Neo4jError::Deadlock("x".into()))),
            Outcome::Retryable(_)
        ));
        assert!(matches!(
            Outcome::<()>::from_result(Err(Neo4jError::QueryError("x".into()))),
            Outcome::Fatal(_)
        ));
    }
}
