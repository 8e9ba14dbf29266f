//! Circuit breaker for the graph database
//!
//! Tracks call outcomes over a sliding `monitoring_period`. Once at least
//! `minimum_throughput` calls were observed in the window and
//! `failure_threshold` of them failed, the circuit opens and every call is
//! rejected without reaching the database until `recovery_timeout` has
//! passed. The next call after that is admitted as the single half-open
//! probe: success closes the circuit, failure re-opens it.
//!
//! State only moves along `Closed -> Open -> HalfOpen -> {Closed | Open}`;
//! [`CircuitBreaker::force_open`] and [`CircuitBreaker::force_close`] bypass
//! that for operators.

use crate::error::{Neo4jError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Errors that can tell the breaker whether they reflect resource health
pub trait CircuitFailure {
    /// Whether this failure counts against the protected resource.
    fn trips_circuit(&self) -> bool;
}

/// Configuration for the circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failures within the monitoring period that open the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open before a probe is admitted
    pub recovery_timeout: Duration,
    /// Sliding window over which calls and failures are counted
    pub monitoring_period: Duration,
    /// Calls that must be observed in the window before the circuit may open
    pub minimum_throughput: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            monitoring_period: Duration::from_secs(60),
            minimum_throughput: 10,
        }
    }
}

impl CircuitBreakerConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(Neo4jError::ConfigError(
                "failure_threshold must be greater than 0".to_string(),
            ));
        }
        if self.monitoring_period.is_zero() {
            return Err(Neo4jError::ConfigError(
                "monitoring_period must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Circuit states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation, all calls pass through
    Closed,
    /// Failing fast, calls are rejected immediately
    Open,
    /// One probe call is in flight
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Point-in-time view of the breaker
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub next_attempt_time: Option<DateTime<Utc>>,
}

struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    next_attempt: Option<Instant>,
    /// (when, failed) for calls completed while closed
    window: VecDeque<(Instant, bool)>,
    /// Bumped on every transition; stale permits are ignored
    generation: u64,
}

impl BreakerInner {
    fn transition(&mut self, to: CircuitState) {
        debug!("Circuit breaker {} -> {}", self.state, to);
        self.state = to;
        self.generation += 1;
    }

    fn prune(&mut self, now: Instant, period: Duration) {
        while let Some((at, _)) = self.window.front() {
            if now.duration_since(*at) > period {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Kind of admission granted by [`CircuitBreaker::try_acquire`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermitKind {
    /// Circuit closed, regular call
    Normal,
    /// Half-open trial call
    Probe,
}

/// Permission to make one call
///
/// Report the outcome with [`record_success`](Self::record_success) or
/// [`record_failure`](Self::record_failure). A probe permit dropped without
/// an outcome returns the circuit to open with an immediate retry time.
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    kind: PermitKind,
    generation: u64,
    completed: bool,
}

impl CallPermit<'_> {
    pub fn kind(&self) -> PermitKind {
        self.kind
    }

    pub fn record_success(mut self) {
        self.completed = true;
        self.breaker.on_success(self.kind, self.generation);
    }

    pub fn record_failure(mut self) {
        self.completed = true;
        self.breaker.on_failure(self.kind, self.generation);
    }

    /// Record an error outcome, counting it only if it reflects resource health.
    pub fn record_error<E: CircuitFailure>(self, error: &E) {
        if error.trips_circuit() {
            self.record_failure();
        } else {
            self.record_success();
        }
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.completed && self.kind == PermitKind::Probe {
            self.breaker.on_probe_abandoned(self.generation);
        }
    }
}

/// Thread-safe circuit breaker
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                next_attempt: None,
                window: VecDeque::new(),
                generation: 0,
            }),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Ask to make a call.
    ///
    /// Returns [`Neo4jError::CircuitOpen`] while open, and while another
    /// caller holds the half-open probe.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>> {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        let kind = match inner.state {
            CircuitState::Closed => PermitKind::Normal,
            CircuitState::Open => match inner.next_attempt {
                Some(next) if now >= next => {
                    inner.transition(CircuitState::HalfOpen);
                    info!("Circuit breaker half-open, admitting probe call");
                    PermitKind::Probe
                }
                _ => return Err(Self::rejection(&inner, now)),
            },
            CircuitState::HalfOpen => return Err(Self::rejection(&inner, now)),
        };

        Ok(CallPermit {
            breaker: self,
            kind,
            generation: inner.generation,
            completed: false,
        })
    }

    /// Run `f` under the breaker.
    ///
    /// While open, `f` is not invoked and the rejection is converted into `E`.
    pub async fn execute<T, E, F, Fut>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Neo4jError> + CircuitFailure,
    {
        let permit = self.try_acquire().map_err(E::from)?;

        match f().await {
            Ok(value) => {
                permit.record_success();
                Ok(value)
            }
            Err(error) => {
                permit.record_error(&error);
                Err(error)
            }
        }
    }

    /// Current state snapshot.
    pub fn state(&self) -> CircuitBreakerState {
        let inner = self.inner.lock();
        let now = Instant::now();
        let wall_now = Utc::now();

        CircuitBreakerState {
            state: inner.state,
            failure_count: inner.failure_count,
            last_failure_time: inner.last_failure.map(|at| to_wall(at, now, wall_now)),
            next_attempt_time: inner.next_attempt.map(|at| to_wall(at, now, wall_now)),
        }
    }

    pub fn current_state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.current_state() == CircuitState::Open
    }

    /// Operator override: open the circuit now.
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        inner.transition(CircuitState::Open);
        inner.next_attempt = Some(Instant::now() + self.config.recovery_timeout);
        warn!("Circuit breaker forced open");
    }

    /// Operator override: close the circuit and forget recorded failures.
    pub fn force_close(&self) {
        let mut inner = self.inner.lock();
        inner.transition(CircuitState::Closed);
        inner.failure_count = 0;
        inner.next_attempt = None;
        inner.window.clear();
        info!("Circuit breaker forced closed");
    }

    fn rejection(inner: &BreakerInner, now: Instant) -> Neo4jError {
        let retry_after = inner
            .next_attempt
            .map(|next| next.saturating_duration_since(now))
            .unwrap_or_default();

        Neo4jError::CircuitOpen {
            failure_count: inner.failure_count,
            retry_after_ms: retry_after.as_millis() as u64,
        }
    }

    fn on_success(&self, kind: PermitKind, generation: u64) {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        match kind {
            PermitKind::Probe if inner.generation == generation => {
                inner.transition(CircuitState::Closed);
                inner.failure_count = 0;
                inner.next_attempt = None;
                inner.window.clear();
                info!("Circuit breaker closed after successful probe");
            }
            PermitKind::Normal if inner.state == CircuitState::Closed => {
                inner.window.push_back((now, false));
                self.evaluate_window(&mut inner, now);
            }
            _ => {}
        }
    }

    fn on_failure(&self, kind: PermitKind, generation: u64) {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        match kind {
            PermitKind::Probe if inner.generation == generation => {
                inner.transition(CircuitState::Open);
                inner.failure_count += 1;
                inner.last_failure = Some(now);
                inner.next_attempt = Some(now + self.config.recovery_timeout);
                warn!(
                    "Circuit breaker probe failed, re-opened for {:?}",
                    self.config.recovery_timeout
                );
            }
            PermitKind::Normal if inner.state == CircuitState::Closed => {
                inner.last_failure = Some(now);
                inner.window.push_back((now, true));
                self.evaluate_window(&mut inner, now);
            }
            _ => {}
        }
    }

    /// Prune the window and open the circuit once both throughput and
    /// failure threshold are met, whichever kind of call completed it.
    fn evaluate_window(&self, inner: &mut BreakerInner, now: Instant) {
        inner.prune(now, self.config.monitoring_period);
        inner.failure_count = count_failures(&inner.window);

        let calls = inner.window.len() as u32;
        if calls >= self.config.minimum_throughput
            && inner.failure_count >= self.config.failure_threshold
        {
            inner.transition(CircuitState::Open);
            inner.next_attempt = Some(now + self.config.recovery_timeout);
            inner.window.clear();
            warn!(
                "Circuit breaker opened after {} failures in {} calls",
                inner.failure_count, calls
            );
        }
    }

    fn on_probe_abandoned(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation == generation && inner.state == CircuitState::HalfOpen {
            inner.transition(CircuitState::Open);
            inner.next_attempt = Some(Instant::now());
            debug!("Circuit breaker probe abandoned, next call may probe");
        }
    }
}

fn count_failures(window: &VecDeque<(Instant, bool)>) -> u32 {
    window.iter().filter(|(_, failed)| *failed).count() as u32
}

fn to_wall(at: Instant, now: Instant, wall_now: DateTime<Utc>) -> DateTime<Utc> {
    if at <= now {
        let ago = chrono::Duration::from_std(now - at).unwrap_or_else(|_| chrono::Duration::zero());
        wall_now - ago
    } else {
        let ahead =
            chrono::Duration::from_std(at - now).unwrap_or_else(|_| chrono::Duration::zero());
        wall_now + ahead
    }
}
