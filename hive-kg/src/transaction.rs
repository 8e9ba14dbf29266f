//! Resilient transaction manager
//!
//! Every call goes through the same path:
//!
//! ```text
//! circuit breaker -> retry loop -> acquire session -> begin (read|write)
//!     -> operation -> commit | rollback -> release session -> metrics
//! ```
//!
//! The breaker sees one outcome per call, after retries. Each attempt is
//! bounded by the transaction timeout and runs on its own session; a session
//! whose attempt failed with a connection-level error is discarded instead
//! of going back to the pool.
//!
//! # Example
//! ```no_run
//! use hive_kg::{config::KgConfig, driver::params, transaction::{TransactionManager, TransactionOptions}};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let manager = TransactionManager::connect(&KgConfig::from_env()?).await?;
//!
//!     let result = manager
//!         .execute_in_write_transaction(
//!             |tx| {
//!                 Box::pin(async move {
//!                     tx.run(
//!                         "CREATE (t:Task {id: $id, title: $title})",
//!                         params(json!({"id": "task-001", "title": "Setup database"})),
//!                     )
//!                     .await
//!                 })
//!             },
//!             TransactionOptions::default(),
//!         )
//!         .await?;
//!
//!     println!("Took {:?}", result.metrics.execution_time);
//!     manager.close().await?;
//!     Ok(())
//! }
//! ```

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerState};
use crate::config::KgConfig;
use crate::driver::neo4j::Neo4jDriver;
use crate::driver::{AccessMode, DriverTransaction, GraphDriver, Params, QueryResult};
use crate::error::{Neo4jError, Result};
use crate::health::{StorageHealth, DEFAULT_DEGRADED_THRESHOLD};
use crate::pool::{PooledSession, SessionMetrics, SessionPool};
use crate::retry::{classify, execute_with_retry, AttemptFailure, RetryFailure, RetryStats, RetryStrategy};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Isolation level requested for a transaction
///
/// Neo4j runs every transaction at read-committed; the level is carried
/// through options for callers that record it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// Process-wide transaction defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionDefaults {
    /// Bound on one attempt (begin through commit)
    pub timeout: Duration,
    pub retry_strategy: RetryStrategy,
    pub isolation_level: IsolationLevel,
    pub readonly: bool,
}

impl Default for TransactionDefaults {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retry_strategy: RetryStrategy::default(),
            isolation_level: IsolationLevel::default(),
            readonly: false,
        }
    }
}

impl TransactionDefaults {
    /// Validate the defaults
    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(Neo4jError::ConfigError(
                "transaction timeout must be greater than 0".to_string(),
            ));
        }
        self.retry_strategy
            .validate()
            .map_err(Neo4jError::ConfigError)
    }
}

/// Per-call overrides; unset fields fall back to [`TransactionDefaults`]
#[derive(Debug, Clone, Default)]
pub struct TransactionOptions {
    pub timeout: Option<Duration>,
    pub retry_strategy: Option<RetryStrategy>,
    pub isolation_level: Option<IsolationLevel>,
    /// Overrides `retry_strategy.max_retries`
    pub max_retries: Option<u32>,
    pub readonly: Option<bool>,
}

impl TransactionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.retry_strategy = Some(strategy);
        self
    }

    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = Some(level);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = Some(readonly);
        self
    }

    /// Merge onto `defaults` without modifying them.
    pub fn resolve(&self, defaults: &TransactionDefaults) -> ResolvedOptions {
        let mut retry_strategy = self
            .retry_strategy
            .clone()
            .unwrap_or_else(|| defaults.retry_strategy.clone());
        if let Some(max_retries) = self.max_retries {
            retry_strategy.max_retries = max_retries;
        }

        ResolvedOptions {
            timeout: self.timeout.unwrap_or(defaults.timeout),
            retry_strategy,
            isolation_level: self.isolation_level.unwrap_or(defaults.isolation_level),
            readonly: self.readonly.unwrap_or(defaults.readonly),
        }
    }
}

/// Effective options of one call
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedOptions {
    pub timeout: Duration,
    pub retry_strategy: RetryStrategy,
    pub isolation_level: IsolationLevel,
    pub readonly: bool,
}

impl ResolvedOptions {
    pub fn access_mode(&self) -> AccessMode {
        if self.readonly {
            AccessMode::Read
        } else {
            AccessMode::Write
        }
    }
}

/// Aggregate transaction statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransactionMetrics {
    pub total_transactions: u64,
    pub successful_transactions: u64,
    pub failed_transactions: u64,
    /// EMA of successful call duration in milliseconds (smoothing 0.1)
    pub average_execution_time: f64,
    pub retry_count: u64,
    pub deadlock_count: u64,
}

/// Transaction, session and breaker statistics together
#[derive(Debug, Clone, Serialize)]
pub struct DetailedMetrics {
    pub transaction: TransactionMetrics,
    pub session: SessionMetrics,
    pub circuit_breaker: CircuitBreakerState,
}

/// Per-call measurements returned with the data
#[derive(Debug, Clone, Serialize)]
pub struct OperationMetrics {
    /// Wall-clock time of the whole call, retries included
    pub execution_time: Duration,
    /// Records returned by queries in the successful attempt
    pub record_count: usize,
    /// Session the successful attempt ran on
    pub session_id: String,
}

/// Result envelope of every manager call
#[derive(Debug, Clone, Serialize)]
pub struct Neo4jOperationResult<T> {
    pub data: T,
    pub metrics: OperationMetrics,
}

/// Batch ordering priority; `High` runs first
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

/// Declared kind of a batch operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    Read,
    #[default]
    Write,
}

/// One query of a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOperation {
    pub query: String,
    pub params: Params,
    pub operation_kind: OperationKind,
    pub priority: Priority,
}

impl BatchOperation {
    pub fn new(query: impl Into<String>, params: Params) -> Self {
        Self {
            query: query.into(),
            params,
            operation_kind: OperationKind::default(),
            priority: Priority::default(),
        }
    }

    pub fn read(query: impl Into<String>, params: Params) -> Self {
        Self::new(query, params).kind(OperationKind::Read)
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn kind(mut self, kind: OperationKind) -> Self {
        self.operation_kind = kind;
        self
    }
}

/// Stable sort by priority; equal priorities keep their submitted order.
pub fn order_batch(mut operations: Vec<BatchOperation>) -> Vec<BatchOperation> {
    operations.sort_by_key(|op| op.priority);
    operations
}

/// Open transaction handed to an operation
pub struct Transaction {
    inner: Box<dyn DriverTransaction>,
    mode: AccessMode,
    session_id: Uuid,
    record_count: usize,
}

impl Transaction {
    fn new(inner: Box<dyn DriverTransaction>, mode: AccessMode, session_id: Uuid) -> Self {
        Self {
            inner,
            mode,
            session_id,
            record_count: 0,
        }
    }

    /// Run a query in this transaction.
    pub async fn run(&mut self, query: &str, params: Params) -> Result<QueryResult> {
        let result = self.inner.run(query, &params).await?;
        self.record_count += result.records.len();
        Ok(result)
    }

    /// Run one batch operation.
    pub async fn run_operation(&mut self, operation: &BatchOperation) -> Result<QueryResult> {
        let result = self.inner.run(&operation.query, &operation.params).await?;
        self.record_count += result.records.len();
        Ok(result)
    }

    pub fn access_mode(&self) -> AccessMode {
        self.mode
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }
}

/// Transaction manager
pub struct TransactionManager {
    pool: SessionPool,
    breaker: CircuitBreaker,
    defaults: TransactionDefaults,
    metrics: Mutex<TransactionMetrics>,
    degraded_threshold: Duration,
}

impl TransactionManager {
    /// Build a manager over an already connected driver.
    ///
    /// The pool starts empty; call [`SessionPool::warm_up`] through
    /// [`pool`](Self::pool) to pre-open sessions.
    pub fn new(driver: Arc<dyn GraphDriver>, config: &KgConfig) -> Self {
        Self {
            pool: SessionPool::new(driver, config.pool.clone()),
            breaker: CircuitBreaker::new(config.circuit_breaker.clone()),
            defaults: config.transaction.clone(),
            metrics: Mutex::new(TransactionMetrics::default()),
            degraded_threshold: DEFAULT_DEGRADED_THRESHOLD,
        }
    }

    /// Connect to Neo4j, warm the pool up and start its sweeper.
    pub async fn connect(config: &KgConfig) -> Result<Self> {
        config.validate()?;

        let driver = Neo4jDriver::connect(config).await?;
        let manager = Self::new(Arc::new(driver), config);
        manager.pool.warm_up().await?;
        manager.pool.spawn_sweeper();

        info!(
            "Transaction manager ready (pool: {}..{}, timeout: {:?}, max_retries: {})",
            config.pool.min_pool_size,
            config.pool.max_pool_size,
            config.transaction.timeout,
            config.transaction.retry_strategy.max_retries
        );
        Ok(manager)
    }

    /// Response time above which [`storage_health`](Self::storage_health)
    /// reports `Degraded`.
    pub fn with_degraded_threshold(mut self, threshold: Duration) -> Self {
        self.degraded_threshold = threshold;
        self
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn defaults(&self) -> &TransactionDefaults {
        &self.defaults
    }

    /// Run `op` in a transaction. Write mode unless `options.readonly` is set.
    pub async fn execute_in_transaction<T, F>(
        &self,
        op: F,
        options: TransactionOptions,
    ) -> Result<Neo4jOperationResult<T>>
    where
        T: Send,
        F: for<'t> Fn(&'t mut Transaction) -> BoxFuture<'t, Result<T>> + Send + Sync,
    {
        let resolved = options.resolve(&self.defaults);
        self.execute("transaction", resolved, op).await
    }

    /// Run `op` in a read transaction.
    pub async fn execute_in_read_transaction<T, F>(
        &self,
        op: F,
        options: TransactionOptions,
    ) -> Result<Neo4jOperationResult<T>>
    where
        T: Send,
        F: for<'t> Fn(&'t mut Transaction) -> BoxFuture<'t, Result<T>> + Send + Sync,
    {
        let resolved = options.readonly(true).resolve(&self.defaults);
        self.execute("read transaction", resolved, op).await
    }

    /// Run `op` in a write transaction.
    pub async fn execute_in_write_transaction<T, F>(
        &self,
        op: F,
        options: TransactionOptions,
    ) -> Result<Neo4jOperationResult<T>>
    where
        T: Send,
        F: for<'t> Fn(&'t mut Transaction) -> BoxFuture<'t, Result<T>> + Send + Sync,
    {
        let resolved = options.readonly(false).resolve(&self.defaults);
        self.execute("write transaction", resolved, op).await
    }

    /// Run `operations` in one write transaction, ordered by priority.
    ///
    /// Results come back in execution order. Any failure rolls back the
    /// whole batch.
    pub async fn execute_batch(
        &self,
        operations: Vec<BatchOperation>,
        options: TransactionOptions,
    ) -> Result<Neo4jOperationResult<Vec<QueryResult>>> {
        let ordered = Arc::new(order_batch(operations));
        debug!("Executing batch of {} operations", ordered.len());

        let resolved = options.readonly(false).resolve(&self.defaults);
        self.execute("batch", resolved, move |tx| {
            let ordered = ordered.clone();
            Box::pin(async move {
                let mut results = Vec::with_capacity(ordered.len());
                for operation in ordered.iter() {
                    results.push(tx.run_operation(operation).await?);
                }
                Ok::<_, Neo4jError>(results)
            })
        })
        .await
    }

    async fn execute<T, F>(
        &self,
        operation: &'static str,
        resolved: ResolvedOptions,
        op: F,
    ) -> Result<Neo4jOperationResult<T>>
    where
        T: Send,
        F: for<'t> Fn(&'t mut Transaction) -> BoxFuture<'t, Result<T>> + Send + Sync,
    {
        let mode = resolved.access_mode();
        let timeout = resolved.timeout;
        let strategy = &resolved.retry_strategy;
        let op = &op;

        debug!(
            "Starting {} ({}, {:?}, timeout {:?})",
            operation,
            mode.as_str(),
            resolved.isolation_level,
            timeout
        );

        let start = Instant::now();
        let attempt = move |_attempt: u32| self.run_attempt::<T, F>(op, mode, timeout, operation);
        let result = self
            .breaker
            .execute(move || execute_with_retry(operation, strategy, attempt))
            .await;
        let elapsed = start.elapsed();

        match result {
            Ok(retried) => {
                self.record_outcome(Some(elapsed), retried.stats);
                let (data, record_count, session_id) = retried.value;
                Ok(Neo4jOperationResult {
                    data,
                    metrics: OperationMetrics {
                        execution_time: elapsed,
                        record_count,
                        session_id: session_id.to_string(),
                    },
                })
            }
            Err(failure) => {
                self.record_outcome(None, failure.stats);
                Err(terminal_error(operation, failure))
            }
        }
    }

    /// One attempt on one session. The session is released on every path.
    async fn run_attempt<T, F>(
        &self,
        op: &F,
        mode: AccessMode,
        timeout: Duration,
        operation: &'static str,
    ) -> std::result::Result<(T, usize, Uuid), AttemptFailure>
    where
        T: Send,
        F: for<'t> Fn(&'t mut Transaction) -> BoxFuture<'t, Result<T>> + Send + Sync,
    {
        let mut session = self.pool.acquire().await?;
        let session_id = session.id();

        let attempt =
            tokio::time::timeout(timeout, run_in_transaction(&mut session, op, mode, timeout))
                .await;

        let result = match attempt {
            Ok(result) => result,
            Err(_) => Err(Neo4jError::TimeoutError {
                timeout_ms: timeout.as_millis() as u64,
                context: operation.to_string(),
            }),
        };

        match result {
            Ok((value, record_count)) => {
                session.release().await;
                Ok((value, record_count, session_id))
            }
            Err(error) => {
                if classify(&error).requires_reconnect() {
                    session.mark_broken();
                }
                session.release().await;
                Err(AttemptFailure::new(error, Some(session_id.to_string())))
            }
        }
    }

    fn record_outcome(&self, elapsed: Option<Duration>, stats: RetryStats) {
        let mut metrics = self.metrics.lock();
        metrics.total_transactions += 1;
        match elapsed {
            Some(elapsed) => {
                let sample = elapsed.as_secs_f64() * 1000.0;
                metrics.successful_transactions += 1;
                metrics.average_execution_time =
                    0.9 * metrics.average_execution_time + 0.1 * sample;
            }
            None => metrics.failed_transactions += 1,
        }
        metrics.retry_count += u64::from(stats.retries);
        metrics.deadlock_count += u64::from(stats.deadlocks);
    }

    pub fn get_metrics(&self) -> TransactionMetrics {
        self.metrics.lock().clone()
    }

    pub fn get_detailed_metrics(&self) -> DetailedMetrics {
        DetailedMetrics {
            transaction: self.get_metrics(),
            session: self.pool.metrics(),
            circuit_breaker: self.breaker.state(),
        }
    }

    /// Operator reset of the transaction counters.
    pub fn reset_metrics(&self) {
        *self.metrics.lock() = TransactionMetrics::default();
        info!("Transaction metrics reset");
    }

    /// Run `RETURN 1` through the normal read path.
    pub async fn health_check(&self) -> bool {
        match self.probe().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Health check failed: {}", e);
                false
            }
        }
    }

    /// Health check timing combined with the breaker state.
    pub async fn storage_health(&self) -> StorageHealth {
        let start = Instant::now();
        let result = self.probe().await;
        let elapsed = start.elapsed();
        let circuit_state = self.breaker.current_state();

        match result {
            Ok(()) => StorageHealth::healthy(elapsed, circuit_state, self.degraded_threshold),
            Err(e) => {
                warn!("Storage health probe failed: {}", e);
                StorageHealth::unhealthy(elapsed, circuit_state, &e.to_string())
            }
        }
    }

    async fn probe(&self) -> Result<()> {
        self.execute_in_read_transaction(
            |tx| Box::pin(async move { tx.run("RETURN 1", Params::new()).await.map(|_| ()) }),
            TransactionOptions::default(),
        )
        .await
        .map(|_| ())
    }

    pub fn get_circuit_breaker_state(&self) -> CircuitBreakerState {
        self.breaker.state()
    }

    pub fn force_circuit_breaker_open(&self) {
        self.breaker.force_open();
    }

    pub fn force_circuit_breaker_closed(&self) {
        self.breaker.force_close();
    }

    /// Close the pool and the underlying driver.
    pub async fn close(&self) -> Result<()> {
        self.pool.close().await
    }
}

/// Begin, run `op`, then commit, or roll back if `op` failed.
///
/// Dropping this future mid-way drops the driver transaction, which leaves
/// no writes behind.
async fn run_in_transaction<T, F>(
    session: &mut PooledSession,
    op: &F,
    mode: AccessMode,
    timeout: Duration,
) -> Result<(T, usize)>
where
    T: Send,
    F: for<'t> Fn(&'t mut Transaction) -> BoxFuture<'t, Result<T>> + Send + Sync,
{
    let session_id = session.id();
    let inner = session.begin_transaction(mode, timeout).await?;
    let mut tx = Transaction::new(inner, mode, session_id);

    match op(&mut tx).await {
        Ok(value) => {
            tx.inner.commit().await?;
            Ok((value, tx.record_count))
        }
        Err(e) => {
            if let Err(rollback_err) = tx.inner.rollback().await {
                debug!("Rollback failed on session {}: {}", session_id, rollback_err);
            }
            Err(e)
        }
    }
}

fn terminal_error(operation: &str, failure: RetryFailure) -> Neo4jError {
    match failure.error {
        open @ Neo4jError::CircuitOpen { .. } => open,
        error => Neo4jError::TransactionFailed {
            operation: operation.to_string(),
            attempts: failure.stats.attempts,
            source: Box::new(error),
        },
    }
}
