//! # Hive Knowledge Graph (hive-kg)
//!
//! Resilient transaction layer over a Neo4j graph database, used to persist
//! the shared state of multi-agent project runs.
//!
//! ## Features
//!
//! - Bounded session pool with acquire timeout, idle eviction and warm-up
//! - Circuit breaker with a sliding failure window and single half-open probe
//! - Error classification with exponential backoff and jitter for transient failures
//! - Read, write and prioritized batch transactions with per-call overrides
//! - Transaction, session and breaker metrics
//! - Storage health reporting with degraded state detection
//!
//! ## Quick Start
//!
//! ```no_run
//! use hive_kg::{KgConfig, TransactionManager, TransactionOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let manager = TransactionManager::connect(&KgConfig::from_env()?).await?;
//!
//!     let count = manager
//!         .execute_in_read_transaction(
//!             |tx| {
//!                 Box::pin(async move {
//!                     let result = tx
//!                         .run("MATCH (t:Task) RETURN count(t) AS count", Default::default())
//!                         .await?;
//!                     Ok::<_, hive_kg::Neo4jError>(result.single_i64("count").unwrap_or(0))
//!                 })
//!             },
//!             TransactionOptions::default(),
//!         )
//!         .await?;
//!
//!     println!("{} tasks", count.data);
//!     println!("{:?}", manager.get_detailed_metrics());
//!     manager.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Batches
//!
//! ```no_run
//! use hive_kg::{driver::params, BatchOperation, Priority, TransactionManager, TransactionOptions};
//! use serde_json::json;
//!
//! # async fn run(manager: &TransactionManager) -> hive_kg::Result<()> {
//! let batch = vec![
//!     BatchOperation::new("CREATE (t:Task {id: $id})", params(json!({"id": "task-002"})))
//!         .priority(Priority::Low),
//!     BatchOperation::new("CREATE (t:Task {id: $id})", params(json!({"id": "task-001"})))
//!         .priority(Priority::High),
//! ];
//!
//! // task-001 is created first; both or neither are committed
//! manager.execute_batch(batch, TransactionOptions::default()).await?;
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod driver;
pub mod error;
pub mod health;
pub mod pool;
pub mod retry;
pub mod transaction;

// Re-export main types for convenience
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState, CircuitState};
pub use config::KgConfig;
pub use driver::{AccessMode, GraphDriver, Params, QueryResult, Record};
pub use error::{Neo4jError, Result};
pub use health::{HealthStatus, StorageHealth};
pub use pool::{SessionMetrics, SessionPool, SessionPoolConfig};
pub use retry::{ErrorKind, ErrorRecoveryAction, RetryStrategy};
pub use transaction::{
    BatchOperation, DetailedMetrics, IsolationLevel, Neo4jOperationResult, OperationKind,
    Priority, Transaction, TransactionDefaults, TransactionManager, TransactionMetrics,
    TransactionOptions,
};
