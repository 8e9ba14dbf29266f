//! Graph database driver abstraction
//!
//! The resilience layer never talks to a wire protocol directly. It consumes
//! a connected driver through three small traits:
//!
//! - [`GraphDriver`]: the connected handle; opens sessions and closes the connection
//! - [`DriverSession`]: one logical connection, able to begin transactions
//! - [`DriverTransaction`]: runs queries in read or write mode, then commits or rolls back
//!
//! Two implementations ship with the crate: [`neo4j::Neo4jDriver`] backed by
//! `neo4rs`, and [`memory::MemoryDriver`], an in-process graph with fault
//! injection used by the test suite and for local runs without a database.

pub mod memory;
pub mod neo4j;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Query parameters, threaded to the database unchanged
pub type Params = serde_json::Map<String, serde_json::Value>;

/// A single result row, keyed by the names in the `RETURN` clause
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Build [`Params`] from a JSON object literal.
///
/// Anything other than an object yields empty params.
///
/// ```
/// use hive_kg::driver::params;
/// use serde_json::json;
///
/// let p = params(json!({"id": "task-001", "priority": 2}));
/// assert_eq!(p.len(), 2);
/// ```
pub fn params(value: serde_json::Value) -> Params {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Params::new(),
    }
}

/// Database execution mode for a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    Read,
    Write,
}

impl AccessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessMode::Read => "read",
            AccessMode::Write => "write",
        }
    }
}

/// Summary returned alongside the records of one query
#[derive(Debug, Clone, Serialize)]
pub struct QuerySummary {
    /// Query text as sent
    pub query: String,
    /// Mode the enclosing transaction ran in
    pub access_mode: AccessMode,
    /// Wall-clock time until all records were received
    pub elapsed: Duration,
}

/// Records and summary of one query
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub records: Vec<Record>,
    pub summary: QuerySummary,
}

impl QueryResult {
    /// Get a value from the first record, if any.
    pub fn first_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.records.first().and_then(|record| record.get(key))
    }

    /// Convenience accessor for `count(...)`-style single integer results.
    pub fn single_i64(&self, key: &str) -> Option<i64> {
        self.first_value(key).and_then(|value| value.as_i64())
    }
}

/// A connected graph database handle
#[async_trait]
pub trait GraphDriver: Send + Sync + 'static {
    /// Open a new logical session.
    async fn open_session(&self) -> Result<Box<dyn DriverSession>>;

    /// Close the underlying connection. Sessions opened earlier become unusable.
    async fn close(&self) -> Result<()>;
}

/// One logical connection to the database
#[async_trait]
pub trait DriverSession: Send + Sync {
    /// Begin an explicit transaction in the given mode. The server-side
    /// transaction timeout is set to `timeout` where the driver supports it.
    async fn begin_transaction(
        &mut self,
        mode: AccessMode,
        timeout: Duration,
    ) -> Result<Box<dyn DriverTransaction>>;

    /// Close the session and return its connection.
    async fn close(&mut self) -> Result<()>;
}

/// An open transaction
///
/// Dropping a transaction without calling [`commit`](Self::commit) must
/// leave no writes behind.
#[async_trait]
pub trait DriverTransaction: Send {
    /// Run a query and collect all of its records.
    async fn run(&mut self, query: &str, params: &Params) -> Result<QueryResult>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_params_from_object() {
        let p = params(json!({"id": "a", "n": 1}));
        assert_eq!(p.get("id"), Some(&json!("a")));
        assert_eq!(p.get("n"), Some(&json!(1)));

        assert!(params(json!([1, 2, 3])).is_empty());
    }

    #[test]
    fn test_query_result_accessors() {
        let mut record = Record::new();
        record.insert("count".to_string(), json!(3));
        let result = QueryResult {
            records: vec![record],
            summary: QuerySummary {
                query: "MATCH (n) RETURN count(n) AS count".to_string(),
                access_mode: AccessMode::Read,
                elapsed: Duration::from_millis(1),
            },
        };

        assert_eq!(result.single_i64("count"), Some(3));
        assert_eq!(result.single_i64("missing"), None);
        assert_eq!(AccessMode::Write.as_str(), "write");
    }
}
