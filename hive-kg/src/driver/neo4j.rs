//! Neo4j driver backed by `neo4rs`
//!
//! `neo4rs` keeps its own bolt connection pool inside [`Graph`]; a
//! [`Neo4jSession`] is a cheap handle onto it and each transaction checks a
//! bolt connection out for its lifetime. The bolt driver version in use has
//! no per-transaction access mode, so read transactions run against the
//! configured database like write transactions; the manager still enforces
//! the mode it was asked for when choosing how to account for the call.

use crate::config::KgConfig;
use crate::driver::{
    AccessMode, DriverSession, DriverTransaction, GraphDriver, Params, QueryResult, QuerySummary,
    Record,
};
use crate::error::{Neo4jError, Result};
use async_trait::async_trait;
use neo4rs::{query, BoltList, BoltMap, BoltNull, BoltString, BoltType, ConfigBuilder, Graph, Txn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Connected Neo4j handle
pub struct Neo4jDriver {
    graph: Graph,
    closed: Arc<AtomicBool>,
}

impl Neo4jDriver {
    /// Connect using the connection section of a [`KgConfig`].
    ///
    /// # Example
    /// ```no_run
    /// use hive_kg::{config::KgConfig, driver::neo4j::Neo4jDriver};
    ///
    /// #[tokio::main]
    /// async fn main() -> anyhow::Result<()> {
    ///     let config = KgConfig::from_env()?;
    ///     let driver = Neo4jDriver::connect(&config).await?;
    ///     Ok(())
    /// }
    /// ```
    pub async fn connect(config: &KgConfig) -> Result<Self> {
        info!(
            "Connecting to Neo4j at {} (database: {})",
            config.uri, config.database
        );

        let neo4rs_config = ConfigBuilder::default()
            .uri(config.uri.as_str())
            .user(config.user.as_str())
            .password(config.password.as_str())
            .db(config.database.as_str())
            .fetch_size(config.fetch_size)
            .max_connections(config.pool.max_pool_size)
            .build()
            .map_err(|e| Neo4jError::ConfigError(e.to_string()))?;

        let graph = Graph::connect(neo4rs_config)
            .await
            .map_err(|e| Neo4jError::ConnectionError(e.to_string()))?;

        info!("Successfully connected to Neo4j");

        Ok(Self {
            graph,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Get a reference to the underlying neo4rs Graph instance
    pub fn graph(&self) -> &Graph {
        &self.graph
    }
}

#[async_trait]
impl GraphDriver for Neo4jDriver {
    async fn open_session(&self) -> Result<Box<dyn DriverSession>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Neo4jError::ConnectionError("driver is closed".to_string()));
        }

        Ok(Box::new(Neo4jSession {
            graph: self.graph.clone(),
            closed: self.closed.clone(),
        }))
    }

    async fn close(&self) -> Result<()> {
        // neo4rs releases bolt connections when the last Graph clone drops.
        self.closed.store(true, Ordering::Release);
        info!("Neo4j driver closed");
        Ok(())
    }
}

/// Session handle onto the shared neo4rs connection pool
pub struct Neo4jSession {
    graph: Graph,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl DriverSession for Neo4jSession {
    async fn begin_transaction(
        &mut self,
        mode: AccessMode,
        _timeout: Duration,
    ) -> Result<Box<dyn DriverTransaction>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Neo4jError::ConnectionError("driver is closed".to_string()));
        }

        let txn = self.graph.start_txn().await.map_err(map_driver_error)?;
        debug!("Started {} transaction", mode.as_str());

        Ok(Box::new(Neo4jTransaction {
            txn: Some(txn),
            mode,
        }))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Explicit neo4rs transaction
pub struct Neo4jTransaction {
    txn: Option<Txn>,
    mode: AccessMode,
}

impl Neo4jTransaction {
    fn txn(&mut self) -> Result<&mut Txn> {
        self.txn
            .as_mut()
            .ok_or_else(|| Neo4jError::QueryError("transaction already finished".to_string()))
    }
}

#[async_trait]
impl DriverTransaction for Neo4jTransaction {
    async fn run(&mut self, query_text: &str, params: &Params) -> Result<QueryResult> {
        let mode = self.mode;
        let start = Instant::now();

        let mut cypher = query(query_text);
        for (key, value) in params {
            cypher = cypher.param(key, to_bolt(value));
        }

        let txn = self.txn()?;
        let mut stream = txn.execute(cypher).await.map_err(map_driver_error)?;

        let mut records = Vec::new();
        while let Some(row) = stream.next(txn.handle()).await.map_err(map_driver_error)? {
            let record: Record = row
                .to()
                .map_err(|e| Neo4jError::SerializationError(e.to_string()))?;
            records.push(record);
        }

        Ok(QueryResult {
            records,
            summary: QuerySummary {
                query: query_text.to_string(),
                access_mode: mode,
                elapsed: start.elapsed(),
            },
        })
    }

    async fn commit(&mut self) -> Result<()> {
        match self.txn.take() {
            Some(txn) => txn.commit().await.map_err(map_driver_error),
            None => Err(Neo4jError::QueryError(
                "transaction already finished".to_string(),
            )),
        }
    }

    async fn rollback(&mut self) -> Result<()> {
        match self.txn.take() {
            Some(txn) => txn.rollback().await.map_err(map_driver_error),
            None => Ok(()),
        }
    }
}

/// neo4rs reports server failures as text; route them through the shared mapping.
fn map_driver_error(error: neo4rs::Error) -> Neo4jError {
    Neo4jError::from_server_message(error.to_string())
}

/// Convert a JSON parameter value into the bolt type neo4rs sends.
fn to_bolt(value: &serde_json::Value) -> BoltType {
    match value {
        serde_json::Value::Null => BoltType::Null(BoltNull),
        serde_json::Value::Bool(b) => BoltType::from(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => BoltType::from(i),
            None => BoltType::from(n.as_f64().unwrap_or_default()),
        },
        serde_json::Value::String(s) => BoltType::from(s.clone()),
        serde_json::Value::Array(items) => {
            let mut list = BoltList::new();
            for item in items {
                list.push(to_bolt(item));
            }
            BoltType::List(list)
        }
        serde_json::Value::Object(map) => {
            let mut bolt_map = BoltMap::new();
            for (key, item) in map {
                bolt_map.put(BoltString::new(key), to_bolt(item));
            }
            BoltType::Map(bolt_map)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_to_bolt_scalars() {
        assert!(matches!(to_bolt(&json!(null)), BoltType::Null(_)));
        assert!(matches!(to_bolt(&json!(true)), BoltType::Boolean(_)));
        assert!(matches!(to_bolt(&json!(42)), BoltType::Integer(_)));
        assert!(matches!(to_bolt(&json!(1.5)), BoltType::Float(_)));
        assert!(matches!(to_bolt(&json!("agent")), BoltType::String(_)));
    }

    #[test]
    fn test_to_bolt_nested() {
        let value = json!({"tags": ["a", "b"], "meta": {"depth": 2}});
        match to_bolt(&value) {
            BoltType::Map(map) => assert_eq!(map.value.len(), 2),
            other => panic!("expected map, got {:?}", other),
        }
    }
}
