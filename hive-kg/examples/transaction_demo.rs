//! Transaction Manager Demo Application
//!
//! Runs writes, a prioritized batch and reads through the transaction
//! manager, then prints metrics and storage health.
//!
//! Usage:
//!   cargo run --example transaction_demo
//!   cargo run --example transaction_demo -- --memory   (no database needed)
//!
//! Environment variables (also read from `.env`):
//!   NEO4J_URI      - Neo4j connection URI (default: bolt://localhost:7687)
//!   NEO4J_USER     - Neo4j username (default: neo4j)
//!   NEO4J_PASSWORD - Neo4j password (default: password)
//!   NEO4J_DATABASE - Neo4j database name (default: neo4j)
//!   RUST_LOG       - log filter (default: info)

use hive_kg::driver::memory::{Fault, MemoryDriver};
use hive_kg::driver::params;
use hive_kg::{
    BatchOperation, KgConfig, Neo4jError, Params, Priority, TransactionManager, TransactionOptions,
};
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("=== Transaction Manager Demo ===");

    let config = KgConfig::from_env()?;
    let use_memory = std::env::args().any(|arg| arg == "--memory");

    let manager = if use_memory {
        info!("Using in-memory driver (one deadlock will be injected)");
        let driver = MemoryDriver::new();
        driver.inject_fault(Fault::Deadlock);
        let manager = TransactionManager::new(Arc::new(driver), &config);
        manager.pool().warm_up().await?;
        manager
    } else {
        TransactionManager::connect(&config).await?
    };

    info!("\n--- Writes ---");
    for (id, title) in [("demo-task-1", "Plan"), ("demo-task-2", "Build")] {
        let result = manager
            .execute_in_write_transaction(
                move |tx| {
                    Box::pin(async move {
                        tx.run(
                            "CREATE (t:DemoTask {id: $id, title: $title})",
                            params(json!({ "id": id, "title": title })),
                        )
                        .await
                    })
                },
                TransactionOptions::default(),
            )
            .await?;
        info!(
            "Created {} in {:?} on session {}",
            id, result.metrics.execution_time, result.metrics.session_id
        );
    }

    info!("\n--- Batch ---");
    let batch = vec![
        BatchOperation::new("CREATE (t:DemoTask {id: 'demo-task-4'})", Params::new())
            .priority(Priority::Low),
        BatchOperation::new("CREATE (t:DemoTask {id: 'demo-task-3'})", Params::new())
            .priority(Priority::High),
    ];
    let batch_result = manager
        .execute_batch(batch, TransactionOptions::default())
        .await?;
    info!("Batch ran {} operations", batch_result.data.len());

    info!("\n--- Duplicate write (expected to fail) ---");
    let duplicate = manager
        .execute_in_write_transaction(
            |tx| {
                Box::pin(async move {
                    tx.run("CREATE (t:DemoTask {id: 'demo-task-1'})", Params::new())
                        .await
                })
            },
            TransactionOptions::default(),
        )
        .await;
    if let Err(e) = duplicate {
        info!("✗ {} (attempts: {})", e, e.attempts());
    }

    info!("\n--- Read ---");
    let count = manager
        .execute_in_read_transaction(
            |tx| {
                Box::pin(async move {
                    let result = tx
                        .run("MATCH (t:DemoTask) RETURN count(t) AS count", Params::new())
                        .await?;
                    Ok::<_, Neo4jError>(result.single_i64("count").unwrap_or(0))
                })
            },
            TransactionOptions::default(),
        )
        .await?;
    info!("DemoTask nodes: {}", count.data);

    info!("\n--- Metrics ---");
    info!(
        "{}",
        serde_json::to_string_pretty(&manager.get_detailed_metrics())?
    );

    info!("\n--- Storage Health ---");
    let health = manager.storage_health().await;
    info!("Status: {:?}", health.status);
    info!("Response time: {}ms", health.response_time_ms);
    info!("Circuit: {}", health.circuit_state);
    if let Some(error) = &health.error {
        info!("Error: {}", error);
    }

    if !use_memory {
        manager
            .execute_in_write_transaction(
                |tx| {
                    Box::pin(async move {
                        tx.run("MATCH (t:DemoTask) DETACH DELETE t", Params::new())
                            .await
                    })
                },
                TransactionOptions::default(),
            )
            .await?;
    }

    manager.close().await?;
    info!("\n=== Demo Complete ===");
    Ok(())
}
