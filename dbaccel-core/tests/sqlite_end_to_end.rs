//! End-to-end tests: optimizer over a real SQLite file.

use dbaccel_core::batch::{BatchConfig, OperationRequest, Priority};
use dbaccel_core::storage::SqliteSession;
use dbaccel_core::{AccelError, DbOptimizer, OptimizerConfig};
use serde_json::json;
use std::time::Duration;
use tempfile::TempDir;

async fn setup(config: OptimizerConfig) -> (TempDir, DbOptimizer<SqliteSession>) {
    let dir = TempDir::new().unwrap();
    let optimizer = DbOptimizer::sqlite(dir.path().join("e2e.db"), config).unwrap();
    optimizer
        .pool()
        .with_session(|s| {
            Box::pin(async move {
                s.execute_batch("CREATE TABLE orders (id INTEGER PRIMARY KEY, customer TEXT, total REAL)")
            })
        })
        .await
        .unwrap();
    (dir, optimizer)
}

async fn count_orders(optimizer: &DbOptimizer<SqliteSession>) -> i64 {
    optimizer
        .pool()
        .with_session(|s| Box::pin(async move { s.query_scalar("SELECT COUNT(*) FROM orders") }))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_burst_of_inserts_is_batched() {
    let mut config = OptimizerConfig::default();
    config.batch = BatchConfig::default()
        .with_batch_size(50, 200)
        .with_wait_time(Duration::from_millis(10), Duration::from_millis(100));
    let (_dir, optimizer) = setup(config).await;
    optimizer.start().await.unwrap();

    let mut handles = Vec::new();
    for i in 0..150 {
        let request = OperationRequest::insert("orders").with_payload(json!({ "customer": format!("c{}", i % 7), "total": i }));
        handles.push(optimizer.submit(request).await);
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap(), json!({ "rows_affected": 1 }));
    }

    assert_eq!(count_orders(&optimizer).await, 150);

    let stats = optimizer.stats().await.unwrap();
    assert_eq!(stats.batch.total_operations, 150);
    assert!(stats.batch.flush_count >= 1);

    optimizer.stop().await.unwrap();
}

#[tokio::test]
async fn test_update_and_delete_round_through_scheduler() {
    let (_dir, optimizer) = setup(OptimizerConfig::development()).await;
    optimizer.start().await.unwrap();

    for customer in ["ann", "bob"] {
        optimizer
            .execute(OperationRequest::insert("orders").with_payload(json!({ "customer": customer, "total": 10 })))
            .await
            .unwrap();
    }

    let updated = optimizer
        .execute(
            OperationRequest::update("orders")
                .with_condition("customer", "ann")
                .with_payload(json!({ "total": 99 }))
                .with_priority(Priority::High),
        )
        .await
        .unwrap();
    assert_eq!(updated, json!({ "rows_affected": 1 }));

    let rows = optimizer
        .execute(OperationRequest::read("orders").with_condition("customer", "ann"))
        .await
        .unwrap();
    assert_eq!(rows[0]["total"], json!(99.0));

    let deleted = optimizer
        .execute(OperationRequest::delete("orders").with_condition("customer", "bob"))
        .await
        .unwrap();
    assert_eq!(deleted, json!({ "rows_affected": 1 }));
    assert_eq!(count_orders(&optimizer).await, 1);

    optimizer.stop().await.unwrap();
}

#[tokio::test]
async fn test_unconditioned_delete_fails_without_touching_rows() {
    let (_dir, optimizer) = setup(OptimizerConfig::development()).await;

    optimizer
        .execute(OperationRequest::insert("orders").with_payload(json!({ "customer": "ann", "total": 1 })))
        .await
        .unwrap();

    let result = optimizer.execute(OperationRequest::delete("orders")).await;
    assert!(matches!(result, Err(AccelError::Execution(_))));
    assert_eq!(count_orders(&optimizer).await, 1);
}

#[tokio::test]
async fn test_expired_deadline_is_never_executed() {
    let (_dir, optimizer) = setup(OptimizerConfig::default()).await;
    optimizer.start().await.unwrap();

    let handle = optimizer
        .submit(
            OperationRequest::insert("orders")
                .with_payload(json!({ "customer": "late", "total": 1 }))
                .with_timeout(Duration::ZERO),
        )
        .await;
    let result = handle.await;
    assert!(matches!(result, Err(AccelError::Timeout(_))));

    optimizer.stop().await.unwrap();
    assert_eq!(count_orders(&optimizer).await, 0);
}
