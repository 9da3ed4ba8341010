//! # DbAccel Basic Usage
//!
//! Wires the optimizer over a temporary SQLite file, pushes a burst of
//! inserts through the batch scheduler and reads them back through the cache.
//!
//! ```bash
//! RUST_LOG=dbaccel_core=debug cargo run --example basic_usage
//! ```

use dbaccel_core::{ConfigLoader, DbOptimizer, OperationRequest, Priority};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ConfigLoader::new().load()?;
    let dir = tempfile::tempdir()?;
    let optimizer = DbOptimizer::sqlite(dir.path().join("demo.db"), config)?;

    optimizer
        .pool()
        .with_session(|s| {
            Box::pin(async move {
                s.execute_batch("CREATE TABLE products (id INTEGER PRIMARY KEY, name TEXT, price REAL)")
            })
        })
        .await?;

    optimizer.start().await?;

    let mut handles = Vec::new();
    for i in 0..100 {
        let request = OperationRequest::insert("products")
            .with_payload(json!({ "name": format!("product-{}", i), "price": i as f64 * 1.5 }));
        handles.push(optimizer.submit(request).await);
    }
    for handle in handles {
        handle.await?;
    }

    let urgent = OperationRequest::read("products")
        .with_condition("name", "product-42")
        .with_priority(Priority::Urgent);
    println!("product-42: {}", optimizer.execute(urgent).await?);

    for _ in 0..3 {
        let value = optimizer
            .get("product:42", || async { Ok(Some(json!({ "name": "product-42" }))) })
            .await?;
        println!("cached: {:?}", value);
    }

    let report = optimizer.stop().await?;
    println!("drained on stop: {}", report.drained);
    println!("{}", serde_json::to_string_pretty(&optimizer.stats().await?)?);
    Ok(())
}
