//! # Batch Module
//!
//! 优先级队列 + 自适应批处理调度器。
//!
//! ## 使用示例
//!
//! ```rust,ignore
//! use dbaccel_core::batch::{AdaptiveBatchScheduler, BatchConfig, OperationRequest, Priority};
//! use serde_json::json;
//!
//! let scheduler = Arc::new(AdaptiveBatchScheduler::new(BatchConfig::default(), executor)?);
//! scheduler.start().await?;
//!
//! let handle = scheduler
//!     .enqueue(
//!         OperationRequest::insert("events")
//!             .with_payload(json!({"kind": "login"}))
//!             .with_priority(Priority::High),
//!     )
//!     .await;
//! let result = handle.await?;
//!
//! scheduler.stop().await?;
//! ```

pub mod config;
pub mod operation;
pub mod scheduler;

pub use config::BatchConfig;
pub use operation::{Conditions, OperationHandle, OperationKind, OperationRequest, PendingOperation, Priority};
pub use scheduler::{AdaptiveBatchScheduler, BatchExecutor, BatchStats, FlushReport, OperationCounters};
