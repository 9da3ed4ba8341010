//! # DbAccel Core Library
//!
//! Database access acceleration layer.
//!
//! This library sits between an application and its database and cuts
//! the number of round trips the application makes.
//!
//! ## Architecture
//!
//! - **Cache**: Bounded TTL maps, a two-tier L1/L2 cache and an access-pattern preloader
//! - **Batch**: Priority queues drained by an adaptive batch scheduler
//! - **Storage**: Reusable session pool and the SQLite backend
//! - **Config**: Defaults, `dbaccel.toml` and `DBACCEL_*` environment overrides
//!
//! ```text
//! application
//!     │ get / execute
//!     ▼
//! DbOptimizer ──► MultiLevelCache (L1 → L2 → loader)
//!     │
//!     ▼
//! AdaptiveBatchScheduler ──► BatchExecutor ──► SessionPool ──► database
//! ```
//!
//! All timing (TTL, idle expiry, pattern decay, flush intervals) uses
//! `tokio::time::Instant`, so tests can pause and advance the clock.

pub mod error;

// Lock timeout module - bounded lock acquisition
pub mod lock_timeout;

// Background tasks with cancellation
pub mod worker;

pub mod batch;
pub mod cache;
pub mod config;
pub mod context;
pub mod storage;

pub use error::{AccelError, Result};
pub use lock_timeout::LockStats;

pub use batch::{
    AdaptiveBatchScheduler, BatchConfig, BatchExecutor, BatchStats, OperationHandle, OperationKind,
    OperationRequest, Priority,
};
pub use cache::{AccessPreloader, BoundedTtlMap, CacheConfig, EstimateSize, MultiLevelCache, PreloadConfig};
pub use config::{ConfigLoader, OptimizerConfig};
pub use context::{DbOptimizer, OptimizerStats};
pub use storage::{PoolConfig, Session, SessionFactory, SessionPool, SqliteSession};
