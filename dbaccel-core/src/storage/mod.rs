//! # Storage Module
//!
//! 会话抽象、会话连接池与 SQLite 适配。
//!
//! 连接池不依赖缓存，也不依赖调度器；调度器通过 [`BatchExecutor`](crate::batch::BatchExecutor)
//! 使用连接池（见 [`SqliteBatchExecutor`]）。

pub mod pool;
pub mod session;
pub mod sqlite;

pub use pool::{PoolConfig, PoolStats, PooledSession, SessionHandleInfo, SessionPool};
pub use session::{finish_transaction, Session, SessionFactory};
pub use sqlite::{validate_identifier, SqliteBatchExecutor, SqliteSession, SqliteSessionFactory};
