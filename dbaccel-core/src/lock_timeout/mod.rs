// dbaccel-core/src/lock_timeout/mod.rs
//
// 有等待上限的锁
//
// 连接池的句柄集合与调度器的优先级队列都通过 AsyncMutex 访问。获取超时
// 返回 LockTimeoutError，调用方降级（临时会话、同步执行、统计置空），
// 不会无限期阻塞。每把锁的等待与持有时间汇总为 LockStats，随
// PoolStats / BatchStats 一起报告。

pub mod async_mutex;

pub use async_mutex::{AsyncMutex, AsyncMutexGuard};

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// 默认锁超时时间（用于一般场景）
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// 短期操作锁超时时间（统计、清理等可降级的操作）
pub const SHORT_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// 锁获取失败
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockTimeoutError {
    /// 在给定时间内未能获取锁
    #[error("lock '{name}' not acquired within {timeout:?}")]
    Timeout { name: String, timeout: Duration },
}

/// 单把锁的统计快照
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LockStats {
    pub name: String,
    /// 成功获取次数
    pub acquisitions: u64,
    /// 超时次数
    pub timeouts: u64,
    /// 正在等待的任务数
    pub waiters: u64,
    pub avg_wait: Duration,
    pub max_wait: Duration,
    pub avg_hold: Duration,
    pub max_hold: Duration,
}
