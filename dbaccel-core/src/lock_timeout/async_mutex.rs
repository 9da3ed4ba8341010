// dbaccel-core/src/lock_timeout/async_mutex.rs
//
// tokio::sync::Mutex 加上等待上限与等待/持有计时

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tokio::time::{timeout, Instant};

use super::{LockStats, LockTimeoutError};

#[derive(Debug, Default)]
struct LockMetrics {
    acquisitions: AtomicU64,
    timeouts: AtomicU64,
    waiters: AtomicU64,
    wait_nanos: AtomicU64,
    max_wait_nanos: AtomicU64,
    hold_nanos: AtomicU64,
    max_hold_nanos: AtomicU64,
}

impl LockMetrics {
    fn acquired(&self, wait: Duration) {
        let nanos = wait.as_nanos() as u64;
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.wait_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.max_wait_nanos.fetch_max(nanos, Ordering::Relaxed);
    }

    fn released(&self, hold: Duration) {
        let nanos = hold.as_nanos() as u64;
        self.hold_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.max_hold_nanos.fetch_max(nanos, Ordering::Relaxed);
    }

    fn snapshot(&self, name: &str) -> LockStats {
        let acquisitions = self.acquisitions.load(Ordering::Relaxed);
        let avg = |total: &AtomicU64| match acquisitions {
            0 => Duration::ZERO,
            n => Duration::from_nanos(total.load(Ordering::Relaxed) / n),
        };
        LockStats {
            name: name.to_string(),
            acquisitions,
            timeouts: self.timeouts.load(Ordering::Relaxed),
            waiters: self.waiters.load(Ordering::Relaxed),
            avg_wait: avg(&self.wait_nanos),
            max_wait: Duration::from_nanos(self.max_wait_nanos.load(Ordering::Relaxed)),
            avg_hold: avg(&self.hold_nanos),
            max_hold: Duration::from_nanos(self.max_hold_nanos.load(Ordering::Relaxed)),
        }
    }
}

/// 有等待上限的互斥锁
pub struct AsyncMutex<T> {
    inner: Mutex<T>,
    name: String,
    default_timeout: Duration,
    metrics: LockMetrics,
}

impl<T> AsyncMutex<T> {
    pub fn new(value: T, default_timeout: Duration) -> Self {
        Self::with_name(value, default_timeout, "anonymous")
    }

    /// 带名称的锁（名称出现在日志、错误与统计中）
    pub fn with_name(value: T, default_timeout: Duration, name: impl Into<String>) -> Self {
        Self {
            inner: Mutex::new(value),
            name: name.into(),
            default_timeout,
            metrics: LockMetrics::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 在默认上限内获取
    pub async fn lock_with_timeout(&self) -> Result<AsyncMutexGuard<'_, T>, LockTimeoutError> {
        self.lock_with_custom_timeout(self.default_timeout).await
    }

    /// 在给定上限内获取
    pub async fn lock_with_custom_timeout(&self, limit: Duration) -> Result<AsyncMutexGuard<'_, T>, LockTimeoutError> {
        let started = Instant::now();
        self.metrics.waiters.fetch_add(1, Ordering::Relaxed);
        let result = timeout(limit, self.inner.lock()).await;
        self.metrics.waiters.fetch_sub(1, Ordering::Relaxed);

        match result {
            Ok(guard) => {
                let wait = started.elapsed();
                self.metrics.acquired(wait);
                tracing::trace!("Lock '{}' acquired after {:?}", self.name, wait);
                Ok(AsyncMutexGuard {
                    guard,
                    acquired_at: Instant::now(),
                    metrics: &self.metrics,
                })
            }
            Err(_) => {
                self.metrics.timeouts.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Lock '{}' not acquired within {:?}", self.name, limit);
                Err(LockTimeoutError::Timeout {
                    name: self.name.clone(),
                    timeout: limit,
                })
            }
        }
    }

    /// 统计快照
    pub fn stats(&self) -> LockStats {
        self.metrics.snapshot(&self.name)
    }
}

/// 持有期间计时的守卫
pub struct AsyncMutexGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    acquired_at: Instant,
    metrics: &'a LockMetrics,
}

impl<T> Deref for AsyncMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for AsyncMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for AsyncMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.metrics.released(self.acquired_at.elapsed());
    }
}
