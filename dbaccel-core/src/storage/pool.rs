//! # Session Pool
//!
//! 可复用会话句柄的连接池。
//!
//! ## 获取策略
//!
//! 1. 扫描现有句柄，找到第一个空闲、未过期且通过存活探测的句柄复用
//! 2. 没有可复用句柄且未达到 `max_size` 时创建新句柄
//! 3. 已满时立即返回 `None`，不排队等待；[`SessionPool::with_session`] 随后
//!    退化为一个不入池的临时会话
//!
//! 存活探测在锁外执行，探测失败的句柄立即移出池（与过期同等对待）。
//!
//! ## 事务收尾
//!
//! `with_session` 正常返回时提交仍活动的事务，返回错误时回滚，二者只会发生
//! 一个。提交失败的句柄会被丢弃。被中途丢弃的 checkout（调用方 future
//! 被取消或 panic）在后台任务中回滚并移出池，状态未知的会话不会回到池中。
//!
//! ## 使用示例
//!
//! ```rust,ignore
//! let pool = SessionPool::new(PoolConfig::default(), SqliteSessionFactory::new("app.db"));
//!
//! let count: i64 = pool
//!     .with_session(|session| Box::pin(async move {
//!         session.query_scalar("SELECT COUNT(*) FROM users")
//!     }))
//!     .await?;
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::session::{finish_transaction, Session, SessionFactory};
use crate::error::{AccelError, Result};
use crate::lock_timeout::{AsyncMutex, LockStats, DEFAULT_LOCK_TIMEOUT, SHORT_LOCK_TIMEOUT};
use crate::worker::BackgroundWorker;

/// 连接池配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// 最大句柄数
    pub max_size: usize,
    /// 句柄最长寿命
    pub max_lifetime: Duration,
    /// 空闲句柄最长空闲时间
    pub max_idle: Duration,
    /// 后台清理间隔
    pub cleanup_interval: Duration,
    /// 存活探测超时
    pub probe_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            max_lifetime: Duration::from_secs(3600),
            max_idle: Duration::from_secs(300), // 5分钟
            cleanup_interval: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_max_lifetime(mut self, max_lifetime: Duration) -> Self {
        self.max_lifetime = max_lifetime;
        self
    }

    pub fn with_max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = max_idle;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// 验证配置是否有效
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_size == 0 {
            return Err("pool max_size must be greater than 0".to_string());
        }
        if self.max_lifetime.is_zero() || self.max_idle.is_zero() {
            return Err("pool max_lifetime and max_idle must be greater than 0".to_string());
        }
        if self.cleanup_interval.is_zero() {
            return Err("pool cleanup_interval must be greater than 0".to_string());
        }
        if self.probe_timeout.is_zero() {
            return Err("pool probe_timeout must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// 连接池统计
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub in_use: usize,
    pub idle: usize,
    pub created: u64,
    pub reused: u64,
    pub expired: u64,
    pub liveness_failures: u64,
    pub unpooled_fallbacks: u64,
    pub discarded: u64,
    /// 句柄集合锁
    pub lock: LockStats,
}

/// 单个句柄的快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionHandleInfo {
    pub id: Uuid,
    pub age: Duration,
    pub idle_for: Duration,
    pub in_use: bool,
    pub ref_count: u32,
    pub checkouts: u64,
}

#[derive(Debug, Default)]
struct PoolCounters {
    created: AtomicU64,
    reused: AtomicU64,
    expired: AtomicU64,
    liveness_failures: AtomicU64,
    unpooled_fallbacks: AtomicU64,
    discarded: AtomicU64,
}

/// 池中的句柄
///
/// 被借出期间 `session` 为 `None`，会话由 [`PooledSession`] 持有。
struct SessionSlot<S> {
    id: Uuid,
    session: Option<S>,
    created_at: Instant,
    last_used: Instant,
    in_use: bool,
    ref_count: u32,
    checkouts: u64,
}

impl<S> SessionSlot<S> {
    fn is_expired(&self, now: Instant, config: &PoolConfig) -> bool {
        now.saturating_duration_since(self.created_at) > config.max_lifetime
            || (!self.in_use && now.saturating_duration_since(self.last_used) > config.max_idle)
    }
}

struct PoolInner<S: Session> {
    config: PoolConfig,
    factory: Arc<dyn SessionFactory<Session = S>>,
    slots: AsyncMutex<Vec<SessionSlot<S>>>,
    closed: AtomicBool,
    counters: PoolCounters,
    sweeper: Mutex<Option<BackgroundWorker>>,
}

impl<S: Session> PoolInner<S> {
    /// 把借出的会话放回池中；池已关闭或句柄已被移除时关闭会话
    async fn checkin(&self, id: Uuid, session: S) {
        let leftover = match self.slots.lock_with_timeout().await {
            Ok(mut slots) => {
                let position = slots.iter().position(|slot| slot.id == id);
                match position {
                    Some(i) if !self.closed.load(Ordering::Acquire) => {
                        let slot = &mut slots[i];
                        slot.session = Some(session);
                        slot.in_use = false;
                        slot.ref_count = slot.ref_count.saturating_sub(1);
                        slot.last_used = Instant::now();
                        None
                    }
                    Some(i) => {
                        slots.remove(i);
                        Some(session)
                    }
                    None => Some(session),
                }
            }
            Err(e) => {
                warn!("Session {} could not be returned to the pool: {}", id, e);
                Some(session)
            }
        };

        if let Some(mut session) = leftover {
            session.close().await;
        }
    }

    /// 从池中移除句柄
    async fn discard(&self, id: Uuid) {
        match self.slots.lock_with_timeout().await {
            Ok(mut slots) => {
                let before = slots.len();
                slots.retain(|slot| slot.id != id);
                if slots.len() < before {
                    self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                    debug!("Session {} discarded from pool", id);
                }
            }
            Err(e) => warn!("Session {} could not be discarded: {}", id, e),
        }
    }

    async fn sweep_expired(&self) -> Result<usize> {
        let now = Instant::now();
        let expired: Vec<S> = {
            let mut slots = self.slots.lock_with_timeout().await?;
            let mut expired = Vec::new();
            let mut i = 0;
            while i < slots.len() {
                if !slots[i].in_use && slots[i].is_expired(now, &self.config) {
                    if let Some(session) = slots.remove(i).session {
                        expired.push(session);
                    }
                } else {
                    i += 1;
                }
            }
            expired
        };

        let count = expired.len();
        for mut session in expired {
            session.close().await;
        }
        if count > 0 {
            self.counters.expired.fetch_add(count as u64, Ordering::Relaxed);
            debug!("Swept {} expired sessions", count);
        }
        Ok(count)
    }
}

impl<S: Session> Drop for PoolInner<S> {
    fn drop(&mut self) {
        if let Some(worker) = self.sweeper.get_mut().take() {
            worker.cancel();
        }
    }
}

/// 会话连接池
pub struct SessionPool<S: Session> {
    inner: Arc<PoolInner<S>>,
}

impl<S: Session> Clone for SessionPool<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Session> SessionPool<S> {
    /// 创建新的连接池
    pub fn new<F>(config: PoolConfig, factory: F) -> Self
    where
        F: SessionFactory<Session = S>,
    {
        Self::with_factory(config, Arc::new(factory))
    }

    /// 使用共享的工厂创建连接池
    pub fn with_factory(config: PoolConfig, factory: Arc<dyn SessionFactory<Session = S>>) -> Self {
        info!(
            "SessionPool created: max={}, lifetime={:?}, idle={:?}",
            config.max_size, config.max_lifetime, config.max_idle
        );
        Self {
            inner: Arc::new(PoolInner {
                config,
                factory,
                slots: AsyncMutex::with_name(Vec::new(), DEFAULT_LOCK_TIMEOUT, "session_pool"),
                closed: AtomicBool::new(false),
                counters: PoolCounters::default(),
                sweeper: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// 尝试借出一个会话（非阻塞）
    ///
    /// 池已满或已关闭时返回 `None`。
    pub async fn acquire(&self) -> Result<Option<PooledSession<S>>> {
        if self.is_closed() {
            return Ok(None);
        }

        let config = &self.inner.config;

        loop {
            let (candidate, stale) = {
                let mut slots = self.inner.slots.lock_with_timeout().await?;
                let now = Instant::now();

                // 顺带移除已过期的空闲句柄，腾出容量
                let mut stale = Vec::new();
                let mut i = 0;
                while i < slots.len() {
                    if !slots[i].in_use && slots[i].is_expired(now, config) {
                        if let Some(session) = slots.remove(i).session {
                            stale.push(session);
                        }
                    } else {
                        i += 1;
                    }
                }

                let candidate = slots.iter_mut().find(|slot| !slot.in_use).and_then(|slot| {
                    let session = slot.session.take()?;
                    slot.in_use = true;
                    slot.ref_count += 1;
                    slot.checkouts += 1;
                    Some((slot.id, session))
                });
                (candidate, stale)
            };

            if !stale.is_empty() {
                self.inner
                    .counters
                    .expired
                    .fetch_add(stale.len() as u64, Ordering::Relaxed);
                for mut session in stale {
                    session.close().await;
                }
            }

            let Some((id, mut session)) = candidate else {
                break;
            };
            let reservation = SlotReservation::new(Arc::clone(&self.inner), id);

            match tokio::time::timeout(config.probe_timeout, session.ping()).await {
                Ok(Ok(())) => {
                    self.inner.counters.reused.fetch_add(1, Ordering::Relaxed);
                    debug!("Reusing pooled session {}", id);
                    return Ok(Some(reservation.into_checkout(session)));
                }
                Ok(Err(e)) => {
                    warn!("Session {} failed liveness probe: {}", id, e);
                }
                Err(_) => {
                    warn!("Session {} liveness probe timed out after {:?}", id, config.probe_timeout);
                }
            }

            self.inner.counters.liveness_failures.fetch_add(1, Ordering::Relaxed);
            reservation.discard().await;
            session.close().await;
        }

        // 占位后在锁外创建
        let reservation = {
            let mut slots = self.inner.slots.lock_with_timeout().await?;
            if slots.len() >= config.max_size {
                return Ok(None);
            }
            let now = Instant::now();
            let id = Uuid::new_v4();
            slots.push(SessionSlot {
                id,
                session: None,
                created_at: now,
                last_used: now,
                in_use: true,
                ref_count: 1,
                checkouts: 1,
            });
            SlotReservation::new(Arc::clone(&self.inner), id)
        };

        match self.inner.factory.create().await {
            Ok(session) => {
                self.inner.counters.created.fetch_add(1, Ordering::Relaxed);
                debug!("Created pooled session {}", reservation.id);
                Ok(Some(reservation.into_checkout(session)))
            }
            Err(e) => {
                reservation.discard().await;
                Err(e)
            }
        }
    }

    /// 在会话作用域内执行 `f`
    ///
    /// 正常返回时提交仍活动的事务，出错时回滚。池不可用时使用临时会话，
    /// 行为与池化路径一致。
    pub async fn with_session<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'s> FnOnce(&'s mut S) -> BoxFuture<'s, Result<T>>,
    {
        let checkout = match self.acquire().await {
            Ok(checkout) => checkout,
            Err(AccelError::LockTimeout(e)) => {
                warn!("Session pool busy ({}), using an unpooled session", e);
                None
            }
            Err(e) => return Err(e),
        };

        match checkout {
            Some(mut checkout) => {
                let result = f(checkout.session_mut()?).await;
                checkout.release(result.is_ok()).await?;
                result
            }
            None => {
                self.inner.counters.unpooled_fallbacks.fetch_add(1, Ordering::Relaxed);
                debug!("No pooled session available, using an unpooled session");

                let mut session = self.inner.factory.create().await?;
                let result = f(&mut session).await;
                let finished = finish_transaction(&mut session, result.is_ok()).await;
                session.close().await;

                match (result, finished) {
                    (Ok(value), Ok(())) => Ok(value),
                    (Ok(_), Err(e)) => Err(e),
                    (Err(e), Err(rollback_err)) => {
                        warn!("Rollback of unpooled session failed: {}", rollback_err);
                        Err(e)
                    }
                    (Err(e), Ok(())) => Err(e),
                }
            }
        }
    }

    /// 移除过期的空闲句柄，返回移除数量
    pub async fn sweep_expired(&self) -> Result<usize> {
        self.inner.sweep_expired().await
    }

    /// 启动后台清理任务
    pub async fn start(&self) -> Result<()> {
        if self.is_closed() {
            return Err(AccelError::PoolClosed);
        }
        let mut slot = self.inner.sweeper.lock().await;
        if slot.is_some() {
            return Err(AccelError::already_running("session pool sweeper"));
        }

        let weak: Weak<PoolInner<S>> = Arc::downgrade(&self.inner);
        *slot = Some(BackgroundWorker::spawn_periodic(
            "session pool sweeper",
            self.inner.config.cleanup_interval,
            move || {
                let weak = weak.clone();
                async move {
                    let Some(inner) = weak.upgrade() else {
                        return false;
                    };
                    if let Err(e) = inner.sweep_expired().await {
                        warn!("Session pool sweep failed: {}", e);
                    }
                    true
                }
            },
        ));
        Ok(())
    }

    /// 停止后台清理任务
    pub async fn stop(&self) {
        let worker = self.inner.sweeper.lock().await.take();
        if let Some(worker) = worker {
            worker.shutdown().await;
        }
    }

    /// 关闭连接池
    ///
    /// 关闭所有空闲会话；借出中的会话在归还时关闭。之后的 `with_session`
    /// 全部使用临时会话。
    pub async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::Release);
        self.stop().await;

        let idle: Vec<S> = {
            let mut slots = self.inner.slots.lock_with_timeout().await?;
            let mut idle = Vec::new();
            slots.retain_mut(|slot| {
                if slot.in_use {
                    return true;
                }
                if let Some(session) = slot.session.take() {
                    idle.push(session);
                }
                false
            });
            idle
        };

        for mut session in idle {
            session.close().await;
        }

        info!("SessionPool closed");
        Ok(())
    }

    /// 统计快照
    pub async fn stats(&self) -> Result<PoolStats> {
        let (total, in_use) = {
            let slots = self.inner.slots.lock_with_custom_timeout(SHORT_LOCK_TIMEOUT).await?;
            (slots.len(), slots.iter().filter(|slot| slot.in_use).count())
        };
        let counters = &self.inner.counters;

        Ok(PoolStats {
            total,
            in_use,
            idle: total - in_use,
            created: counters.created.load(Ordering::Relaxed),
            reused: counters.reused.load(Ordering::Relaxed),
            expired: counters.expired.load(Ordering::Relaxed),
            liveness_failures: counters.liveness_failures.load(Ordering::Relaxed),
            unpooled_fallbacks: counters.unpooled_fallbacks.load(Ordering::Relaxed),
            discarded: counters.discarded.load(Ordering::Relaxed),
            lock: self.inner.slots.stats(),
        })
    }

    /// 所有句柄的快照
    pub async fn handles(&self) -> Result<Vec<SessionHandleInfo>> {
        let now = Instant::now();
        let slots = self.inner.slots.lock_with_custom_timeout(SHORT_LOCK_TIMEOUT).await?;
        Ok(slots
            .iter()
            .map(|slot| SessionHandleInfo {
                id: slot.id,
                age: now.saturating_duration_since(slot.created_at),
                idle_for: now.saturating_duration_since(slot.last_used),
                in_use: slot.in_use,
                ref_count: slot.ref_count,
                checkouts: slot.checkouts,
            })
            .collect())
    }
}

/// 获取过程中被占用的槽位
///
/// 探测或创建会话期间获取 future 被取消时，槽位随守卫一起移出池。
struct SlotReservation<S: Session> {
    pool: Arc<PoolInner<S>>,
    id: Uuid,
    armed: bool,
}

impl<S: Session> SlotReservation<S> {
    fn new(pool: Arc<PoolInner<S>>, id: Uuid) -> Self {
        Self { pool, id, armed: true }
    }

    fn into_checkout(mut self, session: S) -> PooledSession<S> {
        self.armed = false;
        PooledSession::new(Arc::clone(&self.pool), self.id, session)
    }

    async fn discard(mut self) {
        self.pool.discard(self.id).await;
        self.armed = false;
    }
}

impl<S: Session> Drop for SlotReservation<S> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let pool = Arc::clone(&self.pool);
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!("Acquire of session {} abandoned, releasing slot", id);
                handle.spawn(async move { pool.discard(id).await });
            }
            Err(_) => warn!("Slot {} abandoned outside a runtime, slot leaked", id),
        }
    }
}

/// 借出的会话
///
/// 通过 [`release`](Self::release) 归还；未归还就被丢弃时，后台回滚并把句柄移出池。
pub struct PooledSession<S: Session> {
    pool: Arc<PoolInner<S>>,
    id: Uuid,
    session: Option<S>,
}

impl<S: Session> PooledSession<S> {
    fn new(pool: Arc<PoolInner<S>>, id: Uuid, session: S) -> Self {
        Self {
            pool,
            id,
            session: Some(session),
        }
    }

    /// 句柄 ID
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// 会话的可变引用
    pub fn session_mut(&mut self) -> Result<&mut S> {
        self.session
            .as_mut()
            .ok_or_else(|| AccelError::other("session checkout already released"))
    }

    /// 结束事务并归还
    ///
    /// `success` 为 true 时提交，否则回滚。提交或回滚失败的句柄被丢弃，
    /// 提交失败的错误返回给调用方。
    pub async fn release(mut self, success: bool) -> Result<()> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };

        match finish_transaction(&mut session, success).await {
            Ok(()) => {
                self.pool.checkin(self.id, session).await;
                Ok(())
            }
            Err(e) => {
                warn!("Session {} transaction end failed, discarding: {}", self.id, e);
                self.pool.discard(self.id).await;
                session.close().await;
                if success {
                    Err(e)
                } else {
                    Ok(())
                }
            }
        }
    }
}

impl<S: Session> Drop for PooledSession<S> {
    fn drop(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        let pool = Arc::clone(&self.pool);
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if session.in_transaction() {
                        if let Err(e) = session.rollback().await {
                            warn!("Rollback of abandoned session {} failed: {}", id, e);
                        }
                    }
                    pool.discard(id).await;
                    session.close().await;
                });
            }
            Err(_) => warn!("Session {} dropped outside a runtime, handle leaked", id),
        }
    }
}
