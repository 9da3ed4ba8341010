//! # Multi-Level Cache
//!
//! 两级缓存：L1（小、快、短 TTL）+ L2（大、长 TTL），均为 [`BoundedTtlMap`]。
//!
//! ## 读路径
//!
//! L1 → L2 → loader。L2 命中会回写（promote）到 L1，热数据逐步迁移到更快的一层。
//!
//! ## 写路径
//!
//! | 请求的 TTL            | 写入          |
//! |----------------------|---------------|
//! | 未指定                | L1 + L2       |
//! | `ttl <= l1_ttl`       | 仅 L1         |
//! | `ttl <= l2_ttl`       | L1 + L2       |
//! | `ttl > l2_ttl`        | 仅 L2         |
//!
//! 只写一层时，另一层的旧副本会被删除，避免旧值在短 TTL 过期后重新浮现。
//! 估算大小超过 `max_item_size_mb` 的值直接拒绝，不进入缓存。
//!
//! ## 内存回收
//!
//! 后台周期清理是一个逐级加码的阶梯：
//! 1. 清理两层的过期条目
//! 2. 仍超预算：清空 L2
//! 3. 仍超预算：清空 L1
//!
//! 每一步都有超时上限，超时的步骤记录日志并视为“无数据”。
//!
//! 两层之间不保证原子性：读可能观察到 L1 已更新而 L2 仍是旧值。

use std::collections::HashSet;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::config::CacheConfig;
use super::lru::{BoundedTtlMap, CacheStats, EstimateSize};
use crate::error::{AccelError, Result};
use crate::worker::BackgroundWorker;

/// 统计与清理子步骤的超时上限
pub const STEP_TIMEOUT: Duration = Duration::from_secs(1);

/// 缓存层
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CacheTier {
    /// 热数据，小容量，短 TTL
    L1,
    /// 温数据，大容量，长 TTL
    L2,
}

/// 聚合统计
#[derive(Debug, Clone, Serialize)]
pub struct MultiLevelStats {
    /// L1 统计（超时则为 None）
    pub l1: Option<CacheStats>,
    /// L2 统计（超时则为 None）
    pub l2: Option<CacheStats>,
    /// 经过本缓存的读请求数
    pub requests: u64,
    /// L1 命中
    pub l1_hits: u64,
    /// L2 命中（同时是 promote 次数）
    pub l2_hits: u64,
    /// 两层均未命中
    pub misses: u64,
    /// 总体命中率
    pub overall_hit_rate: f64,
    /// 去重后的键数（同时位于两层的键只计一次）
    pub unique_items: Option<usize>,
    /// 两层条目大小合计
    pub total_size_bytes: usize,
    pub memory_usage_mb: f64,
    /// 因超过单条目上限被拒绝的写入
    pub rejected_items: u64,
    /// loader 调用次数
    pub loader_calls: u64,
    /// 超时的子步骤
    pub timed_out: Vec<String>,
    pub collected_at: DateTime<Utc>,
}

/// 一次清理周期的结果
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanupReport {
    pub expired_l1: usize,
    pub expired_l2: usize,
    pub cleared_l2: bool,
    pub cleared_l1: bool,
    pub memory_before: Option<usize>,
    pub memory_after: Option<usize>,
    pub timed_out_steps: Vec<String>,
}

impl CleanupReport {
    /// 本周期是否移除了任何数据
    pub fn removed_anything(&self) -> bool {
        self.expired_l1 > 0 || self.expired_l2 > 0 || self.cleared_l1 || self.cleared_l2
    }
}

#[derive(Debug, Default)]
struct ReadCounters {
    requests: AtomicU64,
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    misses: AtomicU64,
    rejected: AtomicU64,
    loader_calls: AtomicU64,
}

/// 在上限时间内等待子步骤；超时记录并返回 None
async fn bounded<T, F>(step: &str, timed_out: &mut Vec<String>, fut: F) -> Option<T>
where
    F: Future<Output = T>,
{
    match tokio::time::timeout(STEP_TIMEOUT, fut).await {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Cache step '{}' exceeded {:?}, treating as no data", step, STEP_TIMEOUT);
            timed_out.push(step.to_string());
            None
        }
    }
}

/// 两级缓存
pub struct MultiLevelCache<K: Hash + Eq, V> {
    config: CacheConfig,
    l1: BoundedTtlMap<K, V>,
    l2: BoundedTtlMap<K, V>,
    counters: ReadCounters,
    cleanup_worker: Mutex<Option<BackgroundWorker>>,
}

impl<K, V> MultiLevelCache<K, V>
where
    K: Hash + Eq + Clone + std::fmt::Debug + Send + Sync + 'static,
    V: Clone + EstimateSize + Send + Sync + 'static,
{
    /// 创建新的两级缓存
    pub fn new(config: CacheConfig) -> Self {
        Self {
            l1: BoundedTtlMap::new("l1", config.l1_max_size, config.l1_ttl),
            l2: BoundedTtlMap::new("l2", config.l2_max_size, config.l2_ttl),
            config,
            counters: ReadCounters::default(),
            cleanup_worker: Mutex::new(None),
        }
    }

    /// 配置
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// L1 层
    pub fn l1(&self) -> &BoundedTtlMap<K, V> {
        &self.l1
    }

    /// L2 层
    pub fn l2(&self) -> &BoundedTtlMap<K, V> {
        &self.l2
    }

    /// 读取：L1 → L2（命中则 promote 到 L1）
    pub async fn get(&self, key: &K) -> Option<V> {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);

        if let Some(value) = self.l1.get(key).await {
            self.counters.l1_hits.fetch_add(1, Ordering::Relaxed);
            return Some(value);
        }

        if let Some(value) = self.l2.get(key).await {
            self.counters.l2_hits.fetch_add(1, Ordering::Relaxed);
            let size = value.estimated_size();
            self.l1.set_with_size(key.clone(), value.clone(), size, None).await;
            debug!("Promoted {:?} from L2 to L1", key);
            return Some(value);
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// 读取，未命中时调用 loader 并写回
    ///
    /// loader 返回 `Ok(None)` 表示数据源中也不存在；loader 的错误原样返回。
    pub async fn get_or_load<F, Fut>(&self, key: &K, loader: F) -> Result<Option<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(Some(value));
        }

        self.counters.loader_calls.fetch_add(1, Ordering::Relaxed);
        let loaded = loader().await?;

        if let Some(value) = &loaded {
            self.set(key.clone(), value.clone(), None).await;
        }
        Ok(loaded)
    }

    /// 写入，返回是否被接受
    pub async fn set(&self, key: K, value: V, ttl: Option<Duration>) -> bool {
        let size = value.estimated_size();
        self.set_with_size(key, value, size, ttl).await
    }

    /// 写入并给出显式大小，返回是否被接受
    pub async fn set_with_size(&self, key: K, value: V, size_bytes: usize, ttl: Option<Duration>) -> bool {
        let max_item = self.config.max_item_size_bytes();
        if size_bytes > max_item {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Rejected cache item {:?}: {} bytes exceeds per-item limit of {} bytes",
                key, size_bytes, max_item
            );
            return false;
        }

        let (to_l1, to_l2) = self.route(ttl);

        if to_l1 {
            self.l1.set_with_size(key.clone(), value.clone(), size_bytes, ttl).await;
        } else {
            self.l1.delete(&key).await;
        }

        if to_l2 {
            self.l2.set_with_size(key, value, size_bytes, ttl).await;
        } else {
            self.l2.delete(&key).await;
        }

        true
    }

    /// 按请求的 TTL 决定写入哪几层
    fn route(&self, ttl: Option<Duration>) -> (bool, bool) {
        match ttl {
            None => (true, true),
            Some(ttl) if ttl <= self.config.l1_ttl => (true, false),
            Some(ttl) if ttl <= self.config.l2_ttl => (true, true),
            Some(_) => (false, true),
        }
    }

    /// 从两层删除，返回任一层是否存在
    pub async fn delete(&self, key: &K) -> bool {
        let in_l1 = self.l1.delete(key).await;
        let in_l2 = self.l2.delete(key).await;
        in_l1 || in_l2
    }

    /// 清空两层
    pub async fn clear(&self) {
        self.l1.clear().await;
        self.l2.clear().await;
    }

    /// 任一层是否包含未过期的键（不影响统计与 LRU 顺序）
    pub async fn contains(&self, key: &K) -> bool {
        self.l1.contains(key).await || self.l2.contains(key).await
    }

    /// 键当前所在的最快一层
    pub async fn tier_of(&self, key: &K) -> Option<CacheTier> {
        if self.l1.contains(key).await {
            Some(CacheTier::L1)
        } else if self.l2.contains(key).await {
            Some(CacheTier::L2)
        } else {
            None
        }
    }

    /// 两层内存占用合计（字节）
    pub async fn memory_usage(&self) -> usize {
        self.l1.memory_usage().await + self.l2.memory_usage().await
    }

    /// 在上限时间内读取内存占用；任一层超时则返回 None
    async fn bounded_memory_usage(&self, timed_out: &mut Vec<String>) -> Option<usize> {
        let l1 = bounded("l1 memory", timed_out, self.l1.memory_usage()).await?;
        let l2 = bounded("l2 memory", timed_out, self.l2.memory_usage()).await?;
        Some(l1 + l2)
    }

    /// 执行一次清理周期
    pub async fn cleanup(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        let budget = self.config.max_memory_bytes();
        let mut timed_out = Vec::new();

        report.memory_before = self.bounded_memory_usage(&mut timed_out).await;

        // 1. 过期条目
        report.expired_l1 = bounded("l1 purge", &mut timed_out, self.l1.purge_expired())
            .await
            .unwrap_or(0);
        report.expired_l2 = bounded("l2 purge", &mut timed_out, self.l2.purge_expired())
            .await
            .unwrap_or(0);

        // 2. 仍超预算则清空 L2
        if let Some(usage) = self.bounded_memory_usage(&mut timed_out).await {
            if usage > budget {
                warn!(
                    "Cache memory {} bytes over budget {} bytes after purge, clearing L2",
                    usage, budget
                );
                report.cleared_l2 = bounded("l2 clear", &mut timed_out, self.l2.clear())
                    .await
                    .is_some();
            }
        }

        // 3. 仍超预算则清空 L1
        if report.cleared_l2 {
            if let Some(usage) = self.bounded_memory_usage(&mut timed_out).await {
                if usage > budget {
                    warn!(
                        "Cache memory {} bytes still over budget {} bytes, clearing L1",
                        usage, budget
                    );
                    report.cleared_l1 = bounded("l1 clear", &mut timed_out, self.l1.clear())
                        .await
                        .is_some();
                }
            }
        }

        report.memory_after = self.bounded_memory_usage(&mut timed_out).await;
        report.timed_out_steps = timed_out;
        report
    }

    /// 聚合统计
    ///
    /// 每个子步骤独立加锁、独立超时；超时的部分为 None 并记入 `timed_out`。
    pub async fn stats(&self) -> MultiLevelStats {
        let mut timed_out = Vec::new();

        let l1 = bounded("l1 stats", &mut timed_out, self.l1.stats()).await;
        let l2 = bounded("l2 stats", &mut timed_out, self.l2.stats()).await;
        let l1_keys = bounded("l1 keys", &mut timed_out, self.l1.keys()).await;
        let l2_keys = bounded("l2 keys", &mut timed_out, self.l2.keys()).await;

        let unique_items = match (&l1_keys, &l2_keys) {
            (Some(l1_keys), Some(l2_keys)) => {
                let in_l1: HashSet<&K> = l1_keys.iter().collect();
                Some(l1_keys.len() + l2_keys.iter().filter(|k| !in_l1.contains(k)).count())
            }
            _ => None,
        };

        let total_size_bytes = l1.as_ref().map_or(0, |s| s.total_size_bytes)
            + l2.as_ref().map_or(0, |s| s.total_size_bytes);

        let requests = self.counters.requests.load(Ordering::Relaxed);
        let l1_hits = self.counters.l1_hits.load(Ordering::Relaxed);
        let l2_hits = self.counters.l2_hits.load(Ordering::Relaxed);

        MultiLevelStats {
            l1,
            l2,
            requests,
            l1_hits,
            l2_hits,
            misses: self.counters.misses.load(Ordering::Relaxed),
            overall_hit_rate: if requests == 0 {
                0.0
            } else {
                (l1_hits + l2_hits) as f64 / requests as f64
            },
            unique_items,
            total_size_bytes,
            memory_usage_mb: total_size_bytes as f64 / (1024.0 * 1024.0),
            rejected_items: self.counters.rejected.load(Ordering::Relaxed),
            loader_calls: self.counters.loader_calls.load(Ordering::Relaxed),
            timed_out,
            collected_at: Utc::now(),
        }
    }

    /// 启动后台清理任务
    ///
    /// 任务只持有弱引用，缓存被释放后自行退出。
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut slot = self.cleanup_worker.lock().await;
        if slot.is_some() {
            return Err(AccelError::already_running("cache cleanup"));
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let worker = BackgroundWorker::spawn_periodic(
            "cache cleanup",
            self.config.cleanup_interval,
            move || {
                let weak = weak.clone();
                async move {
                    let Some(cache) = weak.upgrade() else {
                        return false;
                    };
                    let report = cache.cleanup().await;
                    if report.removed_anything() {
                        debug!("Cache cleanup: {:?}", report);
                    }
                    true
                }
            },
        );

        *slot = Some(worker);
        Ok(())
    }

    /// 停止后台清理任务（等待进行中的周期结束）
    pub async fn stop(&self) {
        let worker = self.cleanup_worker.lock().await.take();
        if let Some(worker) = worker {
            worker.shutdown().await;
        }
    }
}

impl<K: Hash + Eq, V> Drop for MultiLevelCache<K, V> {
    fn drop(&mut self) {
        if let Some(worker) = self.cleanup_worker.get_mut().take() {
            worker.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    fn key(s: &str) -> String {
        s.to_string()
    }

    fn test_config() -> CacheConfig {
        CacheConfig::default()
            .with_l1(10, Duration::from_secs(10))
            .with_l2(100, Duration::from_secs(100))
    }

    #[tokio::test]
    async fn test_set_without_ttl_writes_both_tiers() {
        let cache: MultiLevelCache<String, String> = MultiLevelCache::new(test_config());

        assert!(cache.set(key("a"), "1".to_string(), None).await);

        assert!(cache.l1().contains(&key("a")).await);
        assert!(cache.l2().contains(&key("a")).await);
        assert_eq!(cache.get(&key("a")).await, Some("1".to_string()));
    }

    #[tokio::test]
    async fn test_tier_routing_by_ttl() {
        let cache: MultiLevelCache<String, String> = MultiLevelCache::new(test_config());

        cache.set(key("hot"), "h".to_string(), Some(Duration::from_secs(5))).await;
        cache.set(key("warm"), "w".to_string(), Some(Duration::from_secs(100))).await;
        cache.set(key("cold"), "c".to_string(), Some(Duration::from_secs(500))).await;

        assert!(cache.l1().contains(&key("hot")).await);
        assert!(!cache.l2().contains(&key("hot")).await);

        assert!(cache.l1().contains(&key("warm")).await);
        assert!(cache.l2().contains(&key("warm")).await);

        assert!(!cache.l1().contains(&key("cold")).await);
        assert!(cache.l2().contains(&key("cold")).await);
    }

    #[tokio::test]
    async fn test_single_tier_write_drops_stale_copy() {
        let cache: MultiLevelCache<String, String> = MultiLevelCache::new(test_config());

        cache.set(key("a"), "old".to_string(), None).await;
        cache.set(key("a"), "new".to_string(), Some(Duration::from_secs(1))).await;

        assert!(!cache.l2().contains(&key("a")).await);
        assert_eq!(cache.get(&key("a")).await, Some("new".to_string()));
    }

    #[tokio::test]
    async fn test_l2_hit_promotes_to_l1() {
        let cache: MultiLevelCache<String, String> = MultiLevelCache::new(test_config());

        cache.set(key("cold"), "c".to_string(), Some(Duration::from_secs(500))).await;
        assert_eq!(cache.tier_of(&key("cold")).await, Some(CacheTier::L2));

        assert_eq!(cache.get(&key("cold")).await, Some("c".to_string()));
        assert_eq!(cache.tier_of(&key("cold")).await, Some(CacheTier::L1));

        let stats = cache.stats().await;
        assert_eq!(stats.l2_hits, 1);
        assert_eq!(stats.l1_hits, 0);
    }

    #[tokio::test]
    async fn test_oversized_item_is_rejected() {
        let config = test_config().with_max_item_size_mb(0.001);
        let cache: MultiLevelCache<String, String> = MultiLevelCache::new(config);

        let big = "x".repeat(2048);
        assert!(!cache.set(key("big"), big, None).await);
        assert!(!cache.contains(&key("big")).await);
        assert_eq!(cache.stats().await.rejected_items, 1);
    }

    #[tokio::test]
    async fn test_get_or_load() {
        let cache: MultiLevelCache<String, String> = MultiLevelCache::new(test_config());

        let loaded = cache
            .get_or_load(&key("a"), || async { Ok(Some("from-db".to_string())) })
            .await
            .unwrap();
        assert_eq!(loaded, Some("from-db".to_string()));

        // 第二次命中缓存，loader 不会被调用
        let cached = cache
            .get_or_load(&key("a"), || async { Err(AccelError::other("loader must not run")) })
            .await
            .unwrap();
        assert_eq!(cached, Some("from-db".to_string()));

        let missing = cache
            .get_or_load(&key("b"), || async { Ok(None) })
            .await
            .unwrap();
        assert_eq!(missing, None);
        assert!(!cache.contains(&key("b")).await);

        let failed = cache
            .get_or_load(&key("c"), || async { Err(AccelError::execution("db down")) })
            .await;
        assert!(matches!(failed, Err(AccelError::Execution(_))));

        assert_eq!(cache.stats().await.loader_calls, 3);
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let cache: MultiLevelCache<String, String> = MultiLevelCache::new(test_config());

        cache.set(key("a"), "1".to_string(), None).await;
        cache.set(key("b"), "2".to_string(), None).await;

        assert!(cache.delete(&key("a")).await);
        assert!(!cache.delete(&key("a")).await);
        assert_eq!(cache.get(&key("a")).await, None);

        cache.clear().await;
        assert!(!cache.contains(&key("b")).await);
        assert_eq!(cache.memory_usage().await, 0);
    }

    #[tokio::test]
    async fn test_stats_deduplicate_keys_in_both_tiers() {
        let cache: MultiLevelCache<String, String> = MultiLevelCache::new(test_config());

        cache.set(key("both"), "b".to_string(), None).await;
        cache.set(key("l1"), "1".to_string(), Some(Duration::from_secs(1))).await;
        cache.set(key("l2"), "2".to_string(), Some(Duration::from_secs(1000))).await;

        let stats = cache.stats().await;
        assert_eq!(stats.l1.as_ref().unwrap().item_count, 2);
        assert_eq!(stats.l2.as_ref().unwrap().item_count, 2);
        assert_eq!(stats.unique_items, Some(3));
        assert!(stats.timed_out.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_purges_expired_entries() {
        let cache: MultiLevelCache<String, String> = MultiLevelCache::new(test_config());

        cache.set(key("a"), "1".to_string(), None).await;
        advance(Duration::from_secs(11)).await;

        let report = cache.cleanup().await;
        assert_eq!(report.expired_l1, 1);
        assert_eq!(report.expired_l2, 0);
        assert!(!report.cleared_l2);
        assert!(cache.l2().contains(&key("a")).await);
    }

    #[tokio::test]
    async fn test_cleanup_ladder_clears_l2_first() {
        // 预算约 104 字节
        let config = test_config()
            .with_max_memory_mb(0.0001)
            .with_max_item_size_mb(0.0001);
        let cache: MultiLevelCache<String, String> = MultiLevelCache::new(config);

        cache.set(key("a"), "x".repeat(60), None).await;
        assert_eq!(cache.memory_usage().await, 120);

        let report = cache.cleanup().await;
        assert!(report.cleared_l2);
        assert!(!report.cleared_l1);
        assert_eq!(report.memory_after, Some(60));
        assert!(cache.l1().contains(&key("a")).await);
    }

    #[tokio::test]
    async fn test_cleanup_ladder_clears_both_tiers() {
        let config = test_config()
            .with_max_memory_mb(0.0001)
            .with_max_item_size_mb(0.0001);
        let cache: MultiLevelCache<String, String> = MultiLevelCache::new(config);

        cache.set(key("a"), "x".repeat(60), Some(Duration::from_secs(5))).await;
        cache.set(key("b"), "y".repeat(60), Some(Duration::from_secs(5))).await;

        let report = cache.cleanup().await;
        assert!(report.cleared_l2);
        assert!(report.cleared_l1);
        assert_eq!(report.memory_after, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_cleanup_lifecycle() {
        let config = test_config().with_cleanup_interval(Duration::from_secs(30));
        let cache = Arc::new(MultiLevelCache::<String, String>::new(config));

        cache.start().await.unwrap();
        assert!(matches!(cache.start().await, Err(AccelError::AlreadyRunning(_))));

        cache.set(key("a"), "1".to_string(), Some(Duration::from_secs(5))).await;
        tokio::time::sleep(Duration::from_secs(31)).await;

        assert_eq!(cache.l1().len().await, 0);

        cache.stop().await;
        // 可以再次启动
        cache.start().await.unwrap();
        cache.stop().await;
    }
}
