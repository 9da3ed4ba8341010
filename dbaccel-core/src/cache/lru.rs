//! # LRU + TTL Map
//!
//! 单个缓存层（tier）的实现：固定容量、带过期时间、LRU 淘汰。
//!
//! ## 特性
//!
//! - 基于 `lru::LruCache` 的 O(1) 读写与最近使用顺序
//! - 每个 map 一把 `tokio::sync::Mutex`，只在结构性修改期间持有
//! - 过期条目在访问时淘汰，也可由后台任务批量清理 (`purge_expired`)
//! - 单条目 TTL 覆盖：通过回拨 `created_at` 实现，同一容器内的条目
//!   可以拥有不同的有效寿命，而无需第二个数据结构
//! - 统计：命中、未命中、淘汰、过期、总字节数
//!
//! ## 示例
//!
//! ```rust
//! use dbaccel_core::cache::{BoundedTtlMap, Lookup};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let map: BoundedTtlMap<String, String> = BoundedTtlMap::new("l1", 2, Duration::from_secs(60));
//! map.set("a".to_string(), "1".to_string(), None).await;
//! assert!(matches!(map.lookup(&"a".to_string()).await, Lookup::Found(_)));
//! # }
//! ```

use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// 单条目 TTL 覆盖相对默认 TTL 的最大延长量（约 100 年）
pub const MAX_TTL_EXTENSION: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// 字节大小估算
///
/// 用于单条目大小上限与内存预算的计算。估算不需要精确，但必须对
/// 同一个值稳定。
pub trait EstimateSize {
    /// 估算的字节数
    fn estimated_size(&self) -> usize;
}

macro_rules! impl_estimate_size_for_primitives {
    ($($t:ty),* $(,)?) => {
        $(
            impl EstimateSize for $t {
                fn estimated_size(&self) -> usize {
                    std::mem::size_of::<$t>()
                }
            }
        )*
    };
}

impl_estimate_size_for_primitives!(bool, char, u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64);

impl EstimateSize for str {
    fn estimated_size(&self) -> usize {
        self.len()
    }
}

impl EstimateSize for String {
    fn estimated_size(&self) -> usize {
        self.len()
    }
}

impl<T: EstimateSize> EstimateSize for Vec<T> {
    fn estimated_size(&self) -> usize {
        self.iter().map(EstimateSize::estimated_size).sum()
    }
}

impl<T: EstimateSize> EstimateSize for Option<T> {
    fn estimated_size(&self) -> usize {
        self.as_ref().map_or(0, EstimateSize::estimated_size)
    }
}

impl<T: EstimateSize + ?Sized> EstimateSize for Arc<T> {
    fn estimated_size(&self) -> usize {
        (**self).estimated_size()
    }
}

impl<T: EstimateSize + ?Sized> EstimateSize for Box<T> {
    fn estimated_size(&self) -> usize {
        (**self).estimated_size()
    }
}

impl EstimateSize for serde_json::Value {
    fn estimated_size(&self) -> usize {
        use serde_json::Value;
        match self {
            Value::Null | Value::Bool(_) => 1,
            Value::Number(_) => 8,
            Value::String(s) => s.len(),
            Value::Array(items) => items.iter().map(EstimateSize::estimated_size).sum(),
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| k.len() + v.estimated_size())
                .sum(),
        }
    }
}

/// 缓存条目
///
/// 由所在 tier 独占，从不共享。
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    /// 缓存的值
    pub value: V,
    /// 创建时间（TTL 覆盖时为合成时间）
    pub created_at: Instant,
    /// 最后访问时间
    pub last_accessed: Instant,
    /// 访问次数
    pub access_count: u64,
    /// 估算大小（字节）
    pub size_bytes: usize,
}

impl<V> CacheEntry<V> {
    fn new(value: V, now: Instant, created_at: Instant, size_bytes: usize) -> Self {
        Self {
            value,
            created_at,
            last_accessed: now,
            access_count: 0,
            size_bytes,
        }
    }

    /// 是否已过期
    ///
    /// `created_at` 可能位于未来（TTL 覆盖大于默认 TTL 时），此时年龄为 0。
    pub fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) > ttl
    }

    fn touch(&mut self, now: Instant) {
        self.last_accessed = now;
        self.access_count += 1;
    }
}

/// 查询结果
///
/// 未命中与过期是两种正常结果，调用方显式分支处理。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<V> {
    /// 命中
    Found(V),
    /// 不存在
    Absent,
    /// 存在但已过期（本次访问已将其移除）
    Expired,
}

impl<V> Lookup<V> {
    /// 转换为 Option
    pub fn into_option(self) -> Option<V> {
        match self {
            Lookup::Found(v) => Some(v),
            Lookup::Absent | Lookup::Expired => None,
        }
    }

    /// 是否命中
    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }
}

/// 单层统计快照
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub total_size_bytes: usize,
    pub item_count: usize,
    pub hit_rate: f64,
}

/// 单层统计计数器
#[derive(Debug, Default)]
struct TierMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl TierMetrics {
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    fn record_expirations(&self, count: u64) {
        self.expirations.fetch_add(count, Ordering::Relaxed);
    }
}

/// 受锁保护的内部状态
struct MapState<K: Hash + Eq, V> {
    /// 条目存储，迭代顺序即最近使用顺序
    entries: LruCache<K, CacheEntry<V>>,
    /// 当前条目大小合计
    total_size: usize,
}

impl<K: Hash + Eq, V> MapState<K, V> {
    fn remove(&mut self, key: &K) -> Option<CacheEntry<V>> {
        let entry = self.entries.pop(key)?;
        self.total_size = self.total_size.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    fn pop_lru(&mut self) -> Option<(K, CacheEntry<V>)> {
        let (key, entry) = self.entries.pop_lru()?;
        self.total_size = self.total_size.saturating_sub(entry.size_bytes);
        Some((key, entry))
    }
}

/// 固定容量、带 TTL 的 LRU map
pub struct BoundedTtlMap<K: Hash + Eq, V> {
    name: String,
    max_size: usize,
    ttl: Duration,
    state: Mutex<MapState<K, V>>,
    metrics: TierMetrics,
}

impl<K, V> BoundedTtlMap<K, V>
where
    K: Hash + Eq + Clone + std::fmt::Debug,
    V: Clone,
{
    /// 创建新的 map
    ///
    /// `max_size` 至少为 1。
    pub fn new(name: impl Into<String>, max_size: usize, ttl: Duration) -> Self {
        Self {
            name: name.into(),
            max_size: max_size.max(1),
            ttl,
            state: Mutex::new(MapState {
                entries: LruCache::unbounded(),
                total_size: 0,
            }),
            metrics: TierMetrics::default(),
        }
    }

    /// 名称（用于日志）
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 默认 TTL
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// 容量
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// 查询，区分未命中与过期
    pub async fn lookup(&self, key: &K) -> Lookup<V> {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        match state.entries.get_mut(key) {
            None => {
                self.metrics.record_miss();
                return Lookup::Absent;
            }
            Some(entry) if !entry.is_expired(self.ttl, now) => {
                entry.touch(now);
                self.metrics.record_hit();
                return Lookup::Found(entry.value.clone());
            }
            Some(_) => {}
        }

        state.remove(key);
        drop(state);

        self.metrics.record_miss();
        self.metrics.record_expirations(1);
        tracing::trace!("{}: entry {:?} expired on access", self.name, key);
        Lookup::Expired
    }

    /// 读取值
    pub async fn get(&self, key: &K) -> Option<V> {
        self.lookup(key).await.into_option()
    }

    /// 写入值，大小由 [`EstimateSize`] 估算
    pub async fn set(&self, key: K, value: V, ttl: Option<Duration>)
    where
        V: EstimateSize,
    {
        // 在锁外估算大小
        let size = value.estimated_size();
        self.set_with_size(key, value, size, ttl).await;
    }

    /// 写入值并给出显式大小
    ///
    /// 已满时先淘汰最久未使用的条目，直到恰好能容纳一个新条目。
    /// `ttl` 覆盖默认 TTL。
    pub async fn set_with_size(&self, key: K, value: V, size_bytes: usize, ttl: Option<Duration>) {
        let now = Instant::now();
        let entry = CacheEntry::new(value, now, self.synthetic_created_at(now, ttl), size_bytes);

        let mut state = self.state.lock().await;
        let mut evicted = 0u64;

        if state.remove(&key).is_none() {
            while state.entries.len() >= self.max_size {
                match state.pop_lru() {
                    Some((evicted_key, _)) => {
                        tracing::debug!("{}: evicted {:?}", self.name, evicted_key);
                        evicted += 1;
                    }
                    None => break,
                }
            }
        }

        state.entries.put(key, entry);
        state.total_size += size_bytes;
        drop(state);

        if evicted > 0 {
            self.metrics.record_evictions(evicted);
        }
    }

    /// 删除条目，返回是否存在
    pub async fn delete(&self, key: &K) -> bool {
        self.state.lock().await.remove(key).is_some()
    }

    /// 清空所有条目（统计计数器保持单调，不重置）
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.entries.clear();
        state.total_size = 0;
    }

    /// 是否包含未过期的键
    ///
    /// 不修改最近使用顺序，也不计入命中统计。
    pub async fn contains(&self, key: &K) -> bool {
        let now = Instant::now();
        let state = self.state.lock().await;
        state
            .entries
            .peek(key)
            .map_or(false, |entry| !entry.is_expired(self.ttl, now))
    }

    /// 移除所有过期条目，返回移除数
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        let expired: Vec<K> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(self.ttl, now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            state.remove(key);
        }
        drop(state);

        let count = expired.len();
        if count > 0 {
            self.metrics.record_expirations(count as u64);
        }
        count
    }

    /// 移除所有满足谓词的键，返回移除数
    pub async fn remove_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&K) -> bool,
    {
        let mut state = self.state.lock().await;

        let matched: Vec<K> = state
            .entries
            .iter()
            .filter(|(key, _)| predicate(key))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &matched {
            state.remove(key);
        }
        matched.len()
    }

    /// 所有未过期的键（最近使用在前）
    pub async fn keys(&self) -> Vec<K> {
        let now = Instant::now();
        let state = self.state.lock().await;
        state
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_expired(self.ttl, now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// 当前条目数（包含尚未清理的过期条目）
    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    /// 是否为空
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// 当前条目大小合计（字节）
    pub async fn memory_usage(&self) -> usize {
        self.state.lock().await.total_size
    }

    /// 统计快照
    pub async fn stats(&self) -> CacheStats {
        let (item_count, total_size_bytes) = {
            let state = self.state.lock().await;
            (state.entries.len(), state.total_size)
        };

        let hits = self.metrics.hits.load(Ordering::Relaxed);
        let misses = self.metrics.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        CacheStats {
            hits,
            misses,
            evictions: self.metrics.evictions.load(Ordering::Relaxed),
            expirations: self.metrics.expirations.load(Ordering::Relaxed),
            total_size_bytes,
            item_count,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }

    /// 计算合成创建时间
    ///
    /// 覆盖 TTL 较短时回拨 `ttl_default - ttl_override`，较长时前移差值。
    fn synthetic_created_at(&self, now: Instant, ttl: Option<Duration>) -> Instant {
        match ttl {
            None => now,
            Some(ttl) if ttl <= self.ttl => {
                // 时钟起点附近无法回拨时退化为默认 TTL
                now.checked_sub(self.ttl - ttl).unwrap_or(now)
            }
            Some(ttl) => {
                // `Duration::MAX` 之类的“永不过期”按上限处理
                let extension = (ttl - self.ttl).min(MAX_TTL_EXTENSION);
                now.checked_add(extension).unwrap_or(now)
            }
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

    #[tokio::test]
    async fn test_basic_get_set() {
        let map: BoundedTtlMap<String, String> = BoundedTtlMap::new("test", 10, Duration::from_secs(60));

        map.set(key("k1"), "v1".to_string(), None).await;

        assert_eq!(map.get(&key("k1")).await, Some("v1".to_string()));
        assert_eq!(map.get(&key("k2")).await, None);

        let stats = map.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.item_count, 1);
        assert_eq!(stats.total_size_bytes, 2);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let map: BoundedTtlMap<String, i32> = BoundedTtlMap::new("test", 3, Duration::from_secs(60));

        map.set(key("a"), 1, None).await;
        map.set(key("b"), 2, None).await;
        map.set(key("c"), 3, None).await;

        // 访问 a，使其变为最近使用
        map.get(&key("a")).await;

        // 插入 d，应该淘汰 b
        map.set(key("d"), 4, None).await;

        assert_eq!(map.get(&key("a")).await, Some(1));
        assert_eq!(map.get(&key("b")).await, None);
        assert_eq!(map.get(&key("c")).await, Some(3));
        assert_eq!(map.get(&key("d")).await, Some(4));
        assert_eq!(map.stats().await.evictions, 1);
    }

    #[tokio::test]
    async fn test_capacity_two_scenario() {
        let map: BoundedTtlMap<String, i32> = BoundedTtlMap::new("l1", 2, Duration::from_secs(60));

        map.set(key("a"), 1, None).await;
        map.set(key("b"), 2, None).await;
        map.set(key("c"), 3, None).await;

        let mut keys = map.keys().await;
        keys.sort();
        assert_eq!(keys, vec![key("b"), key("c")]);
    }

    #[tokio::test]
    async fn test_capacity_invariant_holds_after_every_set() {
        let map: BoundedTtlMap<u64, u64> = BoundedTtlMap::new("test", 7, Duration::from_secs(60));

        for i in 0..200u64 {
            // 混合新键与重复键
            map.set(i % 13, i, None).await;
            assert!(map.len().await <= 7);
        }
    }

    #[tokio::test]
    async fn test_overwrite_does_not_evict() {
        let map: BoundedTtlMap<String, i32> = BoundedTtlMap::new("test", 2, Duration::from_secs(60));

        map.set(key("a"), 1, None).await;
        map.set(key("b"), 2, None).await;
        map.set(key("a"), 10, None).await;

        assert_eq!(map.len().await, 2);
        assert_eq!(map.get(&key("a")).await, Some(10));
        assert_eq!(map.get(&key("b")).await, Some(2));
        assert_eq!(map.stats().await.evictions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiration_boundary() {
        let map: BoundedTtlMap<String, i32> = BoundedTtlMap::new("test", 10, Duration::from_secs(10));

        map.set(key("a"), 1, None).await;

        advance(Duration::from_secs(10) - Duration::from_millis(1)).await;
        assert_eq!(map.lookup(&key("a")).await, Lookup::Found(1));

        advance(Duration::from_millis(2)).await;
        assert_eq!(map.lookup(&key("a")).await, Lookup::Expired);

        // 过期条目已在访问时移除
        assert_eq!(map.lookup(&key("a")).await, Lookup::Absent);
        assert_eq!(map.stats().await.expirations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shorter_ttl_override() {
        let map: BoundedTtlMap<String, i32> = BoundedTtlMap::new("test", 10, Duration::from_secs(60));

        map.set(key("short"), 1, Some(Duration::from_secs(5))).await;
        map.set(key("default"), 2, None).await;

        advance(Duration::from_millis(4900)).await;
        assert_eq!(map.get(&key("short")).await, Some(1));

        advance(Duration::from_millis(200)).await;
        assert_eq!(map.get(&key("short")).await, None);
        assert_eq!(map.get(&key("default")).await, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_longer_ttl_override() {
        let map: BoundedTtlMap<String, i32> = BoundedTtlMap::new("test", 10, Duration::from_secs(5));

        map.set(key("long"), 1, Some(Duration::from_secs(20))).await;

        advance(Duration::from_secs(19)).await;
        assert_eq!(map.get(&key("long")).await, Some(1));

        advance(Duration::from_secs(2)).await;
        assert_eq!(map.get(&key("long")).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_ttl_override_is_clamped() {
        let map: BoundedTtlMap<String, i32> = BoundedTtlMap::new("test", 10, Duration::from_secs(5));

        map.set(key("forever"), 1, Some(Duration::MAX)).await;

        advance(Duration::from_secs(365 * 24 * 3600)).await;
        assert_eq!(map.get(&key("forever")).await, Some(1));
        assert_eq!(map.purge_expired().await, 0);
    }

    #[tokio::test]
    async fn test_contains_does_not_touch_recency() {
        let map: BoundedTtlMap<String, i32> = BoundedTtlMap::new("test", 2, Duration::from_secs(60));

        map.set(key("a"), 1, None).await;
        map.set(key("b"), 2, None).await;
        assert!(map.contains(&key("a")).await);

        map.set(key("c"), 3, None).await;
        assert!(!map.contains(&key("a")).await);

        let stats = map.stats().await;
        assert_eq!(stats.hits + stats.misses, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let map: BoundedTtlMap<String, String> = BoundedTtlMap::new("test", 10, Duration::from_secs(10));

        map.set(key("a"), "aaaa".to_string(), None).await;
        map.set(key("b"), "bb".to_string(), Some(Duration::from_secs(1))).await;

        advance(Duration::from_secs(2)).await;
        assert_eq!(map.purge_expired().await, 1);
        assert_eq!(map.len().await, 1);
        assert_eq!(map.memory_usage().await, 4);
    }

    #[tokio::test]
    async fn test_delete_clear_and_remove_where() {
        let map: BoundedTtlMap<String, i32> = BoundedTtlMap::new("test", 10, Duration::from_secs(60));

        map.set(key("read:user:1"), 1, None).await;
        map.set(key("read:user:2"), 2, None).await;
        map.set(key("read:order:1"), 3, None).await;

        assert!(map.delete(&key("read:user:1")).await);
        assert!(!map.delete(&key("read:user:1")).await);

        assert_eq!(map.remove_where(|k| k.starts_with("read:user:")).await, 1);
        assert_eq!(map.keys().await, vec![key("read:order:1")]);

        map.clear().await;
        assert!(map.is_empty().await);
        assert_eq!(map.memory_usage().await, 0);
    }

    #[test]
    fn test_estimate_size_json() {
        let value = serde_json::json!({"id": 1, "name": "abc", "tags": ["x", "yz"]});
        // id(2)+8 + name(4)+3 + tags(4)+1+2
        assert_eq!(value.estimated_size(), 24);
        assert_eq!("hello".to_string().estimated_size(), 5);
        assert_eq!(vec![1u32, 2, 3].estimated_size(), 12);
        assert_eq!(Some(7u64).estimated_size(), 8);
    }
}
