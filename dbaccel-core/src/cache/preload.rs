//! # Access Preloader
//!
//! 记录键的访问频率，按时间衰减打分，推荐并预热热点键。
//!
//! 分数：`access_count * decay_factor ^ hours_since_last_access`，读取时惰性计算。
//! 模式表满时淘汰分数最低的一条。
//!
//! 预热是尽力而为的：缓存已有则跳过，loader 失败只记日志，不影响请求路径。

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::lru::EstimateSize;
use super::multi_level::MultiLevelCache;
use crate::error::Result;

/// 预热配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreloadConfig {
    /// 最多跟踪的访问模式数
    pub max_patterns: usize,
    /// 每小时的衰减系数，取值 (0, 1]
    pub decay_factor: f64,
    /// 分数达到该阈值才推荐预热
    pub threshold: f64,
    /// 每个键最多记录的关联键数
    pub max_related: usize,
}

impl Default for PreloadConfig {
    fn default() -> Self {
        Self {
            max_patterns: 10_000,
            decay_factor: 0.95,
            threshold: 5.0,
            max_related: 16,
        }
    }
}

impl PreloadConfig {
    pub fn with_max_patterns(mut self, max_patterns: usize) -> Self {
        self.max_patterns = max_patterns;
        self
    }

    pub fn with_decay_factor(mut self, decay_factor: f64) -> Self {
        self.decay_factor = decay_factor;
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// 验证配置是否有效
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_patterns == 0 {
            return Err("max_patterns must be greater than 0".to_string());
        }
        if !(self.decay_factor > 0.0 && self.decay_factor <= 1.0) {
            return Err("decay_factor must be in (0, 1]".to_string());
        }
        if !(self.threshold >= 0.0) {
            return Err("threshold must not be negative".to_string());
        }
        Ok(())
    }
}

/// 单个键的访问模式
#[derive(Debug, Clone)]
pub struct AccessPattern<K> {
    pub key: K,
    pub access_count: u64,
    pub last_access: Instant,
    pub related_keys: HashSet<K>,
}

impl<K> AccessPattern<K> {
    /// 在 `now` 时刻的衰减分数
    pub fn score_at(&self, now: Instant, decay_factor: f64) -> f64 {
        let hours = now.saturating_duration_since(self.last_access).as_secs_f64() / 3600.0;
        self.access_count as f64 * decay_factor.powf(hours)
    }
}

/// 预热统计
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PreloadStats {
    pub tracked_patterns: usize,
    pub evicted_patterns: u64,
    pub preloaded: u64,
    /// 缓存中已存在而跳过
    pub skipped: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct PreloadCounters {
    evicted: AtomicU64,
    preloaded: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

/// 访问模式跟踪与预热
pub struct AccessPreloader<K: Hash + Eq, V> {
    config: PreloadConfig,
    cache: Arc<MultiLevelCache<K, V>>,
    patterns: Mutex<HashMap<K, AccessPattern<K>>>,
    counters: PreloadCounters,
}

impl<K, V> AccessPreloader<K, V>
where
    K: Hash + Eq + Clone + std::fmt::Debug + Send + Sync + 'static,
    V: Clone + EstimateSize + Send + Sync + 'static,
{
    pub fn new(config: PreloadConfig, cache: Arc<MultiLevelCache<K, V>>) -> Self {
        Self {
            config,
            cache,
            patterns: Mutex::new(HashMap::new()),
            counters: PreloadCounters::default(),
        }
    }

    pub fn config(&self) -> &PreloadConfig {
        &self.config
    }

    /// 记录一次访问，以及同时被访问的关联键
    pub fn record_access(&self, key: &K, related: &[K]) {
        let now = Instant::now();
        let mut patterns = self.patterns.lock();

        if !patterns.contains_key(key) && patterns.len() >= self.config.max_patterns {
            let decay = self.config.decay_factor;
            let coldest = patterns
                .values()
                .min_by(|a, b| a.score_at(now, decay).total_cmp(&b.score_at(now, decay)))
                .map(|p| p.key.clone());
            if let Some(coldest) = coldest {
                patterns.remove(&coldest);
                self.counters.evicted.fetch_add(1, Ordering::Relaxed);
                debug!("Evicted access pattern {:?}", coldest);
            }
        }

        let pattern = patterns.entry(key.clone()).or_insert_with(|| AccessPattern {
            key: key.clone(),
            access_count: 0,
            last_access: now,
            related_keys: HashSet::new(),
        });
        pattern.access_count += 1;
        pattern.last_access = now;

        for other in related {
            if pattern.related_keys.len() >= self.config.max_related {
                break;
            }
            if other != key {
                pattern.related_keys.insert(other.clone());
            }
        }
    }

    /// 当前分数；未跟踪的键为 0
    pub fn score(&self, key: &K) -> f64 {
        let now = Instant::now();
        self.patterns
            .lock()
            .get(key)
            .map_or(0.0, |p| p.score_at(now, self.config.decay_factor))
    }

    /// 是否值得预热
    pub fn should_preload(&self, key: &K) -> bool {
        let now = Instant::now();
        let patterns = self.patterns.lock();
        patterns
            .get(key)
            .is_some_and(|p| p.score_at(now, self.config.decay_factor) >= self.config.threshold)
    }

    pub fn related_keys(&self, key: &K) -> Vec<K> {
        self.patterns
            .lock()
            .get(key)
            .map(|p| p.related_keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn pattern(&self, key: &K) -> Option<AccessPattern<K>> {
        self.patterns.lock().get(key).cloned()
    }

    /// 推荐预热的键
    ///
    /// 按分数降序，每个热点键后紧跟它尚未出现的关联键，截断到 `limit`。
    pub fn get_preload_keys(&self, limit: usize) -> Vec<K> {
        let now = Instant::now();
        let decay = self.config.decay_factor;

        let mut hot: Vec<(f64, K, Vec<K>)> = {
            let patterns = self.patterns.lock();
            patterns
                .values()
                .map(|p| (p.score_at(now, decay), p))
                .filter(|(score, _)| *score >= self.config.threshold)
                .map(|(score, p)| (score, p.key.clone(), p.related_keys.iter().cloned().collect()))
                .collect()
        };
        hot.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        for (_, key, related) in hot {
            for candidate in std::iter::once(key).chain(related) {
                if keys.len() >= limit {
                    return keys;
                }
                if seen.insert(candidate.clone()) {
                    keys.push(candidate);
                }
            }
        }
        keys
    }

    /// 预热单个键，返回是否写入了缓存
    pub async fn preload<F, Fut>(&self, key: &K, loader: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>>>,
    {
        if self.cache.contains(key).await {
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        match loader().await {
            Ok(Some(value)) => {
                let stored = self.cache.set(key.clone(), value, None).await;
                if stored {
                    self.counters.preloaded.fetch_add(1, Ordering::Relaxed);
                    debug!("Preloaded {:?}", key);
                }
                stored
            }
            Ok(None) => false,
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!("Preload of {:?} failed: {}", key, e);
                false
            }
        }
    }

    /// 后台预热，不等待结果
    pub fn spawn_preload<F, Fut>(self: &Arc<Self>, key: K, loader: F) -> JoinHandle<bool>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<V>>> + Send + 'static,
    {
        let preloader = Arc::clone(self);
        tokio::spawn(async move { preloader.preload(&key, loader).await })
    }

    /// 预热所有推荐的键，返回写入缓存的数量
    pub async fn preload_hot<F, Fut>(&self, limit: usize, loader: F) -> usize
    where
        F: Fn(K) -> Fut,
        Fut: Future<Output = Result<Option<V>>>,
    {
        let mut loaded = 0;
        for key in self.get_preload_keys(limit) {
            let fut = loader(key.clone());
            if self.preload(&key, || fut).await {
                loaded += 1;
            }
        }
        loaded
    }

    pub fn stats(&self) -> PreloadStats {
        PreloadStats {
            tracked_patterns: self.patterns.lock().len(),
            evicted_patterns: self.counters.evicted.load(Ordering::Relaxed),
            preloaded: self.counters.preloaded.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}
