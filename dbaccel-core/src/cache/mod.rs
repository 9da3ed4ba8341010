//! # Cache Module
//!
//! 数据库访问前的多级缓存。
//!
//! - [`BoundedTtlMap`]: 单层 LRU + TTL 容器
//! - [`MultiLevelCache`]: L1/L2 两级缓存，带 promote、按 TTL 路由写入与内存回收阶梯
//! - [`AccessPreloader`]: 访问频率跟踪与热点预热
//!
//! ## 使用示例
//!
//! ```rust
//! use dbaccel_core::cache::{CacheConfig, MultiLevelCache};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let cache: MultiLevelCache<String, String> = MultiLevelCache::new(CacheConfig::default());
//!
//! // 短 TTL 只进入 L1
//! cache.set("session:1".to_string(), "alice".to_string(), Some(Duration::from_secs(5))).await;
//! assert_eq!(cache.get(&"session:1".to_string()).await, Some("alice".to_string()));
//! # }
//! ```

pub mod config;
pub mod lru;
pub mod multi_level;
pub mod preload;

pub use config::CacheConfig;
pub use lru::{BoundedTtlMap, CacheEntry, CacheStats, EstimateSize, Lookup};
pub use multi_level::{CacheTier, CleanupReport, MultiLevelCache, MultiLevelStats};
pub use preload::{AccessPattern, AccessPreloader, PreloadConfig, PreloadStats};
