//! # Cache Configuration
//!
//! 多级缓存配置。
//!
//! ## 配置选项
//!
//! - `l1_max_size` / `l1_ttl`: L1（小、快、短 TTL）容量与过期时间
//! - `l2_max_size` / `l2_ttl`: L2（大、慢、长 TTL）容量与过期时间
//! - `max_memory_mb`: 两级缓存合计的内存预算
//! - `max_item_size_mb`: 单个条目的大小上限，超过则拒绝缓存
//! - `cleanup_interval`: 后台清理周期
//!
//! ## 示例
//!
//! ```rust
//! use dbaccel_core::cache::CacheConfig;
//! use std::time::Duration;
//!
//! let config = CacheConfig::default()
//!     .with_l1(500, Duration::from_secs(5))
//!     .with_l2(5000, Duration::from_secs(300));
//! assert!(config.validate().is_ok());
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 多级缓存配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// L1 最大条目数
    pub l1_max_size: usize,

    /// L1 默认 TTL
    pub l1_ttl: Duration,

    /// L2 最大条目数
    pub l2_max_size: usize,

    /// L2 默认 TTL
    ///
    /// 应当不小于 `l1_ttl`，否则按 TTL 路由写入时 L2 永远不会单独命中。
    pub l2_ttl: Duration,

    /// 两级合计内存预算 (MB)
    ///
    /// 后台清理发现超出预算时，依次：清理过期条目 → 清空 L2 → 清空 L1。
    pub max_memory_mb: f64,

    /// 单条目大小上限 (MB)
    pub max_item_size_mb: f64,

    /// 后台清理间隔
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_max_size: 1000,
            l1_ttl: Duration::from_secs(60),
            l2_max_size: 10_000,
            l2_ttl: Duration::from_secs(600),
            max_memory_mb: 100.0,
            max_item_size_mb: 1.0,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    /// 设置 L1 容量与 TTL
    pub fn with_l1(mut self, max_size: usize, ttl: Duration) -> Self {
        self.l1_max_size = max_size;
        self.l1_ttl = ttl;
        self
    }

    /// 设置 L2 容量与 TTL
    pub fn with_l2(mut self, max_size: usize, ttl: Duration) -> Self {
        self.l2_max_size = max_size;
        self.l2_ttl = ttl;
        self
    }

    /// 设置内存预算
    pub fn with_max_memory_mb(mut self, mb: f64) -> Self {
        self.max_memory_mb = mb;
        self
    }

    /// 设置单条目大小上限
    pub fn with_max_item_size_mb(mut self, mb: f64) -> Self {
        self.max_item_size_mb = mb;
        self
    }

    /// 设置后台清理间隔
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// 内存预算（字节）
    pub fn max_memory_bytes(&self) -> usize {
        (self.max_memory_mb * 1024.0 * 1024.0) as usize
    }

    /// 单条目上限（字节）
    pub fn max_item_size_bytes(&self) -> usize {
        (self.max_item_size_mb * 1024.0 * 1024.0) as usize
    }

    /// 验证配置是否有效
    pub fn validate(&self) -> Result<(), String> {
        if self.l1_max_size == 0 || self.l2_max_size == 0 {
            return Err("tier max size must be greater than 0".to_string());
        }

        if self.l1_ttl.is_zero() || self.l2_ttl.is_zero() {
            return Err("tier ttl must be greater than 0".to_string());
        }

        if self.l2_ttl < self.l1_ttl {
            return Err(format!(
                "l2_ttl ({:?}) must not be shorter than l1_ttl ({:?})",
                self.l2_ttl, self.l1_ttl
            ));
        }

        if !(self.max_memory_mb > 0.0) {
            return Err("max_memory_mb must be greater than 0".to_string());
        }

        if !(self.max_item_size_mb > 0.0) || self.max_item_size_mb > self.max_memory_mb {
            return Err("max_item_size_mb must be in (0, max_memory_mb]".to_string());
        }

        if self.cleanup_interval.is_zero() {
            return Err("cleanup_interval must be greater than 0".to_string());
        }

        Ok(())
    }

    /// 禁用缓存的退化配置
    ///
    /// 容量 1、TTL 约等于 0：写入立即过期，读取总是未命中。
    pub fn disabled() -> Self {
        Self {
            l1_max_size: 1,
            l1_ttl: Duration::from_millis(1),
            l2_max_size: 1,
            l2_ttl: Duration::from_millis(1),
            ..Self::default()
        }
    }

    /// 用于开发环境的配置
    ///
    /// 特点：较小的缓存，较短的 TTL。
    pub fn development() -> Self {
        Self {
            l1_max_size: 100,
            l1_ttl: Duration::from_secs(5),
            l2_max_size: 1000,
            l2_ttl: Duration::from_secs(60),
            max_memory_mb: 16.0,
            ..Self::default()
        }
    }

    /// 用于生产环境的配置
    pub fn production() -> Self {
        Self {
            l1_max_size: 5000,
            l1_ttl: Duration::from_secs(60),
            l2_max_size: 50_000,
            l2_ttl: Duration::from_secs(900),
            max_memory_mb: 512.0,
            max_item_size_mb: 4.0,
            cleanup_interval: Duration::from_secs(30),
        }
    }
}
