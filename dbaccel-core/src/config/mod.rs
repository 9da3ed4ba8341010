//! # DbAccel Configuration
//!
//! 所有组件配置的汇总。
//!
//! ## 配置层次
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Environment Variables          │
//! │    DBACCEL_L1_MAX_SIZE=2000            │
//! ├─────────────────────────────────────────┤
//! │         Config File (dbaccel.toml)      │
//! │    [cache]                              │
//! │    l1_max_size = 2000                   │
//! ├─────────────────────────────────────────┤
//! │         Default Values                  │
//! │    impl Default for CacheConfig { .. }  │
//! └─────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};

mod loader;

pub use loader::ConfigLoader;

use crate::batch::BatchConfig;
use crate::cache::{CacheConfig, PreloadConfig};
use crate::storage::PoolConfig;

/// 全部组件的配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    pub cache: CacheConfig,
    pub batch: BatchConfig,
    pub pool: PoolConfig,
    pub preload: PreloadConfig,
}

impl OptimizerConfig {
    /// 验证所有部分，错误信息带上所属部分
    pub fn validate(&self) -> Result<(), String> {
        self.cache.validate().map_err(|e| format!("cache: {}", e))?;
        self.batch.validate().map_err(|e| format!("batch: {}", e))?;
        self.pool.validate().map_err(|e| format!("pool: {}", e))?;
        self.preload.validate().map_err(|e| format!("preload: {}", e))?;
        Ok(())
    }

    /// 开发环境：小缓存、低延迟批处理
    pub fn development() -> Self {
        Self {
            cache: CacheConfig::development(),
            batch: BatchConfig::low_latency(),
            ..Self::default()
        }
    }

    /// 生产环境：大缓存、高吞吐批处理
    pub fn production() -> Self {
        Self {
            cache: CacheConfig::production(),
            batch: BatchConfig::high_throughput(),
            pool: PoolConfig::default().with_max_size(32),
            ..Self::default()
        }
    }

    /// 关闭缓存的退化配置
    pub fn cache_disabled() -> Self {
        Self {
            cache: CacheConfig::disabled(),
            ..Self::default()
        }
    }
}
