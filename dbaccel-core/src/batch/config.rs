//! 批处理调度器配置

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 调度器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// 每个周期处理的最少操作数（自适应下限，也是初始值）
    pub min_batch_size: usize,

    /// 每个周期处理的最多操作数（自适应上限）
    pub max_batch_size: usize,

    /// 刷新间隔下限，也是初始值
    pub base_wait_time: Duration,

    /// 刷新间隔上限
    pub max_wait_time: Duration,

    /// 队列容量，满了以后入队的操作同步执行
    pub max_queue_size: usize,

    /// 读结果去重缓存的 TTL
    pub read_cache_ttl: Duration,

    /// 读结果去重缓存的容量
    pub read_cache_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            min_batch_size: 10,
            max_batch_size: 500,
            base_wait_time: Duration::from_millis(50),
            max_wait_time: Duration::from_secs(1),
            max_queue_size: 1000,
            read_cache_ttl: Duration::from_secs(5),
            read_cache_size: 1000,
        }
    }
}

impl BatchConfig {
    pub fn with_batch_size(mut self, min: usize, max: usize) -> Self {
        self.min_batch_size = min;
        self.max_batch_size = max;
        self
    }

    pub fn with_wait_time(mut self, base: Duration, max: Duration) -> Self {
        self.base_wait_time = base;
        self.max_wait_time = max;
        self
    }

    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    pub fn with_read_cache(mut self, size: usize, ttl: Duration) -> Self {
        self.read_cache_size = size;
        self.read_cache_ttl = ttl;
        self
    }

    /// 验证配置是否有效
    pub fn validate(&self) -> Result<(), String> {
        if self.min_batch_size == 0 {
            return Err("min_batch_size must be greater than 0".to_string());
        }
        if self.max_batch_size < self.min_batch_size {
            return Err(format!(
                "max_batch_size ({}) must not be smaller than min_batch_size ({})",
                self.max_batch_size, self.min_batch_size
            ));
        }
        if self.base_wait_time.is_zero() {
            return Err("base_wait_time must be greater than 0".to_string());
        }
        if self.max_wait_time < self.base_wait_time {
            return Err("max_wait_time must not be shorter than base_wait_time".to_string());
        }
        if self.max_queue_size == 0 {
            return Err("max_queue_size must be greater than 0".to_string());
        }
        if self.read_cache_size == 0 || self.read_cache_ttl.is_zero() {
            return Err("read cache size and ttl must be greater than 0".to_string());
        }
        Ok(())
    }

    /// 低延迟：小批次、短间隔
    pub fn low_latency() -> Self {
        Self {
            min_batch_size: 1,
            max_batch_size: 50,
            base_wait_time: Duration::from_millis(5),
            max_wait_time: Duration::from_millis(100),
            ..Self::default()
        }
    }

    /// 高吞吐：大批次、长间隔、大队列
    pub fn high_throughput() -> Self {
        Self {
            min_batch_size: 50,
            max_batch_size: 2000,
            base_wait_time: Duration::from_millis(100),
            max_wait_time: Duration::from_secs(2),
            max_queue_size: 10_000,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BatchConfig::default();
        assert_eq!(config.min_batch_size, 10);
        assert_eq!(config.max_batch_size, 500);
        assert_eq!(config.base_wait_time, Duration::from_millis(50));
        assert_eq!(config.max_queue_size, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_inverted_bounds() {
        assert!(BatchConfig::default().with_batch_size(100, 10).validate().is_err());
        assert!(BatchConfig::default()
            .with_wait_time(Duration::from_secs(2), Duration::from_secs(1))
            .validate()
            .is_err());
        assert!(BatchConfig::default().with_max_queue_size(0).validate().is_err());
    }

    #[test]
    fn test_presets_are_valid() {
        assert!(BatchConfig::low_latency().validate().is_ok());
        assert!(BatchConfig::high_throughput().validate().is_ok());
    }
}
