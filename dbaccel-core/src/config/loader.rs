//! # Configuration Loader
//!
//! Loads and merges configuration from multiple sources:
//! 1. Default values (lowest priority)
//! 2. Configuration file (middle priority)
//! 3. Environment variables (highest priority)
//!
//! Durations are written in seconds and may be fractional
//! (`base_wait_time = 0.05`).

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use super::OptimizerConfig;
use crate::error::{AccelError, Result};

/// Configuration loader with support for file and environment variable overrides
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    /// Path to configuration file
    config_path: PathBuf,

    /// Environment variable prefix
    env_prefix: String,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self {
            config_path: Self::default_config_path(),
            env_prefix: "DBACCEL".to_string(),
        }
    }
}

impl ConfigLoader {
    /// Create a new config loader with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a config loader with a specific config file path
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: path.into(),
            env_prefix: "DBACCEL".to_string(),
        }
    }

    /// Use a different environment variable prefix
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Path of the configuration file this loader reads
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Get the default configuration file path
    fn default_config_path() -> PathBuf {
        if let Ok(config_path) = env::var("DBACCEL_CONFIG") {
            return PathBuf::from(config_path);
        }

        let possible_paths = [
            PathBuf::from("dbaccel.toml"),
            dirs::config_dir()
                .map(|d| d.join("dbaccel").join("config.toml"))
                .unwrap_or_else(|| PathBuf::from("/etc/dbaccel/config.toml")),
        ];

        for path in &possible_paths {
            if path.exists() {
                return path.clone();
            }
        }

        possible_paths[0].clone()
    }

    /// Load configuration with full hierarchy
    pub fn load(&self) -> Result<OptimizerConfig> {
        self.load_with_env(|key| env::var(key).ok())
    }

    /// Load configuration, reading overrides through `lookup` instead of the
    /// process environment
    pub fn load_with_env<F>(&self, lookup: F) -> Result<OptimizerConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = OptimizerConfig::default();

        if self.config_path.exists() {
            let file_config = self.load_from_file()?;
            config = merge_file_config(config, file_config)?;
        }

        config = self.merge_env_config(config, lookup)?;

        config.validate().map_err(|e| {
            AccelError::configuration(format!("Configuration validation failed: {}", e))
        })?;

        tracing::debug!("Configuration loaded from {}", self.config_path.display());
        Ok(config)
    }

    /// Load configuration from file
    fn load_from_file(&self) -> Result<FileConfig> {
        let content = std::fs::read_to_string(&self.config_path).map_err(|e| {
            AccelError::configuration(format!(
                "Failed to read config file '{}': {}",
                self.config_path.display(),
                e
            ))
        })?;

        toml::from_str(&content).map_err(|e| {
            AccelError::configuration(format!(
                "Failed to parse config file '{}': {}",
                self.config_path.display(),
                e
            ))
        })
    }

    /// Merge environment variables into configuration
    fn merge_env_config<F>(&self, mut config: OptimizerConfig, lookup: F) -> Result<OptimizerConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}_{}", self.env_prefix, name));

        // Cache
        if let Some(val) = var("L1_MAX_SIZE") {
            config.cache.l1_max_size = parse_usize(&val, "L1_MAX_SIZE")?;
        }
        if let Some(val) = var("L1_TTL") {
            config.cache.l1_ttl = parse_secs(&val, "L1_TTL")?;
        }
        if let Some(val) = var("L2_MAX_SIZE") {
            config.cache.l2_max_size = parse_usize(&val, "L2_MAX_SIZE")?;
        }
        if let Some(val) = var("L2_TTL") {
            config.cache.l2_ttl = parse_secs(&val, "L2_TTL")?;
        }
        if let Some(val) = var("MAX_MEMORY_MB") {
            config.cache.max_memory_mb = parse_f64(&val, "MAX_MEMORY_MB")?;
        }
        if let Some(val) = var("MAX_ITEM_SIZE_MB") {
            config.cache.max_item_size_mb = parse_f64(&val, "MAX_ITEM_SIZE_MB")?;
        }
        if let Some(val) = var("CLEANUP_INTERVAL") {
            config.cache.cleanup_interval = parse_secs(&val, "CLEANUP_INTERVAL")?;
        }

        // Batch
        if let Some(val) = var("MIN_BATCH_SIZE") {
            config.batch.min_batch_size = parse_usize(&val, "MIN_BATCH_SIZE")?;
        }
        if let Some(val) = var("MAX_BATCH_SIZE") {
            config.batch.max_batch_size = parse_usize(&val, "MAX_BATCH_SIZE")?;
        }
        if let Some(val) = var("BASE_WAIT_TIME") {
            config.batch.base_wait_time = parse_secs(&val, "BASE_WAIT_TIME")?;
        }
        if let Some(val) = var("MAX_WAIT_TIME") {
            config.batch.max_wait_time = parse_secs(&val, "MAX_WAIT_TIME")?;
        }
        if let Some(val) = var("MAX_QUEUE_SIZE") {
            config.batch.max_queue_size = parse_usize(&val, "MAX_QUEUE_SIZE")?;
        }
        if let Some(val) = var("READ_CACHE_TTL") {
            config.batch.read_cache_ttl = parse_secs(&val, "READ_CACHE_TTL")?;
        }
        if let Some(val) = var("READ_CACHE_SIZE") {
            config.batch.read_cache_size = parse_usize(&val, "READ_CACHE_SIZE")?;
        }

        // Pool
        if let Some(val) = var("POOL_MAX_SIZE") {
            config.pool.max_size = parse_usize(&val, "POOL_MAX_SIZE")?;
        }
        if let Some(val) = var("POOL_MAX_LIFETIME") {
            config.pool.max_lifetime = parse_secs(&val, "POOL_MAX_LIFETIME")?;
        }
        if let Some(val) = var("POOL_MAX_IDLE") {
            config.pool.max_idle = parse_secs(&val, "POOL_MAX_IDLE")?;
        }
        if let Some(val) = var("POOL_CLEANUP_INTERVAL") {
            config.pool.cleanup_interval = parse_secs(&val, "POOL_CLEANUP_INTERVAL")?;
        }
        if let Some(val) = var("POOL_PROBE_TIMEOUT") {
            config.pool.probe_timeout = parse_secs(&val, "POOL_PROBE_TIMEOUT")?;
        }

        // Preload
        if let Some(val) = var("PRELOAD_MAX_PATTERNS") {
            config.preload.max_patterns = parse_usize(&val, "PRELOAD_MAX_PATTERNS")?;
        }
        if let Some(val) = var("PRELOAD_DECAY_FACTOR") {
            config.preload.decay_factor = parse_f64(&val, "PRELOAD_DECAY_FACTOR")?;
        }
        if let Some(val) = var("PRELOAD_THRESHOLD") {
            config.preload.threshold = parse_f64(&val, "PRELOAD_THRESHOLD")?;
        }

        Ok(config)
    }
}

/// Merge file configuration into default configuration
fn merge_file_config(mut base: OptimizerConfig, file: FileConfig) -> Result<OptimizerConfig> {
    if let Some(cache) = file.cache {
        if let Some(size) = cache.l1_max_size {
            base.cache.l1_max_size = size;
        }
        if let Some(ttl) = cache.l1_ttl {
            base.cache.l1_ttl = secs(ttl, "cache.l1_ttl")?;
        }
        if let Some(size) = cache.l2_max_size {
            base.cache.l2_max_size = size;
        }
        if let Some(ttl) = cache.l2_ttl {
            base.cache.l2_ttl = secs(ttl, "cache.l2_ttl")?;
        }
        if let Some(mb) = cache.max_memory_mb {
            base.cache.max_memory_mb = mb;
        }
        if let Some(mb) = cache.max_item_size_mb {
            base.cache.max_item_size_mb = mb;
        }
        if let Some(interval) = cache.cleanup_interval {
            base.cache.cleanup_interval = secs(interval, "cache.cleanup_interval")?;
        }
    }

    if let Some(batch) = file.batch {
        if let Some(size) = batch.min_batch_size {
            base.batch.min_batch_size = size;
        }
        if let Some(size) = batch.max_batch_size {
            base.batch.max_batch_size = size;
        }
        if let Some(wait) = batch.base_wait_time {
            base.batch.base_wait_time = secs(wait, "batch.base_wait_time")?;
        }
        if let Some(wait) = batch.max_wait_time {
            base.batch.max_wait_time = secs(wait, "batch.max_wait_time")?;
        }
        if let Some(size) = batch.max_queue_size {
            base.batch.max_queue_size = size;
        }
        if let Some(ttl) = batch.read_cache_ttl {
            base.batch.read_cache_ttl = secs(ttl, "batch.read_cache_ttl")?;
        }
        if let Some(size) = batch.read_cache_size {
            base.batch.read_cache_size = size;
        }
    }

    if let Some(pool) = file.pool {
        if let Some(size) = pool.max_size {
            base.pool.max_size = size;
        }
        if let Some(lifetime) = pool.max_lifetime {
            base.pool.max_lifetime = secs(lifetime, "pool.max_lifetime")?;
        }
        if let Some(idle) = pool.max_idle {
            base.pool.max_idle = secs(idle, "pool.max_idle")?;
        }
        if let Some(interval) = pool.cleanup_interval {
            base.pool.cleanup_interval = secs(interval, "pool.cleanup_interval")?;
        }
        if let Some(timeout) = pool.probe_timeout {
            base.pool.probe_timeout = secs(timeout, "pool.probe_timeout")?;
        }
    }

    if let Some(preload) = file.preload {
        if let Some(max) = preload.max_patterns {
            base.preload.max_patterns = max;
        }
        if let Some(decay) = preload.decay_factor {
            base.preload.decay_factor = decay;
        }
        if let Some(threshold) = preload.threshold {
            base.preload.threshold = threshold;
        }
        if let Some(max) = preload.max_related {
            base.preload.max_related = max;
        }
    }

    Ok(base)
}

fn secs(value: f64, name: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value).map_err(|_| {
        AccelError::configuration(format!("Invalid duration for {}: {} seconds", name, value))
    })
}

fn parse_secs(val: &str, name: &str) -> Result<Duration> {
    secs(parse_f64(val, name)?, name)
}

fn parse_f64(val: &str, name: &str) -> Result<f64> {
    val.trim().parse::<f64>().map_err(|_| {
        AccelError::configuration(format!("Invalid number for {}: {}", name, val))
    })
}

fn parse_usize(val: &str, name: &str) -> Result<usize> {
    val.trim().parse::<usize>().map_err(|_| {
        AccelError::configuration(format!("Invalid integer for {}: {}", name, val))
    })
}

// File configuration structures (with optional fields for partial configs)

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    pub cache: Option<FileCacheConfig>,
    #[serde(default)]
    pub batch: Option<FileBatchConfig>,
    #[serde(default)]
    pub pool: Option<FilePoolConfig>,
    #[serde(default)]
    pub preload: Option<FilePreloadConfig>,
}

#[derive(Debug, Clone, Deserialize)]
struct FileCacheConfig {
    pub l1_max_size: Option<usize>,
    pub l1_ttl: Option<f64>,
    pub l2_max_size: Option<usize>,
    pub l2_ttl: Option<f64>,
    pub max_memory_mb: Option<f64>,
    pub max_item_size_mb: Option<f64>,
    pub cleanup_interval: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
struct FileBatchConfig {
    pub min_batch_size: Option<usize>,
    pub max_batch_size: Option<usize>,
    pub base_wait_time: Option<f64>,
    pub max_wait_time: Option<f64>,
    pub max_queue_size: Option<usize>,
    pub read_cache_ttl: Option<f64>,
    pub read_cache_size: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
struct FilePoolConfig {
    pub max_size: Option<usize>,
    pub max_lifetime: Option<f64>,
    pub max_idle: Option<f64>,
    pub cleanup_interval: Option<f64>,
    pub probe_timeout: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
struct FilePreloadConfig {
    pub max_patterns: Option<usize>,
    pub decay_factor: Option<f64>,
    pub threshold: Option<f64>,
    pub max_related: Option<usize>,
}
