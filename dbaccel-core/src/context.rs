//! # DbOptimizer
//!
//! 把缓存、预热器、连接池和批处理调度器组装在一起的门面。
//!
//! ```text
//! OptimizerConfig
//! ├── MultiLevelCache<String, Value>
//! │   └── AccessPreloader (共享同一个缓存)
//! ├── SessionPool<S>
//! └── AdaptiveBatchScheduler
//!     └── BatchExecutor (通常持有 SessionPool 的克隆)
//! ```
//!
//! ## 生命周期
//!
//! - `start`：缓存清理、连接池清理、批处理循环
//! - `stop`：先排空调度器（排队的操作全部执行），再停止清理任务，最后关闭连接池
//!
//! ## 使用示例
//!
//! ```rust,ignore
//! let optimizer = DbOptimizer::sqlite("app.db", OptimizerConfig::default())?;
//! optimizer.start().await?;
//!
//! let rows = optimizer
//!     .execute(OperationRequest::read("users").with_condition("name", "alice"))
//!     .await?;
//!
//! optimizer.stop().await?;
//! ```

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::batch::{AdaptiveBatchScheduler, BatchExecutor, BatchStats, FlushReport, OperationHandle, OperationRequest};
use crate::cache::{AccessPreloader, MultiLevelCache, MultiLevelStats, PreloadStats};
use crate::config::OptimizerConfig;
use crate::error::{AccelError, Result};
use crate::storage::{PoolStats, Session, SessionFactory, SessionPool, SqliteBatchExecutor, SqliteSession, SqliteSessionFactory};

/// 所有组件的统计快照
#[derive(Debug, Clone, Serialize)]
pub struct OptimizerStats {
    pub cache: MultiLevelStats,
    pub preload: PreloadStats,
    pub pool: PoolStats,
    pub batch: BatchStats,
}

/// 数据库访问优化层
pub struct DbOptimizer<S: Session> {
    config: OptimizerConfig,
    cache: Arc<MultiLevelCache<String, Value>>,
    preloader: Arc<AccessPreloader<String, Value>>,
    pool: SessionPool<S>,
    scheduler: Arc<AdaptiveBatchScheduler>,
}

impl<S: Session> DbOptimizer<S> {
    /// 组装所有组件
    ///
    /// `build_executor` 拿到连接池的克隆，返回调度器使用的执行器。
    pub fn new<F, E, B>(config: OptimizerConfig, factory: F, build_executor: B) -> Result<Self>
    where
        F: SessionFactory<Session = S>,
        E: BatchExecutor,
        B: FnOnce(SessionPool<S>) -> E,
    {
        config.validate().map_err(AccelError::configuration)?;

        let cache = Arc::new(MultiLevelCache::new(config.cache.clone()));
        let preloader = Arc::new(AccessPreloader::new(config.preload.clone(), Arc::clone(&cache)));
        let pool = SessionPool::new(config.pool.clone(), factory);
        let scheduler = Arc::new(AdaptiveBatchScheduler::new(
            config.batch.clone(),
            build_executor(pool.clone()),
        )?);

        Ok(Self {
            config,
            cache,
            preloader,
            pool,
            scheduler,
        })
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<MultiLevelCache<String, Value>> {
        &self.cache
    }

    pub fn preloader(&self) -> &Arc<AccessPreloader<String, Value>> {
        &self.preloader
    }

    pub fn pool(&self) -> &SessionPool<S> {
        &self.pool
    }

    pub fn scheduler(&self) -> &Arc<AdaptiveBatchScheduler> {
        &self.scheduler
    }

    /// 启动所有后台任务
    pub async fn start(&self) -> Result<()> {
        self.cache.start().await?;
        self.pool.start().await?;
        self.scheduler.start().await?;
        info!("DbOptimizer started");
        Ok(())
    }

    /// 停止所有后台任务，返回排空调度器时执行的操作
    pub async fn stop(&self) -> Result<FlushReport> {
        let report = self.scheduler.stop().await?;
        self.cache.stop().await;
        self.pool.close().await?;
        info!("DbOptimizer stopped, {} operations drained", report.drained);
        Ok(report)
    }

    /// 读缓存，未命中时调用 loader；同时记录访问模式
    pub async fn get<F, Fut>(&self, key: &str, loader: F) -> Result<Option<Value>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<Value>>>,
    {
        self.get_with_related(key, &[], loader).await
    }

    /// 同 [`get`](Self::get)，并记录与本次访问同时出现的键
    pub async fn get_with_related<F, Fut>(&self, key: &str, related: &[String], loader: F) -> Result<Option<Value>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<Value>>>,
    {
        let key = key.to_string();
        self.preloader.record_access(&key, related);
        self.cache.get_or_load(&key, loader).await
    }

    /// 写缓存
    pub async fn put(&self, key: impl Into<String>, value: Value) -> bool {
        self.cache.set(key.into(), value, None).await
    }

    /// 从两级缓存中删除
    pub async fn invalidate(&self, key: &str) -> bool {
        self.cache.delete(&key.to_string()).await
    }

    /// 提交操作，立即返回 handle
    pub async fn submit(&self, request: OperationRequest) -> OperationHandle {
        self.scheduler.enqueue(request).await
    }

    /// 提交操作并等待结果
    pub async fn execute(&self, request: OperationRequest) -> Result<Value> {
        self.scheduler.enqueue(request).await.await
    }

    /// 预热热点键，返回写入缓存的数量
    pub async fn preload_hot<F, Fut>(&self, limit: usize, loader: F) -> usize
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<Option<Value>>>,
    {
        self.preloader.preload_hot(limit, loader).await
    }

    pub async fn stats(&self) -> Result<OptimizerStats> {
        Ok(OptimizerStats {
            cache: self.cache.stats().await,
            preload: self.preloader.stats(),
            pool: self.pool.stats().await?,
            batch: self.scheduler.stats().await,
        })
    }
}

impl DbOptimizer<SqliteSession> {
    /// SQLite 文件数据库上的完整组装
    pub fn sqlite(path: impl Into<PathBuf>, config: OptimizerConfig) -> Result<Self> {
        Self::new(config, SqliteSessionFactory::new(path), SqliteBatchExecutor::new)
    }
}
