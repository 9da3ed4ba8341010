//! # Adaptive Batch Scheduler
//!
//! 把同类数据库操作攒成批次执行。
//!
//! ## 流程
//!
//! 1. `enqueue`：读操作先查短 TTL 的去重缓存，命中直接返回；否则按优先级入队。
//!    调度器未运行或队列已满时同步执行，不丢弃任何操作。
//! 2. 每个周期从高到低优先级取出至多 `current_batch_size` 个操作。
//! 3. 截止时间已过的操作以 `Timeout` 结束，不执行。
//! 4. 其余按 `(kind, target)` 分组，每组调用一次 [`BatchExecutor::execute_group`]。
//!    读操作组内相同条件只查询一次，结果分发给每个等待者。组执行失败时组内
//!    每个操作收到相同的错误。
//!    写操作成功后递增 target 的写代数并清除该 target 的缓存读；读结果只有在
//!    执行期间写代数未变时才写入去重缓存。
//! 5. 周期结束后调整批次大小与等待间隔。
//!
//! ## 自适应
//!
//! - `congestion = queued / max_queue_size`（取出前的队列长度）
//! - `congestion > 0.7`：批次 ×1.2（上限 `max_batch_size`）
//! - `congestion < 0.3`：批次 ×0.9（下限 `min_batch_size`）
//! - 周期耗时 > 2×等待间隔：间隔 ×1.1（上限 `max_wait_time`）
//! - 周期耗时 < 0.5×等待间隔：间隔 ×0.9（下限 `base_wait_time`）

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::config::BatchConfig;
use super::operation::{OperationHandle, OperationKind, OperationRequest, PendingOperation, Priority};
use crate::cache::BoundedTtlMap;
use crate::error::{AccelError, Result};
use crate::lock_timeout::{AsyncMutex, LockStats, DEFAULT_LOCK_TIMEOUT, SHORT_LOCK_TIMEOUT};
use crate::worker::BackgroundWorker;

/// 批量执行原语
#[async_trait]
pub trait BatchExecutor: Send + Sync + 'static {
    /// 执行一组同类操作
    ///
    /// 返回值必须与 `operations` 等长、按下标一一对应。返回错误表示整组失败。
    async fn execute_group(
        &self,
        kind: OperationKind,
        target: &str,
        operations: &[OperationRequest],
    ) -> Result<Vec<Value>>;
}

/// 按操作类型的计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct OperationCounters {
    pub read: u64,
    pub insert: u64,
    pub update: u64,
    pub delete: u64,
}

impl OperationCounters {
    fn record(&mut self, kind: OperationKind, count: u64) {
        match kind {
            OperationKind::Read => self.read += count,
            OperationKind::Insert => self.insert += count,
            OperationKind::Update => self.update += count,
            OperationKind::Delete => self.delete += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.read + self.insert + self.update + self.delete
    }
}

/// 调度器统计
#[derive(Debug, Clone, Serialize)]
pub struct BatchStats {
    /// 提交的操作总数（含去重命中与同步执行）
    pub total_operations: u64,
    /// 经批次周期执行的操作数
    pub batched_operations: u64,
    /// 同步执行的操作数
    pub sync_executions: u64,
    /// 读去重缓存命中
    pub cache_hits: u64,
    pub timed_out: u64,
    pub failed: u64,
    /// 实际执行的操作，按类型
    pub executed: OperationCounters,
    /// 当前排队数（锁超时则为 None）
    pub queued: Option<usize>,
    pub congestion_score: f64,
    pub current_batch_size: usize,
    pub current_wait_time: Duration,
    pub total_execution_time: Duration,
    pub last_batch_size: usize,
    pub last_batch_duration: Duration,
    pub flush_count: u64,
    pub last_flush_at: Option<DateTime<Utc>>,
    pub running: bool,
    /// 队列锁
    pub queue_lock: LockStats,
}

/// 一个周期的结果
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FlushReport {
    /// 从队列取出的操作数
    pub drained: usize,
    /// 成功执行的操作数
    pub executed: usize,
    pub timed_out: usize,
    pub failed: usize,
    /// 执行的分组数
    pub groups: usize,
    pub duration: Duration,
}

impl FlushReport {
    fn merge(&mut self, other: &FlushReport) {
        self.drained += other.drained;
        self.executed += other.executed;
        self.timed_out += other.timed_out;
        self.failed += other.failed;
        self.groups += other.groups;
        self.duration += other.duration;
    }
}

/// 四个优先级队列
#[derive(Default)]
struct PriorityQueues {
    buckets: [VecDeque<PendingOperation>; 4],
}

impl PriorityQueues {
    fn len(&self) -> usize {
        self.buckets.iter().map(VecDeque::len).sum()
    }

    fn push(&mut self, op: PendingOperation) {
        self.buckets[op.request.priority.index()].push_back(op);
    }

    /// 从高到低优先级取出至多 `limit` 个
    fn drain(&mut self, limit: usize) -> Vec<PendingOperation> {
        let mut batch = Vec::with_capacity(limit.min(self.len()));
        for priority in Priority::DESCENDING {
            let bucket = &mut self.buckets[priority.index()];
            while batch.len() < limit {
                match bucket.pop_front() {
                    Some(op) => batch.push(op),
                    None => break,
                }
            }
        }
        batch
    }

    fn drain_all(&mut self) -> Vec<PendingOperation> {
        self.buckets.iter_mut().flat_map(|bucket| bucket.drain(..)).collect()
    }
}

#[derive(Debug, Default)]
struct StatsState {
    total_operations: u64,
    batched_operations: u64,
    sync_executions: u64,
    cache_hits: u64,
    timed_out: u64,
    failed: u64,
    executed: OperationCounters,
    congestion_score: f64,
    total_execution_time: Duration,
    last_batch_size: usize,
    last_batch_duration: Duration,
    flush_count: u64,
    last_flush_at: Option<DateTime<Utc>>,
}

/// 自适应批处理调度器
pub struct AdaptiveBatchScheduler {
    config: BatchConfig,
    executor: Arc<dyn BatchExecutor>,
    queues: AsyncMutex<PriorityQueues>,
    read_cache: BoundedTtlMap<String, Value>,
    /// 每个 target 成功执行的写组数
    write_generations: parking_lot::Mutex<HashMap<String, u64>>,
    running: AtomicBool,
    current_batch_size: AtomicUsize,
    current_wait_nanos: AtomicU64,
    /// 串行化批次周期（后台循环与手动 flush）
    cycle: Mutex<()>,
    stats: parking_lot::Mutex<StatsState>,
    worker: Mutex<Option<BackgroundWorker>>,
}

impl AdaptiveBatchScheduler {
    pub fn new<E: BatchExecutor>(config: BatchConfig, executor: E) -> Result<Self> {
        Self::with_executor(config, Arc::new(executor))
    }

    /// 配置无效时返回 `Configuration`
    pub fn with_executor(config: BatchConfig, executor: Arc<dyn BatchExecutor>) -> Result<Self> {
        config.validate().map_err(AccelError::configuration)?;

        Ok(Self {
            read_cache: BoundedTtlMap::new("batch_read_cache", config.read_cache_size, config.read_cache_ttl),
            write_generations: parking_lot::Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            current_batch_size: AtomicUsize::new(config.min_batch_size),
            current_wait_nanos: AtomicU64::new(config.base_wait_time.as_nanos() as u64),
            queues: AsyncMutex::with_name(PriorityQueues::default(), DEFAULT_LOCK_TIMEOUT, "batch_queues"),
            cycle: Mutex::new(()),
            stats: parking_lot::Mutex::new(StatsState::default()),
            worker: Mutex::new(None),
            executor,
            config,
        })
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn current_batch_size(&self) -> usize {
        self.current_batch_size.load(Ordering::Relaxed)
    }

    pub fn current_wait_time(&self) -> Duration {
        Duration::from_nanos(self.current_wait_nanos.load(Ordering::Relaxed))
    }

    /// 提交操作
    ///
    /// 去重命中、同步执行时返回的 handle 在本方法返回前已经完成。
    pub async fn enqueue(&self, request: OperationRequest) -> OperationHandle {
        self.stats.lock().total_operations += 1;

        if request.kind == OperationKind::Read {
            if let Some(value) = self.read_cache.get(&request.dedup_key()).await {
                self.stats.lock().cache_hits += 1;
                return OperationHandle::ready(Ok(value));
            }
        }

        let (pending, handle) = PendingOperation::new(request);

        let rejected = match self.queues.lock_with_timeout().await {
            Ok(mut queues) => {
                if !self.is_running() {
                    Some(pending)
                } else if queues.len() >= self.config.max_queue_size {
                    debug!(
                        "Batch queue full ({}), executing {} on '{}' synchronously",
                        self.config.max_queue_size, pending.request.kind, pending.request.target
                    );
                    Some(pending)
                } else {
                    queues.push(pending);
                    None
                }
            }
            Err(e) => {
                warn!("Batch queue unavailable ({}), executing synchronously", e);
                Some(pending)
            }
        };

        if let Some(pending) = rejected {
            self.stats.lock().sync_executions += 1;
            self.execute_batch(vec![pending]).await;
        }

        handle
    }

    /// 执行一个批次周期
    pub async fn flush(&self) -> Result<FlushReport> {
        let _cycle = self.cycle.lock().await;
        let started = Instant::now();

        let (batch, queued) = {
            let mut queues = self.queues.lock_with_timeout().await?;
            let queued = queues.len();
            (queues.drain(self.current_batch_size()), queued)
        };

        let drained = batch.len();
        let mut report = self.execute_batch(batch).await;
        report.drained = drained;
        report.duration = started.elapsed();

        let congestion = (queued as f64 / self.config.max_queue_size as f64).min(1.0);
        self.adapt(congestion, report.duration);

        {
            let mut stats = self.stats.lock();
            stats.batched_operations += drained as u64;
            stats.congestion_score = congestion;
            stats.total_execution_time += report.duration;
            stats.last_batch_size = drained;
            stats.last_batch_duration = report.duration;
            stats.flush_count += 1;
            stats.last_flush_at = Some(Utc::now());
        }

        if drained > 0 {
            debug!(
                "Flushed {} operations in {} groups ({:?}), congestion {:.2}",
                drained, report.groups, report.duration, congestion
            );
        }
        Ok(report)
    }

    /// 调整批次大小与等待间隔
    fn adapt(&self, congestion: f64, duration: Duration) {
        let min = self.config.min_batch_size;
        let max = self.config.max_batch_size;
        let size = self.current_batch_size();

        let next_size = if congestion > 0.7 {
            (size as f64 * 1.2).ceil() as usize
        } else if congestion < 0.3 {
            (size as f64 * 0.9).floor() as usize
        } else {
            size
        };
        self.current_batch_size
            .store(next_size.clamp(min, max), Ordering::Relaxed);

        let wait = self.current_wait_time();
        let next_wait = if duration > wait * 2 {
            wait.mul_f64(1.1)
        } else if duration < wait / 2 {
            wait.mul_f64(0.9)
        } else {
            wait
        };
        let next_wait = next_wait.clamp(self.config.base_wait_time, self.config.max_wait_time);
        self.current_wait_nanos
            .store(next_wait.as_nanos() as u64, Ordering::Relaxed);
    }

    /// 过滤超时操作，分组执行
    async fn execute_batch(&self, batch: Vec<PendingOperation>) -> FlushReport {
        let mut report = FlushReport::default();
        let now = Instant::now();

        let mut groups: BTreeMap<(OperationKind, String), Vec<PendingOperation>> = BTreeMap::new();
        for op in batch {
            if op.request.is_expired(now) {
                let waited = now.saturating_duration_since(op.enqueued_at);
                let message = format!(
                    "{} on '{}' passed its deadline after {:?} in queue",
                    op.request.kind, op.request.target, waited
                );
                op.resolve(Err(AccelError::timeout(message)));
                report.timed_out += 1;
                continue;
            }
            groups
                .entry((op.request.kind, op.request.target.clone()))
                .or_default()
                .push(op);
        }

        for ((kind, target), ops) in groups {
            let count = ops.len();
            report.groups += 1;
            if self.execute_group(kind, &target, ops).await {
                report.executed += count;
            } else {
                report.failed += count;
            }
        }

        let mut stats = self.stats.lock();
        stats.timed_out += report.timed_out as u64;
        stats.failed += report.failed as u64;
        report
    }

    /// 执行一组操作并分发结果，返回是否成功
    async fn execute_group(&self, kind: OperationKind, target: &str, ops: Vec<PendingOperation>) -> bool {
        // 读操作按条件去重
        let mut requests: Vec<OperationRequest> = Vec::new();
        let mut slots: Vec<usize> = Vec::with_capacity(ops.len());
        if kind == OperationKind::Read {
            let mut seen: HashMap<String, usize> = HashMap::new();
            for op in &ops {
                let key = op.request.condition_key();
                let slot = *seen.entry(key).or_insert_with(|| {
                    requests.push(op.request.clone());
                    requests.len() - 1
                });
                slots.push(slot);
            }
        } else {
            requests.extend(ops.iter().map(|op| op.request.clone()));
            slots.extend(0..ops.len());
        }

        let generation = self.write_generation(target);
        let outcome = match self.executor.execute_group(kind, target, &requests).await {
            Ok(values) if values.len() == requests.len() => Ok(values),
            Ok(values) => Err(format!(
                "executor returned {} results for {} operations",
                values.len(),
                requests.len()
            )),
            Err(e) => Err(e.to_string()),
        };

        match outcome {
            Ok(values) => {
                self.stats.lock().executed.record(kind, requests.len() as u64);

                if kind.is_write() {
                    *self.write_generations.lock().entry(target.to_string()).or_insert(0) += 1;
                    let prefix = format!("{}:{}:", OperationKind::Read, target);
                    let invalidated = self.read_cache.remove_where(|key| key.starts_with(&prefix)).await;
                    if invalidated > 0 {
                        debug!("Invalidated {} cached reads of '{}'", invalidated, target);
                    }
                } else if self.write_generation(target) == generation {
                    for (request, value) in requests.iter().zip(&values) {
                        self.read_cache.set(request.dedup_key(), value.clone(), None).await;
                    }
                    // 写组可能在上面的 set 期间完成
                    if self.write_generation(target) != generation {
                        for request in &requests {
                            self.read_cache.delete(&request.dedup_key()).await;
                        }
                    }
                } else {
                    debug!("'{}' was written during a read group, results not cached", target);
                }

                for (op, slot) in ops.into_iter().zip(slots) {
                    op.resolve(Ok(values[slot].clone()));
                }
                true
            }
            Err(message) => {
                warn!("{} group on '{}' failed ({} operations): {}", kind, target, ops.len(), message);
                for op in ops {
                    op.resolve(Err(AccelError::execution(format!(
                        "{} on '{}' failed: {}",
                        kind, target, message
                    ))));
                }
                false
            }
        }
    }

    fn write_generation(&self, target: &str) -> u64 {
        self.write_generations.lock().get(target).copied().unwrap_or(0)
    }

    /// 启动后台批处理循环
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut slot = self.worker.lock().await;
        if slot.is_some() {
            return Err(AccelError::already_running("batch scheduler"));
        }

        self.running.store(true, Ordering::Release);
        let weak: Weak<Self> = Arc::downgrade(self);
        *slot = Some(BackgroundWorker::spawn("batch scheduler", move |token| async move {
            info!("Batch scheduler started");
            loop {
                let wait = match weak.upgrade() {
                    Some(scheduler) => scheduler.current_wait_time(),
                    None => break,
                };
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
                let Some(scheduler) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = scheduler.flush().await {
                    warn!("Batch flush failed: {}", e);
                }
            }
            info!("Batch scheduler loop exited");
        }));
        Ok(())
    }

    /// 停止调度器，执行完所有排队的操作后返回
    pub async fn stop(&self) -> Result<FlushReport> {
        self.mark_stopped().await;

        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            worker.shutdown().await;
        }

        let mut total = FlushReport::default();
        loop {
            let report = self.flush().await?;
            total.merge(&report);
            if report.drained == 0 {
                break;
            }
        }
        info!("Batch scheduler stopped, drained {} operations", total.drained);
        Ok(total)
    }

    /// 强制停止
    ///
    /// 不执行排队的操作，全部以 `Cancelled` 结束；进行中的周期被中断，
    /// 其中尚未完成的操作同样以 `Cancelled` 结束。
    pub async fn abort(&self) -> usize {
        self.mark_stopped().await;

        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            worker.abort();
        }

        let pending = match self.queues.lock_with_timeout().await {
            Ok(mut queues) => queues.drain_all(),
            Err(e) => {
                warn!("Batch queue unavailable during abort: {}", e);
                Vec::new()
            }
        };

        let count = pending.len();
        for op in pending {
            op.resolve(Err(AccelError::cancelled("batch scheduler aborted")));
        }
        warn!("Batch scheduler aborted, cancelled {} queued operations", count);
        count
    }

    /// 在队列锁内清除运行标志，之后的入队全部同步执行
    async fn mark_stopped(&self) {
        match self.queues.lock_with_timeout().await {
            Ok(_queues) => self.running.store(false, Ordering::Release),
            Err(e) => {
                warn!("Stopping batch scheduler without queue lock: {}", e);
                self.running.store(false, Ordering::Release);
            }
        }
    }

    /// 统计快照
    pub async fn stats(&self) -> BatchStats {
        let queued = match self.queues.lock_with_custom_timeout(SHORT_LOCK_TIMEOUT).await {
            Ok(queues) => Some(queues.len()),
            Err(e) => {
                warn!("Batch stats without queue length: {}", e);
                None
            }
        };

        let stats = self.stats.lock();
        BatchStats {
            total_operations: stats.total_operations,
            batched_operations: stats.batched_operations,
            sync_executions: stats.sync_executions,
            cache_hits: stats.cache_hits,
            timed_out: stats.timed_out,
            failed: stats.failed,
            executed: stats.executed,
            queued,
            congestion_score: stats.congestion_score,
            current_batch_size: self.current_batch_size(),
            current_wait_time: self.current_wait_time(),
            total_execution_time: stats.total_execution_time,
            last_batch_size: stats.last_batch_size,
            last_batch_duration: stats.last_batch_duration,
            flush_count: stats.flush_count,
            last_flush_at: stats.last_flush_at,
            running: self.is_running(),
            queue_lock: self.queues.stats(),
        }
    }
}

impl Drop for AdaptiveBatchScheduler {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.cancel();
        }
    }
}
