//! # Background Worker
//!
//! 后台周期任务（缓存清理、连接池清理、批处理刷新）的统一封装。
//!
//! 取消语义：取消信号只在两个周期之间被观察，正在执行的周期总会
//! 执行完毕，因此被清理的数据结构不会停在中间状态。

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 可取消的后台任务
#[derive(Debug)]
pub struct BackgroundWorker {
    name: String,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl BackgroundWorker {
    /// 启动一个自带循环的后台任务
    ///
    /// `body` 获得取消令牌，由它自行决定在哪些挂起点检查取消。
    pub fn spawn<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let token = CancellationToken::new();
        let handle = tokio::spawn(body(token.clone()));
        debug!("Background worker '{}' spawned", name);
        Self { name, token, handle }
    }

    /// 启动固定间隔的周期任务
    ///
    /// 每个间隔调用一次 `tick`；`tick` 返回 `false` 时任务自行退出
    /// （例如所属组件已经被释放）。第一次调用发生在一个完整间隔之后。
    pub fn spawn_periodic<F, Fut>(name: impl Into<String>, interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let name = name.into();
        let task_name = name.clone();
        Self::spawn(name, move |token| async move {
            info!("{} started (interval: {:?})", task_name, interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        if !tick().await {
                            debug!("{} owner dropped, exiting", task_name);
                            break;
                        }
                    }
                }
            }
            info!("{} stopped", task_name);
        })
    }

    /// 任务名称
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 任务是否已经结束
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// 请求取消但不等待
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// 取消并等待当前周期结束
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            if !e.is_cancelled() {
                warn!("Background worker '{}' terminated abnormally: {}", self.name, e);
            }
        }
    }

    /// 强制终止，不等待当前周期
    pub fn abort(self) {
        self.token.cancel();
        self.handle.abort();
    }
}
