//! 批处理操作
//!
//! 调用方构造 [`OperationRequest`]，调度器把它包装为 [`PendingOperation`]
//! 并返回 [`OperationHandle`]。`PendingOperation` 持有结果发送端，被丢弃时
//! 若尚未发送结果则以 `Cancelled` 结束，因此每个 handle 恰好收到一次结果。

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{AccelError, Result};

/// 操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Read,
    Insert,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Read => "read",
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }

    /// 是否修改数据
    pub fn is_write(&self) -> bool {
        !matches!(self, OperationKind::Read)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 操作优先级
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    /// 从高到低
    pub const DESCENDING: [Priority; 4] = [Priority::Urgent, Priority::High, Priority::Normal, Priority::Low];

    /// 队列下标
    pub fn index(self) -> usize {
        self as usize
    }
}

/// 匹配条件，键有序，便于生成稳定的去重键
pub type Conditions = BTreeMap<String, Value>;

/// 调用方提交的操作
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRequest {
    pub kind: OperationKind,
    /// 目标类型（通常是表名）
    pub target: String,
    pub conditions: Conditions,
    pub payload: Value,
    pub priority: Priority,
    pub deadline: Option<Instant>,
}

impl OperationRequest {
    pub fn new(kind: OperationKind, target: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            conditions: Conditions::new(),
            payload: Value::Null,
            priority: Priority::default(),
            deadline: None,
        }
    }

    pub fn read(target: impl Into<String>) -> Self {
        Self::new(OperationKind::Read, target)
    }

    pub fn insert(target: impl Into<String>) -> Self {
        Self::new(OperationKind::Insert, target)
    }

    pub fn update(target: impl Into<String>) -> Self {
        Self::new(OperationKind::Update, target)
    }

    pub fn delete(target: impl Into<String>) -> Self {
        Self::new(OperationKind::Delete, target)
    }

    /// 添加一个匹配条件
    pub fn with_condition(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.insert(column.into(), value.into());
        self
    }

    pub fn with_conditions(mut self, conditions: Conditions) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// 从现在起 `timeout` 后过期
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// 截止时间是否已过
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    /// 条件集合的稳定表示
    pub fn condition_key(&self) -> String {
        serde_json::to_string(&self.conditions).unwrap_or_default()
    }

    /// 读结果去重键：`(kind, target, sorted(conditions))`
    pub fn dedup_key(&self) -> String {
        format!("{}:{}:{}", self.kind, self.target, self.condition_key())
    }
}

/// 已入队、等待结果的操作
#[derive(Debug)]
pub struct PendingOperation {
    pub request: OperationRequest,
    pub enqueued_at: Instant,
    responder: Option<oneshot::Sender<Result<Value>>>,
}

impl PendingOperation {
    /// 创建操作及其结果 handle
    pub fn new(request: OperationRequest) -> (Self, OperationHandle) {
        let (tx, rx) = oneshot::channel();
        let pending = Self {
            request,
            enqueued_at: Instant::now(),
            responder: Some(tx),
        };
        (pending, OperationHandle { rx })
    }

    /// 发送结果；返回调用方是否仍在等待
    pub fn resolve(mut self, result: Result<Value>) -> bool {
        match self.responder.take() {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }
}

impl Drop for PendingOperation {
    fn drop(&mut self) {
        if let Some(tx) = self.responder.take() {
            let _ = tx.send(Err(AccelError::cancelled(format!(
                "{} on '{}' dropped before execution",
                self.request.kind, self.request.target
            ))));
        }
    }
}

/// 操作结果
///
/// 作为 `Future` 等待；恰好完成一次。
#[derive(Debug)]
pub struct OperationHandle {
    rx: oneshot::Receiver<Result<Value>>,
}

impl OperationHandle {
    /// 已经完成的 handle
    pub fn ready(result: Result<Value>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }
}

impl Future for OperationHandle {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| match received {
            Ok(result) => result,
            Err(_) => Err(AccelError::cancelled("operation responder dropped")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn test_dedup_key_is_order_independent() {
        let a = OperationRequest::read("users")
            .with_condition("name", "alice")
            .with_condition("age", 30);
        let b = OperationRequest::read("users")
            .with_condition("age", 30)
            .with_condition("name", "alice");

        assert_eq!(a.dedup_key(), b.dedup_key());
        assert_eq!(a.dedup_key(), r#"read:users:{"age":30,"name":"alice"}"#);
        assert_ne!(a.dedup_key(), OperationRequest::read("orders").dedup_key());
    }

    #[test]
    fn test_priority_order() {
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
        assert_eq!(Priority::DESCENDING[0], Priority::Urgent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline() {
        let request = OperationRequest::insert("logs").with_timeout(Duration::from_secs(1));
        assert!(!request.is_expired(Instant::now()));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(request.is_expired(Instant::now()));
        assert!(!OperationRequest::insert("logs").is_expired(Instant::now()));
    }

    #[tokio::test]
    async fn test_handle_resolves_once() {
        let (pending, handle) = PendingOperation::new(OperationRequest::insert("logs"));
        let mut handle = task::spawn(handle);
        assert_pending!(handle.poll());

        assert!(pending.resolve(Ok(json!({"id": 1}))));
        let result = assert_ready!(handle.poll());
        assert_eq!(result.unwrap(), json!({"id": 1}));
    }

    #[tokio::test]
    async fn test_dropped_operation_resolves_cancelled() {
        let (pending, handle) = PendingOperation::new(OperationRequest::delete("logs"));
        drop(pending);
        assert!(matches!(handle.await, Err(AccelError::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_ready_handle() {
        let handle = OperationHandle::ready(Ok(json!(42)));
        assert_eq!(handle.await.unwrap(), json!(42));
    }
}
