//! 会话抽象
//!
//! 连接池只依赖这两个 trait，不关心底层是哪种数据库。

use async_trait::async_trait;

use crate::error::Result;

/// 可被池化的数据库会话
#[async_trait]
pub trait Session: Send + 'static {
    /// 轻量级存活探测（一次往返）
    async fn ping(&mut self) -> Result<()>;

    /// 是否存在未结束的事务
    fn in_transaction(&self) -> bool;

    /// 提交当前事务
    ///
    /// 无事务时应为空操作。
    async fn commit(&mut self) -> Result<()>;

    /// 回滚当前事务
    ///
    /// 无事务时应为空操作。
    async fn rollback(&mut self) -> Result<()>;

    /// 释放底层资源
    async fn close(&mut self) {}
}

/// 会话工厂
#[async_trait]
pub trait SessionFactory: Send + Sync + 'static {
    type Session: Session;

    /// 创建一个新会话
    async fn create(&self) -> Result<Self::Session>;
}

/// 按结果结束会话中仍活动的事务
///
/// 成功则提交，失败则回滚，只会调用其中一个；事务已经结束时什么也不做。
pub async fn finish_transaction<S: Session + ?Sized>(session: &mut S, success: bool) -> Result<()> {
    if !session.in_transaction() {
        return Ok(());
    }
    if success {
        session.commit().await
    } else {
        session.rollback().await
    }
}
