//! 过期注册的后台清扫任务。
//!
//! # 教案式说明
//! - **意图 (Why)**：查询本身已经排除过期条目，清扫只负责回收存储与命名空间中的残留；
//! - **契约 (What)**：[`spawn_eviction`] 在当前 Tokio 运行时上启动周期任务，首个周期结束后开始清扫；
//!   返回的 [`EvictionHandle`] 被丢弃或显式 [`EvictionHandle::abort`] 时任务停止；
//! - **前置条件**：必须在 Tokio 运行时上下文中调用，否则 `tokio::spawn` 会 panic。

use std::{sync::Arc, time::Duration};

use tokio::{
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};

use crate::applications::directory::DirectoryService;

/// 可被周期清扫的对象。
pub trait ExpirySweep: Send + Sync + 'static {
    /// 执行一次清扫，返回回收的条目数。
    fn sweep(&self) -> usize;
}

impl ExpirySweep for DirectoryService {
    fn sweep(&self) -> usize {
        self.evict_expired().len()
    }
}

/// 清扫任务句柄，析构时终止任务。
#[derive(Debug)]
pub struct EvictionHandle {
    task: JoinHandle<()>,
}

impl EvictionHandle {
    pub fn abort(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for EvictionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// 以 `period` 为周期启动清扫任务。
pub fn spawn_eviction<T: ExpirySweep>(target: Arc<T>, period: Duration) -> EvictionHandle {
    let task = tokio::spawn(async move {
        let mut ticker = time::interval_at(time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let evicted = target.sweep();
            if evicted > 0 {
                tracing::info!(evicted, "expired registrations swept");
            }
        }
    });
    EvictionHandle { task }
}
