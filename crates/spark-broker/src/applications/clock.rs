//! 目录服务使用的可注入单调时钟。
//!
//! - **意图 (Why)**：注册寿命与过期判断依赖“当前时间”，测试需要在不睡眠的前提下推进时间轴；
//! - **契约 (What)**：[`Clock::now`] 返回单调时间点；[`SystemClock`] 读取宿主时钟，
//!   [`ManualClock`] 只在显式 [`ManualClock::advance`] 后前进。

use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

/// 单调时钟契约。
pub trait Clock: Send + Sync + fmt::Debug + 'static {
    fn now(&self) -> Instant;
}

/// 宿主单调时钟。
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// 手动推进的虚拟时钟。
///
/// # 教案式说明
/// - **契约 (What)**：`now = origin + elapsed`，`elapsed` 只由 `advance` 累加；
///   克隆体共享同一条时间轴，便于测试把一份交给目录服务、另一份留在手里推进。
#[derive(Clone, Debug)]
pub struct ManualClock {
    origin: Instant,
    elapsed: Arc<Mutex<Duration>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self::with_start(Instant::now())
    }

    pub fn with_start(origin: Instant) -> Self {
        Self {
            origin,
            elapsed: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// 推进虚拟时间。
    pub fn advance(&self, delta: Duration) {
        let mut elapsed = self.elapsed.lock();
        *elapsed = elapsed.saturating_add(delta);
    }

    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_clones_share_timeline() {
        let clock = ManualClock::new();
        let shared = clock.clone();
        let before = shared.now();
        clock.advance(Duration::from_secs(3));
        assert_eq!(shared.now() - before, Duration::from_secs(3));
        assert_eq!(shared.elapsed(), Duration::from_secs(3));
    }
}
