//! 时间来源抽象：限流判定与调度等待都基于毫秒级 epoch 时间。

use chrono::{DateTime, Utc};

/// 墙钟时间来源，测试中可替换为可控时钟。
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// 当前 UTC 时间（epoch 毫秒）。
    fn now_millis(&self) -> i64;

    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.now_millis()).unwrap_or_else(Utc::now)
    }
}

/// 生产环境使用的系统时钟。多进程共享同一个存储时，各进程依赖 NTP 保持时钟一致。
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// 锚定在 tokio 虚拟时间上的时钟：配合 `start_paused` 的测试，
/// `tokio::time::sleep` 推进多少，墙钟就推进多少。
#[cfg(test)]
#[derive(Debug, Clone)]
pub struct TokioClock {
    base_millis: i64,
    start: tokio::time::Instant,
}

#[cfg(test)]
impl TokioClock {
    pub fn new(base_millis: i64) -> Self {
        Self {
            base_millis,
            start: tokio::time::Instant::now(),
        }
    }
}

#[cfg(test)]
impl Clock for TokioClock {
    fn now_millis(&self) -> i64 {
        let elapsed = i64::try_from(self.start.elapsed().as_millis()).unwrap_or(i64::MAX);
        self.base_millis.saturating_add(elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn tokio_clock_follows_virtual_time() {
        let clock = TokioClock::new(1_000);
        assert_eq!(clock.now_millis(), 1_000);
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(clock.now_millis(), 91_000);
        assert_eq!(clock.now_utc().timestamp(), 91);
    }
}
