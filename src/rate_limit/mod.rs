//! 按 key 的多窗口限流。
//!
//! 评估（evaluate）与提交（commit）分离：评估只读（顺带惰性清理过期标记），
//! 只有调度器最终选中某个 key 时才提交，写入一次请求事件。
//! 这样被丢弃的探测不会消耗配额。

use crate::config::WindowMode;
use crate::quota_store::{QuotaStore, StoreError, keys};
use std::sync::Arc;

const MINUTE_MS: i64 = 60_000;
const DAY_MS: i64 = 86_400_000;

/// 限流维度。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitKind {
    Minute,
    Day,
}

impl LimitKind {
    pub const ALL: [LimitKind; 2] = [LimitKind::Minute, LimitKind::Day];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Day => "day",
        }
    }

    pub fn window_ms(self) -> i64 {
        match self {
            Self::Minute => MINUTE_MS,
            Self::Day => DAY_MS,
        }
    }

    /// 集合 key 的兜底过期时间：即使某个 key 被弃用，数据也会自然消失。
    pub fn key_ttl_secs(self) -> u64 {
        match self {
            Self::Minute => 86_400,
            Self::Day => 2 * 86_400,
        }
    }
}

/// 每个上游 key 的配额。0 表示该维度永远拒绝。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaLimits {
    pub per_minute: u32,
    pub per_day: u32,
}

impl QuotaLimits {
    pub fn limit(&self, kind: LimitKind) -> u32 {
        match kind {
            LimitKind::Minute => self.per_minute,
            LimitKind::Day => self.per_day,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Admitted,
    /// 被拒绝；`next_eligible_at_ms` 是窗口最早重新有余量的时刻（epoch 毫秒）。
    Denied { next_eligible_at_ms: i64 },
}

#[derive(Debug, Clone)]
pub struct RateLimiter {
    store: Arc<dyn QuotaStore>,
    limits: QuotaLimits,
    mode: WindowMode,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn QuotaStore>, limits: QuotaLimits, mode: WindowMode) -> Self {
        Self {
            store,
            limits,
            mode,
        }
    }

    /// 早于该时刻的事件不再计入当前窗口。
    fn cutoff(&self, kind: LimitKind, now_ms: i64) -> i64 {
        let window = kind.window_ms();
        match self.mode {
            // 事件年龄达到 window 即过期。
            WindowMode::Sliding => now_ms - window + 1,
            WindowMode::Fixed => bucket_start(now_ms, window),
        }
    }

    fn reopen_at(&self, kind: LimitKind, now_ms: i64, oldest_ms: Option<i64>) -> i64 {
        let window = kind.window_ms();
        match self.mode {
            WindowMode::Sliding => oldest_ms.unwrap_or(now_ms) + window,
            WindowMode::Fixed => bucket_start(now_ms, window) + window,
        }
    }

    /// 判断该 key 现在能否再接纳一个请求。不写入事件。
    pub async fn evaluate(&self, credential: &str, now_ms: i64) -> Result<Decision, StoreError> {
        let mut next_eligible_at: Option<i64> = None;

        for kind in LimitKind::ALL {
            let key = keys::requests(credential, kind);
            self.store
                .purge_older_than(&key, self.cutoff(kind, now_ms))
                .await?;
            let count = self.store.count(&key).await?;
            let limit = u64::from(self.limits.limit(kind));
            if count < limit {
                continue;
            }

            // limit=0 时没有事件可以"老化"出窗口，按一个完整窗口后再探测。
            let oldest = if limit == 0 {
                None
            } else {
                self.store.oldest(&key).await?
            };
            let reopen = self.reopen_at(kind, now_ms, oldest);
            // 所有耗尽的维度都要恢复才能放行，取最晚者。
            next_eligible_at = Some(next_eligible_at.map_or(reopen, |at| at.max(reopen)));
        }

        Ok(match next_eligible_at {
            Some(next_eligible_at_ms) => Decision::Denied {
                next_eligible_at_ms,
            },
            None => Decision::Admitted,
        })
    }

    /// 为选中的 key 记录一次请求：每个维度写一个事件标记并刷新过期时间。
    pub async fn commit(&self, credential: &str, now_ms: i64) -> Result<(), StoreError> {
        let member = format!("{now_ms}-{}", uuid::Uuid::new_v4().simple());
        for kind in LimitKind::ALL {
            let key = keys::requests(credential, kind);
            self.store.add_event(&key, now_ms, &member).await?;
            self.store.expire_after(&key, kind.key_ttl_secs()).await?;
        }
        Ok(())
    }
}

fn bucket_start(now_ms: i64, window_ms: i64) -> i64 {
    now_ms - now_ms.rem_euclid(window_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, TokioClock};
    use crate::quota_store::InMemoryQuotaStore;

    // 2024-01-01T00:00:30Z
    const T0: i64 = 1_704_067_230_000;

    fn limiter(per_minute: u32, per_day: u32, mode: WindowMode) -> (RateLimiter, InMemoryQuotaStore) {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::new(T0));
        let store = InMemoryQuotaStore::new(clock);
        let limiter = RateLimiter::new(
            Arc::new(store.clone()),
            QuotaLimits {
                per_minute,
                per_day,
            },
            mode,
        );
        (limiter, store)
    }

    #[tokio::test]
    async fn denies_after_n_admissions_and_reports_oldest_plus_window() {
        let (rl, _) = limiter(3, 100, WindowMode::Sliding);
        for i in 0..3 {
            let now = T0 + i * 1_000;
            assert_eq!(rl.evaluate("k", now).await.unwrap(), Decision::Admitted);
            rl.commit("k", now).await.unwrap();
        }
        assert_eq!(
            rl.evaluate("k", T0 + 5_000).await.unwrap(),
            Decision::Denied {
                next_eligible_at_ms: T0 + MINUTE_MS
            }
        );
    }

    #[tokio::test]
    async fn sliding_window_reopens_exactly_at_reported_instant() {
        let (rl, _) = limiter(1, 100, WindowMode::Sliding);
        rl.commit("k", T0).await.unwrap();
        assert!(matches!(
            rl.evaluate("k", T0 + MINUTE_MS - 1).await.unwrap(),
            Decision::Denied { .. }
        ));
        assert_eq!(
            rl.evaluate("k", T0 + MINUTE_MS).await.unwrap(),
            Decision::Admitted
        );
    }

    #[tokio::test]
    async fn evaluate_does_not_consume_quota() {
        let (rl, store) = limiter(2, 100, WindowMode::Sliding);
        rl.commit("k", T0).await.unwrap();
        for _ in 0..5 {
            assert_eq!(rl.evaluate("k", T0 + 10).await.unwrap(), Decision::Admitted);
        }
        let key = keys::requests("k", LimitKind::Minute);
        assert_eq!(store.count(&key).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn zero_limit_always_denies() {
        let (rl, _) = limiter(0, 100, WindowMode::Sliding);
        assert_eq!(
            rl.evaluate("k", T0).await.unwrap(),
            Decision::Denied {
                next_eligible_at_ms: T0 + MINUTE_MS
            }
        );
    }

    #[tokio::test]
    async fn fixed_window_reopens_at_bucket_boundary() {
        let (rl, _) = limiter(1, 100, WindowMode::Fixed);
        // T0 位于某分钟的第 30 秒。
        rl.commit("k", T0).await.unwrap();
        let bucket_end = T0 - 30_000 + MINUTE_MS;
        assert_eq!(
            rl.evaluate("k", T0 + 1_000).await.unwrap(),
            Decision::Denied {
                next_eligible_at_ms: bucket_end
            }
        );
        assert_eq!(rl.evaluate("k", bucket_end).await.unwrap(), Decision::Admitted);
    }

    #[tokio::test]
    async fn day_limit_is_the_constraining_kind() {
        let (rl, _) = limiter(10, 2, WindowMode::Sliding);
        rl.commit("k", T0).await.unwrap();
        rl.commit("k", T0 + 120_000).await.unwrap();
        assert_eq!(
            rl.evaluate("k", T0 + 240_000).await.unwrap(),
            Decision::Denied {
                next_eligible_at_ms: T0 + DAY_MS
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn commit_sets_key_expiry() {
        let (rl, store) = limiter(1, 1, WindowMode::Sliding);
        rl.commit("k", T0).await.unwrap();
        let minute = keys::requests("k", LimitKind::Minute);
        let day = keys::requests("k", LimitKind::Day);
        assert_eq!(store.ttl_millis(&minute), Some(86_400_000));
        assert_eq!(store.ttl_millis(&day), Some(2 * 86_400_000));
        assert_eq!(store.events(&minute), vec![T0]);
    }

    #[tokio::test]
    async fn credentials_are_limited_independently() {
        let (rl, _) = limiter(1, 100, WindowMode::Sliding);
        rl.commit("a", T0).await.unwrap();
        assert!(matches!(
            rl.evaluate("a", T0).await.unwrap(),
            Decision::Denied { .. }
        ));
        assert_eq!(rl.evaluate("b", T0).await.unwrap(), Decision::Admitted);
    }
}
