//! 用量统计：上游成功响应后，按 key 累加分钟/天两个粒度的 token 与请求数。
//!
//! 仅用于事后统计，不参与准入判定。

use crate::clock::Clock;
use crate::logging::mask_key;
use crate::quota_store::{QuotaStore, StoreError, keys};
use sonic_rs::prelude::*;
use std::sync::Arc;

const MINUTE_STATS_TTL_SECS: u64 = 24 * 60 * 60;
const DAILY_STATS_TTL_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

/// 从 Gemini 响应体中提取 `usageMetadata`。
///
/// - JSON 对象：读取顶层 `usageMetadata`，缺失字段按 0 计
/// - JSON 数组（streamGenerateContent 非 SSE）：取最后一个带 `usageMetadata` 的元素
/// - SSE（`data: {...}` 行）：同上，取最后一个带 `usageMetadata` 的事件
///
/// 响应体无法解析时返回 None（不记录用量）。
pub fn extract_usage(body: &[u8]) -> Option<TokenUsage> {
    if let Ok(v) = sonic_rs::from_slice::<sonic_rs::Value>(body) {
        if let Some(items) = v.as_array() {
            let last = items.iter().filter_map(usage_of).last();
            return Some(last.unwrap_or_default());
        }
        if v.is_object() {
            return Some(usage_of(&v).unwrap_or_default());
        }
        return None;
    }

    let text = std::str::from_utf8(body).ok()?;
    let mut parsed_any = false;
    let mut last = None;
    for line in text.lines() {
        let Some(data) = line.trim().strip_prefix("data:") else {
            continue;
        };
        let Ok(v) = sonic_rs::from_str::<sonic_rs::Value>(data.trim()) else {
            continue;
        };
        parsed_any = true;
        if let Some(u) = usage_of(&v) {
            last = Some(u);
        }
    }
    parsed_any.then(|| last.unwrap_or_default())
}

fn usage_of(v: &sonic_rs::Value) -> Option<TokenUsage> {
    let meta = v.get("usageMetadata")?;
    let count = |field: &str| meta.get(field).and_then(|n| n.as_u64()).unwrap_or(0);
    Some(TokenUsage {
        prompt_tokens: count("promptTokenCount"),
        completion_tokens: count("candidatesTokenCount"),
    })
}

#[derive(Debug, Clone)]
pub struct UsageRecorder {
    store: Arc<dyn QuotaStore>,
    clock: Arc<dyn Clock>,
}

impl UsageRecorder {
    pub fn new(store: Arc<dyn QuotaStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// 累加一次成功调用的用量。各计数器独立自增，并发调用不会丢失更新。
    pub async fn record(&self, credential: &str, usage: TokenUsage) -> Result<(), StoreError> {
        let at = self.clock.now_utc();
        let prompt = to_delta(usage.prompt_tokens);
        let completion = to_delta(usage.completion_tokens);
        let total = to_delta(usage.total());

        let minute = keys::stats_minute(credential, at);
        for (field, delta) in [
            ("prompt_tokens", prompt),
            ("completion_tokens", completion),
            ("total_tokens", total),
            ("total_requests", 1),
        ] {
            self.store.increment_counter(&minute, field, delta).await?;
        }
        self.store
            .expire_after(&minute, MINUTE_STATS_TTL_SECS)
            .await?;

        let daily = keys::stats_daily(credential, at);
        for (field, delta) in [
            ("total_requests", 1),
            ("total_prompt_tokens", prompt),
            ("total_completion_tokens", completion),
            ("total_tokens", total),
        ] {
            self.store.increment_counter(&daily, field, delta).await?;
        }
        self.store.expire_after(&daily, DAILY_STATS_TTL_SECS).await?;

        Ok(())
    }

    /// 在后台记录用量，不阻塞响应；失败只记日志。
    pub fn spawn_record(&self, credential: String, usage: TokenUsage) {
        let recorder = self.clone();
        tokio::spawn(async move {
            match recorder.record(&credential, usage).await {
                Ok(()) => tracing::debug!(
                    credential = %mask_key(&credential),
                    prompt_tokens = usage.prompt_tokens,
                    completion_tokens = usage.completion_tokens,
                    "用量已记录"
                ),
                Err(e) => tracing::warn!(
                    credential = %mask_key(&credential),
                    error = %e,
                    "记录用量失败"
                ),
            }
        });
    }
}

fn to_delta(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}
