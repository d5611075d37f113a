//! 存储 key 命名。命名属于对外约定（运维直接在 Valkey 中查看这些 key），不要随意修改。

use crate::rate_limit::LimitKind;
use chrono::{DateTime, Utc};

pub const ROUND_ROBIN_INDEX: &str = "proxy:round_robin_index";

/// `proxy:<credential>:requests:minute` / `proxy:<credential>:requests:day`
pub fn requests(credential: &str, kind: LimitKind) -> String {
    format!("proxy:{credential}:requests:{}", kind.as_str())
}

/// `proxy:<credential>:stats:minute:<YYYY-MM-DDThh:mm>`
pub fn stats_minute(credential: &str, at: DateTime<Utc>) -> String {
    format!("proxy:{credential}:stats:minute:{}", at.format("%Y-%m-%dT%H:%M"))
}

/// `proxy:<credential>:stats:daily:<YYYY-MM-DD>`
pub fn stats_daily(credential: &str, at: DateTime<Utc>) -> String {
    format!("proxy:{credential}:stats:daily:{}", at.format("%Y-%m-%d"))
}
