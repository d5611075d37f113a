//! 准入调度：决定每个入站请求使用哪个上游 key，以及没有可用 key 时如何等待。

mod dispatcher;
mod selector;

pub use dispatcher::{AdmissionHandle, spawn_dispatcher};
pub use selector::CredentialSelector;

use crate::quota_store::StoreError;
use std::time::Duration;
use thiserror::Error;

/// 准入失败的终态。取消（调用方离开）没有对应的错误：调用方已经不在了。
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("配额存储不可用，无法分配上游 key: {0}")]
    Failed(#[source] StoreError),

    #[error("等待可用上游 key 超时（{}s）", .0.as_secs())]
    TimedOut(Duration),

    #[error("准入调度器已停止")]
    Closed,
}
