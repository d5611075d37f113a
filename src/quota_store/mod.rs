//! 配额存储客户端。
//!
//! 对共享计数存储（Valkey/Redis）的窄接口：有序集合（score 为事件时间戳）、
//! hash 计数器、key 过期以及自增计数器。这里不含任何业务逻辑；
//! 每个操作都是一次独立往返，不做本地缓存，也不做重试（重试策略属于调度器）。

pub mod keys;
mod memory;
mod valkey;

pub use memory::InMemoryQuotaStore;
#[cfg(test)]
pub use memory::FailingQuotaStore;
pub use valkey::ValkeyQuotaStore;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Valkey 错误: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("配额存储不可用: {0}")]
    Unavailable(String),
}

/// 共享配额存储需要提供的操作集合。
///
/// 实现必须是 `Send + Sync`，允许多个任务并发调用（只读评估可以并行）。
#[async_trait]
pub trait QuotaStore: Send + Sync + std::fmt::Debug {
    /// 向有序集合写入一个事件标记。`member` 需唯一，否则同一时刻的事件会被合并。
    async fn add_event(&self, key: &str, timestamp_ms: i64, member: &str)
    -> Result<(), StoreError>;

    /// 删除 score 严格小于 `cutoff_ms` 的事件，返回删除数量。
    async fn purge_older_than(&self, key: &str, cutoff_ms: i64) -> Result<u64, StoreError>;

    async fn count(&self, key: &str) -> Result<u64, StoreError>;

    /// 最早一个事件的时间戳；集合为空时返回 None。
    async fn oldest(&self, key: &str) -> Result<Option<i64>, StoreError>;

    async fn increment_counter(
        &self,
        hash_key: &str,
        field: &str,
        delta: i64,
    ) -> Result<i64, StoreError>;

    async fn expire_after(&self, key: &str, seconds: u64) -> Result<(), StoreError>;

    /// 原子自增并返回新值（INCR）。
    async fn increment_and_get(&self, key: &str) -> Result<i64, StoreError>;

    /// 连通性检查。
    async fn ping(&self) -> Result<(), StoreError>;
}
