//! 凭据选择：配额扫描模式下给出探测顺序；轮询模式下用共享计数器直接取 key。

use crate::config::SelectionMode;
use crate::quota_store::{QuotaStore, StoreError, keys};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug)]
pub struct CredentialSelector {
    pool: Arc<[String]>,
    mode: SelectionMode,
    store: Arc<dyn QuotaStore>,
    /// 配额扫描的起始下标，每个调度周期前进一位，避免总是先消耗低下标的 key。
    rotation: AtomicUsize,
}

impl CredentialSelector {
    /// `pool` 必须非空（由配置加载保证）。
    pub fn new(pool: Arc<[String]>, mode: SelectionMode, store: Arc<dyn QuotaStore>) -> Self {
        Self {
            pool,
            mode,
            store,
            rotation: AtomicUsize::new(0),
        }
    }

    pub fn mode(&self) -> SelectionMode {
        self.mode
    }

    pub fn pool_size(&self) -> usize {
        self.pool.len()
    }

    /// 本周期的探测顺序：整个池按起始下标旋转。
    pub fn probe_order(&self) -> impl Iterator<Item = &str> + '_ {
        let len = self.pool.len().max(1);
        let start = self.rotation.fetch_add(1, Ordering::Relaxed) % len;
        self.pool[start..]
            .iter()
            .chain(self.pool[..start].iter())
            .map(String::as_str)
    }

    /// 轮询模式：`pool[counter % len]`，计数器存放在共享存储中，跨进程、跨重启保持连续。
    pub async fn next_round_robin(&self) -> Result<String, StoreError> {
        if self.pool.is_empty() {
            return Err(StoreError::Unavailable("凭据池为空".to_string()));
        }
        let counter = self.store.increment_and_get(keys::ROUND_ROBIN_INDEX).await?;
        let len = i64::try_from(self.pool.len()).unwrap_or(i64::MAX);
        let idx = usize::try_from(counter.rem_euclid(len)).unwrap_or(0);
        Ok(self.pool[idx].clone())
    }
}
