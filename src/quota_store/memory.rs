use super::{QuotaStore, StoreError};
use crate::clock::Clock;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

/// 全量过期清理的最小间隔。
const SWEEP_INTERVAL_MS: i64 = 1_000;

/// 进程内实现：语义与 Valkey 实现一致（包括 key 过期），但状态不跨进程共享。
#[derive(Debug, Clone)]
pub struct InMemoryQuotaStore {
    state: Arc<Mutex<State>>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Default)]
struct State {
    sorted: HashMap<String, BTreeSet<(i64, String)>>,
    hashes: HashMap<String, HashMap<String, i64>>,
    counters: HashMap<String, i64>,
    /// key -> 过期时刻（epoch 毫秒）
    expires_at: HashMap<String, i64>,
    next_sweep_ms: i64,
}

impl State {
    fn evict_if_expired(&mut self, key: &str, now_ms: i64) {
        let expired = self.expires_at.get(key).is_some_and(|at| *at <= now_ms);
        if expired {
            self.remove(key);
        }
    }

    /// 清理所有已过期的 key。按分钟分桶的统计 key 写入后不会再被访问，只能靠这里回收。
    fn sweep_expired(&mut self, now_ms: i64) {
        if now_ms < self.next_sweep_ms {
            return;
        }
        self.next_sweep_ms = now_ms.saturating_add(SWEEP_INTERVAL_MS);

        let expired: Vec<String> = self
            .expires_at
            .iter()
            .filter(|(_, at)| **at <= now_ms)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.remove(&key);
        }
    }

    fn remove(&mut self, key: &str) {
        self.expires_at.remove(key);
        self.sorted.remove(key);
        self.hashes.remove(key);
        self.counters.remove(key);
    }

    fn exists(&self, key: &str) -> bool {
        self.sorted.contains_key(key)
            || self.hashes.contains_key(key)
            || self.counters.contains_key(key)
    }
}

impl InMemoryQuotaStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            clock,
        }
    }

    /// 取锁并先清理过期数据：该 key 总是检查，其余 key 按间隔整体扫描。
    /// 锁中毒时沿用内部状态（计数数据没有跨字段不变量）。
    fn lock_key(&self, key: &str) -> MutexGuard<'_, State> {
        let now = self.clock.now_millis();
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        guard.evict_if_expired(key, now);
        guard.sweep_expired(now);
        guard
    }
}

#[cfg(test)]
impl InMemoryQuotaStore {
    pub fn hash(&self, key: &str) -> HashMap<String, i64> {
        self.lock_key(key).hashes.get(key).cloned().unwrap_or_default()
    }

    pub fn ttl_millis(&self, key: &str) -> Option<i64> {
        let now = self.clock.now_millis();
        self.lock_key(key).expires_at.get(key).map(|at| at - now)
    }

    /// 当前驻留的 key 数（不触发清理）。
    pub fn resident_keys(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.sorted.len() + state.hashes.len() + state.counters.len()
    }

    pub fn events(&self, key: &str) -> Vec<i64> {
        self.lock_key(key)
            .sorted
            .get(key)
            .map(|set| set.iter().map(|(ts, _)| *ts).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl QuotaStore for InMemoryQuotaStore {
    async fn add_event(
        &self,
        key: &str,
        timestamp_ms: i64,
        member: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.lock_key(key);
        let set = state.sorted.entry(key.to_string()).or_default();
        // ZADD 语义：同一 member 只保留一份，score 以最新为准。
        set.retain(|(_, m)| m != member);
        set.insert((timestamp_ms, member.to_string()));
        Ok(())
    }

    async fn purge_older_than(&self, key: &str, cutoff_ms: i64) -> Result<u64, StoreError> {
        let mut state = self.lock_key(key);
        let Some(set) = state.sorted.get_mut(key) else {
            return Ok(0);
        };
        let before = set.len();
        set.retain(|(ts, _)| *ts >= cutoff_ms);
        let removed = (before - set.len()) as u64;
        if set.is_empty() {
            state.sorted.remove(key);
            state.expires_at.remove(key);
        }
        Ok(removed)
    }

    async fn count(&self, key: &str) -> Result<u64, StoreError> {
        let state = self.lock_key(key);
        Ok(state.sorted.get(key).map_or(0, |set| set.len() as u64))
    }

    async fn oldest(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let state = self.lock_key(key);
        Ok(state
            .sorted
            .get(key)
            .and_then(|set| set.first())
            .map(|(ts, _)| *ts))
    }

    async fn increment_counter(
        &self,
        hash_key: &str,
        field: &str,
        delta: i64,
    ) -> Result<i64, StoreError> {
        let mut state = self.lock_key(hash_key);
        let fields = state.hashes.entry(hash_key.to_string()).or_default();
        let v = fields.entry(field.to_string()).or_insert(0);
        *v += delta;
        Ok(*v)
    }

    async fn expire_after(&self, key: &str, seconds: u64) -> Result<(), StoreError> {
        let now = self.clock.now_millis();
        let mut state = self.lock_key(key);
        // EXPIRE 对不存在的 key 不生效。
        if state.exists(key) {
            let ttl_ms = i64::try_from(seconds.saturating_mul(1000)).unwrap_or(i64::MAX);
            state
                .expires_at
                .insert(key.to_string(), now.saturating_add(ttl_ms));
        }
        Ok(())
    }

    async fn increment_and_get(&self, key: &str) -> Result<i64, StoreError> {
        let mut state = self.lock_key(key);
        let v = state.counters.entry(key.to_string()).or_insert(0);
        *v += 1;
        Ok(*v)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// 测试替身：对 key 中包含 `failing_marker` 的操作返回错误，其余委托给内存实现。
/// marker 为空字符串时所有操作都失败。
#[cfg(test)]
#[derive(Debug, Clone)]
pub struct FailingQuotaStore {
    inner: InMemoryQuotaStore,
    failing_marker: String,
}

#[cfg(test)]
impl FailingQuotaStore {
    pub fn new(inner: InMemoryQuotaStore, failing_marker: impl Into<String>) -> Self {
        Self {
            inner,
            failing_marker: failing_marker.into(),
        }
    }

    fn check(&self, key: &str) -> Result<(), StoreError> {
        if key.contains(&self.failing_marker) {
            Err(StoreError::Unavailable(format!("injected failure for {key}")))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
#[async_trait]
impl QuotaStore for FailingQuotaStore {
    async fn add_event(
        &self,
        key: &str,
        timestamp_ms: i64,
        member: &str,
    ) -> Result<(), StoreError> {
        self.check(key)?;
        self.inner.add_event(key, timestamp_ms, member).await
    }

    async fn purge_older_than(&self, key: &str, cutoff_ms: i64) -> Result<u64, StoreError> {
        self.check(key)?;
        self.inner.purge_older_than(key, cutoff_ms).await
    }

    async fn count(&self, key: &str) -> Result<u64, StoreError> {
        self.check(key)?;
        self.inner.count(key).await
    }

    async fn oldest(&self, key: &str) -> Result<Option<i64>, StoreError> {
        self.check(key)?;
        self.inner.oldest(key).await
    }

    async fn increment_counter(
        &self,
        hash_key: &str,
        field: &str,
        delta: i64,
    ) -> Result<i64, StoreError> {
        self.check(hash_key)?;
        self.inner.increment_counter(hash_key, field, delta).await
    }

    async fn expire_after(&self, key: &str, seconds: u64) -> Result<(), StoreError> {
        self.check(key)?;
        self.inner.expire_after(key, seconds).await
    }

    async fn increment_and_get(&self, key: &str) -> Result<i64, StoreError> {
        self.check(key)?;
        self.inner.increment_and_get(key).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check("")?;
        self.inner.ping().await
    }
}
