use super::{QuotaStore, StoreError};
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

/// Valkey/Redis 实现。ConnectionManager 内部是多路复用连接，断线自动重连，clone 开销很小。
#[derive(Clone)]
pub struct ValkeyQuotaStore {
    conn: ConnectionManager,
    url_for_log: String,
}

impl std::fmt::Debug for ValkeyQuotaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValkeyQuotaStore")
            .field("url", &self.url_for_log)
            .finish()
    }
}

impl ValkeyQuotaStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            url_for_log: redact_url_password(url),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl QuotaStore for ValkeyQuotaStore {
    async fn add_event(
        &self,
        key: &str,
        timestamp_ms: i64,
        member: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let _: () = conn.zadd(key, member, timestamp_ms).await?;
        Ok(())
    }

    async fn purge_older_than(&self, key: &str, cutoff_ms: i64) -> Result<u64, StoreError> {
        let mut conn = self.conn();
        // "(" 表示开区间：只删除 score < cutoff 的事件。
        let removed: u64 = conn
            .zrembyscore(key, "-inf", format!("({cutoff_ms}"))
            .await?;
        Ok(removed)
    }

    async fn count(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn();
        let n: u64 = conn.zcard(key).await?;
        Ok(n)
    }

    async fn oldest(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let mut conn = self.conn();
        let head: Vec<(String, f64)> = conn.zrange_withscores(key, 0, 0).await?;
        Ok(head.first().map(|(_, score)| *score as i64))
    }

    async fn increment_counter(
        &self,
        hash_key: &str,
        field: &str,
        delta: i64,
    ) -> Result<i64, StoreError> {
        let mut conn = self.conn();
        let v: i64 = conn.hincr(hash_key, field, delta).await?;
        Ok(v)
    }

    async fn expire_after(&self, key: &str, seconds: u64) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let seconds = i64::try_from(seconds).unwrap_or(i64::MAX);
        let _: () = conn.expire(key, seconds).await?;
        Ok(())
    }

    async fn increment_and_get(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn();
        let v: i64 = conn.incr(key, 1).await?;
        Ok(v)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong.eq_ignore_ascii_case("PONG") {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!("PING 返回异常: {pong}")))
        }
    }
}

/// 日志中隐藏连接串里的密码。
fn redact_url_password(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    match rest.rsplit_once('@') {
        Some((_, host)) => format!("{scheme}://***@{host}"),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_is_hidden_in_debug_url() {
        assert_eq!(
            redact_url_password("redis://:secret@cache:6379/0"),
            "redis://***@cache:6379/0"
        );
        assert_eq!(
            redact_url_password("redis://localhost:6379/0"),
            "redis://localhost:6379/0"
        );
    }
}
