use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use std::time::Duration;

use crate::ports::{LockStore, RepositoryResult};

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

/// `SET key token NX PX ttl` to acquire and a Lua compare-and-delete to
/// release, so a check-then-delete race cannot free someone else's lock.
#[derive(Clone)]
pub struct RedisLockStore {
    conn: MultiplexedConnection,
    release: redis::Script,
}

impl RedisLockStore {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            conn,
            release: redis::Script::new(RELEASE_SCRIPT),
        })
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> RepositoryResult<bool> {
        let mut conn = self.conn.clone();
        let ttl_ms = ttl.as_millis().max(1) as u64;

        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;

        Ok(reply.is_some())
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> RepositoryResult<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;

        Ok(deleted == 1)
    }
}
