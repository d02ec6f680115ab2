use super::NonceStore;
use crate::error::SenderResult;

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Script};
use std::time::Duration;
use tracing::info;

const KEY_PREFIX: &str = "nonce-last-sent";
const LOCK_PREFIX: &str = "nonce-lock";

/// Delete the lock only while the caller's token still holds it
const UNLOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Redis-backed nonce cache shared by every sender instance
#[derive(Clone)]
pub struct RedisNonceStore {
    conn: ConnectionManager,
    expiration_secs: Option<u64>,
}

impl RedisNonceStore {
    pub async fn connect(url: &str, expiration_secs: Option<u64>) -> SenderResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Connected to redis nonce store");

        Ok(Self {
            conn,
            expiration_secs,
        })
    }
}

fn cache_key(key: &str) -> String {
    format!("{}:{}", KEY_PREFIX, key)
}

fn lock_key(key: &str) -> String {
    format!("{}:{}", LOCK_PREFIX, key)
}

#[async_trait]
impl NonceStore for RedisNonceStore {
    async fn get_last_sent(&self, key: &str) -> SenderResult<Option<u64>> {
        let mut conn = self.conn.clone();
        let nonce: Option<u64> = conn.get(cache_key(key)).await?;
        Ok(nonce)
    }

    async fn set_last_sent(&self, key: &str, nonce: u64) -> SenderResult<()> {
        let mut conn = self.conn.clone();
        match self.expiration_secs {
            Some(ttl) => conn.set_ex::<_, _, ()>(cache_key(key), nonce, ttl).await?,
            None => conn.set::<_, _, ()>(cache_key(key), nonce).await?,
        }
        Ok(())
    }

    async fn delete_last_sent(&self, key: &str) -> SenderResult<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(cache_key(key)).await?;
        Ok(())
    }

    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> SenderResult<bool> {
        let mut conn = self.conn.clone();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let reply: Option<String> = redis::cmd("SET")
            .arg(lock_key(key))
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn unlock(&self, key: &str, token: &str) -> SenderResult<()> {
        let mut conn = self.conn.clone();
        Script::new(UNLOCK_SCRIPT)
            .key(lock_key(key))
            .arg(token)
            .invoke_async::<i64>(&mut conn)
            .await?;
        Ok(())
    }
}
