//! Nonce cache backends
//!
//! The cache maps a partition key to the last nonce sent on it. Each backend
//! also holds the per-key write locks, so every sender instance sharing a
//! backend agrees on who may use a key.

mod memory;
mod redis_store;

pub use memory::InMemoryNonceStore;
pub use redis_store::RedisNonceStore;

use crate::config::{NonceBackend, NonceConfig};
use crate::error::{SenderError, SenderResult};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait NonceStore: Send + Sync {
    async fn get_last_sent(&self, key: &str) -> SenderResult<Option<u64>>;

    async fn set_last_sent(&self, key: &str, nonce: u64) -> SenderResult<()>;

    async fn delete_last_sent(&self, key: &str) -> SenderResult<()>;

    /// Take the lock on `key` for `ttl` unless another holder has it.
    /// Returns whether `token` now holds the lock.
    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> SenderResult<bool>;

    /// Release the lock on `key` if `token` still holds it
    async fn unlock(&self, key: &str, token: &str) -> SenderResult<()>;
}

/// Build the configured backend
pub async fn from_config(config: &NonceConfig) -> SenderResult<Arc<dyn NonceStore>> {
    match config.backend {
        NonceBackend::Memory => Ok(Arc::new(InMemoryNonceStore::new())),
        NonceBackend::Redis => {
            let url = config.redis_url.as_deref().ok_or_else(|| {
                SenderError::Config("nonce.redis_url is required for the redis backend".into())
            })?;
            let store = RedisNonceStore::connect(url, config.expiration_secs).await?;
            Ok(Arc::new(store))
        }
    }
}
