use super::NonceStore;
use crate::error::SenderResult;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Process-local nonce cache, lost on restart
#[derive(Debug, Default)]
pub struct InMemoryNonceStore {
    last_sent: DashMap<String, u64>,
    /// Lock holder token and expiry per key
    locks: DashMap<String, (String, Instant)>,
}

impl InMemoryNonceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NonceStore for InMemoryNonceStore {
    async fn get_last_sent(&self, key: &str) -> SenderResult<Option<u64>> {
        Ok(self.last_sent.get(key).map(|n| *n))
    }

    async fn set_last_sent(&self, key: &str, nonce: u64) -> SenderResult<()> {
        self.last_sent.insert(key.to_string(), nonce);
        Ok(())
    }

    async fn delete_last_sent(&self, key: &str) -> SenderResult<()> {
        self.last_sent.remove(key);
        Ok(())
    }

    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> SenderResult<bool> {
        let now = Instant::now();
        match self.locks.entry(key.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert((token.to_string(), now + ttl));
                Ok(true)
            }
            Entry::Occupied(mut entry) if entry.get().1 <= now => {
                entry.insert((token.to_string(), now + ttl));
                Ok(true)
            }
            Entry::Occupied(_) => Ok(false),
        }
    }

    async fn unlock(&self, key: &str, token: &str) -> SenderResult<()> {
        self.locks.remove_if(key, |_, (holder, _)| holder == token);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0x7E654d251Da770A068413677967F6d3Ea2FeA9E4@888";

    #[tokio::test]
    async fn test_get_set_delete() {
        let store = InMemoryNonceStore::new();

        assert_eq!(store.get_last_sent(KEY).await.unwrap(), None);
        store.set_last_sent(KEY, 4).await.unwrap();
        assert_eq!(store.get_last_sent(KEY).await.unwrap(), Some(4));
        store.delete_last_sent(KEY).await.unwrap();
        assert_eq!(store.get_last_sent(KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lock_single_holder() {
        let store = InMemoryNonceStore::new();
        let ttl = Duration::from_secs(30);

        assert!(store.try_lock(KEY, "a", ttl).await.unwrap());
        assert!(!store.try_lock(KEY, "b", ttl).await.unwrap());

        // Only the holder releases
        store.unlock(KEY, "b").await.unwrap();
        assert!(!store.try_lock(KEY, "b", ttl).await.unwrap());

        store.unlock(KEY, "a").await.unwrap();
        assert!(store.try_lock(KEY, "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_expires() {
        let store = InMemoryNonceStore::new();

        assert!(store.try_lock(KEY, "a", Duration::ZERO).await.unwrap());
        assert!(store
            .try_lock(KEY, "b", Duration::from_secs(30))
            .await
            .unwrap());
    }
}
