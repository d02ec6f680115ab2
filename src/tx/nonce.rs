//! Nonce management for ordered transaction submission
//!
//! Handles:
//! - Partition keys grouping jobs that share a nonce sequence
//! - Next nonce from the local cache, calibrated from the chain when empty
//! - Recovery from nonce conflicts reported by the node
//! - Per-key serialization of the read-send-write sequence, across instances
//!   sharing a nonce store

use crate::chain::ChainClient;
use crate::error::{SenderError, SenderResult};
use crate::store::NonceStore;
use crate::types::{Job, JobType};

use dashmap::DashMap;
use ethers::utils::to_checksum;
use sha3::{Digest, Keccak256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Node messages meaning the nonce we sent was stale or already taken
const NONCE_CONFLICT_MESSAGES: [&str; 3] =
    ["nonce too low", "incorrect nonce", "replacement transaction"];

/// Key of the nonce sequence a job takes part in.
///
/// Empty when the job does not take part in nonce ordering.
pub fn partition_key(job: &Job) -> String {
    let (from, chain_id) = match (job.transaction.from, job.internal_data.chain_id) {
        (Some(from), Some(chain_id)) if !job.is_one_time_key() => (from, chain_id),
        _ => return String::new(),
    };
    let from = to_checksum(&from, None);
    let tx = &job.transaction;

    if job.job_type == JobType::EeaPrivateTransaction {
        if let Some(group_id) = tx.privacy_group_id.as_deref() {
            return format!("{}@orion-{}@{}", from, group_id, chain_id);
        }
        if !tx.private_for.is_empty() {
            let mut participants = tx.private_for.clone();
            participants.extend(tx.private_from.clone());
            participants.sort();
            let digest = Keccak256::digest(participants.join("-").as_bytes());
            return format!("{}@orion-{}@{}", from, hex::encode(digest), chain_id);
        }
    }

    format!("{}@{}", from, chain_id)
}

fn is_nonce_conflict(err: &SenderError) -> bool {
    let message = err.to_string().to_lowercase();
    NONCE_CONFLICT_MESSAGES
        .iter()
        .any(|pattern| message.contains(pattern))
}

/// Nonce-conflict recoveries per job
#[derive(Debug, Default)]
pub struct RecoveryTracker {
    counters: DashMap<Uuid, u32>,
}

impl RecoveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, job_uuid: &Uuid) -> u32 {
        self.counters.get(job_uuid).map(|c| *c).unwrap_or(0)
    }

    pub fn recover(&self, job_uuid: Uuid) -> u32 {
        let mut count = self.counters.entry(job_uuid).or_insert(0);
        *count += 1;
        *count
    }

    pub fn clear(&self, job_uuid: &Uuid) {
        self.counters.remove(job_uuid);
    }
}

/// How long a nonce lock is kept when its holder never releases it
const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(60);
/// Pause between attempts on a key locked by another instance
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(20);

type LockTable = Arc<DashMap<String, Arc<Mutex<()>>>>;

/// Exclusive use of a partition key, released on drop.
///
/// Holds the local per-key mutex and the store lock shared with other
/// instances. The store lock is released first so that a local waiter
/// never finds it still taken.
pub struct NonceLock {
    key: String,
    token: String,
    store: Arc<dyn NonceStore>,
    locks: LockTable,
    local: Option<OwnedMutexGuard<()>>,
}

impl NonceLock {
    pub fn partition_key(&self) -> &str {
        &self.key
    }
}

impl Drop for NonceLock {
    fn drop(&mut self) {
        let key = self.key.clone();
        let token = std::mem::take(&mut self.token);
        let store = Arc::clone(&self.store);
        let locks = Arc::clone(&self.locks);
        let local = self.local.take();

        let release = async move {
            if let Err(e) = store.unlock(&key, &token).await {
                warn!(partition_key = %key, "failed to release nonce lock: {}", e);
            }
            drop(local);
            prune_lock(&locks, &key);
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(release);
            }
            // No runtime left: the store lock expires on its own
            Err(_) => {
                drop(release);
                prune_lock(&self.locks, &self.key);
            }
        }
    }
}

/// Drop the table entry of a key nobody holds or waits on
fn prune_lock(locks: &DashMap<String, Arc<Mutex<()>>>, key: &str) {
    locks.remove_if(key, |_, mutex| Arc::strong_count(mutex) == 1);
}

/// Hands out nonces per partition key
pub struct NonceManager {
    /// Last sent nonce per partition key
    store: Arc<dyn NonceStore>,
    recovery: RecoveryTracker,
    max_recovery: u32,
    /// One local lock per partition key in use
    locks: LockTable,
    lock_ttl: Duration,
}

impl NonceManager {
    pub fn new(store: Arc<dyn NonceStore>, max_recovery: u32) -> Self {
        Self {
            store,
            recovery: RecoveryTracker::new(),
            max_recovery,
            locks: Arc::new(DashMap::new()),
            lock_ttl: DEFAULT_LOCK_TTL,
        }
    }

    pub fn with_lock_ttl(mut self, lock_ttl: Duration) -> Self {
        self.lock_ttl = lock_ttl;
        self
    }

    fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let entry = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())));
        Arc::clone(entry.value())
    }

    /// Serialize nonce use on the job's partition key, across every
    /// instance sharing the nonce store.
    ///
    /// The lock must be held from crafting until the nonce is incremented
    /// or cleaned. Jobs without a partition key get no lock. Waiting longer
    /// than the lock TTL is a `Timeout`.
    pub async fn lock(&self, job: &Job) -> SenderResult<Option<NonceLock>> {
        let key = partition_key(job);
        if key.is_empty() {
            return Ok(None);
        }

        debug!(partition_key = %key, job_uuid = %job.uuid, "acquiring nonce lock");
        let local = self.key_lock(&key).lock_owned().await;
        let token = Uuid::new_v4().to_string();
        let lock = NonceLock {
            key,
            token,
            store: Arc::clone(&self.store),
            locks: Arc::clone(&self.locks),
            local: Some(local),
        };

        let deadline = Instant::now() + self.lock_ttl;
        while !self
            .store
            .try_lock(&lock.key, &lock.token, self.lock_ttl)
            .await?
        {
            if Instant::now() >= deadline {
                return Err(SenderError::Timeout {
                    operation: format!("nonce lock on {}", lock.key),
                });
            }
            sleep(LOCK_RETRY_INTERVAL).await;
        }

        debug!(partition_key = %lock.key, job_uuid = %job.uuid, "nonce lock acquired");
        Ok(Some(lock))
    }

    /// Next nonce for the job
    pub async fn get_nonce(&self, chain: &dyn ChainClient, job: &Job) -> SenderResult<u64> {
        let key = partition_key(job);
        if key.is_empty() {
            return Ok(0);
        }

        if let Some(last_sent) = self.store.get_last_sent(&key).await? {
            let nonce = last_sent + 1;
            debug!(partition_key = %key, nonce, "nonce from cache");
            return Ok(nonce);
        }

        let nonce = self.fetch_nonce(chain, job).await?;
        debug!(partition_key = %key, nonce, "nonce calibrated from chain");
        Ok(nonce)
    }

    /// Record the nonce of a successfully sent job
    pub async fn increment_nonce(&self, job: &Job) -> SenderResult<()> {
        self.recovery.clear(&job.uuid);

        let key = partition_key(job);
        if key.is_empty() {
            return Ok(());
        }

        let used = job.transaction.nonce.ok_or_else(|| {
            SenderError::InvalidParameter(format!("job {} was sent without a nonce", job.uuid))
        })?;

        match self.store.get_last_sent(&key).await? {
            Some(last_sent) if used != last_sent + 1 => {
                debug!(
                    partition_key = %key,
                    used,
                    last_sent,
                    "nonce out of sequence, cache left unchanged"
                );
            }
            _ => {
                self.store.set_last_sent(&key, used).await?;
                debug!(partition_key = %key, nonce = used, "last sent nonce updated");
            }
        }

        Ok(())
    }

    /// React to a failed send.
    ///
    /// Returns `Ok(())` when the failure is unrelated to nonces, an
    /// `InvalidNonce` warning once the job has been prepared for another
    /// attempt, or an `Internal` error when recoveries are exhausted.
    pub async fn clean_nonce(&self, job: &mut Job, send_error: &SenderError) -> SenderResult<()> {
        // Resends keep their signed nonce
        if job.is_resend() || !is_nonce_conflict(send_error) {
            return Ok(());
        }

        let attempts = self.recovery.count(&job.uuid);
        if attempts >= self.max_recovery {
            return Err(SenderError::Internal(format!(
                "job {} reached max nonce recovery ({}): {}",
                job.uuid, self.max_recovery, send_error
            )));
        }

        let key = partition_key(job);
        if !key.is_empty() {
            let last_sent = self.store.get_last_sent(&key).await?;
            if let (Some(last_sent), Some(nonce)) = (last_sent, job.transaction.nonce) {
                if nonce == last_sent + 1 {
                    self.store.delete_last_sent(&key).await?;
                    debug!(partition_key = %key, last_sent, "stale cached nonce removed");
                }
            }
        }

        let attempts = self.recovery.recover(job.uuid);
        warn!(
            job_uuid = %job.uuid,
            partition_key = %key,
            nonce = ?job.transaction.nonce,
            attempts,
            "nonce conflict, job will be crafted again: {}",
            send_error
        );
        job.transaction.nonce = None;
        crate::metrics::record_nonce_recovery(job.internal_data.chain_id.unwrap_or_default());

        Err(SenderError::InvalidNonce(send_error.to_string()))
    }

    pub fn recovery_count(&self, job_uuid: &Uuid) -> u32 {
        self.recovery.count(job_uuid)
    }

    /// Forget the recoveries of a job that will not be sent again
    pub fn clear_recovery(&self, job_uuid: &Uuid) {
        self.recovery.clear(job_uuid);
    }

    /// Fetch nonce from chain
    async fn fetch_nonce(&self, chain: &dyn ChainClient, job: &Job) -> SenderResult<u64> {
        let tx = &job.transaction;
        let from = tx.from.ok_or_else(|| {
            SenderError::InvalidParameter("from is required to fetch a nonce".to_string())
        })?;

        if job.job_type == JobType::EeaPrivateTransaction {
            if let Some(group_id) = tx.privacy_group_id.as_deref() {
                return chain.priv_nonce(from, group_id).await;
            }
            if !tx.private_for.is_empty() {
                let private_from = tx.private_from.as_deref().unwrap_or_default();
                return chain
                    .priv_eea_nonce(from, private_from, &tx.private_for)
                    .await;
            }
        }

        chain.pending_nonce_at(from).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChainClient;
    use crate::store::InMemoryNonceStore;
    use ethers::types::Address;

    const FROM: &str = "0x7e654d251da770a068413677967f6d3ea2fea9e4";

    fn public_job() -> Job {
        let mut job = Job::new(JobType::EthTransaction, Uuid::new_v4());
        job.transaction.from = Some(FROM.parse().unwrap());
        job.internal_data.chain_id = Some(888);
        job
    }

    fn manager(max_recovery: u32) -> (Arc<InMemoryNonceStore>, NonceManager) {
        let store = Arc::new(InMemoryNonceStore::new());
        let manager = NonceManager::new(store.clone(), max_recovery);
        (store, manager)
    }

    #[test]
    fn test_partition_key_public() {
        let job = public_job();
        assert_eq!(
            partition_key(&job),
            "0x7E654d251Da770A068413677967F6d3Ea2FeA9E4@888"
        );
        // Same inputs, same key
        let mut other = public_job();
        other.transaction.data = Some(vec![1u8, 2].into());
        assert_eq!(partition_key(&job), partition_key(&other));
    }

    #[test]
    fn test_partition_key_empty() {
        let mut job = public_job();
        job.transaction.from = None;
        assert_eq!(partition_key(&job), "");

        let mut job = public_job();
        job.internal_data.chain_id = None;
        assert_eq!(partition_key(&job), "");

        let mut job = public_job();
        job.internal_data.one_time_key = true;
        assert_eq!(partition_key(&job), "");
    }

    #[test]
    fn test_partition_key_private() {
        let mut job = public_job();
        job.job_type = JobType::EeaPrivateTransaction;
        job.transaction.privacy_group_id = Some("kAbelwaVW7okoEn1+okO+AbA4Hhz/7DaCOWVQz9nx5M=".into());
        assert_eq!(
            partition_key(&job),
            "0x7E654d251Da770A068413677967F6d3Ea2FeA9E4@orion-kAbelwaVW7okoEn1+okO+AbA4Hhz/7DaCOWVQz9nx5M=@888"
        );

        let mut a = public_job();
        a.job_type = JobType::EeaPrivateTransaction;
        a.transaction.private_from = Some("A1aVtMxLCUHmBVHXoZzzBgPbW/wj5axDpW9X8l91SGo=".into());
        a.transaction.private_for = vec![
            "Ko2bVqD+nNlNYL5EE7y3IdOnviftjiizpjRt+HTuFBs=".into(),
            "k2zXEin4Ip/qBGlRkJejnGWdP9cjkK+DAvKNW31L2C8=".into(),
        ];
        let mut b = a.clone();
        b.transaction.private_for.reverse();

        let key = partition_key(&a);
        assert!(key.starts_with("0x7E654d251Da770A068413677967F6d3Ea2FeA9E4@orion-"));
        assert!(key.ends_with("@888"));
        assert_eq!(key, partition_key(&b));

        // Tessera marking transactions share the public sequence
        let mut marking = a.clone();
        marking.job_type = JobType::TesseraMarkingTransaction;
        assert_eq!(partition_key(&marking), partition_key(&public_job()));
    }

    #[tokio::test]
    async fn test_get_nonce_empty_key() {
        let (_, manager) = manager(3);
        let chain = MockChainClient::new();
        let mut job = public_job();
        job.transaction.from = None;

        assert_eq!(manager.get_nonce(&chain, &job).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_get_nonce_calibrates_from_chain() {
        let (_, manager) = manager(3);
        let mut chain = MockChainClient::new();
        chain
            .expect_pending_nonce_at()
            .withf(|address| *address == FROM.parse::<Address>().unwrap())
            .times(1)
            .returning(|_| Ok(1));

        assert_eq!(manager.get_nonce(&chain, &public_job()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_get_nonce_private_queries() {
        let (_, manager) = manager(3);
        let mut chain = MockChainClient::new();
        chain
            .expect_priv_nonce()
            .withf(|_, group| group == "group-id")
            .times(1)
            .returning(|_, _| Ok(4));
        chain
            .expect_priv_eea_nonce()
            .withf(|_, private_from, private_for| {
                private_from == "private-from"
                    && private_for.len() == 1
                    && private_for[0] == "private-for"
            })
            .times(1)
            .returning(|_, _, _| Ok(9));

        let mut group_job = public_job();
        group_job.job_type = JobType::EeaPrivateTransaction;
        group_job.transaction.privacy_group_id = Some("group-id".into());
        assert_eq!(manager.get_nonce(&chain, &group_job).await.unwrap(), 4);

        let mut list_job = public_job();
        list_job.job_type = JobType::EeaPrivateTransaction;
        list_job.transaction.private_from = Some("private-from".into());
        list_job.transaction.private_for = vec!["private-for".into()];
        assert_eq!(manager.get_nonce(&chain, &list_job).await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_nonce_monotonicity() {
        let (_, manager) = manager(3);
        let mut chain = MockChainClient::new();
        chain.expect_pending_nonce_at().times(1).returning(|_| Ok(10));

        let mut previous = None;
        for _ in 0..5 {
            let mut job = public_job();
            let nonce = manager.get_nonce(&chain, &job).await.unwrap();
            if let Some(previous) = previous {
                assert_eq!(nonce, previous + 1);
            }
            job.transaction.nonce = Some(nonce);
            manager.increment_nonce(&job).await.unwrap();
            previous = Some(nonce);
        }
        assert_eq!(previous, Some(14));
    }

    #[tokio::test]
    async fn test_increment_ignores_out_of_sequence_nonce() {
        let (store, manager) = manager(3);
        let job = public_job();
        let key = partition_key(&job);
        store.set_last_sent(&key, 5).await.unwrap();

        let mut stale = job.clone();
        stale.transaction.nonce = Some(3);
        manager.increment_nonce(&stale).await.unwrap();
        assert_eq!(store.get_last_sent(&key).await.unwrap(), Some(5));

        let mut next = job.clone();
        next.transaction.nonce = Some(6);
        manager.increment_nonce(&next).await.unwrap();
        assert_eq!(store.get_last_sent(&key).await.unwrap(), Some(6));
    }

    #[tokio::test]
    async fn test_clean_nonce_too_low_recovery() {
        let (store, manager) = manager(3);
        let mut job = public_job();
        let key = partition_key(&job);
        store.set_last_sent(&key, 1).await.unwrap();
        job.transaction.nonce = Some(2);

        let send_error = SenderError::Transaction("Nonce too low".to_string());
        let err = manager.clean_nonce(&mut job, &send_error).await.unwrap_err();

        assert!(err.is_recoverable());
        assert_eq!(store.get_last_sent(&key).await.unwrap(), None);
        assert_eq!(manager.recovery_count(&job.uuid), 1);
        assert_eq!(job.transaction.nonce, None);
    }

    #[tokio::test]
    async fn test_clean_nonce_keeps_cache_when_not_consecutive() {
        let (store, manager) = manager(3);
        let mut job = public_job();
        let key = partition_key(&job);
        store.set_last_sent(&key, 1).await.unwrap();
        job.transaction.nonce = Some(7);

        let send_error = SenderError::Transaction("incorrect nonce".to_string());
        let err = manager.clean_nonce(&mut job, &send_error).await.unwrap_err();

        assert!(err.is_recoverable());
        assert_eq!(store.get_last_sent(&key).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_clean_nonce_ignores_other_errors() {
        let (_, manager) = manager(3);
        let mut job = public_job();
        job.transaction.nonce = Some(2);

        let send_error = SenderError::Transaction("insufficient funds for gas".to_string());
        tokio_test::assert_ok!(manager.clean_nonce(&mut job, &send_error).await);
        assert_eq!(job.transaction.nonce, Some(2));
        assert_eq!(manager.recovery_count(&job.uuid), 0);
    }

    #[tokio::test]
    async fn test_clean_nonce_skips_resend() {
        let (_, manager) = manager(3);
        let mut job = public_job();
        job.internal_data.resend = true;
        job.transaction.nonce = Some(2);

        let send_error = SenderError::Transaction("replacement transaction underpriced".into());
        tokio_test::assert_ok!(manager.clean_nonce(&mut job, &send_error).await);
        assert_eq!(job.transaction.nonce, Some(2));
    }

    #[tokio::test]
    async fn test_recovery_overrun_fails_on_last_call_only() {
        let max_recovery = 3;
        let (_, manager) = manager(max_recovery);
        let mut job = public_job();
        let send_error = SenderError::Transaction("nonce too low".to_string());

        for _ in 0..max_recovery {
            job.transaction.nonce = Some(1);
            let err = manager.clean_nonce(&mut job, &send_error).await.unwrap_err();
            assert!(matches!(err, SenderError::InvalidNonce(_)));
        }

        job.transaction.nonce = Some(1);
        let err = manager.clean_nonce(&mut job, &send_error).await.unwrap_err();
        assert!(matches!(err, SenderError::Internal(_)));

        // A successful send resets the budget
        job.transaction.nonce = Some(1);
        manager.increment_nonce(&job).await.unwrap();
        assert_eq!(manager.recovery_count(&job.uuid), 0);
    }

    #[tokio::test]
    async fn test_lock_serializes_same_account() {
        let (_, manager) = manager(3);
        let manager = Arc::new(manager);
        let mut chain = MockChainClient::new();
        chain.expect_pending_nonce_at().times(1).returning(|_| Ok(5));
        let chain = Arc::new(chain);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let manager = manager.clone();
            let chain = chain.clone();
            handles.push(tokio::spawn(async move {
                let mut job = public_job();
                let _guard = manager.lock(&job).await.unwrap();
                let nonce = manager.get_nonce(chain.as_ref(), &job).await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
                job.transaction.nonce = Some(nonce);
                manager.increment_nonce(&job).await.unwrap();
                nonce
            }));
        }

        let mut nonces = Vec::new();
        for handle in handles {
            nonces.push(handle.await.unwrap());
        }
        nonces.sort();
        assert_eq!(nonces, vec![5, 6, 7, 8]);
    }

    #[tokio::test]
    async fn test_lock_skipped_without_partition_key() {
        let (_, manager) = manager(3);
        let mut job = public_job();
        job.internal_data.one_time_key = true;
        assert!(manager.lock(&job).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lock_serializes_instances_sharing_store() {
        let store = Arc::new(InMemoryNonceStore::new());
        store.set_last_sent(&partition_key(&public_job()), 4).await.unwrap();
        let chain = Arc::new(MockChainClient::new());

        let mut handles = Vec::new();
        for _ in 0..2 {
            // One manager per sender instance
            let manager = NonceManager::new(store.clone(), 3);
            let chain = chain.clone();
            handles.push(tokio::spawn(async move {
                let mut job = public_job();
                let _guard = manager.lock(&job).await.unwrap();
                let nonce = manager.get_nonce(chain.as_ref(), &job).await.unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
                job.transaction.nonce = Some(nonce);
                manager.increment_nonce(&job).await.unwrap();
                nonce
            }));
        }

        let mut nonces = Vec::new();
        for handle in handles {
            nonces.push(handle.await.unwrap());
        }
        nonces.sort();
        assert_eq!(nonces, vec![5, 6]);
    }

    #[tokio::test]
    async fn test_lock_times_out_while_held_elsewhere() {
        let (store, manager) = manager(3);
        let manager = manager.with_lock_ttl(Duration::from_millis(50));
        let job = public_job();
        store
            .try_lock(&partition_key(&job), "other-instance", Duration::from_secs(30))
            .await
            .unwrap();

        let err = manager.lock(&job).await.err().unwrap();
        assert!(matches!(err, SenderError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_lock_released_and_pruned_on_drop() {
        let (store, manager) = manager(3);
        let job = public_job();
        let key = partition_key(&job);

        let guard = manager.lock(&job).await.unwrap();
        assert_eq!(guard.as_ref().map(|g| g.partition_key()), Some(key.as_str()));
        assert!(!store.try_lock(&key, "other", Duration::from_secs(1)).await.unwrap());
        drop(guard);

        tokio::time::timeout(Duration::from_secs(1), async {
            while !manager.locks.is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(store.try_lock(&key, "other", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_recovery() {
        let (_, manager) = manager(2);
        let mut job = public_job();
        let send_error = SenderError::Transaction("nonce too low".to_string());

        for _ in 0..3 {
            job.transaction.nonce = Some(1);
            let _ = manager.clean_nonce(&mut job, &send_error).await;
        }
        assert_eq!(manager.recovery_count(&job.uuid), 2);

        manager.clear_recovery(&job.uuid);
        assert_eq!(manager.recovery_count(&job.uuid), 0);
    }
}
