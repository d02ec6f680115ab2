//! Sender use cases, one per transaction variant
//!
//! Each use case takes a job from crafting to broadcast and reports the
//! resulting status to the job API. They share a [`SenderContext`] holding
//! the collaborators and the steps common to all variants.

mod eea;
mod public;
mod raw;
mod tessera;

pub use eea::EeaPrivateSender;
pub use public::PublicTransactionSender;
pub use raw::RawTransactionSender;
pub use tessera::{TesseraMarkingSender, TesseraPrivateSender};

use super::crafter::CraftTransaction;
use super::nonce::NonceManager;
use super::signer::TransactionSigner;
use crate::chain::{ChainClient, ChainManager};
use crate::error::{SenderError, SenderResult};
use crate::metrics;
use crate::state::{JobStatusReporter, UpdateJobRequest};
use crate::types::{Job, JobStatus, SignedTransaction};

use async_trait::async_trait;
use ethers::types::{Bytes, H256};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Runs one job of a given variant to broadcast
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SendTransaction: Send + Sync {
    async fn execute(&self, job: &mut Job) -> SenderResult<()>;
}

pub struct SenderContext {
    chains: Arc<ChainManager>,
    crafter: CraftTransaction,
    signer: TransactionSigner,
    nonce_manager: Arc<NonceManager>,
    reporter: Arc<dyn JobStatusReporter>,
    send_timeout: Duration,
}

impl SenderContext {
    pub fn new(
        chains: Arc<ChainManager>,
        nonce_manager: Arc<NonceManager>,
        signer: TransactionSigner,
        reporter: Arc<dyn JobStatusReporter>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            chains,
            crafter: CraftTransaction::new(nonce_manager.clone()),
            signer,
            nonce_manager,
            reporter,
            send_timeout,
        }
    }

    fn chain(&self, job: &Job) -> SenderResult<Arc<dyn ChainClient>> {
        self.chains.get_client(job.chain_uuid)
    }

    async fn craft(&self, chain: &dyn ChainClient, job: &mut Job) -> SenderResult<()> {
        self.crafter
            .execute(chain, job)
            .await
            .map_err(|e| e.extend_component("crafter"))
    }

    /// Record a status on the job and push it to the job API
    pub async fn update_status(
        &self,
        job: &mut Job,
        status: JobStatus,
        message: Option<String>,
    ) -> SenderResult<()> {
        job.status = status;
        let update = UpdateJobRequest {
            status,
            message,
            transaction: job.transaction.clone(),
        };
        debug!(job_uuid = %job.uuid, ?status, "reporting job status");
        self.reporter.update_job(job.uuid, &update).await
    }

    /// Broadcast bounded by the send timeout
    async fn broadcast<T, F>(&self, operation: &str, call: F) -> SenderResult<T>
    where
        F: Future<Output = SenderResult<T>>,
    {
        match timeout(self.send_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(SenderError::Timeout {
                operation: operation.to_string(),
            }),
        }
    }

    /// Update the nonce cache with the outcome of a broadcast
    async fn settle_nonce(&self, job: &mut Job, result: SenderResult<H256>) -> SenderResult<H256> {
        match result {
            Ok(tx_hash) => {
                self.nonce_manager
                    .increment_nonce(job)
                    .await
                    .map_err(|e| e.extend_component("nonce-manager"))?;
                metrics::record_transaction_sent(job.job_type);
                Ok(tx_hash)
            }
            Err(send_error) => {
                metrics::record_send_failure(job.job_type);
                if let Err(e) = self.nonce_manager.clean_nonce(job, &send_error).await {
                    return Err(e.extend_component("nonce-manager"));
                }
                Err(send_error.extend_component("sender"))
            }
        }
    }

    /// Report a warning when the node hashed the transaction differently
    async fn check_hash(&self, job: &mut Job, tx_hash: H256) -> SenderResult<()> {
        match job.transaction.hash {
            Some(expected) if expected != tx_hash => {
                warn!(
                    job_uuid = %job.uuid,
                    expected = ?expected,
                    tx_hash = ?tx_hash,
                    "transaction hash mismatch"
                );
                metrics::record_hash_mismatch(job.job_type);
                job.transaction.hash = Some(tx_hash);
                let message = format!(
                    "expected transaction hash {:?}, but got {:?}. Overriding",
                    expected, tx_hash
                );
                self.update_status(job, JobStatus::Warning, Some(message))
                    .await
            }
            _ => Ok(()),
        }
    }
}

/// Resends reuse the payload signed on the first attempt
fn can_resend(job: &Job) -> bool {
    job.is_resend() && job.transaction.raw.is_some()
}

fn apply_signed(job: &mut Job, signed: SignedTransaction) {
    job.transaction.raw = Some(signed.raw);
    job.transaction.hash = signed.hash;
}

fn signed_raw(job: &Job) -> SenderResult<Bytes> {
    job.transaction.raw.clone().ok_or_else(|| {
        SenderError::InvalidParameter(format!("job {} has no signed transaction", job.uuid))
    })
}
