//! Tessera private payloads and the marking transactions pointing at them

use super::{apply_signed, can_resend, signed_raw, SendTransaction, SenderContext};
use crate::error::{SenderError, SenderResult};
use crate::metrics;
use crate::types::{Job, JobStatus};

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Public marking transaction sent with its private recipients
pub struct TesseraMarkingSender {
    ctx: Arc<SenderContext>,
}

impl TesseraMarkingSender {
    pub fn new(ctx: Arc<SenderContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl SendTransaction for TesseraMarkingSender {
    async fn execute(&self, job: &mut Job) -> SenderResult<()> {
        let chain = self.ctx.chain(job)?;
        let _nonce_guard = self
            .ctx
            .nonce_manager
            .lock(job)
            .await
            .map_err(|e| e.extend_component("nonce-manager"))?;

        self.ctx.craft(chain.as_ref(), job).await?;

        let status = if can_resend(job) {
            JobStatus::Resending
        } else {
            let signed = self
                .ctx
                .signer
                .sign_quorum_private(job)
                .await
                .map_err(|e| e.extend_component("signer"))?;
            apply_signed(job, signed);
            JobStatus::Pending
        };
        self.ctx.update_status(job, status, None).await?;

        let raw = signed_raw(job)?;
        let tx = &job.transaction;
        let result = self
            .ctx
            .broadcast(
                "eth_sendRawPrivateTransaction",
                chain.send_quorum_raw_private_transaction(
                    &raw,
                    &tx.private_for,
                    &tx.mandatory_for,
                    tx.privacy_flag.unwrap_or_default(),
                ),
            )
            .await;
        let tx_hash = self.ctx.settle_nonce(job, result).await?;

        info!(
            job_uuid = %job.uuid,
            nonce = ?job.transaction.nonce,
            tx_hash = ?tx_hash,
            "marking transaction sent"
        );
        self.ctx.check_hash(job, tx_hash).await
    }
}

/// Private payload stored in the enclave, never signed as a transaction
pub struct TesseraPrivateSender {
    ctx: Arc<SenderContext>,
}

impl TesseraPrivateSender {
    pub fn new(ctx: Arc<SenderContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl SendTransaction for TesseraPrivateSender {
    async fn execute(&self, job: &mut Job) -> SenderResult<()> {
        let chain = self.ctx.chain(job)?;
        self.ctx.craft(chain.as_ref(), job).await?;

        let data = job.transaction.data.clone().ok_or_else(|| {
            SenderError::InvalidParameter("data is required for a private payload".into())
        })?;
        let private_from = job.transaction.private_from.clone().ok_or_else(|| {
            SenderError::InvalidParameter("privateFrom is required for a private payload".into())
        })?;

        let enclave_key = match self
            .ctx
            .broadcast("storeraw", chain.store_raw(&data, &private_from))
            .await
        {
            Ok(key) => key,
            Err(e) => {
                metrics::record_send_failure(job.job_type);
                return Err(e.extend_component("sender"));
            }
        };
        metrics::record_transaction_sent(job.job_type);
        job.transaction.enclave_key = Some(enclave_key);

        info!(job_uuid = %job.uuid, "private payload stored");
        self.ctx.update_status(job, JobStatus::Stored, None).await
    }
}
