//! Public transactions, legacy or dynamic fee, and EEA marking transactions

use super::{apply_signed, can_resend, signed_raw, SendTransaction, SenderContext};
use crate::error::SenderResult;
use crate::types::{Job, JobStatus};

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

pub struct PublicTransactionSender {
    ctx: Arc<SenderContext>,
}

impl PublicTransactionSender {
    pub fn new(ctx: Arc<SenderContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl SendTransaction for PublicTransactionSender {
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
                .sign_public(job)
                .await
                .map_err(|e| e.extend_component("signer"))?;
            apply_signed(job, signed);
            JobStatus::Pending
        };
        self.ctx.update_status(job, status, None).await?;

        let raw = signed_raw(job)?;
        let result = self
            .ctx
            .broadcast("eth_sendRawTransaction", chain.send_raw_transaction(&raw))
            .await;
        let tx_hash = self.ctx.settle_nonce(job, result).await?;

        info!(
            job_uuid = %job.uuid,
            job_type = %job.job_type,
            nonce = ?job.transaction.nonce,
            tx_hash = ?tx_hash,
            "transaction sent"
        );
        self.ctx.check_hash(job, tx_hash).await
    }
}
