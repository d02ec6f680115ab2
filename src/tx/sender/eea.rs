//! EEA private transactions, distributed through the privacy manager

use super::{apply_signed, signed_raw, SendTransaction, SenderContext};
use crate::error::SenderResult;
use crate::types::{Job, JobStatus};

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

pub struct EeaPrivateSender {
    ctx: Arc<SenderContext>,
}

impl EeaPrivateSender {
    pub fn new(ctx: Arc<SenderContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl SendTransaction for EeaPrivateSender {
    async fn execute(&self, job: &mut Job) -> SenderResult<()> {
        let chain = self.ctx.chain(job)?;
        let _nonce_guard = self
            .ctx
            .nonce_manager
            .lock(job)
            .await
            .map_err(|e| e.extend_component("nonce-manager"))?;

        self.ctx.craft(chain.as_ref(), job).await?;

        let signed = self
            .ctx
            .signer
            .sign_eea(job)
            .await
            .map_err(|e| e.extend_component("signer"))?;
        apply_signed(job, signed);

        let raw = signed_raw(job)?;
        let result = self
            .ctx
            .broadcast(
                "priv_distributeRawTransaction",
                chain.priv_distribute_raw_transaction(&raw),
            )
            .await;
        let tx_hash = self.ctx.settle_nonce(job, result).await?;
        job.transaction.hash = Some(tx_hash);

        info!(
            job_uuid = %job.uuid,
            nonce = ?job.transaction.nonce,
            tx_hash = ?tx_hash,
            "private transaction distributed"
        );
        self.ctx.update_status(job, JobStatus::Stored, None).await
    }
}
