//! Transactions signed by the caller

use super::{SendTransaction, SenderContext};
use crate::error::{SenderError, SenderResult};
use crate::metrics;
use crate::tx::encoding::decode_signed_transaction;
use crate::types::{Job, JobStatus, TransactionType};

use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{H256, U256};
use ethers::utils::keccak256;
use std::sync::Arc;
use tracing::{debug, info};

pub struct RawTransactionSender {
    ctx: Arc<SenderContext>,
}

impl RawTransactionSender {
    pub fn new(ctx: Arc<SenderContext>) -> Self {
        Self { ctx }
    }
}

fn to_u64(value: &U256, field: &str) -> SenderResult<u64> {
    if *value > U256::from(u64::MAX) {
        return Err(SenderError::InvalidParameter(format!(
            "raw transaction {} out of range: {}",
            field, value
        )));
    }
    Ok(value.as_u64())
}

/// Fill the job transaction from the signed payload, for reporting only
fn decode_into_job(job: &mut Job) -> SenderResult<()> {
    let raw = job.transaction.raw.clone().ok_or_else(|| {
        SenderError::InvalidParameter(format!("job {} has no raw transaction", job.uuid))
    })?;
    let (decoded, signature) = decode_signed_transaction(&raw)?;
    let from = signature
        .recover(decoded.sighash())
        .map_err(|e| SenderError::CryptoOperation(format!("cannot recover sender: {}", e)))?;

    let tx = &mut job.transaction;
    tx.from = Some(from);
    tx.to = decoded.to_addr().copied();
    tx.value = decoded.value().copied();
    tx.data = decoded.data().cloned();
    tx.gas = decoded.gas().map(|gas| to_u64(gas, "gas")).transpose()?;
    tx.nonce = decoded.nonce().map(|nonce| to_u64(nonce, "nonce")).transpose()?;

    match &decoded {
        TypedTransaction::Eip1559(inner) => {
            tx.transaction_type = Some(TransactionType::DynamicFee);
            tx.gas_fee_cap = inner.max_fee_per_gas;
            tx.gas_tip_cap = inner.max_priority_fee_per_gas;
            tx.gas_price = None;
        }
        _ => {
            tx.transaction_type = Some(TransactionType::Legacy);
            tx.gas_price = decoded.gas_price();
            tx.clear_dynamic_fee();
        }
    }
    tx.hash = Some(H256::from(keccak256(&raw)));

    debug!(job_uuid = %job.uuid, from = ?from, "raw transaction decoded");
    Ok(())
}

#[async_trait]
impl SendTransaction for RawTransactionSender {
    async fn execute(&self, job: &mut Job) -> SenderResult<()> {
        let chain = self.ctx.chain(job)?;
        decode_into_job(job)?;

        let status = if job.is_resend() {
            JobStatus::Resending
        } else {
            JobStatus::Pending
        };
        self.ctx.update_status(job, status, None).await?;

        let raw = super::signed_raw(job)?;
        let tx_hash = match self
            .ctx
            .broadcast("eth_sendRawTransaction", chain.send_raw_transaction(&raw))
            .await
        {
            Ok(tx_hash) => tx_hash,
            Err(e) => {
                metrics::record_send_failure(job.job_type);
                return Err(e.extend_component("sender"));
            }
        };
        metrics::record_transaction_sent(job.job_type);

        info!(job_uuid = %job.uuid, tx_hash = ?tx_hash, "raw transaction sent");
        self.ctx.check_hash(job, tx_hash).await
    }
}
