//! Transaction crafting
//!
//! Fills in every field signing and broadcasting need. Fields already set
//! are kept, so a job can go through crafting again after a failed attempt.

use super::gas::{FeeOutcome, FeeStrategy};
use super::nonce::NonceManager;
use crate::chain::ChainClient;
use crate::error::SenderResult;
use crate::types::{Job, JobType, TransactionType};

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, NameOrAddress, TransactionRequest};
use std::sync::Arc;
use tracing::debug;

/// Payload estimated for EEA marking transactions, some nodes fail on empty data
const MARKING_PLACEHOLDER_DATA: [u8; 64] = [0u8; 64];

pub struct CraftTransaction {
    nonce_manager: Arc<NonceManager>,
}

impl CraftTransaction {
    pub fn new(nonce_manager: Arc<NonceManager>) -> Self {
        Self { nonce_manager }
    }

    pub async fn execute(&self, chain: &dyn ChainClient, job: &mut Job) -> SenderResult<()> {
        if job.job_type == JobType::EeaMarkingTransaction {
            let precompile = chain.eea_priv_precompiled_contract_addr().await?;
            debug!(job_uuid = %job.uuid, %precompile, "marking transaction sent to privacy precompile");
            job.transaction.to = Some(precompile);
        }

        if job.transaction.transaction_type.is_none() {
            job.transaction.transaction_type = infer_transaction_type(job);
        }

        self.apply_fees(chain, job).await?;

        if job.transaction.gas.is_none() && job.job_type != JobType::EeaPrivateTransaction {
            let call = estimation_call(job);
            let gas = chain.estimate_gas(&call).await?;
            debug!(job_uuid = %job.uuid, gas, "gas limit estimated");
            job.transaction.gas = Some(gas);
        }

        if job.transaction.nonce.is_none() {
            let nonce = if job.is_one_time_key()
                || job.job_type == JobType::TesseraPrivateTransaction
            {
                0
            } else {
                self.nonce_manager.get_nonce(chain, job).await?
            };
            debug!(job_uuid = %job.uuid, nonce, "nonce set");
            job.transaction.nonce = Some(nonce);
        }

        Ok(())
    }

    async fn apply_fees(&self, chain: &dyn ChainClient, job: &mut Job) -> SenderResult<()> {
        for strategy in FeeStrategy::chain_for(job.transaction.transaction_type) {
            match strategy.apply(chain, job).await? {
                FeeOutcome::Applied => return Ok(()),
                FeeOutcome::Fallback(reason) => {
                    debug!(job_uuid = %job.uuid, ?strategy, %reason, "fee strategy skipped");
                }
            }
        }
        Ok(())
    }
}

/// Type a job's fields already commit it to
fn infer_transaction_type(job: &Job) -> Option<TransactionType> {
    let legacy_only = matches!(
        job.job_type,
        JobType::EeaPrivateTransaction
            | JobType::TesseraMarkingTransaction
            | JobType::TesseraPrivateTransaction
    );

    if legacy_only || job.transaction.gas_price.is_some() || job.is_one_time_key() {
        Some(TransactionType::Legacy)
    } else if job.transaction.has_dynamic_fee() {
        Some(TransactionType::DynamicFee)
    } else {
        None
    }
}

fn estimation_call(job: &Job) -> TypedTransaction {
    let tx = &job.transaction;
    // The one-time key does not exist yet
    let from = if job.is_one_time_key() {
        Some(Address::from_low_u64_be(1))
    } else {
        tx.from
    };
    let data = if job.job_type == JobType::EeaMarkingTransaction {
        Some(Bytes::from(MARKING_PLACEHOLDER_DATA.to_vec()))
    } else {
        tx.data.clone()
    };

    TypedTransaction::Legacy(TransactionRequest {
        from,
        to: tx.to.map(NameOrAddress::Address),
        value: tx.value,
        data,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChainClient;
    use crate::error::SenderError;
    use crate::store::InMemoryNonceStore;
    use crate::types::Priority;
    use ethers::types::{FeeHistory, U256};
    use uuid::Uuid;

    fn crafter() -> CraftTransaction {
        let store = Arc::new(InMemoryNonceStore::new());
        CraftTransaction::new(Arc::new(NonceManager::new(store, 3)))
    }

    fn job(job_type: JobType) -> Job {
        let mut job = Job::new(job_type, Uuid::new_v4());
        job.transaction.from = Some("0x7e654d251da770a068413677967f6d3ea2fea9e4".parse().unwrap());
        job.transaction.to = Some("0x905b88eff8bda1543d4d6f4aa05afef143d27e18".parse().unwrap());
        job.internal_data.chain_id = Some(888);
        job.internal_data.priority = Priority::Medium;
        job
    }

    fn history(base_fee: u64) -> FeeHistory {
        FeeHistory {
            base_fee_per_gas: vec![U256::from(base_fee)],
            gas_used_ratio: vec![0.5],
            oldest_block: U256::from(1),
            reward: vec![],
        }
    }

    fn assert_single_fee_scheme(job: &Job) {
        let tx = &job.transaction;
        let legacy = tx.gas_price.is_some();
        let dynamic = tx.gas_fee_cap.is_some() && tx.gas_tip_cap.is_some();
        assert!(legacy != dynamic, "exactly one fee scheme expected: {:?}", tx);
        assert!(!(legacy && tx.has_dynamic_fee()));
    }

    #[tokio::test]
    async fn test_legacy_happy_path() {
        let mut chain = MockChainClient::new();
        chain
            .expect_suggest_gas_price()
            .times(1)
            .returning(|| Ok(U256::from(1000)));
        chain.expect_estimate_gas().times(1).returning(|_| Ok(1000));
        chain.expect_pending_nonce_at().times(1).returning(|_| Ok(1));

        let mut job = job(JobType::EthTransaction);
        job.transaction.transaction_type = Some(TransactionType::Legacy);
        crafter().execute(&chain, &mut job).await.unwrap();

        assert_eq!(job.transaction.gas_price, Some(U256::from(1000)));
        assert_eq!(job.transaction.gas, Some(1000));
        assert_eq!(job.transaction.nonce, Some(1));
        assert_single_fee_scheme(&job);
    }

    #[tokio::test]
    async fn test_dynamic_fee_happy_path() {
        let mut chain = MockChainClient::new();
        chain
            .expect_fee_history()
            .times(1)
            .returning(|_, _| Ok(history(1_000_000_000)));
        chain.expect_estimate_gas().times(1).returning(|_| Ok(21000));
        chain.expect_pending_nonce_at().times(1).returning(|_| Ok(0));

        let mut job = job(JobType::EthTransaction);
        crafter().execute(&chain, &mut job).await.unwrap();

        assert_eq!(job.transaction.gas_fee_cap, Some(U256::from(2_500_000_000u64)));
        assert_eq!(job.transaction.gas_tip_cap, Some(U256::from(1_500_000_000u64)));
        assert_eq!(job.transaction.transaction_type, Some(TransactionType::DynamicFee));
        assert_single_fee_scheme(&job);
    }

    #[tokio::test]
    async fn test_zero_base_fee_falls_back_to_legacy() {
        let mut chain = MockChainClient::new();
        chain
            .expect_fee_history()
            .times(1)
            .returning(|_, _| Ok(history(0)));
        chain
            .expect_suggest_gas_price()
            .times(1)
            .returning(|| Ok(U256::from(1000)));
        chain.expect_estimate_gas().returning(|_| Ok(21000));
        chain.expect_pending_nonce_at().returning(|_| Ok(0));

        let mut job = job(JobType::EthTransaction);
        job.internal_data.priority = Priority::High;
        job.transaction.gas_tip_cap = Some(U256::from(7));
        crafter().execute(&chain, &mut job).await.unwrap();

        assert_eq!(job.transaction.transaction_type, Some(TransactionType::Legacy));
        assert_eq!(job.transaction.gas_price, Some(U256::from(1200)));
        assert!(!job.transaction.has_dynamic_fee());
        assert_single_fee_scheme(&job);
    }

    #[tokio::test]
    async fn test_fee_history_error_falls_back_to_legacy() {
        let mut chain = MockChainClient::new();
        chain.expect_fee_history().times(1).returning(|_, _| {
            Err(SenderError::Transaction("method not found".to_string()))
        });
        chain
            .expect_suggest_gas_price()
            .times(1)
            .returning(|| Ok(U256::from(1000)));
        chain.expect_estimate_gas().returning(|_| Ok(21000));
        chain.expect_pending_nonce_at().returning(|_| Ok(0));

        let mut job = job(JobType::EthTransaction);
        crafter().execute(&chain, &mut job).await.unwrap();

        assert_eq!(job.transaction.transaction_type, Some(TransactionType::Legacy));
        assert_single_fee_scheme(&job);
    }

    #[tokio::test]
    async fn test_crafting_is_idempotent() {
        // No expectations: any chain call fails the test
        let chain = MockChainClient::new();

        let mut job = job(JobType::EthTransaction);
        job.transaction.transaction_type = Some(TransactionType::DynamicFee);
        job.transaction.gas_fee_cap = Some(U256::from(2_500_000_000u64));
        job.transaction.gas_tip_cap = Some(U256::from(1_500_000_000u64));
        job.transaction.gas = Some(21000);
        job.transaction.nonce = Some(4);
        let before = job.clone();

        let crafter = crafter();
        crafter.execute(&chain, &mut job).await.unwrap();
        assert_eq!(job, before);
        crafter.execute(&chain, &mut job).await.unwrap();
        assert_eq!(job, before);
    }

    #[tokio::test]
    async fn test_resend_recomputes_dynamic_fee() {
        let mut chain = MockChainClient::new();
        chain
            .expect_fee_history()
            .times(1)
            .returning(|_, _| Ok(history(3_000_000_000)));

        let mut job = job(JobType::EthTransaction);
        job.internal_data.resend = true;
        job.transaction.transaction_type = Some(TransactionType::DynamicFee);
        job.transaction.gas_fee_cap = Some(U256::from(2_500_000_000u64));
        job.transaction.gas_tip_cap = Some(U256::from(1_500_000_000u64));
        job.transaction.gas = Some(21000);
        job.transaction.nonce = Some(4);

        crafter().execute(&chain, &mut job).await.unwrap();
        assert_eq!(job.transaction.gas_fee_cap, Some(U256::from(4_500_000_000u64)));
        assert_eq!(job.transaction.nonce, Some(4));
    }

    #[tokio::test]
    async fn test_eea_marking_uses_precompile_and_placeholder() {
        let precompile: Address = "0x000000000000000000000000000000000000007e".parse().unwrap();
        let mut chain = MockChainClient::new();
        chain
            .expect_eea_priv_precompiled_contract_addr()
            .times(1)
            .returning(move || Ok(precompile));
        chain
            .expect_suggest_gas_price()
            .returning(|| Ok(U256::from(1000)));
        chain
            .expect_estimate_gas()
            .withf(move |call| {
                call.to_addr() == Some(&precompile)
                    && call.data().map(|d| d.len()) == Some(64)
            })
            .times(1)
            .returning(|_| Ok(30000));
        chain.expect_pending_nonce_at().returning(|_| Ok(2));

        let mut job = job(JobType::EeaMarkingTransaction);
        job.transaction.transaction_type = Some(TransactionType::Legacy);
        job.transaction.data = Some(Bytes::from(vec![0xab; 10]));
        crafter().execute(&chain, &mut job).await.unwrap();

        assert_eq!(job.transaction.to, Some(precompile));
        assert_eq!(job.transaction.data, Some(Bytes::from(vec![0xab; 10])));
        assert_eq!(job.transaction.gas, Some(30000));
    }

    #[tokio::test]
    async fn test_eea_private_skips_pricing_and_estimation() {
        let mut chain = MockChainClient::new();
        chain
            .expect_priv_nonce()
            .times(1)
            .returning(|_, _| Ok(6));

        let mut job = job(JobType::EeaPrivateTransaction);
        job.transaction.privacy_group_id = Some("kAbelwaVW7okoEn1+okO+AbA4Hhz/7DaCOWVQz9nx5M=".into());
        crafter().execute(&chain, &mut job).await.unwrap();

        assert_eq!(job.transaction.transaction_type, Some(TransactionType::Legacy));
        assert_eq!(job.transaction.gas_price, None);
        assert_eq!(job.transaction.gas, None);
        assert_eq!(job.transaction.nonce, Some(6));
    }

    #[tokio::test]
    async fn test_one_time_key_job() {
        let mut chain = MockChainClient::new();
        chain
            .expect_suggest_gas_price()
            .returning(|| Ok(U256::from(1000)));
        chain
            .expect_estimate_gas()
            .withf(|call| call.from() == Some(&Address::from_low_u64_be(1)))
            .times(1)
            .returning(|_| Ok(21000));

        let mut job = job(JobType::EthTransaction);
        job.transaction.from = None;
        job.internal_data.one_time_key = true;
        crafter().execute(&chain, &mut job).await.unwrap();

        assert_eq!(job.transaction.transaction_type, Some(TransactionType::Legacy));
        assert_eq!(job.transaction.nonce, Some(0));
    }

    #[tokio::test]
    async fn test_estimation_failure_propagates() {
        let mut chain = MockChainClient::new();
        chain
            .expect_suggest_gas_price()
            .returning(|| Ok(U256::from(1000)));
        chain
            .expect_estimate_gas()
            .returning(|_| Err(SenderError::GasEstimation("execution reverted".into())));

        let mut job = job(JobType::EthTransaction);
        job.transaction.transaction_type = Some(TransactionType::Legacy);
        let err = crafter().execute(&chain, &mut job).await.unwrap_err();
        assert!(matches!(err, SenderError::GasEstimation(_)));
        assert_eq!(job.transaction.nonce, None);
    }
}
