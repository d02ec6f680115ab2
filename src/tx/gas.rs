//! Fee pricing for legacy and EIP-1559 transactions
//!
//! Pricing is an ordered list of strategies. A strategy either prices the
//! transaction or hands over to the next one with a [`FallbackReason`].

use crate::chain::ChainClient;
use crate::error::SenderResult;
use crate::types::{Job, JobType, Priority, TransactionType};

use ethers::types::{BlockNumber, FeeHistory, U256};
use std::fmt;
use tracing::debug;

pub const GWEI: u64 = 1_000_000_000;

/// Blocks requested from `eth_feeHistory`
const FEE_HISTORY_BLOCKS: u64 = 1;

/// Suggested gas price multiplier, in tenths
fn gas_price_multiplier(priority: Priority) -> u64 {
    match priority {
        Priority::VeryLow => 6,
        Priority::Low => 8,
        Priority::Medium => 10,
        Priority::High => 12,
        Priority::VeryHigh => 14,
    }
}

/// Scale a suggested gas price by the job priority
pub fn apply_priority(gas_price: U256, priority: Priority) -> U256 {
    gas_price * U256::from(gas_price_multiplier(priority)) / U256::from(10)
}

/// EIP-1559 priority tip in wei
pub fn priority_tip(priority: Priority) -> U256 {
    let half_gwei = GWEI / 2;
    let tip = match priority {
        Priority::VeryLow => half_gwei,
        Priority::Low => 2 * half_gwei,
        Priority::Medium => 3 * half_gwei,
        Priority::High => 4 * half_gwei,
        Priority::VeryHigh => 5 * half_gwei,
    };
    U256::from(tip)
}

/// Why a dynamic fee could not be computed
#[derive(Debug, Clone, PartialEq)]
pub enum FallbackReason {
    FeeHistoryUnavailable(String),
    NoBaseFee,
    ZeroBaseFee,
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::FeeHistoryUnavailable(e) => write!(f, "fee history unavailable: {}", e),
            FallbackReason::NoBaseFee => write!(f, "fee history has no base fee"),
            FallbackReason::ZeroBaseFee => write!(f, "next base fee is zero"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeeOutcome {
    Applied,
    Fallback(FallbackReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeStrategy {
    DynamicFee,
    LegacyGasPrice,
}

impl FeeStrategy {
    /// Strategies to try, in order, for a transaction type
    pub fn chain_for(tx_type: Option<TransactionType>) -> &'static [FeeStrategy] {
        match tx_type {
            Some(TransactionType::Legacy) => &[FeeStrategy::LegacyGasPrice],
            _ => &[FeeStrategy::DynamicFee, FeeStrategy::LegacyGasPrice],
        }
    }

    pub async fn apply(&self, chain: &dyn ChainClient, job: &mut Job) -> SenderResult<FeeOutcome> {
        match self {
            FeeStrategy::LegacyGasPrice => {
                apply_legacy(chain, job).await?;
                Ok(FeeOutcome::Applied)
            }
            FeeStrategy::DynamicFee => apply_dynamic_fee(chain, job).await,
        }
    }
}

async fn apply_legacy(chain: &dyn ChainClient, job: &mut Job) -> SenderResult<()> {
    let tx = &mut job.transaction;
    tx.transaction_type = Some(TransactionType::Legacy);
    tx.clear_dynamic_fee();

    // Private payloads are not priced
    if job.job_type == JobType::EeaPrivateTransaction || tx.gas_price.is_some() {
        return Ok(());
    }

    let suggested = chain.suggest_gas_price().await?;
    let gas_price = apply_priority(suggested, job.internal_data.priority);
    debug!(
        job_uuid = %job.uuid,
        %suggested,
        %gas_price,
        "gas price set"
    );
    tx.gas_price = Some(gas_price);
    Ok(())
}

async fn apply_dynamic_fee(chain: &dyn ChainClient, job: &mut Job) -> SenderResult<FeeOutcome> {
    // A resend must be repriced, the market may have moved
    if job.transaction.gas_fee_cap.is_some() && !job.is_resend() {
        job.transaction.transaction_type = Some(TransactionType::DynamicFee);
        job.transaction.gas_price = None;
        return Ok(FeeOutcome::Applied);
    }

    let base_fee = match chain
        .fee_history(FEE_HISTORY_BLOCKS, BlockNumber::Latest)
        .await
    {
        Ok(history) => match next_base_fee(&history) {
            Ok(base_fee) => base_fee,
            Err(reason) => return Ok(FeeOutcome::Fallback(reason)),
        },
        Err(e) => {
            return Ok(FeeOutcome::Fallback(FallbackReason::FeeHistoryUnavailable(
                e.to_string(),
            )))
        }
    };

    let tx = &mut job.transaction;
    let tip = tx
        .gas_tip_cap
        .unwrap_or_else(|| priority_tip(job.internal_data.priority));
    let fee_cap = base_fee + tip;
    debug!(
        job_uuid = %job.uuid,
        %base_fee,
        %tip,
        %fee_cap,
        "dynamic fee set"
    );

    tx.gas_tip_cap = Some(tip);
    tx.gas_fee_cap = Some(fee_cap);
    tx.gas_price = None;
    tx.transaction_type = Some(TransactionType::DynamicFee);
    Ok(FeeOutcome::Applied)
}

/// Base fee of the next block, the last entry of the history
pub fn next_base_fee(history: &FeeHistory) -> Result<U256, FallbackReason> {
    match history.base_fee_per_gas.last() {
        None => Err(FallbackReason::NoBaseFee),
        Some(fee) if fee.is_zero() => Err(FallbackReason::ZeroBaseFee),
        Some(fee) => Ok(*fee),
    }
}
