//! Ethereum transaction carried by a job

use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};

/// Fee pricing scheme of a public transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Legacy,
    DynamicFee,
}

/// Transaction fields, filled in progressively by crafting and signing.
///
/// Unset fields are `None` so a job can re-enter the pipeline and keep what
/// an earlier attempt already computed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EthTransaction {
    pub from: Option<Address>,
    pub to: Option<Address>,
    pub nonce: Option<u64>,
    pub value: Option<U256>,
    pub data: Option<Bytes>,
    pub gas: Option<u64>,
    pub gas_price: Option<U256>,
    pub gas_fee_cap: Option<U256>,
    pub gas_tip_cap: Option<U256>,
    pub transaction_type: Option<TransactionType>,
    pub raw: Option<Bytes>,
    pub hash: Option<H256>,
    pub private_from: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub private_for: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mandatory_for: Vec<String>,
    pub privacy_flag: Option<i32>,
    pub privacy_group_id: Option<String>,
    pub enclave_key: Option<String>,
}

impl EthTransaction {
    pub fn has_dynamic_fee(&self) -> bool {
        self.gas_fee_cap.is_some() || self.gas_tip_cap.is_some()
    }

    /// Drop the EIP-1559 fee fields, used when pricing falls back to legacy
    pub fn clear_dynamic_fee(&mut self) {
        self.gas_fee_cap = None;
        self.gas_tip_cap = None;
    }
}

/// Signer output, ready to broadcast
#[derive(Debug, Clone, PartialEq)]
pub struct SignedTransaction {
    pub raw: Bytes,
    /// Unknown for EEA private transactions until the privacy manager
    /// assigns one
    pub hash: Option<H256>,
}
