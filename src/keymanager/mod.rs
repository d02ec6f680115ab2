//! Remote key custody - signing contract and payloads
//!
//! Private keys never leave the key manager: the sender ships transaction
//! parameters and gets a signature back.

mod http;

pub use http::HttpKeyManagerClient;

use crate::error::SenderResult;
use crate::types::TransactionType;

use async_trait::async_trait;
use ethers::types::{Address, Bytes, U256};
use serde::Serialize;

/// Public (EIP-155 or EIP-1559) transaction to sign
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignEthTransactionRequest {
    pub nonce: u64,
    pub to: Option<Address>,
    pub value: U256,
    pub gas_price: Option<U256>,
    pub gas_limit: u64,
    pub data: Bytes,
    pub chain_id: u64,
    pub transaction_type: TransactionType,
    pub max_fee_per_gas: Option<U256>,
    pub max_priority_fee_per_gas: Option<U256>,
}

/// EEA private transaction to sign
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignEeaTransactionRequest {
    pub nonce: u64,
    pub to: Option<Address>,
    pub value: U256,
    pub gas_price: U256,
    pub gas_limit: u64,
    pub data: Bytes,
    pub chain_id: u64,
    pub private_from: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub private_for: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub privacy_group_id: Option<String>,
}

/// Quorum private (Tessera marking) transaction to sign
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignQuorumPrivateTransactionRequest {
    pub nonce: u64,
    pub to: Option<Address>,
    pub value: U256,
    pub gas_price: U256,
    pub gas_limit: u64,
    pub data: Bytes,
}

/// Signing operations of the key manager.
///
/// Each call returns the hex encoded 65 byte signature, or a `NotFound`
/// error when `address` is not custodied under `tenant`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyManagerClient: Send + Sync {
    async fn eth_sign_transaction(
        &self,
        tenant: &str,
        address: Address,
        request: &SignEthTransactionRequest,
    ) -> SenderResult<String>;

    async fn eth_sign_eea_transaction(
        &self,
        tenant: &str,
        address: Address,
        request: &SignEeaTransactionRequest,
    ) -> SenderResult<String>;

    async fn eth_sign_quorum_private_transaction(
        &self,
        tenant: &str,
        address: Address,
        request: &SignQuorumPrivateTransactionRequest,
    ) -> SenderResult<String>;
}
