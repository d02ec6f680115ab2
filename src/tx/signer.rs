//! Transaction signing
//!
//! Builds the chain-native transaction for a job and signs it either with
//! the key manager (custodied accounts) or with a throwaway key generated
//! for this one transaction.

use super::encoding::{
    decode_signature, eea_signed_raw, eea_signing_payload, eip155_v, quorum_private_v,
    EeaPrivacy,
};
use crate::config::MultiTenancyConfig;
use crate::error::{SenderError, SenderResult};
use crate::keymanager::{
    KeyManagerClient, SignEeaTransactionRequest, SignEthTransactionRequest,
    SignQuorumPrivateTransactionRequest,
};
use crate::types::{Job, SignedTransaction, TransactionType};

use ethers::core::rand::thread_rng;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Eip1559TransactionRequest, NameOrAddress, Signature, TransactionRequest, H256,
};
use ethers::utils::keccak256;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone, Copy)]
enum SignRequest<'a> {
    Eth(&'a SignEthTransactionRequest),
    Eea(&'a SignEeaTransactionRequest),
    QuorumPrivate(&'a SignQuorumPrivateTransactionRequest),
}

pub struct TransactionSigner {
    key_manager: Arc<dyn KeyManagerClient>,
    multi_tenancy: MultiTenancyConfig,
}

impl TransactionSigner {
    pub fn new(key_manager: Arc<dyn KeyManagerClient>, multi_tenancy: MultiTenancyConfig) -> Self {
        Self {
            key_manager,
            multi_tenancy,
        }
    }

    /// Sign a public legacy (EIP-155) or dynamic fee (EIP-1559) transaction
    pub async fn sign_public(&self, job: &mut Job) -> SenderResult<SignedTransaction> {
        let chain_id = chain_id(job)?;
        let typed = public_transaction(job, chain_id);
        let sighash = typed.sighash();

        let mut signature = if job.is_one_time_key() {
            sign_ephemeral(job, sighash)?
        } else {
            let request = eth_request(job, chain_id);
            self.sign_remote(job, SignRequest::Eth(&request)).await?
        };

        if let TypedTransaction::Legacy(_) = typed {
            signature.v = eip155_v(signature.v, chain_id);
        }

        let raw = typed.rlp_signed(&signature);
        let hash = H256::from(keccak256(&raw));
        debug!(job_uuid = %job.uuid, tx_hash = ?hash, "public transaction signed");

        Ok(SignedTransaction {
            raw,
            hash: Some(hash),
        })
    }

    /// Sign an EEA private transaction.
    ///
    /// The hash is left unset, the privacy manager assigns it on distribution.
    pub async fn sign_eea(&self, job: &mut Job) -> SenderResult<SignedTransaction> {
        let chain_id = chain_id(job)?;
        let privacy = EeaPrivacy::from_transaction(&job.transaction)?;
        let payload = eea_signing_payload(&job.transaction, chain_id, &privacy);
        let sighash = H256::from(keccak256(&payload));

        let mut signature = if job.is_one_time_key() {
            sign_ephemeral(job, sighash)?
        } else {
            let request = eea_request(job, chain_id)?;
            self.sign_remote(job, SignRequest::Eea(&request)).await?
        };
        signature.v = eip155_v(signature.v, chain_id);

        let raw = eea_signed_raw(&job.transaction, &signature, &privacy);
        debug!(job_uuid = %job.uuid, "eea private transaction signed");

        Ok(SignedTransaction { raw, hash: None })
    }

    /// Sign a Quorum private (Tessera marking) transaction
    pub async fn sign_quorum_private(&self, job: &mut Job) -> SenderResult<SignedTransaction> {
        let typed = quorum_private_transaction(job);
        let sighash = typed.sighash();

        let mut signature = if job.is_one_time_key() {
            sign_ephemeral(job, sighash)?
        } else {
            let request = quorum_private_request(job);
            self.sign_remote(job, SignRequest::QuorumPrivate(&request))
                .await?
        };
        signature.v = quorum_private_v(signature.v);

        let raw = typed.rlp_signed(&signature);
        let hash = H256::from(keccak256(&raw));
        debug!(job_uuid = %job.uuid, tx_hash = ?hash, "quorum private transaction signed");

        Ok(SignedTransaction {
            raw,
            hash: Some(hash),
        })
    }

    /// Ask the key manager for a signature, trying each tenant the job may
    /// use until one custodies the account
    async fn sign_remote(&self, job: &Job, request: SignRequest<'_>) -> SenderResult<Signature> {
        let from = job.transaction.from.ok_or_else(|| {
            SenderError::InvalidParameter("from is required to sign with the key manager".into())
        })?;

        for tenant in self.multi_tenancy.allowed_tenants(&job.tenant_id) {
            let result = match request {
                SignRequest::Eth(r) => self.key_manager.eth_sign_transaction(&tenant, from, r).await,
                SignRequest::Eea(r) => {
                    self.key_manager
                        .eth_sign_eea_transaction(&tenant, from, r)
                        .await
                }
                SignRequest::QuorumPrivate(r) => {
                    self.key_manager
                        .eth_sign_quorum_private_transaction(&tenant, from, r)
                        .await
                }
            };

            match result {
                Ok(signature) => return decode_signature(&signature),
                Err(e) if e.is_not_found() => {
                    debug!(job_uuid = %job.uuid, %tenant, "account not custodied under tenant");
                }
                Err(e) => return Err(e),
            }
        }

        Err(SenderError::InvalidParameter(format!(
            "account {:?} not found",
            from
        )))
    }
}

fn chain_id(job: &Job) -> SenderResult<u64> {
    job.internal_data
        .chain_id
        .ok_or_else(|| SenderError::InvalidParameter("chain id is required to sign".into()))
}

/// Sign with a key that only ever signs this transaction
fn sign_ephemeral(job: &mut Job, sighash: H256) -> SenderResult<Signature> {
    let wallet = LocalWallet::new(&mut thread_rng());
    let mut signature = wallet
        .sign_hash(sighash)
        .map_err(|e| SenderError::CryptoOperation(e.to_string()))?;
    // 27/28 from the wallet, back to a recovery id
    signature.v -= 27;

    debug!(job_uuid = %job.uuid, from = ?wallet.address(), "signed with one-time key");
    job.transaction.from = Some(wallet.address());
    Ok(signature)
}

fn public_transaction(job: &Job, chain_id: u64) -> TypedTransaction {
    let tx = &job.transaction;
    let to = tx.to.map(NameOrAddress::Address);

    match tx.transaction_type {
        Some(TransactionType::DynamicFee) => TypedTransaction::Eip1559(Eip1559TransactionRequest {
            from: tx.from,
            to,
            gas: tx.gas.map(Into::into),
            value: tx.value,
            data: tx.data.clone(),
            nonce: tx.nonce.map(Into::into),
            max_priority_fee_per_gas: tx.gas_tip_cap,
            max_fee_per_gas: tx.gas_fee_cap,
            chain_id: Some(chain_id.into()),
            ..Default::default()
        }),
        _ => TypedTransaction::Legacy(TransactionRequest {
            from: tx.from,
            to,
            gas: tx.gas.map(Into::into),
            gas_price: tx.gas_price,
            value: tx.value,
            data: tx.data.clone(),
            nonce: tx.nonce.map(Into::into),
            chain_id: Some(chain_id.into()),
            ..Default::default()
        }),
    }
}

/// Homestead transaction, Quorum private signatures carry no chain id
fn quorum_private_transaction(job: &Job) -> TypedTransaction {
    let tx = &job.transaction;
    TypedTransaction::Legacy(TransactionRequest {
        from: tx.from,
        to: tx.to.map(NameOrAddress::Address),
        gas: tx.gas.map(Into::into),
        gas_price: tx.gas_price,
        value: tx.value,
        data: tx.data.clone(),
        nonce: tx.nonce.map(Into::into),
        chain_id: None,
        ..Default::default()
    })
}

fn eth_request(job: &Job, chain_id: u64) -> SignEthTransactionRequest {
    let tx = &job.transaction;
    SignEthTransactionRequest {
        nonce: tx.nonce.unwrap_or_default(),
        to: tx.to,
        value: tx.value.unwrap_or_default(),
        gas_price: tx.gas_price,
        gas_limit: tx.gas.unwrap_or_default(),
        data: tx.data.clone().unwrap_or_default(),
        chain_id,
        transaction_type: tx.transaction_type.unwrap_or(TransactionType::Legacy),
        max_fee_per_gas: tx.gas_fee_cap,
        max_priority_fee_per_gas: tx.gas_tip_cap,
    }
}

fn eea_request(job: &Job, chain_id: u64) -> SenderResult<SignEeaTransactionRequest> {
    let tx = &job.transaction;
    let private_from = tx
        .private_from
        .clone()
        .ok_or_else(|| SenderError::InvalidParameter("privateFrom is required".into()))?;

    Ok(SignEeaTransactionRequest {
        nonce: tx.nonce.unwrap_or_default(),
        to: tx.to,
        value: tx.value.unwrap_or_default(),
        gas_price: tx.gas_price.unwrap_or_default(),
        gas_limit: tx.gas.unwrap_or_default(),
        data: tx.data.clone().unwrap_or_default(),
        chain_id,
        private_from,
        private_for: tx.private_for.clone(),
        privacy_group_id: tx.privacy_group_id.clone(),
    })
}

fn quorum_private_request(job: &Job) -> SignQuorumPrivateTransactionRequest {
    let tx = &job.transaction;
    SignQuorumPrivateTransactionRequest {
        nonce: tx.nonce.unwrap_or_default(),
        to: tx.to,
        value: tx.value.unwrap_or_default(),
        gas_price: tx.gas_price.unwrap_or_default(),
        gas_limit: tx.gas.unwrap_or_default(),
        data: tx.data.clone().unwrap_or_default(),
    }
}
