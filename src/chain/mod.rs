//! Chain module - access to the blockchain nodes and privacy enclaves
//!
//! This module provides:
//! - The [`ChainClient`] contract consumed by crafting, nonce management and senders
//! - A registry of clients indexed by chain UUID
//! - An ethers-based JSON-RPC implementation with automatic failover

pub mod provider;

pub use provider::EthersChainClient;

use crate::config::Settings;
use crate::error::{SenderError, SenderResult};

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, BlockNumber, Bytes, FeeHistory, H256, U256};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Node and enclave operations needed by the sender pipeline
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn estimate_gas(&self, call: &TypedTransaction) -> SenderResult<u64>;

    async fn suggest_gas_price(&self) -> SenderResult<U256>;

    async fn fee_history(&self, block_count: u64, newest_block: BlockNumber)
        -> SenderResult<FeeHistory>;

    async fn pending_nonce_at(&self, address: Address) -> SenderResult<u64>;

    /// Next nonce of `address` inside a Besu privacy group
    async fn priv_nonce(&self, address: Address, privacy_group_id: &str) -> SenderResult<u64>;

    /// Next nonce of `address` for an EEA recipient list
    async fn priv_eea_nonce(
        &self,
        address: Address,
        private_from: &str,
        private_for: &[String],
    ) -> SenderResult<u64>;

    async fn eea_priv_precompiled_contract_addr(&self) -> SenderResult<Address>;

    async fn send_raw_transaction(&self, raw: &Bytes) -> SenderResult<H256>;

    async fn priv_distribute_raw_transaction(&self, raw: &Bytes) -> SenderResult<H256>;

    async fn send_quorum_raw_private_transaction(
        &self,
        raw: &Bytes,
        private_for: &[String],
        mandatory_for: &[String],
        privacy_flag: i32,
    ) -> SenderResult<H256>;

    /// Store a private payload in Tessera, returning the enclave key
    async fn store_raw(&self, data: &Bytes, private_from: &str) -> SenderResult<String>;
}

/// Chain clients indexed by chain UUID
#[derive(Default)]
pub struct ChainManager {
    clients: DashMap<Uuid, Arc<dyn ChainClient>>,
}

impl ChainManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a client for every enabled chain
    pub fn from_settings(settings: &Settings) -> SenderResult<Self> {
        let manager = Self::new();

        for (name, chain_config) in settings.enabled_chains() {
            info!(
                "Initializing chain {} (UUID: {}, ID: {})",
                name, chain_config.uuid, chain_config.chain_id
            );
            let client = EthersChainClient::new(chain_config.clone())?;
            manager.insert(chain_config.uuid, Arc::new(client));
        }

        Ok(manager)
    }

    pub fn insert(&self, chain_uuid: Uuid, client: Arc<dyn ChainClient>) {
        self.clients.insert(chain_uuid, client);
    }

    /// Get client for a specific chain
    pub fn get_client(&self, chain_uuid: Uuid) -> SenderResult<Arc<dyn ChainClient>> {
        self.clients
            .get(&chain_uuid)
            .map(|c| c.clone())
            .ok_or(SenderError::ChainNotFound { chain_uuid })
    }

    /// Get all registered chain UUIDs
    pub fn connected_chains(&self) -> Vec<Uuid> {
        self.clients.iter().map(|e| *e.key()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_client() {
        let manager = ChainManager::new();
        let chain_uuid = Uuid::new_v4();
        manager.insert(chain_uuid, Arc::new(MockChainClient::new()));

        assert!(manager.get_client(chain_uuid).is_ok());
        assert_eq!(manager.connected_chains(), vec![chain_uuid]);

        let missing = Uuid::new_v4();
        match manager.get_client(missing) {
            Err(SenderError::ChainNotFound { chain_uuid }) => assert_eq!(chain_uuid, missing),
            _ => panic!("expected ChainNotFound"),
        }
    }
}
