//! Chain client with multi-RPC support and automatic failover

use super::ChainClient;
use crate::config::ChainConfig;
use crate::error::{SenderError, SenderResult};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use ethers::providers::{Http, Middleware, Provider, ProviderError, RpcError};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, BlockNumber, Bytes, FeeHistory, H256, U256};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Ethers-backed [`ChainClient`]
pub struct EthersChainClient {
    /// Chain configuration
    config: ChainConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
    /// Client for the Tessera third-party API
    http_client: reqwest::Client,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QuorumPrivateArgs<'a> {
    private_for: &'a [String],
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    mandatory_for: &'a [String],
    privacy_flag: i32,
}

#[derive(Serialize)]
struct StoreRawRequest<'a> {
    payload: String,
    from: &'a str,
}

#[derive(Deserialize)]
struct StoreRawResponse {
    key: String,
}

impl EthersChainClient {
    /// Create a new chain client
    pub fn new(config: ChainConfig) -> SenderResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", config.uuid, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(SenderError::ChainConnection {
                chain_uuid: config.uuid,
                message: "No valid RPC providers".to_string(),
            });
        }

        Ok(Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
            http_client: reqwest::Client::new(),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.config.uuid, next);
    }

    /// Run a read-only call, moving to the next provider on transport errors.
    ///
    /// Errors returned by the node itself are not retried elsewhere.
    async fn read<T, F, Fut>(&self, operation: &str, call: F) -> SenderResult<T>
    where
        F: Fn(Provider<Http>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut last_error = String::new();

        for _ in 0..self.http_providers.len() {
            match call(self.http().clone()).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if let Some(rpc_error) = e.as_error_response() {
                        return Err(SenderError::ChainConnection {
                            chain_uuid: self.config.uuid,
                            message: format!("{} rejected: {}", operation, rpc_error.message),
                        });
                    }
                    warn!(
                        "Failed to {} on chain {}: {}",
                        operation, self.config.uuid, e
                    );
                    last_error = e.to_string();
                    self.failover();
                }
            }
        }

        Err(SenderError::ChainConnection {
            chain_uuid: self.config.uuid,
            message: format!("All providers failed to {}: {}", operation, last_error),
        })
    }

    /// Broadcast on the active provider
    async fn send<T, P>(&self, method: &str, params: P) -> SenderResult<T>
    where
        T: serde::de::DeserializeOwned + Serialize + std::fmt::Debug + Send,
        P: Serialize + std::fmt::Debug + Send + Sync,
    {
        self.http()
            .request::<P, T>(method, params)
            .await
            .map_err(|e| self.send_error(method, e))
    }

    fn send_error(&self, method: &str, e: ProviderError) -> SenderError {
        match e.as_error_response() {
            // Keep the node message intact, nonce recovery matches on it
            Some(rpc_error) => SenderError::Transaction(rpc_error.message.clone()),
            None => SenderError::ChainConnection {
                chain_uuid: self.config.uuid,
                message: format!("{}: {}", method, e),
            },
        }
    }

    fn to_u64(&self, value: U256, what: &str) -> SenderResult<u64> {
        if value > U256::from(u64::MAX) {
            return Err(SenderError::ChainConnection {
                chain_uuid: self.config.uuid,
                message: format!("{} does not fit in 64 bits: {}", what, value),
            });
        }
        Ok(value.as_u64())
    }

    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }
}

#[async_trait]
impl ChainClient for EthersChainClient {
    async fn estimate_gas(&self, call: &TypedTransaction) -> SenderResult<u64> {
        let gas = self
            .read("estimate gas", |p| {
                let call = call.clone();
                async move { p.estimate_gas(&call, None).await }
            })
            .await
            .map_err(|e| SenderError::GasEstimation(e.to_string()))?;

        self.to_u64(gas, "gas estimate")
    }

    async fn suggest_gas_price(&self) -> SenderResult<U256> {
        self.read("get gas price", |p| async move { p.get_gas_price().await })
            .await
    }

    async fn fee_history(
        &self,
        block_count: u64,
        newest_block: BlockNumber,
    ) -> SenderResult<FeeHistory> {
        self.read("get fee history", |p| async move {
            p.fee_history(block_count, newest_block, &[]).await
        })
        .await
    }

    async fn pending_nonce_at(&self, address: Address) -> SenderResult<u64> {
        let nonce = self
            .read("get pending nonce", |p| async move {
                p.get_transaction_count(address, Some(BlockNumber::Pending.into()))
                    .await
            })
            .await?;

        self.to_u64(nonce, "nonce")
    }

    async fn priv_nonce(&self, address: Address, privacy_group_id: &str) -> SenderResult<u64> {
        let nonce: U256 = self
            .read("get privacy group nonce", |p| {
                let group = privacy_group_id.to_string();
                async move { p.request("priv_getTransactionCount", (address, group)).await }
            })
            .await?;

        self.to_u64(nonce, "nonce")
    }

    async fn priv_eea_nonce(
        &self,
        address: Address,
        private_from: &str,
        private_for: &[String],
    ) -> SenderResult<u64> {
        let nonce: U256 = self
            .read("get eea nonce", |p| {
                let params = (address, private_from.to_string(), private_for.to_vec());
                async move { p.request("priv_getEeaTransactionCount", params).await }
            })
            .await?;

        self.to_u64(nonce, "nonce")
    }

    async fn eea_priv_precompiled_contract_addr(&self) -> SenderResult<Address> {
        self.read("get privacy precompile address", |p| async move {
            p.request("priv_getPrivacyPrecompileAddress", ()).await
        })
        .await
    }

    async fn send_raw_transaction(&self, raw: &Bytes) -> SenderResult<H256> {
        self.send("eth_sendRawTransaction", [raw]).await
    }

    async fn priv_distribute_raw_transaction(&self, raw: &Bytes) -> SenderResult<H256> {
        self.send("priv_distributeRawTransaction", [raw]).await
    }

    async fn send_quorum_raw_private_transaction(
        &self,
        raw: &Bytes,
        private_for: &[String],
        mandatory_for: &[String],
        privacy_flag: i32,
    ) -> SenderResult<H256> {
        let args = QuorumPrivateArgs {
            private_for,
            mandatory_for,
            privacy_flag,
        };
        self.send("eth_sendRawPrivateTransaction", (raw, args)).await
    }

    async fn store_raw(&self, data: &Bytes, private_from: &str) -> SenderResult<String> {
        let tessera_url = self.config.tessera_url.as_deref().ok_or_else(|| {
            SenderError::InvalidParameter(format!(
                "no Tessera endpoint configured for chain {}",
                self.config.uuid
            ))
        })?;

        let request = StoreRawRequest {
            payload: BASE64_STANDARD.encode(data.as_ref()),
            from: private_from,
        };

        let response = self
            .http_client
            .post(format!("{}/storeraw", tessera_url.trim_end_matches('/')))
            .json(&request)
            .send()
            .await
            .map_err(|e| SenderError::ChainConnection {
                chain_uuid: self.config.uuid,
                message: format!("storeraw: {}", e),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SenderError::Transaction(format!(
                "Tessera storeraw failed ({}): {}",
                status, body
            )));
        }

        let stored: StoreRawResponse = response.json().await.map_err(|e| {
            SenderError::Encoding(format!("invalid Tessera storeraw response: {}", e))
        })?;

        Ok(stored.key)
    }
}
