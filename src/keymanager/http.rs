//! HTTP client for the key manager API

use super::{
    KeyManagerClient, SignEeaTransactionRequest, SignEthTransactionRequest,
    SignQuorumPrivateTransactionRequest,
};
use crate::error::{SenderError, SenderResult};

use async_trait::async_trait;
use ethers::types::Address;
use reqwest::StatusCode;
use serde::Serialize;
use tracing::debug;

/// Header carrying the tenant the account is looked up under
pub const TENANT_HEADER: &str = "X-Tenant-ID";

pub struct HttpKeyManagerClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpKeyManagerClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn sign_url(&self, address: Address, operation: &str) -> String {
        format!(
            "{}/ethereum/accounts/{:?}/{}",
            self.base_url, address, operation
        )
    }

    async fn sign<T: Serialize + Sync>(
        &self,
        tenant: &str,
        address: Address,
        operation: &str,
        request: &T,
    ) -> SenderResult<String> {
        let url = self.sign_url(address, operation);
        debug!(%tenant, %url, "requesting signature");

        let response = self
            .client
            .post(&url)
            .header(TENANT_HEADER, tenant)
            .json(request)
            .send()
            .await
            .map_err(|e| SenderError::KeyManager {
                status: 0,
                message: e.to_string(),
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| SenderError::KeyManager {
            status: status.as_u16(),
            message: e.to_string(),
        })?;

        match status {
            s if s.is_success() => Ok(parse_signature_body(&body)),
            StatusCode::NOT_FOUND => Err(SenderError::NotFound(format!(
                "account {:?} not found in tenant {}",
                address, tenant
            ))),
            s => Err(SenderError::KeyManager {
                status: s.as_u16(),
                message: body,
            }),
        }
    }
}

/// Signatures come back either as a bare string or a JSON string
fn parse_signature_body(body: &str) -> String {
    body.trim().trim_matches('"').to_string()
}

#[async_trait]
impl KeyManagerClient for HttpKeyManagerClient {
    async fn eth_sign_transaction(
        &self,
        tenant: &str,
        address: Address,
        request: &SignEthTransactionRequest,
    ) -> SenderResult<String> {
        self.sign(tenant, address, "sign-transaction", request).await
    }

    async fn eth_sign_eea_transaction(
        &self,
        tenant: &str,
        address: Address,
        request: &SignEeaTransactionRequest,
    ) -> SenderResult<String> {
        self.sign(tenant, address, "sign-eea-transaction", request)
            .await
    }

    async fn eth_sign_quorum_private_transaction(
        &self,
        tenant: &str,
        address: Address,
        request: &SignQuorumPrivateTransactionRequest,
    ) -> SenderResult<String> {
        self.sign(tenant, address, "sign-quorum-private-transaction", request)
            .await
    }
}
