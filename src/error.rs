//! Error types for the transaction sender

use thiserror::Error;
use uuid::Uuid;

/// Main error type for the sender pipeline
#[derive(Error, Debug)]
pub enum SenderError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Chain {chain_uuid} not found")]
    ChainNotFound { chain_uuid: Uuid },

    #[error("Chain connection error for chain {chain_uuid}: {message}")]
    ChainConnection { chain_uuid: Uuid, message: String },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Gas estimation error: {0}")]
    GasEstimation(String),

    /// Nonce conflict that was recovered locally; the job must be crafted again.
    #[error("Invalid nonce: {0}")]
    InvalidNonce(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Crypto operation error: {0}")]
    CryptoOperation(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Key manager error ({status}): {message}")]
    KeyManager { status: u16, message: String },

    #[error("Job API error: {0}")]
    JobApi(String),

    #[error("Nonce store error: {0}")]
    Store(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("{component}: {source}")]
    Component {
        component: &'static str,
        #[source]
        source: Box<SenderError>,
    },
}

impl SenderError {
    /// Tag the error with the pipeline step it came from
    pub fn extend_component(self, component: &'static str) -> Self {
        SenderError::Component {
            component,
            source: Box::new(self),
        }
    }

    /// Innermost error, looking through component tags
    pub fn kind(&self) -> &SenderError {
        match self {
            SenderError::Component { source, .. } => source.kind(),
            other => other,
        }
    }

    /// Check if the job can be run again right away
    pub fn is_recoverable(&self) -> bool {
        matches!(self.kind(), SenderError::InvalidNonce(_))
    }

    /// Check if error is a transient failure of a remote service
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            SenderError::ChainConnection { .. } | SenderError::Timeout { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.kind(), SenderError::NotFound(_))
    }
}

impl From<redis::RedisError> for SenderError {
    fn from(e: redis::RedisError) -> Self {
        SenderError::Store(e.to_string())
    }
}

/// Result type for sender operations
pub type SenderResult<T> = Result<T, SenderError>;
