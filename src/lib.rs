//! Transaction sender - crafts, signs and broadcasts blockchain transactions
//! on behalf of jobs, keeping every account's nonces in order.
//!
//! Supported variants: public legacy and EIP-1559 transactions, caller-signed
//! raw transactions, EEA private transactions and Tessera private payloads
//! with their marking transactions.

pub mod chain;
pub mod config;
pub mod error;
pub mod keymanager;
pub mod metrics;
pub mod state;
pub mod store;
pub mod tx;
pub mod types;
pub mod worker;

pub use error::{SenderError, SenderResult};
