//! Transaction pipeline: crafting, nonce management, signing and sending

pub mod crafter;
pub mod encoding;
pub mod gas;
pub mod nonce;
pub mod sender;
pub mod signer;

pub use crafter::CraftTransaction;
pub use nonce::{partition_key, NonceManager};
pub use sender::{
    EeaPrivateSender, PublicTransactionSender, RawTransactionSender, SendTransaction,
    SenderContext, TesseraMarkingSender, TesseraPrivateSender,
};
pub use signer::TransactionSigner;
