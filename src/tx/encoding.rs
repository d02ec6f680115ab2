//! Signature and envelope encoding shared by the signer and the senders

use crate::error::{SenderError, SenderResult};
use crate::types::EthTransaction;

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Bytes, Signature, U256};
use ethers::utils::rlp::{Rlp, RlpStream};

const SIGNATURE_LENGTH: usize = 65;

/// Restriction level of EEA private transactions, the only one supported
const EEA_RESTRICTED: &str = "restricted";

/// Decode a hex `r || s || v` signature, normalising `v` to a recovery id
pub fn decode_signature(signature: &str) -> SenderResult<Signature> {
    let bytes = hex::decode(signature.trim().trim_start_matches("0x"))
        .map_err(|e| SenderError::Encoding(format!("signature is not hex: {}", e)))?;

    if bytes.len() != SIGNATURE_LENGTH {
        return Err(SenderError::Encoding(format!(
            "signature must be {} bytes, got {}",
            SIGNATURE_LENGTH,
            bytes.len()
        )));
    }

    let recovery_id = match bytes[64] {
        v @ (0 | 1) => v,
        v @ (27 | 28) => v - 27,
        v => {
            return Err(SenderError::CryptoOperation(format!(
                "invalid signature recovery byte {}",
                v
            )))
        }
    };

    Ok(Signature {
        r: U256::from_big_endian(&bytes[0..32]),
        s: U256::from_big_endian(&bytes[32..64]),
        v: recovery_id as u64,
    })
}

/// EIP-155 `v` for a recovery id
pub fn eip155_v(recovery_id: u64, chain_id: u64) -> u64 {
    recovery_id + 35 + 2 * chain_id
}

/// `v` marking a Quorum private transaction
pub fn quorum_private_v(recovery_id: u64) -> u64 {
    recovery_id + 37
}

/// Decode a base64 enclave key or privacy group id
pub fn decode_privacy_key(key: &str) -> SenderResult<Vec<u8>> {
    BASE64_STANDARD
        .decode(key)
        .map_err(|e| SenderError::InvalidParameter(format!("invalid privacy key {}: {}", key, e)))
}

#[derive(Debug, Clone, PartialEq)]
pub enum EeaRecipient {
    PrivacyGroup(Vec<u8>),
    PrivateFor(Vec<Vec<u8>>),
}

/// Decoded privacy fields of an EEA private transaction
#[derive(Debug, Clone, PartialEq)]
pub struct EeaPrivacy {
    pub private_from: Vec<u8>,
    pub recipient: EeaRecipient,
}

impl EeaPrivacy {
    /// Privacy group id wins over the recipient list when both are set
    pub fn from_transaction(tx: &EthTransaction) -> SenderResult<Self> {
        let private_from = tx.private_from.as_deref().ok_or_else(|| {
            SenderError::InvalidParameter("privateFrom is required".to_string())
        })?;
        let private_from = decode_privacy_key(private_from)?;

        let recipient = match tx.privacy_group_id.as_deref() {
            Some(group_id) => EeaRecipient::PrivacyGroup(decode_privacy_key(group_id)?),
            None if !tx.private_for.is_empty() => {
                let mut private_for = tx.private_for.clone();
                private_for.sort();
                let keys = private_for
                    .iter()
                    .map(|key| decode_privacy_key(key))
                    .collect::<SenderResult<Vec<_>>>()?;
                EeaRecipient::PrivateFor(keys)
            }
            None => {
                return Err(SenderError::InvalidParameter(
                    "privacyGroupId or privateFor is required".to_string(),
                ))
            }
        };

        Ok(Self {
            private_from,
            recipient,
        })
    }

    fn append(&self, stream: &mut RlpStream) {
        stream.append(&self.private_from);
        match &self.recipient {
            EeaRecipient::PrivacyGroup(group_id) => {
                stream.append(group_id);
            }
            EeaRecipient::PrivateFor(keys) => {
                stream.begin_list(keys.len());
                for key in keys {
                    stream.append(key);
                }
            }
        }
        stream.append(&EEA_RESTRICTED);
    }
}

fn append_eea_base(stream: &mut RlpStream, tx: &EthTransaction) {
    stream.append(&tx.nonce.unwrap_or_default());
    stream.append(&tx.gas_price.unwrap_or_default());
    stream.append(&tx.gas.unwrap_or_default());
    match tx.to {
        Some(to) => stream.append(&to),
        None => stream.append(&""),
    };
    stream.append(&tx.value.unwrap_or_default());
    stream.append(&tx.data.clone().unwrap_or_default().to_vec());
}

/// Payload an EEA private transaction signature commits to
pub fn eea_signing_payload(tx: &EthTransaction, chain_id: u64, privacy: &EeaPrivacy) -> Bytes {
    let mut stream = RlpStream::new_list(12);
    append_eea_base(&mut stream, tx);
    stream.append(&chain_id);
    stream.append(&0u8);
    stream.append(&0u8);
    privacy.append(&mut stream);
    stream.out().freeze().into()
}

/// Signed EEA envelope, `signature.v` already in EIP-155 form
pub fn eea_signed_raw(tx: &EthTransaction, signature: &Signature, privacy: &EeaPrivacy) -> Bytes {
    let mut stream = RlpStream::new_list(12);
    append_eea_base(&mut stream, tx);
    stream.append(&signature.v);
    stream.append(&signature.r);
    stream.append(&signature.s);
    privacy.append(&mut stream);
    stream.out().freeze().into()
}

/// Decode a signed legacy or typed transaction
pub fn decode_signed_transaction(raw: &[u8]) -> SenderResult<(TypedTransaction, Signature)> {
    TypedTransaction::decode_signed(&Rlp::new(raw))
        .map_err(|e| SenderError::Encoding(format!("invalid raw transaction: {}", e)))
}
