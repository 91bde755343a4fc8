//! Secret / hashlock pairs.
//!
//! The secret is 32 random bytes and the hashlock is its SHA-256. The hashlock goes on
//! chain first; revealing the secret in a redeem witness lets the other chain's leg be
//! claimed with the same preimage.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{SwapError, SwapResult};

/// SHA-256 of `data`
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Parse a fixed 32-byte field
pub fn bytes32(field: &str, bytes: &[u8]) -> SwapResult<[u8; 32]> {
    bytes
        .try_into()
        .map_err(|_| SwapError::length(field, 32, bytes.len()))
}

/// Parse a 32-byte field from hex, accepting an optional `0x` prefix
pub fn bytes32_from_hex(field: &str, value: &str) -> SwapResult<[u8; 32]> {
    let raw = hex::decode(value.trim_start_matches("0x"))?;
    bytes32(field, &raw)
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashPair {
    #[serde(with = "hex::serde")]
    pub secret: [u8; 32],
    #[serde(with = "hex::serde")]
    pub hashlock: [u8; 32],
}

impl HashPair {
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        rand::rng().fill_bytes(&mut secret);
        Self::from_secret(secret)
    }

    pub fn from_secret(secret: [u8; 32]) -> Self {
        Self {
            hashlock: sha256(&secret),
            secret,
        }
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret)
    }

    pub fn hashlock_hex(&self) -> String {
        hex::encode(self.hashlock)
    }
}

impl std::fmt::Debug for HashPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashPair")
            .field("hashlock", &self.hashlock_hex())
            .finish_non_exhaustive()
    }
}

/// Check that `secret` is the preimage of `hashlock`.
pub fn verify_preimage(secret: &[u8], hashlock: &[u8; 32]) -> SwapResult<()> {
    if secret.len() != 32 {
        return Err(SwapError::length("secret", 32, secret.len()));
    }
    let actual = sha256(secret);
    if &actual != hashlock {
        return Err(SwapError::HashlockMismatch {
            expected: hex::encode(hashlock),
            actual: hex::encode(actual),
        });
    }
    Ok(())
}
