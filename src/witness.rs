//! # Witness Packing
//!
//! Script-path spends in this protocol assemble their own stacks (3 or 4 items), so the
//! witness is serialized here explicitly: compact-size item count, then each item as
//! compact-size length followed by its bytes.

use bitcoin::consensus::deserialize;
use bitcoin::Witness;

use crate::error::{SwapError, SwapResult};

/// Immutable witness stack builder
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WitnessBuilder {
    items: Vec<Vec<u8>>,
}

impl WitnessBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a builder with `item` pushed on top.
    #[must_use]
    pub fn push_item(self, item: impl AsRef<[u8]>) -> Self {
        let mut items = self.items;
        items.push(item.as_ref().to_vec());
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Consensus serialization of the stack
    pub fn finish(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_compact_size(&mut out, self.items.len() as u64);
        for item in &self.items {
            write_compact_size(&mut out, item.len() as u64);
            out.extend_from_slice(item);
        }
        out
    }

    /// Decode [`finish`](Self::finish) into the stack placed on a transaction input.
    pub fn into_witness(self) -> SwapResult<Witness> {
        deserialize(&self.finish())
            .map_err(|e| SwapError::transaction(format!("witness stack: {}", e)))
    }
}

/// Bitcoin CompactSize (varint) encoding
pub fn write_compact_size(out: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => out.push(n as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&n.to_le_bytes());
        }
    }
}

/// Strip an optional trailing `SIGHASH_DEFAULT` byte from a BIP340 signature.
///
/// Anything other than 64 bytes, or 65 bytes ending in `0x00`, is rejected.
pub fn normalize_schnorr_signature(sig: &[u8]) -> SwapResult<[u8; 64]> {
    let bare = match sig.len() {
        64 => sig,
        65 if sig[64] == 0x00 => &sig[..64],
        65 => {
            return Err(SwapError::InvalidSignature {
                message: format!(
                    "65-byte signature carries sighash type {:#04x}, expected SIGHASH_DEFAULT",
                    sig[64]
                ),
            })
        }
        n => {
            return Err(SwapError::InvalidSignature {
                message: format!("schnorr signature must be 64 bytes, got {}", n),
            })
        }
    };
    let mut out = [0u8; 64];
    out.copy_from_slice(bare);
    Ok(out)
}
