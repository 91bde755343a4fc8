//! Records exchanged with the chain provider and handed between protocol phases.

use bitcoin::taproot::{ControlBlock, LeafVersion, TapLeafHash};
use bitcoin::{Amount, OutPoint, ScriptBuf, TxOut, Txid};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::protocol::TAPSCRIPT_LEAF_VERSION;
use crate::error::{SwapError, SwapResult};

/// A spendable output reported by the chain provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub txid: Txid,
    pub vout: u32,
    pub value_sat: u64,
}

impl Utxo {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.vout)
    }

    pub fn amount(&self) -> Amount {
        Amount::from_sat(self.value_sat)
    }
}

/// Height and header time of a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub height: u32,
    /// Header timestamp, UNIX seconds
    pub timestamp: u64,
}

impl BlockInfo {
    pub fn datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(i64::try_from(self.timestamp).ok()?, 0)
    }
}

/// One output of a fetched transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutInfo {
    pub value_sat: u64,
    pub script_pubkey: ScriptBuf,
}

/// Transaction detail as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInfo {
    pub outputs: Vec<TxOutInfo>,
    /// Block the transaction confirmed in, `None` while in the mempool
    pub confirmation: Option<BlockInfo>,
}

/// A tapleaf together with the control block proving its inclusion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapLeafRef {
    pub leaf_version: u8,
    pub script: ScriptBuf,
    #[serde(with = "hex::serde")]
    pub control_block: Vec<u8>,
}

impl TapLeafRef {
    pub fn new(script: ScriptBuf, control_block: &ControlBlock) -> Self {
        Self {
            leaf_version: control_block.leaf_version.to_consensus(),
            script,
            control_block: control_block.serialize(),
        }
    }

    /// Contract leaves are tapscript only; any other version is refused.
    pub fn version(&self) -> SwapResult<LeafVersion> {
        if self.leaf_version != TAPSCRIPT_LEAF_VERSION {
            return Err(SwapError::leaf(
                "tapleaf",
                format!(
                    "leaf version {:#04x}, expected {:#04x}",
                    self.leaf_version, TAPSCRIPT_LEAF_VERSION
                ),
            ));
        }
        LeafVersion::from_consensus(self.leaf_version)
            .map_err(|e| SwapError::input("leaf_version", e.to_string()))
    }

    pub fn decode_control_block(&self) -> SwapResult<ControlBlock> {
        ControlBlock::decode(&self.control_block)
            .map_err(|e| SwapError::input("control_block", e.to_string()))
    }

    pub fn leaf_hash(&self) -> SwapResult<TapLeafHash> {
        Ok(TapLeafHash::from_script(&self.script, self.version()?))
    }
}

/// Contract output carried from one phase to the next.
///
/// `leaf` is the tapleaf the next phase intends to reveal. The same output can be
/// referenced through different leaves (cooperative path vs. refund path).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractReference {
    pub txid: Txid,
    pub vout: u32,
    pub value_sat: u64,
    pub script_pubkey: ScriptBuf,
    pub leaf: TapLeafRef,
}

impl ContractReference {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.vout)
    }

    pub fn tx_out(&self) -> TxOut {
        TxOut {
            value: Amount::from_sat(self.value_sat),
            script_pubkey: self.script_pubkey.clone(),
        }
    }

    /// Same output, revealed through another leaf
    pub fn with_leaf(&self, leaf: TapLeafRef) -> Self {
        Self {
            leaf,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    fn sample_reference() -> ContractReference {
        ContractReference {
            txid: Txid::all_zeros(),
            vout: 0,
            value_sat: 100_000,
            script_pubkey: ScriptBuf::from_bytes(vec![0x51, 0x20]),
            leaf: TapLeafRef {
                leaf_version: 0xc0,
                script: ScriptBuf::from_bytes(vec![0xac]),
                control_block: vec![0xc0; 33],
            },
        }
    }

    #[test]
    fn test_contract_reference_json_round_trip() {
        let reference = sample_reference();
        let json = serde_json::to_string(&reference).unwrap();
        assert!(json.contains(&"c0".repeat(33)));

        let parsed: ContractReference = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, reference);
    }

    #[test]
    fn test_with_leaf_keeps_outpoint() {
        let reference = sample_reference();
        let other = TapLeafRef {
            leaf_version: 0xc0,
            script: ScriptBuf::from_bytes(vec![0x75, 0xac]),
            control_block: vec![0xc1; 33],
        };
        let swapped = reference.with_leaf(other.clone());
        assert_eq!(swapped.outpoint(), reference.outpoint());
        assert_eq!(swapped.leaf, other);
    }

    #[test]
    fn test_leaf_version_must_be_tapscript() {
        let mut leaf = sample_reference().leaf;
        assert_eq!(leaf.version().unwrap(), LeafVersion::TapScript);
        assert!(leaf.leaf_hash().is_ok());

        // a valid future leaf version is still not a contract leaf
        leaf.leaf_version = 0xc2;
        assert!(matches!(leaf.version(), Err(SwapError::LeafMismatch { .. })));
        assert!(leaf.leaf_hash().is_err());
    }

    #[test]
    fn test_block_datetime() {
        let block = BlockInfo {
            height: 1,
            timestamp: 1_700_000_000,
        };
        assert_eq!(block.datetime().unwrap().timestamp(), 1_700_000_000);
    }
}
