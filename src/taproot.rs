//! # Taproot Tree Deriver
//!
//! Builds the two-leaf script tree behind every contract output, tweaks the internal
//! key with its Merkle root and hands out per-leaf control blocks.
//!
//! Both leaves sit at depth 1, so the branch hash is taken over the lexicographically
//! sorted leaf hashes and the result does not depend on the order the leaves are
//! passed in. Two parties deriving from the same leaves always get the same address.

use bitcoin::key::{TweakedPublicKey, XOnlyPublicKey};
use bitcoin::secp256k1::{Secp256k1, Verification};
use bitcoin::taproot::{
    ControlBlock, LeafVersion, TapNodeHash, TaprootBuilder, TaprootSpendInfo,
};
use bitcoin::{Address, Network, Script, ScriptBuf};
use log::debug;

use crate::config::protocol::NUMS_INTERNAL_KEY_HEX;
use crate::error::{SwapError, SwapResult};
use crate::types::TapLeafRef;

/// Which internal key the output key is tweaked from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalKey {
    /// NUMS point: the output can only be spent through a leaf
    Unspendable,
    /// Real key: key-path spend stays available to its owner
    Key(XOnlyPublicKey),
}

impl InternalKey {
    pub fn resolve(&self) -> SwapResult<XOnlyPublicKey> {
        match self {
            InternalKey::Unspendable => unspendable_internal_key(),
            InternalKey::Key(key) => Ok(*key),
        }
    }
}

/// The BIP341 "nothing up my sleeve" x-only key
pub fn unspendable_internal_key() -> SwapResult<XOnlyPublicKey> {
    let bytes = hex::decode(NUMS_INTERNAL_KEY_HEX)?;
    XOnlyPublicKey::from_slice(&bytes).map_err(|e| SwapError::crypto(e.to_string()))
}

/// A derived contract: two tapscript leaves committed under one output key.
#[derive(Debug, Clone)]
pub struct ContractTree {
    spend_info: TaprootSpendInfo,
    leaves: [ScriptBuf; 2],
}

impl ContractTree {
    /// Derive the tree from its two leaves.
    pub fn derive<C: Verification>(
        secp: &Secp256k1<C>,
        internal_key: InternalKey,
        first: ScriptBuf,
        second: ScriptBuf,
    ) -> SwapResult<Self> {
        let internal = internal_key.resolve()?;
        let spend_info = TaprootBuilder::new()
            .add_leaf(1, first.clone())
            .and_then(|builder| builder.add_leaf(1, second.clone()))
            .map_err(|e| SwapError::crypto(format!("taproot tree: {}", e)))?
            .finalize(secp, internal)
            .map_err(|_| SwapError::crypto("taproot tree is incomplete"))?;

        debug!(
            "Derived contract tree: output key {}, merkle root {:?}",
            spend_info.output_key(),
            spend_info.merkle_root()
        );

        Ok(Self {
            spend_info,
            leaves: [first, second],
        })
    }

    pub fn leaves(&self) -> &[ScriptBuf; 2] {
        &self.leaves
    }

    pub fn internal_key(&self) -> XOnlyPublicKey {
        self.spend_info.internal_key()
    }

    pub fn merkle_root(&self) -> Option<TapNodeHash> {
        self.spend_info.merkle_root()
    }

    pub fn output_key(&self) -> TweakedPublicKey {
        self.spend_info.output_key()
    }

    pub fn script_pubkey(&self) -> ScriptBuf {
        ScriptBuf::new_p2tr_tweaked(self.output_key())
    }

    pub fn address(&self, network: Network) -> Address {
        Address::p2tr_tweaked(self.output_key(), network)
    }

    /// Control block revealing `script`; fails for scripts outside the tree.
    pub fn control_block(&self, script: &Script) -> SwapResult<ControlBlock> {
        self.spend_info
            .control_block(&(script.to_owned(), LeafVersion::TapScript))
            .ok_or_else(|| SwapError::crypto("script is not a leaf of this contract tree"))
    }

    pub fn leaf_ref(&self, script: &Script) -> SwapResult<TapLeafRef> {
        let control_block = self.control_block(script)?;
        Ok(TapLeafRef::new(script.to_owned(), &control_block))
    }
}

/// Extract the output key from a v1 witness program
pub fn p2tr_output_key(script_pubkey: &Script) -> SwapResult<XOnlyPublicKey> {
    if !script_pubkey.is_p2tr() {
        return Err(SwapError::input("script_pubkey", "not a P2TR output"));
    }
    XOnlyPublicKey::from_slice(&script_pubkey.as_bytes()[2..34])
        .map_err(|e| SwapError::crypto(e.to_string()))
}

/// Check that `leaf`'s control block proves its script against `script_pubkey`.
pub fn verify_leaf_ref<C: Verification>(
    secp: &Secp256k1<C>,
    script_pubkey: &Script,
    leaf: &TapLeafRef,
) -> SwapResult<ControlBlock> {
    let output_key = p2tr_output_key(script_pubkey)?;
    let control_block = leaf.decode_control_block()?;
    if control_block.leaf_version != leaf.version()? {
        return Err(SwapError::crypto("leaf version differs from control block"));
    }
    if !control_block.verify_taproot_commitment(secp, output_key, &leaf.script) {
        return Err(SwapError::crypto(
            "control block does not commit the leaf to the contract output",
        ));
    }
    Ok(control_block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{hashlock_leaf, multisig_leaf, refund_leaf, CsvDelay};
    use bitcoin::secp256k1::{Keypair, SecretKey};

    fn xonly(byte: u8) -> XOnlyPublicKey {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[byte; 32]).unwrap();
        Keypair::from_secret_key(&secp, &sk).x_only_public_key().0
    }

    fn leaves() -> (ScriptBuf, ScriptBuf) {
        let delay = CsvDelay::from_seconds(1200).unwrap();
        (
            hashlock_leaf(&[7; 32], &xonly(2)),
            refund_leaf(delay, &xonly(1)),
        )
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let secp = Secp256k1::new();
        let (a, b) = leaves();

        let first = ContractTree::derive(&secp, InternalKey::Unspendable, a.clone(), b.clone()).unwrap();
        let second = ContractTree::derive(&secp, InternalKey::Unspendable, a.clone(), b.clone()).unwrap();

        assert_eq!(first.output_key(), second.output_key());
        assert_eq!(first.control_block(&a).unwrap(), second.control_block(&a).unwrap());
        assert_eq!(first.control_block(&b).unwrap(), second.control_block(&b).unwrap());
    }

    #[test]
    fn test_leaf_order_does_not_change_address() {
        let secp = Secp256k1::new();
        let (a, b) = leaves();

        let forward = ContractTree::derive(&secp, InternalKey::Unspendable, a.clone(), b.clone()).unwrap();
        let reversed = ContractTree::derive(&secp, InternalKey::Unspendable, b.clone(), a.clone()).unwrap();

        assert_eq!(forward.output_key(), reversed.output_key());
        assert_eq!(forward.control_block(&a).unwrap(), reversed.control_block(&a).unwrap());
    }

    #[test]
    fn test_control_blocks_verify() {
        let secp = Secp256k1::new();
        let (a, b) = leaves();
        let tree = ContractTree::derive(&secp, InternalKey::Unspendable, a.clone(), b.clone()).unwrap();
        let spk = tree.script_pubkey();

        for leaf in [&a, &b] {
            let leaf_ref = tree.leaf_ref(leaf).unwrap();
            // control byte + internal key + one sibling hash
            assert_eq!(leaf_ref.control_block.len(), 65);
            assert_eq!(leaf_ref.control_block[0] & 0xfe, 0xc0);
            assert_eq!(
                &leaf_ref.control_block[1..33],
                &unspendable_internal_key().unwrap().serialize()
            );
            verify_leaf_ref(&secp, &spk, &leaf_ref).unwrap();
        }
    }

    #[test]
    fn test_foreign_leaf_is_rejected() {
        let secp = Secp256k1::new();
        let (a, b) = leaves();
        let tree = ContractTree::derive(&secp, InternalKey::Unspendable, a, b).unwrap();

        let other = multisig_leaf(&xonly(1), &xonly(2));
        assert!(tree.control_block(&other).is_err());

        // a genuine control block paired with a different script must not verify
        let mut forged = tree.leaf_ref(&tree.leaves()[0]).unwrap();
        forged.script = other;
        assert!(verify_leaf_ref(&secp, &tree.script_pubkey(), &forged).is_err());
    }

    #[test]
    fn test_internal_key_changes_output() {
        let secp = Secp256k1::new();
        let (a, b) = leaves();
        let nums = ContractTree::derive(&secp, InternalKey::Unspendable, a.clone(), b.clone()).unwrap();
        let keyed = ContractTree::derive(&secp, InternalKey::Key(xonly(1)), a, b).unwrap();

        assert_ne!(nums.output_key(), keyed.output_key());
        assert_eq!(keyed.internal_key(), xonly(1));
        assert!(nums.address(Network::Testnet).to_string().starts_with("tb1p"));
    }

    #[test]
    fn test_p2tr_output_key_rejects_segwit_v0() {
        let script = ScriptBuf::from_bytes([vec![0x00, 0x14], vec![0; 20]].concat());
        assert!(p2tr_output_key(&script).is_err());
    }
}
