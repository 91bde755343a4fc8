//! # Signer
//!
//! Per-input signing for every input type the protocol spends: Taproot key-path and
//! script-path (BIP340 Schnorr, `SIGHASH_DEFAULT`) and segwit v0 P2WPKH / P2WSH (ECDSA,
//! `SIGHASH_ALL`).

use bitcoin::ecdsa;
use bitcoin::hashes::Hash;
use bitcoin::key::{Keypair, TapTweak, XOnlyPublicKey};
use bitcoin::secp256k1::{schnorr, Message, PublicKey, Secp256k1, SecretKey, Signing, Verification};
use bitcoin::sighash::{EcdsaSighashType, Prevouts, SighashCache, TapSighashType};
use bitcoin::taproot::{ControlBlock, TapLeafHash};
use bitcoin::{Amount, CompressedPublicKey, Script, ScriptBuf, Transaction, TxOut, Witness};

use crate::error::{SwapError, SwapResult};
use crate::taproot::ContractTree;
use crate::witness::normalize_schnorr_signature;

/// How a Taproot input is spent, with exactly the data each mode needs
#[derive(Debug, Clone, Copy)]
pub enum SpendPath<'a> {
    /// Key-path spend of an output without a script tree
    KeyPath { internal_key: XOnlyPublicKey },
    /// Reveal `leaf` with its inclusion proof
    ScriptPath {
        leaf: &'a Script,
        control_block: &'a ControlBlock,
    },
    /// Key-path spend of an output whose key also commits to `tree`
    Both { tree: &'a ContractTree },
}

/// Schnorr signature of input `input_index` along `path`.
///
/// `prevouts` must list the spent output of every input, in input order.
pub fn sign_taproot_input<C: Signing + Verification>(
    secp: &Secp256k1<C>,
    tx: &Transaction,
    input_index: usize,
    prevouts: &[TxOut],
    keypair: &Keypair,
    path: &SpendPath<'_>,
) -> SwapResult<schnorr::Signature> {
    let signer = keypair.x_only_public_key().0;
    let mut cache = SighashCache::new(tx);
    let prevouts = Prevouts::All(prevouts);

    let (sighash, signing_key) = match path {
        SpendPath::KeyPath { internal_key } => {
            ensure_key(internal_key, &signer)?;
            let sighash = cache
                .taproot_key_spend_signature_hash(input_index, &prevouts, TapSighashType::Default)
                .map_err(|e| SwapError::crypto(format!("key-path sighash: {}", e)))?;
            (sighash, keypair.tap_tweak(secp, None).to_inner())
        }
        SpendPath::Both { tree } => {
            ensure_key(&tree.internal_key(), &signer)?;
            let sighash = cache
                .taproot_key_spend_signature_hash(input_index, &prevouts, TapSighashType::Default)
                .map_err(|e| SwapError::crypto(format!("key-path sighash: {}", e)))?;
            (sighash, keypair.tap_tweak(secp, tree.merkle_root()).to_inner())
        }
        SpendPath::ScriptPath {
            leaf,
            control_block,
        } => {
            let leaf_hash = TapLeafHash::from_script(leaf, control_block.leaf_version);
            let sighash = cache
                .taproot_script_spend_signature_hash(
                    input_index,
                    &prevouts,
                    leaf_hash,
                    TapSighashType::Default,
                )
                .map_err(|e| SwapError::crypto(format!("script-path sighash: {}", e)))?;
            (sighash, *keypair)
        }
    };

    let message = Message::from_digest_slice(sighash.as_byte_array())
        .map_err(|e| SwapError::crypto(e.to_string()))?;
    Ok(secp.sign_schnorr(&message, &signing_key))
}

/// Verify a script-path signature by `key` over input `input_index`.
#[allow(clippy::too_many_arguments)]
pub fn verify_script_path_signature<C: Verification>(
    secp: &Secp256k1<C>,
    tx: &Transaction,
    input_index: usize,
    prevouts: &[TxOut],
    leaf: &Script,
    control_block: &ControlBlock,
    signature: &[u8],
    key: &XOnlyPublicKey,
) -> SwapResult<schnorr::Signature> {
    let bare = normalize_schnorr_signature(signature)?;
    let signature = schnorr::Signature::from_slice(&bare)
        .map_err(|e| SwapError::InvalidSignature {
            message: e.to_string(),
        })?;

    let leaf_hash = TapLeafHash::from_script(leaf, control_block.leaf_version);
    let sighash = SighashCache::new(tx)
        .taproot_script_spend_signature_hash(
            input_index,
            &Prevouts::All(prevouts),
            leaf_hash,
            TapSighashType::Default,
        )
        .map_err(|e| SwapError::crypto(format!("script-path sighash: {}", e)))?;
    let message = Message::from_digest_slice(sighash.as_byte_array())
        .map_err(|e| SwapError::crypto(e.to_string()))?;

    secp.verify_schnorr(&signature, &message, key)
        .map_err(|_| SwapError::InvalidSignature {
            message: format!("signature does not verify for key {}", key),
        })?;
    Ok(signature)
}

/// ECDSA signature of a P2WPKH input
pub fn sign_p2wpkh_input<C: Signing>(
    secp: &Secp256k1<C>,
    tx: &Transaction,
    input_index: usize,
    prevout: &TxOut,
    secret_key: &SecretKey,
) -> SwapResult<ecdsa::Signature> {
    let sighash = SighashCache::new(tx)
        .p2wpkh_signature_hash(
            input_index,
            &prevout.script_pubkey,
            prevout.value,
            EcdsaSighashType::All,
        )
        .map_err(|e| SwapError::crypto(format!("p2wpkh sighash: {}", e)))?;
    let message = Message::from_digest_slice(sighash.as_byte_array())
        .map_err(|e| SwapError::crypto(e.to_string()))?;

    Ok(ecdsa::Signature {
        signature: secp.sign_ecdsa(&message, secret_key),
        sighash_type: EcdsaSighashType::All,
    })
}

/// ECDSA signature of a P2WSH input committing to `witness_script`
pub fn sign_p2wsh_input<C: Signing>(
    secp: &Secp256k1<C>,
    tx: &Transaction,
    input_index: usize,
    witness_script: &Script,
    value: Amount,
    secret_key: &SecretKey,
) -> SwapResult<ecdsa::Signature> {
    let sighash = SighashCache::new(tx)
        .p2wsh_signature_hash(input_index, witness_script, value, EcdsaSighashType::All)
        .map_err(|e| SwapError::crypto(format!("p2wsh sighash: {}", e)))?;
    let message = Message::from_digest_slice(sighash.as_byte_array())
        .map_err(|e| SwapError::crypto(e.to_string()))?;

    Ok(ecdsa::Signature {
        signature: secp.sign_ecdsa(&message, secret_key),
        sighash_type: EcdsaSighashType::All,
    })
}

/// Sign and set the witness of every P2WPKH input in `indices`.
pub fn sign_p2wpkh_inputs<C: Signing>(
    secp: &Secp256k1<C>,
    tx: &mut Transaction,
    indices: std::ops::Range<usize>,
    prevouts: &[TxOut],
    keypair: &Keypair,
) -> SwapResult<()> {
    let secret_key = keypair.secret_key();
    let public_key = keypair.public_key();
    let mut witnesses = Vec::with_capacity(indices.len());
    for index in indices.clone() {
        let prevout = prevouts
            .get(index)
            .ok_or_else(|| SwapError::transaction(format!("missing prevout for input {}", index)))?;
        let signature = sign_p2wpkh_input(secp, tx, index, prevout, &secret_key)?;
        witnesses.push(Witness::p2wpkh(&signature, &public_key));
    }
    for (index, witness) in indices.zip(witnesses) {
        tx.input[index].witness = witness;
    }
    Ok(())
}

/// Sign and set the witness of every Taproot key-path input in `indices`.
pub fn sign_key_path_inputs<C: Signing + Verification>(
    secp: &Secp256k1<C>,
    tx: &mut Transaction,
    indices: std::ops::Range<usize>,
    prevouts: &[TxOut],
    keypair: &Keypair,
) -> SwapResult<()> {
    let path = SpendPath::KeyPath {
        internal_key: keypair.x_only_public_key().0,
    };
    let mut witnesses = Vec::with_capacity(indices.len());
    for index in indices.clone() {
        let signature = sign_taproot_input(secp, tx, index, prevouts, keypair, &path)?;
        let signature = bitcoin::taproot::Signature {
            signature,
            sighash_type: TapSighashType::Default,
        };
        witnesses.push(Witness::p2tr_key_spend(&signature));
    }
    for (index, witness) in indices.zip(witnesses) {
        tx.input[index].witness = witness;
    }
    Ok(())
}

/// P2WPKH output script paying `public_key`
pub fn p2wpkh_script(public_key: &PublicKey) -> ScriptBuf {
    ScriptBuf::new_p2wpkh(&CompressedPublicKey(*public_key).wpubkey_hash())
}

/// P2TR key-path output script (no script tree) for `internal_key`
pub fn p2tr_key_script<C: Verification>(secp: &Secp256k1<C>, internal_key: XOnlyPublicKey) -> ScriptBuf {
    ScriptBuf::new_p2tr(secp, internal_key, None)
}

fn ensure_key(expected: &XOnlyPublicKey, actual: &XOnlyPublicKey) -> SwapResult<()> {
    if expected != actual {
        return Err(SwapError::KeyMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{hashlock_leaf, refund_leaf, CsvDelay};
    use crate::taproot::{p2tr_output_key, InternalKey};
    use bitcoin::absolute::LockTime;
    use bitcoin::transaction::Version;
    use bitcoin::{OutPoint, Sequence, TxIn, Txid};

    fn keypair(byte: u8) -> Keypair {
        let secp = Secp256k1::new();
        Keypair::from_secret_key(&secp, &SecretKey::from_slice(&[byte; 32]).unwrap())
    }

    fn spend_tx(prevout_count: usize) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: (0..prevout_count)
                .map(|i| TxIn {
                    previous_output: OutPoint::new(Txid::all_zeros(), i as u32),
                    sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                    ..Default::default()
                })
                .collect(),
            output: vec![TxOut {
                value: Amount::from_sat(90_000),
                script_pubkey: ScriptBuf::new_op_return([0u8; 4]),
            }],
        }
    }

    fn tree(secp: &Secp256k1<bitcoin::secp256k1::All>, internal: InternalKey) -> ContractTree {
        let delay = CsvDelay::from_seconds(1200).unwrap();
        ContractTree::derive(
            secp,
            internal,
            hashlock_leaf(&[1; 32], &keypair(2).x_only_public_key().0),
            refund_leaf(delay, &keypair(1).x_only_public_key().0),
        )
        .unwrap()
    }

    #[test]
    fn test_script_path_signature_verifies() {
        let secp = Secp256k1::new();
        let tree = tree(&secp, InternalKey::Unspendable);
        let leaf = tree.leaves()[0].clone();
        let control_block = tree.control_block(&leaf).unwrap();
        let prevouts = vec![TxOut {
            value: Amount::from_sat(100_000),
            script_pubkey: tree.script_pubkey(),
        }];
        let tx = spend_tx(1);
        let receiver = keypair(2);

        let path = SpendPath::ScriptPath {
            leaf: &leaf,
            control_block: &control_block,
        };
        let sig = sign_taproot_input(&secp, &tx, 0, &prevouts, &receiver, &path).unwrap();

        verify_script_path_signature(
            &secp,
            &tx,
            0,
            &prevouts,
            &leaf,
            &control_block,
            &sig.serialize(),
            &receiver.x_only_public_key().0,
        )
        .unwrap();

        let wrong = verify_script_path_signature(
            &secp,
            &tx,
            0,
            &prevouts,
            &leaf,
            &control_block,
            &sig.serialize(),
            &keypair(3).x_only_public_key().0,
        );
        assert!(matches!(wrong, Err(SwapError::InvalidSignature { .. })));
    }

    #[test]
    fn test_key_path_signature_uses_tweaked_key() {
        let secp = Secp256k1::new();
        let owner = keypair(4);
        let spk = p2tr_key_script(&secp, owner.x_only_public_key().0);
        let prevouts = vec![TxOut {
            value: Amount::from_sat(50_000),
            script_pubkey: spk.clone(),
        }];
        let mut tx = spend_tx(1);

        sign_key_path_inputs(&secp, &mut tx, 0..1, &prevouts, &owner).unwrap();
        let witness_sig = tx.input[0].witness.nth(0).unwrap().to_vec();
        assert_eq!(witness_sig.len(), 64);

        let sighash = SighashCache::new(&tx)
            .taproot_key_spend_signature_hash(0, &Prevouts::All(&prevouts), TapSighashType::Default)
            .unwrap();
        let message = Message::from_digest_slice(sighash.as_byte_array()).unwrap();
        let signature = schnorr::Signature::from_slice(&witness_sig).unwrap();
        secp.verify_schnorr(&signature, &message, &p2tr_output_key(&spk).unwrap())
            .unwrap();
    }

    #[test]
    fn test_both_mode_requires_tree_owner() {
        let secp = Secp256k1::new();
        let owner = keypair(1);
        let tree = tree(&secp, InternalKey::Key(owner.x_only_public_key().0));
        let prevouts = vec![TxOut {
            value: Amount::from_sat(100_000),
            script_pubkey: tree.script_pubkey(),
        }];
        let tx = spend_tx(1);

        let path = SpendPath::Both { tree: &tree };
        let sig = sign_taproot_input(&secp, &tx, 0, &prevouts, &owner, &path).unwrap();

        let sighash = SighashCache::new(&tx)
            .taproot_key_spend_signature_hash(0, &Prevouts::All(&prevouts), TapSighashType::Default)
            .unwrap();
        let message = Message::from_digest_slice(sighash.as_byte_array()).unwrap();
        secp.verify_schnorr(&sig, &message, &tree.output_key().to_inner())
            .unwrap();

        let stranger = sign_taproot_input(&secp, &tx, 0, &prevouts, &keypair(9), &path);
        assert!(matches!(stranger, Err(SwapError::KeyMismatch { .. })));
    }

    #[test]
    fn test_p2wpkh_inputs_get_two_item_witness() {
        let secp = Secp256k1::new();
        let owner = keypair(5);
        let prevouts = vec![
            TxOut {
                value: Amount::from_sat(70_000),
                script_pubkey: p2wpkh_script(&owner.public_key()),
            };
            2
        ];
        let mut tx = spend_tx(2);

        sign_p2wpkh_inputs(&secp, &mut tx, 0..2, &prevouts, &owner).unwrap();
        for input in &tx.input {
            assert_eq!(input.witness.len(), 2);
            assert_eq!(input.witness.nth(1).unwrap(), &owner.public_key().serialize()[..]);
        }

        let sighash = SighashCache::new(&tx)
            .p2wpkh_signature_hash(1, &prevouts[1].script_pubkey, prevouts[1].value, EcdsaSighashType::All)
            .unwrap();
        let message = Message::from_digest_slice(sighash.as_byte_array()).unwrap();
        let sig = ecdsa::Signature::from_slice(tx.input[1].witness.nth(0).unwrap()).unwrap();
        secp.verify_ecdsa(&message, &sig.signature, &owner.public_key())
            .unwrap();
    }
}
