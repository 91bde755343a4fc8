use bitcoin::absolute::LockTime;
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::key::Keypair;
use bitcoin::psbt::Psbt;
use bitcoin::sighash::TapSighashType;
use bitcoin::taproot::{self, LeafVersion, TapLeafHash};
use bitcoin::{Sequence, Transaction, TxOut, Txid};
use log::debug;
use serde::{Deserialize, Serialize};

use super::{
    contract_reference, ensure_key, ensure_positive, tx_in, tx_out, unsigned_tx, TrainBitcoin,
};
use crate::coins::settle_change;
use crate::config::protocol::{DEFAULT_FEE_SATS, DUST_P2WPKH_SATS};
use crate::error::{SwapError, SwapResult};
use crate::memo::{op_return_script, AddLockMemo, MemoPayload};
use crate::script::{hashlock_leaf, parse_multisig_leaf, refund_leaf, CsvDelay};
use crate::services::ChainProvider;
use crate::signer::{sign_p2wpkh_inputs, sign_taproot_input, verify_script_path_signature, SpendPath};
use crate::taproot::{p2tr_output_key, ContractTree, InternalKey};
use crate::types::{ContractReference, Utxo};
use crate::witness::WitnessBuilder;

#[derive(Debug, Clone)]
pub struct AddLockRequest {
    /// Hashlock the upgraded contract is bound to
    pub hashlock: [u8; 32],
    pub delay_secs: u64,
    pub fee_sat: u64,
    /// Sender P2WPKH UTXOs paying the fee; selected from the sender's address when `None`
    pub fee_utxos: Option<Vec<Utxo>>,
    /// Written to the add-lock memo when present
    pub commit_id: Option<[u8; 32]>,
}

impl AddLockRequest {
    pub fn new(hashlock: [u8; 32], delay_secs: u64) -> Self {
        Self {
            hashlock,
            delay_secs,
            fee_sat: DEFAULT_FEE_SATS,
            fee_utxos: None,
            commit_id: None,
        }
    }
}

/// Sender half of the cooperative upgrade.
///
/// The PSBT carries the sender's script-path signature on input 0 and finalized fee
/// inputs; only the receiver's signature is missing. Segwit txids do not cover
/// witnesses, so the new contract's outpoint is already known.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddLockInit {
    pub psbt_hex: String,
    pub txid: Txid,
    pub contract_address: String,
    pub csv_sequence: u32,
    pub memo_hex: Option<String>,
    /// New contract revealed through its hashlock leaf
    pub contract: ContractReference,
    pub refund: ContractReference,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddLockReceipt {
    pub txid: Txid,
    pub raw_tx_hex: String,
}

impl<P: ChainProvider> TrainBitcoin<P> {
    /// Build the upgrade of a committed output into a hashlock contract and sign the
    /// sender's half.
    ///
    /// `prev` must reveal the commit's multisig leaf.
    pub async fn add_lock_init(
        &self,
        prev: &ContractReference,
        sender: &Keypair,
        request: AddLockRequest,
    ) -> SwapResult<AddLockInit> {
        ensure_positive("fee_sat", request.fee_sat)?;
        let delay = CsvDelay::from_seconds(request.delay_secs)?;
        let parties = parse_multisig_leaf(&prev.leaf.script)?;
        let (sender_x, _) = sender.x_only_public_key();
        ensure_key(&parties.sender, &sender_x)?;
        let control_block = self.verify_contract_leaf(prev)?;

        let memo = match request.commit_id {
            Some(commit_id) => Some(
                AddLockMemo {
                    commit_id,
                    hashlock: request.hashlock,
                    csv_sequence: delay.to_consensus_u32(),
                }
                .encode()?,
            ),
            None => None,
        };

        self.verify_prev_output(prev).await?;

        let hashlock_script = hashlock_leaf(&request.hashlock, &parties.receiver);
        let refund_script = refund_leaf(delay, &parties.sender);
        let tree = ContractTree::derive(
            &self.secp,
            InternalKey::Unspendable,
            hashlock_script.clone(),
            refund_script.clone(),
        )?;

        let sender_address = self.p2wpkh_address(&sender.public_key());
        let (fee_utxos, leftover) = self
            .fee_inputs(
                &sender_address,
                request.fee_utxos.as_deref(),
                request.fee_sat,
                prev.outpoint(),
            )
            .await?;
        let change = settle_change(leftover, DUST_P2WPKH_SATS);
        let contract_value = prev.value_sat + change.folded_sat();

        let mut outputs = vec![tx_out(contract_value, tree.script_pubkey())];
        if let Some(value) = change.change_output_sat() {
            outputs.push(tx_out(value, sender_address.script_pubkey()));
        }
        if let Some(payload) = &memo {
            outputs.push(tx_out(0, op_return_script(payload)?));
        }

        let mut inputs = vec![tx_in(prev.outpoint(), Sequence::ENABLE_RBF_NO_LOCKTIME)];
        let mut prevouts = vec![prev.tx_out()];
        for utxo in &fee_utxos {
            inputs.push(tx_in(utxo.outpoint(), Sequence::ENABLE_RBF_NO_LOCKTIME));
            prevouts.push(tx_out(utxo.value_sat, sender_address.script_pubkey()));
        }

        let mut tx = unsigned_tx(inputs, outputs, LockTime::ZERO);
        sign_p2wpkh_inputs(&self.secp, &mut tx, 1..prevouts.len(), &prevouts, sender)?;

        let path = SpendPath::ScriptPath {
            leaf: &prev.leaf.script,
            control_block: &control_block,
        };
        let sender_sig = sign_taproot_input(&self.secp, &tx, 0, &prevouts, sender, &path)?;

        let txid = tx.compute_txid();
        let mut psbt = Psbt::from_unsigned_tx(strip_witnesses(&tx))
            .map_err(|e| SwapError::transaction(format!("psbt: {}", e)))?;

        let leaf_version = prev.leaf.version()?;
        let leaf_hash = TapLeafHash::from_script(&prev.leaf.script, leaf_version);
        let contract_input = &mut psbt.inputs[0];
        contract_input.witness_utxo = Some(prev.tx_out());
        contract_input.tap_internal_key = Some(control_block.internal_key);
        contract_input
            .tap_scripts
            .insert(control_block.clone(), (prev.leaf.script.clone(), leaf_version));
        contract_input.tap_script_sigs.insert(
            (sender_x, leaf_hash),
            taproot::Signature {
                signature: sender_sig,
                sighash_type: TapSighashType::Default,
            },
        );
        for (index, input) in psbt.inputs.iter_mut().enumerate().skip(1) {
            input.witness_utxo = Some(prevouts[index].clone());
            input.final_script_witness = Some(tx.input[index].witness.clone());
        }

        debug!(
            "Add-lock init {}: {} fee inputs, contract {} sats, change {:?}",
            txid,
            fee_utxos.len(),
            contract_value,
            change
        );

        let contract = contract_reference(txid, 0, contract_value, &tree, &hashlock_script)?;
        let refund = contract.with_leaf(tree.leaf_ref(&refund_script)?);
        Ok(AddLockInit {
            psbt_hex: psbt.serialize_hex(),
            txid,
            contract_address: tree.address(self.network()).to_string(),
            csv_sequence: delay.to_consensus_u32(),
            memo_hex: memo.map(hex::encode),
            contract,
            refund,
        })
    }

    /// Receiver half: co-sign the multisig leaf, check both signatures, pack the witness
    /// `[sig_receiver, sig_sender, leaf, control_block]` and broadcast.
    ///
    /// `hashlock` and `delay_secs` are the terms the receiver agreed to. Output 0 must
    /// pay the contract they derive with at least the committed value, or nothing is
    /// signed.
    pub async fn add_lock_finalize(
        &self,
        psbt_hex: &str,
        receiver: &Keypair,
        hashlock: &[u8; 32],
        delay_secs: u64,
    ) -> SwapResult<AddLockReceipt> {
        let delay = CsvDelay::from_seconds(delay_secs)?;
        let mut psbt = Psbt::deserialize(&hex::decode(psbt_hex.trim())?)
            .map_err(|e| SwapError::input("psbt", e.to_string()))?;
        if psbt.inputs.is_empty() {
            return Err(SwapError::input("psbt", "no inputs"));
        }

        let prevouts = psbt
            .inputs
            .iter()
            .enumerate()
            .map(|(index, input)| {
                input.witness_utxo.clone().ok_or_else(|| {
                    SwapError::input("psbt", format!("input {} lacks its witness UTXO", index))
                })
            })
            .collect::<SwapResult<Vec<TxOut>>>()?;
        for (index, input) in psbt.inputs.iter().enumerate().skip(1) {
            if input.final_script_witness.is_none() {
                return Err(SwapError::input(
                    "psbt",
                    format!("fee input {} is not finalized", index),
                ));
            }
        }

        let (control_block, (leaf_script, leaf_version)) = psbt.inputs[0]
            .tap_scripts
            .iter()
            .next()
            .map(|(cb, leaf)| (cb.clone(), leaf.clone()))
            .ok_or_else(|| SwapError::input("psbt", "contract input has no tap leaf"))?;
        if leaf_version != LeafVersion::TapScript {
            return Err(SwapError::leaf("multisig", "unexpected leaf version"));
        }
        let parties = parse_multisig_leaf(&leaf_script)?;
        let (receiver_x, _) = receiver.x_only_public_key();
        ensure_key(&parties.receiver, &receiver_x)?;
        if !control_block.verify_taproot_commitment(
            &self.secp,
            p2tr_output_key(&prevouts[0].script_pubkey)?,
            &leaf_script,
        ) {
            return Err(SwapError::crypto(
                "control block does not commit the leaf to the contract output",
            ));
        }
        let committed = psbt.unsigned_tx.input[0].previous_output;
        self.verify_output(committed, prevouts[0].value.to_sat(), &prevouts[0].script_pubkey)
            .await?;

        let tree = ContractTree::derive(
            &self.secp,
            InternalKey::Unspendable,
            hashlock_leaf(hashlock, &parties.receiver),
            refund_leaf(delay, &parties.sender),
        )?;
        let contract_output = psbt
            .unsigned_tx
            .output
            .first()
            .ok_or_else(|| SwapError::input("psbt", "no outputs"))?;
        if contract_output.script_pubkey != tree.script_pubkey() {
            return Err(SwapError::crypto(
                "output 0 does not pay the agreed hashlock contract",
            ));
        }
        if contract_output.value < prevouts[0].value {
            return Err(SwapError::crypto(format!(
                "output 0 holds {} sats, the committed output {}",
                contract_output.value.to_sat(),
                prevouts[0].value.to_sat()
            )));
        }

        let leaf_hash = TapLeafHash::from_script(&leaf_script, leaf_version);
        let sender_sig = psbt.inputs[0]
            .tap_script_sigs
            .get(&(parties.sender, leaf_hash))
            .map(|sig| sig.to_vec())
            .ok_or_else(|| SwapError::InvalidSignature {
                message: format!("missing signature for sender key {}", parties.sender),
            })?;

        let mut tx = psbt.unsigned_tx.clone();
        let sender_sig = verify_script_path_signature(
            &self.secp,
            &tx,
            0,
            &prevouts,
            &leaf_script,
            &control_block,
            &sender_sig,
            &parties.sender,
        )?;

        let path = SpendPath::ScriptPath {
            leaf: &leaf_script,
            control_block: &control_block,
        };
        let receiver_sig = sign_taproot_input(&self.secp, &tx, 0, &prevouts, receiver, &path)?;
        let receiver_sig = verify_script_path_signature(
            &self.secp,
            &tx,
            0,
            &prevouts,
            &leaf_script,
            &control_block,
            &receiver_sig.serialize(),
            &parties.receiver,
        )?;

        let witness = WitnessBuilder::new()
            .push_item(receiver_sig.serialize())
            .push_item(sender_sig.serialize())
            .push_item(leaf_script.as_bytes())
            .push_item(control_block.serialize())
            .into_witness()?;

        tx.input[0].witness = witness;
        for (index, input) in psbt.inputs.iter_mut().enumerate().skip(1) {
            if let Some(fee_witness) = input.final_script_witness.take() {
                tx.input[index].witness = fee_witness;
            }
        }

        let txid = self.broadcast("add-lock", &tx).await?;
        Ok(AddLockReceipt {
            txid,
            raw_tx_hex: serialize_hex(&tx),
        })
    }
}

/// Copy of `tx` with witnesses cleared, as PSBT requires for the unsigned transaction
fn strip_witnesses(tx: &Transaction) -> Transaction {
    let mut unsigned = tx.clone();
    for input in &mut unsigned.input {
        input.witness.clear();
    }
    unsigned
}
