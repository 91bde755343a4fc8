use bitcoin::absolute::LockTime;
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::key::Keypair;
use bitcoin::taproot::ControlBlock;
use bitcoin::{Address, Sequence, Transaction, TxOut, Txid};
use log::debug;
use serde::{Deserialize, Serialize};

use super::{ensure_key, ensure_positive, tx_in, tx_out, unsigned_tx, TrainBitcoin};
use crate::coins::settle_change;
use crate::config::protocol::{DEFAULT_FEE_SATS, DUST_P2WPKH_SATS};
use crate::error::{SwapError, SwapResult};
use crate::hashlock::{bytes32, verify_preimage};
use crate::memo::{op_return_script, MemoPayload, RedeemMemo};
use crate::script::parse_hashlock_leaf;
use crate::services::ChainProvider;
use crate::signer::{sign_p2wpkh_inputs, sign_taproot_input, SpendPath};
use crate::types::{ContractReference, Utxo};
use crate::witness::WitnessBuilder;

/// Redeem paying the fee from separate receiver UTXOs
#[derive(Debug, Clone)]
pub struct RedeemSolverRequest {
    pub fee_sat: u64,
    /// Receiver P2WPKH UTXOs paying the fee; selected from the receiver's address when `None`
    pub fee_utxos: Option<Vec<Utxo>>,
    /// Written (first 15 bytes) to the redeem memo when present
    pub commit_id: Option<[u8; 32]>,
}

impl Default for RedeemSolverRequest {
    fn default() -> Self {
        Self {
            fee_sat: DEFAULT_FEE_SATS,
            fee_utxos: None,
            commit_id: None,
        }
    }
}

/// Redeem deducting the fee from the contract value
#[derive(Debug, Clone)]
pub struct RedeemRequest {
    pub fee_sat: u64,
    /// Payout address; the receiver's P2WPKH address when `None`
    pub destination: Option<Address>,
}

impl Default for RedeemRequest {
    fn default() -> Self {
        Self {
            fee_sat: DEFAULT_FEE_SATS,
            destination: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedeemReceipt {
    pub txid: Txid,
    pub payout_sat: u64,
    pub raw_tx_hex: String,
}

impl<P: ChainProvider> TrainBitcoin<P> {
    /// Local checks every redeem runs before signing: leaf shape, receiver key, preimage
    /// and the leaf's commitment to the contract output.
    fn check_redeem(
        &self,
        prev: &ContractReference,
        receiver: &Keypair,
        secret: &[u8],
    ) -> SwapResult<([u8; 32], ControlBlock)> {
        let leaf = parse_hashlock_leaf(&prev.leaf.script)?;
        let (receiver_x, _) = receiver.x_only_public_key();
        ensure_key(&leaf.receiver, &receiver_x)?;
        verify_preimage(secret, &leaf.hashlock)?;
        let control_block = self.verify_contract_leaf(prev)?;
        Ok((bytes32("secret", secret)?, control_block))
    }

    /// Claim the contract through its hashlock leaf, revealing `secret`.
    ///
    /// The full contract value is paid to the receiver; fees come from the receiver's
    /// own P2WPKH UTXOs. An optional redeem memo publishes the secret in the same
    /// transaction.
    pub async fn redeem_solver(
        &self,
        prev: &ContractReference,
        receiver: &Keypair,
        secret: &[u8],
        request: RedeemSolverRequest,
    ) -> SwapResult<RedeemReceipt> {
        ensure_positive("fee_sat", request.fee_sat)?;
        let (secret, control_block) = self.check_redeem(prev, receiver, secret)?;
        let hashlock = parse_hashlock_leaf(&prev.leaf.script)?.hashlock;
        let memo = match request.commit_id {
            Some(commit_id) => Some(RedeemMemo::new(&commit_id, hashlock, secret).encode()?),
            None => None,
        };

        self.verify_prev_output(prev).await?;

        let receiver_address = self.p2wpkh_address(&receiver.public_key());
        let (fee_utxos, leftover) = self
            .fee_inputs(
                &receiver_address,
                request.fee_utxos.as_deref(),
                request.fee_sat,
                prev.outpoint(),
            )
            .await?;
        let change = settle_change(leftover, DUST_P2WPKH_SATS);
        let payout = prev.value_sat + change.folded_sat();

        let mut outputs = vec![tx_out(payout, receiver_address.script_pubkey())];
        if let Some(value) = change.change_output_sat() {
            outputs.push(tx_out(value, receiver_address.script_pubkey()));
        }
        if let Some(payload) = &memo {
            outputs.push(tx_out(0, op_return_script(payload)?));
        }

        let mut inputs = vec![tx_in(prev.outpoint(), Sequence::ENABLE_RBF_NO_LOCKTIME)];
        let mut prevouts = vec![prev.tx_out()];
        for utxo in &fee_utxos {
            inputs.push(tx_in(utxo.outpoint(), Sequence::ENABLE_RBF_NO_LOCKTIME));
            prevouts.push(tx_out(utxo.value_sat, receiver_address.script_pubkey()));
        }

        let mut tx = unsigned_tx(inputs, outputs, LockTime::ZERO);
        sign_p2wpkh_inputs(&self.secp, &mut tx, 1..prevouts.len(), &prevouts, receiver)?;
        self.reveal_secret(&mut tx, &prevouts, prev, &control_block, receiver, &secret)?;

        debug!(
            "Redeem (solver) of {}:{}: payout {} sats, {} fee inputs",
            prev.txid,
            prev.vout,
            payout,
            fee_utxos.len()
        );

        let txid = self.broadcast("redeem", &tx).await?;
        Ok(RedeemReceipt {
            txid,
            payout_sat: payout,
            raw_tx_hex: serialize_hex(&tx),
        })
    }

    /// Claim the contract through its hashlock leaf, paying the fee out of the
    /// contract value. Single input, single output.
    pub async fn redeem(
        &self,
        prev: &ContractReference,
        receiver: &Keypair,
        secret: &[u8],
        request: RedeemRequest,
    ) -> SwapResult<RedeemReceipt> {
        let (secret, control_block) = self.check_redeem(prev, receiver, secret)?;
        let payout = prev
            .value_sat
            .checked_sub(request.fee_sat)
            .filter(|value| *value >= DUST_P2WPKH_SATS)
            .ok_or_else(|| {
                SwapError::input(
                    "fee_sat",
                    format!(
                        "fee {} leaves no spendable payout from {} sats",
                        request.fee_sat, prev.value_sat
                    ),
                )
            })?;

        self.verify_prev_output(prev).await?;

        let destination = request
            .destination
            .unwrap_or_else(|| self.p2wpkh_address(&receiver.public_key()));
        let prevouts = vec![prev.tx_out()];
        let mut tx = unsigned_tx(
            vec![tx_in(prev.outpoint(), Sequence::ENABLE_RBF_NO_LOCKTIME)],
            vec![tx_out(payout, destination.script_pubkey())],
            LockTime::ZERO,
        );
        self.reveal_secret(&mut tx, &prevouts, prev, &control_block, receiver, &secret)?;

        let txid = self.broadcast("redeem", &tx).await?;
        Ok(RedeemReceipt {
            txid,
            payout_sat: payout,
            raw_tx_hex: serialize_hex(&tx),
        })
    }

    /// Sign input 0 along the hashlock leaf and set `[sig, secret, leaf, control_block]`.
    fn reveal_secret(
        &self,
        tx: &mut Transaction,
        prevouts: &[TxOut],
        prev: &ContractReference,
        control_block: &ControlBlock,
        receiver: &Keypair,
        secret: &[u8; 32],
    ) -> SwapResult<()> {
        let path = SpendPath::ScriptPath {
            leaf: &prev.leaf.script,
            control_block,
        };
        let signature = sign_taproot_input(&self.secp, tx, 0, prevouts, receiver, &path)?;
        tx.input[0].witness = WitnessBuilder::new()
            .push_item(signature.serialize())
            .push_item(secret)
            .push_item(prev.leaf.script.as_bytes())
            .push_item(control_block.serialize())
            .into_witness()?;
        Ok(())
    }
}
