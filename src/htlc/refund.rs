use bitcoin::absolute::LockTime;
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::key::Keypair;
use bitcoin::{Sequence, Txid};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::{ensure_key, ensure_positive, tx_in, tx_out, unsigned_tx, TrainBitcoin};
use crate::coins::settle_change;
use crate::config::protocol::{DEFAULT_FEE_SATS, DUST_P2WPKH_SATS, MTP_LAG_SECS};
use crate::error::{SwapError, SwapResult};
use crate::memo::{op_return_script, MemoPayload, RefundMemo};
use crate::script::parse_refund_leaf;
use crate::services::ChainProvider;
use crate::signer::{sign_p2wpkh_inputs, sign_taproot_input, SpendPath};
use crate::types::{ContractReference, Utxo};
use crate::witness::WitnessBuilder;

#[derive(Debug, Clone)]
pub struct RefundRequest {
    pub fee_sat: u64,
    /// Sender P2WPKH UTXOs paying the fee; selected from the sender's address when `None`
    pub fee_utxos: Option<Vec<Utxo>>,
    pub commit_id: Option<[u8; 32]>,
}

impl Default for RefundRequest {
    fn default() -> Self {
        Self {
            fee_sat: DEFAULT_FEE_SATS,
            fee_utxos: None,
            commit_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundReceipt {
    pub txid: Txid,
    pub payout_sat: u64,
    pub csv_sequence: u32,
    pub raw_tx_hex: String,
}

impl<P: ChainProvider> TrainBitcoin<P> {
    /// Reclaim a contract through its refund leaf once the CSV delay has elapsed.
    ///
    /// Works for commit, add-lock and lock outputs alike: `prev` must reveal the
    /// refund leaf. The delay is read from the leaf itself and checked against the
    /// contract's confirmation time, plus [`MTP_LAG_SECS`], before anything is signed.
    pub async fn refund(
        &self,
        prev: &ContractReference,
        sender: &Keypair,
        request: RefundRequest,
    ) -> SwapResult<RefundReceipt> {
        ensure_positive("fee_sat", request.fee_sat)?;
        let leaf = parse_refund_leaf(&prev.leaf.script)?;
        let (sender_x, _) = sender.x_only_public_key();
        ensure_key(&leaf.sender, &sender_x)?;
        let control_block = self.verify_contract_leaf(prev)?;

        let memo = match request.commit_id {
            Some(commit_id) => Some(RefundMemo { commit_id }.encode()?),
            None => None,
        };

        let info = self.verify_prev_output(prev).await?;
        let confirmed = info.confirmation.ok_or_else(|| SwapError::InvalidTimelock {
            message: format!("contract {} is not confirmed yet", prev.txid),
        })?;
        let tip = self.provider.get_current_block_info().await?;
        // header times run ahead of the median-time-past that CSV is checked against
        let needed = leaf.delay.seconds() + MTP_LAG_SECS;
        let elapsed = tip.timestamp.saturating_sub(confirmed.timestamp);
        if elapsed < needed {
            return Err(SwapError::CsvDelayNotSatisfied {
                needed_secs: needed,
                elapsed_secs: elapsed,
            });
        }

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
        let payout = prev.value_sat + change.folded_sat();

        let mut outputs = vec![tx_out(payout, sender_address.script_pubkey())];
        if let Some(value) = change.change_output_sat() {
            outputs.push(tx_out(value, sender_address.script_pubkey()));
        }
        if let Some(payload) = &memo {
            outputs.push(tx_out(0, op_return_script(payload)?));
        }

        let mut inputs = vec![tx_in(prev.outpoint(), leaf.delay.to_sequence())];
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
        let signature = sign_taproot_input(&self.secp, &tx, 0, &prevouts, sender, &path)?;
        tx.input[0].witness = WitnessBuilder::new()
            .push_item(signature.serialize())
            .push_item(prev.leaf.script.as_bytes())
            .push_item(control_block.serialize())
            .into_witness()?;

        debug!(
            "Refund of {}:{} after {}s (needed {}s), payout {} sats",
            prev.txid,
            prev.vout,
            elapsed,
            leaf.delay.seconds(),
            payout
        );

        let txid = self.broadcast("refund", &tx).await?;
        info!("Refunded {} sats to {}", payout, sender_address);
        Ok(RefundReceipt {
            txid,
            payout_sat: payout,
            csv_sequence: leaf.delay.to_consensus_u32(),
            raw_tx_hex: serialize_hex(&tx),
        })
    }
}
