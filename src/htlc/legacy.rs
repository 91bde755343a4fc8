//! Legacy P2WSH HTLC: ECDSA signatures, absolute block-height CLTV refund.

use bitcoin::absolute::LockTime;
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::key::Keypair;
use bitcoin::{Address, Amount, OutPoint, PublicKey, ScriptBuf, Sequence, TxOut, Txid};
use log::debug;
use serde::{Deserialize, Serialize};

use super::{ensure_positive, tx_in, tx_out, unsigned_tx, TrainBitcoin};
use crate::coins::{select_coins, settle_change, target};
use crate::config::protocol::{
    DEFAULT_FEE_SATS, DEFAULT_LEGACY_LOCK_BLOCKS, DUST_MERGE_SATS, DUST_P2WPKH_SATS,
};
use crate::error::{SwapError, SwapResult};
use crate::hashlock::verify_preimage;
use crate::script::{legacy_htlc_script, parse_legacy_htlc, LegacyHtlc};
use crate::services::ChainProvider;
use crate::signer::{sign_p2wpkh_inputs, sign_p2wsh_input};
use crate::witness::WitnessBuilder;

/// A funded legacy HTLC output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyContract {
    pub txid: Txid,
    pub vout: u32,
    pub value_sat: u64,
    pub witness_script: ScriptBuf,
}

impl LegacyContract {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.vout)
    }

    pub fn script_pubkey(&self) -> ScriptBuf {
        ScriptBuf::new_p2wsh(&self.witness_script.wscript_hash())
    }

    pub fn htlc(&self) -> SwapResult<LegacyHtlc> {
        parse_legacy_htlc(&self.witness_script)
    }
}

#[derive(Debug, Clone)]
pub struct LegacyLockRequest {
    pub amount_sat: u64,
    pub hashlock: [u8; 32],
    pub fee_sat: u64,
    /// Blocks above the current tip before the refund branch opens
    pub lock_blocks: u32,
}

impl LegacyLockRequest {
    pub fn new(amount_sat: u64, hashlock: [u8; 32]) -> Self {
        Self {
            amount_sat,
            hashlock,
            fee_sat: DEFAULT_FEE_SATS,
            lock_blocks: DEFAULT_LEGACY_LOCK_BLOCKS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyLockReceipt {
    pub txid: Txid,
    pub contract_address: String,
    pub cltv_height: u32,
    pub contract: LegacyContract,
}

/// Receipt of a legacy redeem or refund
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacySpendReceipt {
    pub txid: Txid,
    pub payout_sat: u64,
    pub raw_tx_hex: String,
}

impl<P: ChainProvider> TrainBitcoin<P> {
    /// Fund a P2WSH HTLC from the sender's P2WPKH UTXOs. The sender's key guards the
    /// refund branch, which opens at `tip + lock_blocks`.
    pub async fn legacy_lock(
        &self,
        sender: &Keypair,
        receiver: &PublicKey,
        request: LegacyLockRequest,
    ) -> SwapResult<LegacyLockReceipt> {
        ensure_positive("amount_sat", request.amount_sat)?;
        ensure_positive("lock_blocks", u64::from(request.lock_blocks))?;
        let needed = target(request.amount_sat, request.fee_sat)?;

        let tip = self.provider.get_current_block_info().await?;
        let cltv_height = tip
            .height
            .checked_add(request.lock_blocks)
            .filter(|height| LockTime::from_height(*height).is_ok())
            .ok_or_else(|| SwapError::InvalidTimelock {
                message: format!(
                    "tip {} + {} blocks is not a block height",
                    tip.height, request.lock_blocks
                ),
            })?;

        let refund = PublicKey::new(sender.public_key());
        let witness_script = legacy_htlc_script(&request.hashlock, receiver, &refund, cltv_height);
        let contract_address = Address::p2wsh(&witness_script, self.network());

        let sender_address = self.p2wpkh_address(&sender.public_key());
        let utxos = self.provider.get_utxos(&sender_address).await?;
        let selection = select_coins(&utxos, needed)?;
        let change = settle_change(selection.leftover_sat(), DUST_MERGE_SATS);
        let contract_value = request.amount_sat + change.folded_sat();

        let mut outputs = vec![tx_out(contract_value, contract_address.script_pubkey())];
        if let Some(value) = change.change_output_sat() {
            outputs.push(tx_out(value, sender_address.script_pubkey()));
        }

        let inputs = selection
            .utxos
            .iter()
            .map(|u| tx_in(u.outpoint(), Sequence::ENABLE_RBF_NO_LOCKTIME))
            .collect();
        let prevouts: Vec<TxOut> = selection
            .utxos
            .iter()
            .map(|u| tx_out(u.value_sat, sender_address.script_pubkey()))
            .collect();

        let mut tx = unsigned_tx(inputs, outputs, LockTime::ZERO);
        sign_p2wpkh_inputs(&self.secp, &mut tx, 0..prevouts.len(), &prevouts, sender)?;

        debug!(
            "Legacy lock plan: {} sats at {}, cltv height {}",
            contract_value, contract_address, cltv_height
        );

        let txid = self.broadcast("legacy-lock", &tx).await?;
        Ok(LegacyLockReceipt {
            txid,
            contract_address: contract_address.to_string(),
            cltv_height,
            contract: LegacyContract {
                txid,
                vout: 0,
                value_sat: contract_value,
                witness_script,
            },
        })
    }

    /// Claim through the hashlock branch: witness `[sig, secret, witnessScript]`.
    pub async fn legacy_redeem(
        &self,
        contract: &LegacyContract,
        receiver: &Keypair,
        secret: &[u8],
        fee_sat: u64,
    ) -> SwapResult<LegacySpendReceipt> {
        let htlc = contract.htlc()?;
        ensure_public_key(&htlc.receiver, &PublicKey::new(receiver.public_key()))?;
        verify_preimage(secret, &htlc.hashlock)?;
        let payout = legacy_payout(contract, fee_sat)?;

        self.verify_output(contract.outpoint(), contract.value_sat, &contract.script_pubkey())
            .await?;

        let destination = self.p2wpkh_address(&receiver.public_key());
        let mut tx = unsigned_tx(
            vec![tx_in(contract.outpoint(), Sequence::ENABLE_LOCKTIME_NO_RBF)],
            vec![tx_out(payout, destination.script_pubkey())],
            LockTime::ZERO,
        );
        let signature = sign_p2wsh_input(
            &self.secp,
            &tx,
            0,
            &contract.witness_script,
            Amount::from_sat(contract.value_sat),
            &receiver.secret_key(),
        )?;
        tx.input[0].witness = WitnessBuilder::new()
            .push_item(signature.to_vec())
            .push_item(secret)
            .push_item(contract.witness_script.as_bytes())
            .into_witness()?;

        let txid = self.broadcast("legacy-redeem", &tx).await?;
        Ok(LegacySpendReceipt {
            txid,
            payout_sat: payout,
            raw_tx_hex: serialize_hex(&tx),
        })
    }

    /// Reclaim through the CLTV branch once the tip has reached the lock height:
    /// witness `[sig, <empty>, witnessScript]`.
    pub async fn legacy_refund(
        &self,
        contract: &LegacyContract,
        refund: &Keypair,
        fee_sat: u64,
    ) -> SwapResult<LegacySpendReceipt> {
        let htlc = contract.htlc()?;
        ensure_public_key(&htlc.refund, &PublicKey::new(refund.public_key()))?;
        let payout = legacy_payout(contract, fee_sat)?;
        let lock_time = LockTime::from_height(htlc.cltv_height).map_err(|e| {
            SwapError::InvalidTimelock {
                message: e.to_string(),
            }
        })?;

        self.verify_output(contract.outpoint(), contract.value_sat, &contract.script_pubkey())
            .await?;
        let tip = self.provider.get_current_block_info().await?;
        if tip.height < htlc.cltv_height {
            return Err(SwapError::InvalidTimelock {
                message: format!(
                    "refund opens at height {}, tip is {}",
                    htlc.cltv_height, tip.height
                ),
            });
        }

        let destination = self.p2wpkh_address(&refund.public_key());
        let mut tx = unsigned_tx(
            vec![tx_in(contract.outpoint(), Sequence::ENABLE_LOCKTIME_NO_RBF)],
            vec![tx_out(payout, destination.script_pubkey())],
            lock_time,
        );
        let signature = sign_p2wsh_input(
            &self.secp,
            &tx,
            0,
            &contract.witness_script,
            Amount::from_sat(contract.value_sat),
            &refund.secret_key(),
        )?;
        tx.input[0].witness = WitnessBuilder::new()
            .push_item(signature.to_vec())
            .push_item(Vec::<u8>::new())
            .push_item(contract.witness_script.as_bytes())
            .into_witness()?;

        let txid = self.broadcast("legacy-refund", &tx).await?;
        Ok(LegacySpendReceipt {
            txid,
            payout_sat: payout,
            raw_tx_hex: serialize_hex(&tx),
        })
    }
}

fn legacy_payout(contract: &LegacyContract, fee_sat: u64) -> SwapResult<u64> {
    ensure_positive("fee_sat", fee_sat)?;
    contract
        .value_sat
        .checked_sub(fee_sat)
        .filter(|value| *value >= DUST_P2WPKH_SATS)
        .ok_or_else(|| {
            SwapError::input(
                "fee_sat",
                format!(
                    "fee {} leaves no spendable payout from {} sats",
                    fee_sat, contract.value_sat
                ),
            )
        })
}

fn ensure_public_key(expected: &PublicKey, actual: &PublicKey) -> SwapResult<()> {
    if expected != actual {
        return Err(SwapError::KeyMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}
