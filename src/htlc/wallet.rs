//! Moves between an owner's P2WPKH and key-path P2TR addresses.

use bitcoin::absolute::LockTime;
use bitcoin::key::Keypair;
use bitcoin::{Sequence, TxOut, Txid};
use log::debug;
use serde::{Deserialize, Serialize};

use super::{ensure_positive, tx_in, tx_out, unsigned_tx, TrainBitcoin};
use crate::coins::{select_coins, settle_change, target};
use crate::config::protocol::{DUST_MERGE_SATS, DUST_P2WPKH_SATS};
use crate::error::{SwapError, SwapResult};
use crate::services::ChainProvider;
use crate::signer::{sign_key_path_inputs, sign_p2wpkh_inputs};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundReceipt {
    pub txid: Txid,
    pub taproot_address: String,
    /// Value of the P2TR output at vout 0
    pub value_sat: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepReceipt {
    pub txid: Txid,
    pub inputs: usize,
    pub swept_sat: u64,
    pub payout_sat: u64,
}

impl<P: ChainProvider> TrainBitcoin<P> {
    /// Move `amount_sat` from the owner's P2WPKH address to its key-path P2TR address,
    /// ready to be spent by [`Self::lock`].
    pub async fn fund_taproot(
        &self,
        owner: &Keypair,
        amount_sat: u64,
        fee_sat: u64,
    ) -> SwapResult<FundReceipt> {
        ensure_positive("amount_sat", amount_sat)?;
        let needed = target(amount_sat, fee_sat)?;

        let source = self.p2wpkh_address(&owner.public_key());
        let taproot = self.p2tr_key_address(owner.x_only_public_key().0);

        let utxos = self.provider.get_utxos(&source).await?;
        let selection = select_coins(&utxos, needed)?;
        let change = settle_change(selection.leftover_sat(), DUST_MERGE_SATS);
        let value = amount_sat + change.folded_sat();

        let mut outputs = vec![tx_out(value, taproot.script_pubkey())];
        if let Some(change_value) = change.change_output_sat() {
            outputs.push(tx_out(change_value, source.script_pubkey()));
        }
        let inputs = selection
            .utxos
            .iter()
            .map(|u| tx_in(u.outpoint(), Sequence::ENABLE_RBF_NO_LOCKTIME))
            .collect();
        let prevouts: Vec<TxOut> = selection
            .utxos
            .iter()
            .map(|u| tx_out(u.value_sat, source.script_pubkey()))
            .collect();

        let mut tx = unsigned_tx(inputs, outputs, LockTime::ZERO);
        sign_p2wpkh_inputs(&self.secp, &mut tx, 0..prevouts.len(), &prevouts, owner)?;

        debug!("Funding {} with {} sats, change {:?}", taproot, value, change);
        let txid = self.broadcast("fund-taproot", &tx).await?;
        Ok(FundReceipt {
            txid,
            taproot_address: taproot.to_string(),
            value_sat: value,
        })
    }

    /// Send every UTXO of the owner's key-path P2TR address back to its P2WPKH address.
    pub async fn sweep_taproot(&self, owner: &Keypair, fee_sat: u64) -> SwapResult<SweepReceipt> {
        ensure_positive("fee_sat", fee_sat)?;
        let taproot = self.p2tr_key_address(owner.x_only_public_key().0);
        let destination = self.p2wpkh_address(&owner.public_key());

        let utxos = self.provider.get_utxos(&taproot).await?;
        if utxos.is_empty() {
            return Err(SwapError::InsufficientFunds {
                required: fee_sat,
                available: 0,
                shortfall: fee_sat,
            });
        }
        let swept: u64 = utxos.iter().map(|u| u.value_sat).sum();
        let payout = swept
            .checked_sub(fee_sat)
            .filter(|value| *value >= DUST_P2WPKH_SATS)
            .ok_or_else(|| {
                let required = fee_sat + DUST_P2WPKH_SATS;
                SwapError::InsufficientFunds {
                    required,
                    available: swept,
                    shortfall: required.saturating_sub(swept),
                }
            })?;

        let inputs = utxos
            .iter()
            .map(|u| tx_in(u.outpoint(), Sequence::ENABLE_RBF_NO_LOCKTIME))
            .collect();
        let prevouts: Vec<TxOut> = utxos
            .iter()
            .map(|u| tx_out(u.value_sat, taproot.script_pubkey()))
            .collect();

        let mut tx = unsigned_tx(
            inputs,
            vec![tx_out(payout, destination.script_pubkey())],
            LockTime::ZERO,
        );
        sign_key_path_inputs(&self.secp, &mut tx, 0..prevouts.len(), &prevouts, owner)?;

        let txid = self.broadcast("sweep-taproot", &tx).await?;
        Ok(SweepReceipt {
            txid,
            inputs: utxos.len(),
            swept_sat: swept,
            payout_sat: payout,
        })
    }
}
