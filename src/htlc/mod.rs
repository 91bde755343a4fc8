//! # Protocol State Machine
//!
//! [`TrainBitcoin`] composes the script builder, tree deriver, coin selector, signer
//! and witness packer into the swap phases:
//!
//! ```text
//! commit ──► add_lock_init / add_lock_finalize ──► redeem_solver | redeem
//!   │                    │                              ▲
//!   │                    └──────────► refund            │
//!   └──────────────────────────────► refund     lock ───┘
//! ```
//!
//! Each phase reads chain data through a [`ChainProvider`], builds and signs one
//! transaction, broadcasts it and returns the [`ContractReference`] the next phase
//! consumes. Phases of one swap must be called in order; independent swaps may run
//! concurrently.
//!
//! Every contract output sits at vout 0, followed by change, with the memo
//! `OP_RETURN` last.

mod add_lock;
mod commit;
mod legacy;
mod lock;
mod redeem;
mod refund;
mod wallet;


pub use add_lock::{AddLockInit, AddLockReceipt, AddLockRequest};
pub use commit::{CommitReceipt, CommitRequest, CommitRouting};
pub use legacy::{LegacyContract, LegacyLockReceipt, LegacyLockRequest, LegacySpendReceipt};
pub use lock::{LockReceipt, LockRequest, LockRouting};
pub use redeem::{RedeemReceipt, RedeemRequest, RedeemSolverRequest};
pub use refund::{RefundReceipt, RefundRequest};
pub use wallet::{FundReceipt, SweepReceipt};

use bitcoin::absolute::LockTime;
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::key::XOnlyPublicKey;
use bitcoin::secp256k1::{All, PublicKey, Secp256k1};
use bitcoin::taproot::ControlBlock;
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, CompressedPublicKey, Network, OutPoint, Script, ScriptBuf, Sequence,
    Transaction, TxIn, TxOut, Txid, Witness,
};
use log::{info, warn};

use crate::coins::{cover_fee, select_coins};
use crate::config::EngineConfig;
use crate::error::{SwapError, SwapResult};
use crate::services::ChainProvider;
use crate::taproot::{verify_leaf_ref, ContractTree};
use crate::types::{ContractReference, TxInfo, Utxo};

/// Bitcoin engine of the TRAIN swap protocol, parameterised by network config
pub struct TrainBitcoin<P: ChainProvider> {
    provider: P,
    config: EngineConfig,
    secp: Secp256k1<All>,
}

impl<P: ChainProvider> TrainBitcoin<P> {
    pub fn new(provider: P, config: EngineConfig) -> Self {
        Self {
            provider,
            config,
            secp: Secp256k1::new(),
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn network(&self) -> Network {
        self.config.network()
    }

    pub fn secp(&self) -> &Secp256k1<All> {
        &self.secp
    }

    /// P2WPKH address of `public_key` on the configured network
    pub fn p2wpkh_address(&self, public_key: &PublicKey) -> Address {
        Address::p2wpkh(&CompressedPublicKey(*public_key), self.network())
    }

    /// Key-path-only P2TR address of `internal_key`
    pub fn p2tr_key_address(&self, internal_key: XOnlyPublicKey) -> Address {
        Address::p2tr(&self.secp, internal_key, None, self.network())
    }

    /// Check the referenced output exists on chain as recorded.
    async fn verify_prev_output(&self, prev: &ContractReference) -> SwapResult<TxInfo> {
        self.verify_output(prev.outpoint(), prev.value_sat, &prev.script_pubkey)
            .await
    }

    async fn verify_output(
        &self,
        outpoint: OutPoint,
        value_sat: u64,
        script_pubkey: &Script,
    ) -> SwapResult<TxInfo> {
        let info = self.provider.get_transaction(&outpoint.txid).await?;
        let output = info.outputs.get(outpoint.vout as usize).ok_or_else(|| {
            SwapError::input(
                "prev",
                format!("{} has no output {}", outpoint.txid, outpoint.vout),
            )
        })?;
        if output.value_sat != value_sat {
            return Err(SwapError::input(
                "prev",
                format!(
                    "output {} holds {} sats, reference records {}",
                    outpoint, output.value_sat, value_sat
                ),
            ));
        }
        if output.script_pubkey.as_script() != script_pubkey {
            return Err(SwapError::input(
                "prev",
                format!("output {} pays a different script", outpoint),
            ));
        }
        Ok(info)
    }

    /// Check the reference's leaf is committed in its own output key.
    fn verify_contract_leaf(&self, prev: &ContractReference) -> SwapResult<ControlBlock> {
        verify_leaf_ref(&self.secp, &prev.script_pubkey, &prev.leaf)
    }

    /// Fee inputs from `owner`: the caller's list when given, otherwise a greedy
    /// selection of the owner's UTXOs that skips `exclude`. Returns the inputs and the
    /// leftover above the fee.
    async fn fee_inputs(
        &self,
        owner: &Address,
        supplied: Option<&[Utxo]>,
        fee_sat: u64,
        exclude: OutPoint,
    ) -> SwapResult<(Vec<Utxo>, u64)> {
        if let Some(utxos) = supplied {
            if utxos.iter().any(|utxo| utxo.outpoint() == exclude) {
                return Err(SwapError::input(
                    "fee_utxos",
                    format!("{} is the contract input and cannot pay the fee", exclude),
                ));
            }
            let leftover = cover_fee(utxos, fee_sat)?;
            return Ok((utxos.to_vec(), leftover));
        }
        let candidates: Vec<Utxo> = self
            .provider
            .get_utxos(owner)
            .await?
            .into_iter()
            .filter(|utxo| utxo.outpoint() != exclude)
            .collect();
        let selection = select_coins(&candidates, fee_sat)?;
        let leftover = selection.leftover_sat();
        Ok((selection.utxos, leftover))
    }

    /// Submit `tx`, preferring the provider's txid when the two disagree.
    async fn broadcast(&self, phase: &str, tx: &Transaction) -> SwapResult<Txid> {
        let local = tx.compute_txid();
        let reported = self.provider.broadcast(&serialize_hex(tx)).await?;
        if reported != local {
            warn!(
                "{}: provider reported txid {} but the transaction hashes to {}",
                phase, reported, local
            );
        }
        info!("{} broadcast: {}", phase, reported);
        Ok(reported)
    }
}

/// Unsigned input spending `outpoint`
fn tx_in(outpoint: OutPoint, sequence: Sequence) -> TxIn {
    TxIn {
        previous_output: outpoint,
        script_sig: ScriptBuf::new(),
        sequence,
        witness: Witness::new(),
    }
}

fn tx_out(value_sat: u64, script_pubkey: ScriptBuf) -> TxOut {
    TxOut {
        value: Amount::from_sat(value_sat),
        script_pubkey,
    }
}

fn unsigned_tx(input: Vec<TxIn>, output: Vec<TxOut>, lock_time: LockTime) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time,
        input,
        output,
    }
}

/// Reference to output `vout` of `txid`, revealing `leaf` of `tree`
fn contract_reference(
    txid: Txid,
    vout: u32,
    value_sat: u64,
    tree: &ContractTree,
    leaf: &ScriptBuf,
) -> SwapResult<ContractReference> {
    Ok(ContractReference {
        txid,
        vout,
        value_sat,
        script_pubkey: tree.script_pubkey(),
        leaf: tree.leaf_ref(leaf)?,
    })
}

fn ensure_positive(field: &str, value: u64) -> SwapResult<()> {
    if value == 0 {
        return Err(SwapError::input(field, "must be greater than zero"));
    }
    Ok(())
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
