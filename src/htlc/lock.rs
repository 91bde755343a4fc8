use bitcoin::absolute::LockTime;
use bitcoin::key::{Keypair, XOnlyPublicKey};
use bitcoin::{Sequence, TxOut, Txid};
use log::debug;
use serde::{Deserialize, Serialize};

use super::{contract_reference, ensure_positive, tx_in, tx_out, unsigned_tx, TrainBitcoin};
use crate::coins::{select_coins, settle_change, target};
use crate::config::protocol::{DEFAULT_FEE_SATS, DUST_MERGE_SATS};
use crate::error::SwapResult;
use crate::memo::{op_return_script, LockMemo, MemoPayload, PaddedAscii};
use crate::script::{hashlock_leaf, refund_leaf, CsvDelay};
use crate::services::ChainProvider;
use crate::signer::sign_key_path_inputs;
use crate::taproot::{ContractTree, InternalKey};
use crate::types::ContractReference;

/// Routing fields of the lock memo
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRouting {
    pub lock_id: [u8; 32],
    pub dst_chain: String,
    pub dst_asset: String,
}

#[derive(Debug, Clone)]
pub struct LockRequest {
    pub amount_sat: u64,
    pub hashlock: [u8; 32],
    pub delay_secs: u64,
    pub fee_sat: u64,
    pub routing: Option<LockRouting>,
}

impl LockRequest {
    pub fn new(amount_sat: u64, hashlock: [u8; 32], delay_secs: u64) -> Self {
        Self {
            amount_sat,
            hashlock,
            delay_secs,
            fee_sat: DEFAULT_FEE_SATS,
            routing: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockReceipt {
    pub txid: Txid,
    pub contract_address: String,
    pub csv_sequence: u32,
    /// Revealing the hashlock leaf (receiver redeem)
    pub contract: ContractReference,
    /// Revealing the refund leaf (solver refund)
    pub refund: ContractReference,
}

impl<P: ChainProvider> TrainBitcoin<P> {
    /// Solver locks its own funds behind `hashlock` for `receiver`, refundable to the
    /// solver after the CSV delay.
    ///
    /// Funds come from the solver's key-path P2TR address (see [`Self::fund_taproot`]).
    pub async fn lock(
        &self,
        solver: &Keypair,
        receiver: &XOnlyPublicKey,
        request: LockRequest,
    ) -> SwapResult<LockReceipt> {
        ensure_positive("amount_sat", request.amount_sat)?;
        let delay = CsvDelay::from_seconds(request.delay_secs)?;
        let needed = target(request.amount_sat, request.fee_sat)?;

        let memo = match &request.routing {
            Some(routing) => Some(
                LockMemo {
                    lock_id: routing.lock_id,
                    hashlock: request.hashlock,
                    csv_sequence: delay.to_consensus_u32(),
                    dst_chain: PaddedAscii::new("dst_chain", &routing.dst_chain)?,
                    dst_asset: PaddedAscii::new("dst_asset", &routing.dst_asset)?,
                }
                .encode()?,
            ),
            None => None,
        };

        let (solver_x, _) = solver.x_only_public_key();
        let hashlock_script = hashlock_leaf(&request.hashlock, receiver);
        let refund_script = refund_leaf(delay, &solver_x);
        let tree = ContractTree::derive(
            &self.secp,
            InternalKey::Unspendable,
            hashlock_script.clone(),
            refund_script.clone(),
        )?;

        let solver_address = self.p2tr_key_address(solver_x);
        let utxos = self.provider.get_utxos(&solver_address).await?;
        let selection = select_coins(&utxos, needed)?;
        let change = settle_change(selection.leftover_sat(), DUST_MERGE_SATS);
        let contract_value = request.amount_sat + change.folded_sat();

        let mut outputs = vec![tx_out(contract_value, tree.script_pubkey())];
        if let Some(value) = change.change_output_sat() {
            outputs.push(tx_out(value, solver_address.script_pubkey()));
        }
        if let Some(payload) = &memo {
            outputs.push(tx_out(0, op_return_script(payload)?));
        }

        let inputs = selection
            .utxos
            .iter()
            .map(|u| tx_in(u.outpoint(), Sequence::ENABLE_RBF_NO_LOCKTIME))
            .collect();
        let prevouts: Vec<TxOut> = selection
            .utxos
            .iter()
            .map(|u| tx_out(u.value_sat, solver_address.script_pubkey()))
            .collect();

        let mut tx = unsigned_tx(inputs, outputs, LockTime::ZERO);
        sign_key_path_inputs(&self.secp, &mut tx, 0..prevouts.len(), &prevouts, solver)?;

        debug!(
            "Lock plan: contract {} sats, change {:?}, csv {:#010x}",
            contract_value,
            change,
            delay.to_consensus_u32()
        );

        let txid = self.broadcast("lock", &tx).await?;
        let contract = contract_reference(txid, 0, contract_value, &tree, &hashlock_script)?;
        let refund = contract.with_leaf(tree.leaf_ref(&refund_script)?);

        Ok(LockReceipt {
            txid,
            contract_address: tree.address(self.network()).to_string(),
            csv_sequence: delay.to_consensus_u32(),
            contract,
            refund,
        })
    }
}
