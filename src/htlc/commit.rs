use bitcoin::absolute::LockTime;
use bitcoin::key::{Keypair, XOnlyPublicKey};
use bitcoin::{Sequence, TxOut, Txid};
use log::debug;
use serde::{Deserialize, Serialize};

use super::{contract_reference, ensure_positive, tx_in, tx_out, unsigned_tx, TrainBitcoin};
use crate::coins::{select_coins, settle_change, target};
use crate::config::protocol::{DEFAULT_FEE_SATS, DUST_MERGE_SATS, LOCKTIME_THRESHOLD};
use crate::error::{SwapError, SwapResult};
use crate::memo::{op_return_script, CommitLog, MemoPayload, PaddedAscii};
use crate::script::{multisig_leaf, refund_leaf, CsvDelay};
use crate::services::ChainProvider;
use crate::signer::sign_p2wpkh_inputs;
use crate::taproot::{ContractTree, InternalKey};
use crate::types::ContractReference;

/// Destination routing published in the commit log memo
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRouting {
    pub commit_id: [u8; 32],
    pub dst_chain: String,
    pub dst_address: [u8; 20],
    pub dst_asset: String,
    pub src_receiver: String,
}

#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub amount_sat: u64,
    pub delay_secs: u64,
    pub fee_sat: u64,
    pub routing: Option<CommitRouting>,
}

impl CommitRequest {
    pub fn new(amount_sat: u64, delay_secs: u64) -> Self {
        Self {
            amount_sat,
            delay_secs,
            fee_sat: DEFAULT_FEE_SATS,
            routing: None,
        }
    }
}

/// Everything the later phases need about a commit.
///
/// `contract` reveals the multisig leaf (cooperative add-lock), `refund` reveals the
/// refund leaf of the same output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitReceipt {
    pub txid: Txid,
    pub contract_address: String,
    /// Approximate UNIX time the refund path opens
    pub timelock: u64,
    pub csv_sequence: u32,
    pub contract: ContractReference,
    pub refund: ContractReference,
}

impl<P: ChainProvider> TrainBitcoin<P> {
    /// Lock `amount_sat` of the sender's P2WPKH funds into a contract that either both
    /// parties spend cooperatively or the sender reclaims after the CSV delay.
    pub async fn commit(
        &self,
        sender: &Keypair,
        receiver: &XOnlyPublicKey,
        request: CommitRequest,
    ) -> SwapResult<CommitReceipt> {
        ensure_positive("amount_sat", request.amount_sat)?;
        let delay = CsvDelay::from_seconds(request.delay_secs)?;
        let needed = target(request.amount_sat, request.fee_sat)?;

        let (sender_x, _) = sender.x_only_public_key();
        let multisig_script = multisig_leaf(&sender_x, receiver);
        let refund_script = refund_leaf(delay, &sender_x);
        let tree = ContractTree::derive(
            &self.secp,
            InternalKey::Unspendable,
            multisig_script.clone(),
            refund_script.clone(),
        )?;

        let tip = self.provider.get_current_block_info().await?;
        let timelock = tip.timestamp + delay.seconds();
        if timelock < LOCKTIME_THRESHOLD {
            return Err(SwapError::InvalidTimelock {
                message: format!("timelock {} is not a UNIX timestamp", timelock),
            });
        }

        let memo = match &request.routing {
            Some(routing) => Some(
                CommitLog {
                    commit_id: routing.commit_id,
                    timelock,
                    dst_chain: PaddedAscii::new("dst_chain", &routing.dst_chain)?,
                    dst_address: routing.dst_address,
                    dst_asset: PaddedAscii::new("dst_asset", &routing.dst_asset)?,
                    src_receiver: PaddedAscii::new("src_receiver", &routing.src_receiver)?,
                }
                .encode()?,
            ),
            None => None,
        };

        let sender_address = self.p2wpkh_address(&sender.public_key());
        let utxos = self.provider.get_utxos(&sender_address).await?;
        let selection = select_coins(&utxos, needed)?;
        let change = settle_change(selection.leftover_sat(), DUST_MERGE_SATS);
        let contract_value = request.amount_sat + change.folded_sat();

        let mut outputs = vec![tx_out(contract_value, tree.script_pubkey())];
        if let Some(value) = change.change_output_sat() {
            outputs.push(tx_out(value, sender_address.script_pubkey()));
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
            .map(|u| tx_out(u.value_sat, sender_address.script_pubkey()))
            .collect();

        let mut tx = unsigned_tx(inputs, outputs, LockTime::ZERO);
        sign_p2wpkh_inputs(&self.secp, &mut tx, 0..prevouts.len(), &prevouts, sender)?;

        debug!(
            "Commit plan: contract {} sats at {}, change {:?}, csv {:#010x}",
            contract_value,
            tree.address(self.network()),
            change,
            delay.to_consensus_u32()
        );

        let txid = self.broadcast("commit", &tx).await?;
        let contract = contract_reference(txid, 0, contract_value, &tree, &multisig_script)?;
        let refund = contract.with_leaf(tree.leaf_ref(&refund_script)?);

        Ok(CommitReceipt {
            txid,
            contract_address: tree.address(self.network()).to_string(),
            timelock,
            csv_sequence: delay.to_consensus_u32(),
            contract,
            refund,
        })
    }
}
