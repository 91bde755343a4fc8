//! # train-btc
//!
//! Inspection helpers for TRAIN swap contracts on Bitcoin.
//!
//! ```bash
//! # Fresh secret and its SHA-256 hashlock
//! train-btc hash-pair
//!
//! # Decode an OP_RETURN memo payload
//! train-btc decode-memo <hex>
//!
//! # Decode every memo in a transaction (txid fetched from the explorer, or raw hex)
//! train-btc decode-tx <txid|raw-tx-hex>
//!
//! # Derive a contract address without touching the chain
//! train-btc contract-address --sender <xonly> --receiver <xonly> --delay 3600
//! ```
//!
//! The chain and explorer come from `BTC_CHAIN` / `EXPLORER_URL` (a `.env` file is read).

use std::str::FromStr;

use anyhow::{Context, Result};
use bitcoin::consensus::deserialize;
use bitcoin::key::XOnlyPublicKey;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{Transaction, Txid};
use clap::{Parser, Subcommand};
use log::debug;
use serde_json::json;

use train_btc::hashlock::bytes32_from_hex;
use train_btc::memo::{decode_transaction_memos, extract_op_return_payloads};
use train_btc::script::{hashlock_leaf, multisig_leaf, refund_leaf, CsvDelay};
use train_btc::taproot::{ContractTree, InternalKey};
use train_btc::{ChainProvider, EngineConfig, HashPair, MempoolExplorer, Memo};

#[derive(Parser)]
#[command(name = "train-btc")]
#[command(about = "Bitcoin side of TRAIN cross-chain atomic swaps")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a random secret and its hashlock
    HashPair,
    /// Decode a memo payload given as hex
    DecodeMemo {
        /// Memo bytes (without the OP_RETURN opcode)
        hex: String,
    },
    /// Decode the memos of a transaction
    DecodeTx {
        /// Txid to fetch from the explorer, or a raw transaction in hex
        tx: String,
    },
    /// Derive the Taproot contract address for a pair of keys
    ContractAddress {
        /// Sender x-only public key (refund path)
        #[arg(long)]
        sender: String,
        /// Receiver x-only public key
        #[arg(long)]
        receiver: String,
        /// Refund delay in seconds
        #[arg(long)]
        delay: u64,
        /// Hashlock for an add-lock/lock contract; a commit contract when absent
        #[arg(long)]
        hashlock: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::HashPair => hash_pair()?,
        Commands::DecodeMemo { hex } => decode_memo(&hex)?,
        Commands::DecodeTx { tx } => decode_tx(&tx).await?,
        Commands::ContractAddress {
            sender,
            receiver,
            delay,
            hashlock,
        } => contract_address(&sender, &receiver, delay, hashlock.as_deref())?,
    }

    Ok(())
}

fn hash_pair() -> Result<()> {
    let pair = HashPair::generate();
    println!("{}", serde_json::to_string_pretty(&pair)?);
    Ok(())
}

fn decode_memo(payload: &str) -> Result<()> {
    let bytes = hex::decode(payload.trim().trim_start_matches("0x")).context("memo is not hex")?;
    let memo = Memo::decode(&bytes);
    println!("{}", serde_json::to_string_pretty(&memo)?);
    Ok(())
}

async fn decode_tx(tx: &str) -> Result<()> {
    let tx = tx.trim();

    if let Ok(txid) = Txid::from_str(tx) {
        let config = EngineConfig::from_env()?;
        debug!("Fetching {} from {}", txid, config.explorer_url);
        let explorer = MempoolExplorer::new(&config)?;
        let info = explorer.get_transaction(&txid).await?;

        let memos: Vec<_> = info
            .outputs
            .iter()
            .enumerate()
            .filter_map(|(vout, output)| {
                let memos: Vec<Memo> = extract_op_return_payloads(&output.script_pubkey)
                    .iter()
                    .map(|payload| Memo::decode(payload))
                    .collect();
                (!memos.is_empty()).then(|| json!({ "vout": vout, "memos": memos }))
            })
            .collect();
        let confirmed = info.confirmation.map(|block| {
            json!({
                "height": block.height,
                "time": block.datetime().map(|t| t.to_rfc3339()),
            })
        });
        let report = json!({ "txid": txid, "confirmation": confirmed, "outputs": memos });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let raw = hex::decode(tx).context("expected a txid or raw transaction hex")?;
    let transaction: Transaction = deserialize(&raw).context("not a transaction")?;
    let memos: Vec<_> = decode_transaction_memos(&transaction)
        .into_iter()
        .map(|(vout, memos)| json!({ "vout": vout, "memos": memos }))
        .collect();
    let report = json!({ "txid": transaction.compute_txid(), "outputs": memos });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn contract_address(
    sender: &str,
    receiver: &str,
    delay_secs: u64,
    hashlock: Option<&str>,
) -> Result<()> {
    let config = EngineConfig::from_env()?;
    let sender = XOnlyPublicKey::from_str(sender).context("invalid sender key")?;
    let receiver = XOnlyPublicKey::from_str(receiver).context("invalid receiver key")?;
    let delay = CsvDelay::from_seconds(delay_secs)?;

    let first = match hashlock {
        Some(h) => hashlock_leaf(&bytes32_from_hex("hashlock", h)?, &receiver),
        None => multisig_leaf(&sender, &receiver),
    };
    let refund = refund_leaf(delay, &sender);

    let secp = Secp256k1::verification_only();
    let tree = ContractTree::derive(&secp, InternalKey::Unspendable, first.clone(), refund.clone())?;

    let report = json!({
        "chain": config.chain,
        "address": tree.address(config.network()).to_string(),
        "output_key": tree.output_key().to_string(),
        "csv_sequence": format!("{:#010x}", delay.to_consensus_u32()),
        "delay_secs": delay.seconds(),
        "leaves": [first.to_hex_string(), refund.to_hex_string()],
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
