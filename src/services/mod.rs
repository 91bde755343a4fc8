//! # Services Module
//!
//! Chain-data collaborators of the swap engine.
//!
//! ## Components
//!
//! - **ChainProvider**: the trait every phase reads UTXOs, tip data and prior
//!   transactions through, and broadcasts with
//! - **Explorer Client**: Esplora / mempool.space REST implementation

pub mod explorer_client;

pub use explorer_client::MempoolExplorer;

use async_trait::async_trait;
use bitcoin::{Address, Txid};

use crate::error::SwapResult;
use crate::types::{BlockInfo, TxInfo, Utxo};

/// Source of chain data and the broadcast sink.
///
/// Responses are trusted as-is; no proofs are checked against them.
#[async_trait]
pub trait ChainProvider: Send + Sync {
    /// Unspent outputs currently paying `address`
    async fn get_utxos(&self, address: &Address) -> SwapResult<Vec<Utxo>>;

    /// Height and header time of the chain tip
    async fn get_current_block_info(&self) -> SwapResult<BlockInfo>;

    async fn get_transaction(&self, txid: &Txid) -> SwapResult<TxInfo>;

    /// Submit a raw transaction, returning the txid the provider reports
    async fn broadcast(&self, raw_tx_hex: &str) -> SwapResult<Txid>;
}
