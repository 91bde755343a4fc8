//! # train-btc: Bitcoin engine for TRAIN atomic swaps
//!
//! Builds, signs and broadcasts the Bitcoin side of a cross-chain hash-time-locked
//! swap. Contracts are Taproot outputs with an unspendable internal key and two
//! script leaves; a legacy P2WSH HTLC is supported for counterparties without
//! Taproot.
//!
//! ## Contract trees
//!
//! ```text
//! commit:    [ <S> CHECKSIGVERIFY <R> CHECKSIG ]  [ <csv> CSV DROP <S> CHECKSIG ]
//! add-lock:  [ SHA256 <h> EQUALVERIFY <R> CHECKSIG ]  [ <csv> CSV DROP <S> CHECKSIG ]
//! lock:      same shape as add-lock, with the solver as S
//! ```
//!
//! ## Module Structure
//!
//! - [`script`]: leaf builders, parsers and CSV delay encoding
//! - [`taproot`]: tree derivation and control-block verification
//! - [`memo`]: fixed-width `OP_RETURN` memo codec
//! - [`coins`]: greedy coin selection and change/dust handling
//! - [`signer`] / [`witness`]: per-input signing and witness packing
//! - [`htlc`]: the swap phases on [`TrainBitcoin`]
//! - [`services`]: the [`ChainProvider`] seam and the mempool.space client
//! - [`config`] / [`error`]: constants, network selection and errors

pub mod coins;
pub mod config;
pub mod error;
pub mod hashlock;
pub mod htlc;
pub mod memo;
pub mod script;
pub mod services;
pub mod signer;
pub mod taproot;
pub mod types;
pub mod witness;

// Re-export commonly used types
pub use config::{Chain, EngineConfig};
pub use error::{SwapError, SwapResult};
pub use hashlock::HashPair;
pub use htlc::TrainBitcoin;
pub use memo::Memo;
pub use services::{ChainProvider, MempoolExplorer};
pub use types::{BlockInfo, ContractReference, TapLeafRef, TxInfo, Utxo};
