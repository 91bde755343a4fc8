//! # Configuration
//!
//! Protocol constants, explorer endpoints and the runtime [`EngineConfig`] that selects
//! which Bitcoin network the engine targets.

use std::env as std_env;
use std::time::Duration;

use bitcoin::Network;
use serde::{Deserialize, Serialize};

use crate::error::{SwapError, SwapResult};

/// Network and explorer configuration
pub mod network {
    use std::time::Duration;

    /// mempool.space mainnet API
    pub const MAINNET_API_BASE: &str = "https://mempool.space/api";

    /// mempool.space testnet3 API
    pub const TESTNET_API_BASE: &str = "https://mempool.space/testnet/api";

    /// mempool.space testnet4 API
    pub const TESTNET4_API_BASE: &str = "https://mempool.space/testnet4/api";

    /// mempool.space signet API
    pub const SIGNET_API_BASE: &str = "https://mempool.space/signet/api";

    /// Local esplora instance for regtest
    pub const REGTEST_API_BASE: &str = "http://127.0.0.1:3002";

    /// Request timeout for network operations
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
}

/// Protocol parameters shared by every phase
///
/// These values are part of the wire contract between the two swap counterparties:
/// changing any of the script-level constants changes the derived contract address.
pub mod protocol {
    /// Minimum refund delay in seconds.
    ///
    /// Every refund path must keep the counterparty from griefing a swap for at least
    /// this long. Commit and lock calls with a shorter delay fail before touching the
    /// network.
    pub const MIN_DELAY_SECS: u64 = 900;

    /// BIP68 time-based granularity (seconds per unit)
    pub const CSV_UNIT_SECS: u64 = 512;

    /// BIP68 type flag marking a time-based relative lock
    pub const CSV_TYPE_FLAG: u32 = 0x0040_0000;

    /// BIP68 value mask (16 bits of units)
    pub const CSV_VALUE_MASK: u32 = 0x0000_ffff;

    /// BIP68 disable flag; a sequence with this bit set carries no relative lock
    pub const CSV_DISABLE_FLAG: u32 = 0x8000_0000;

    /// Largest encodable number of 512-second units
    pub const CSV_MAX_UNITS: u32 = 0xffff;

    /// Lowest nLockTime value interpreted as a UNIX timestamp
    pub const LOCKTIME_THRESHOLD: u64 = 500_000_000;

    /// Allowance for median-time-past trailing the tip header time (about six blocks).
    /// CSV is enforced against MTP, so the local refund check waits this much longer.
    pub const MTP_LAG_SECS: u64 = 3_600;

    /// Default transaction fee in satoshis when the caller does not provide one
    pub const DEFAULT_FEE_SATS: u64 = 1_800;

    /// Leftover below this is merged into the contract output funded by the same selection
    pub const DUST_MERGE_SATS: u64 = 311;

    /// Leftover below this does not justify its own P2WPKH change output
    pub const DUST_P2WPKH_SATS: u64 = 331;

    /// Relay policy cap on the OP_RETURN payload
    pub const MAX_OP_RETURN_BYTES: usize = 80;

    /// Tapscript leaf version
    pub const TAPSCRIPT_LEAF_VERSION: u8 = 0xc0;

    /// BIP341 NUMS point x-coordinate (no known discrete log)
    pub const NUMS_INTERNAL_KEY_HEX: &str =
        "50929b74c1a04954b78b4b6035e97a5e078a5a0f28ec96d547bfee9ace803ac0";

    /// Blocks added to the tip height for the legacy P2WSH CLTV refund
    pub const DEFAULT_LEGACY_LOCK_BLOCKS: u32 = 2;
}

/// Environment variable names
pub mod env {
    /// Target chain (`mainnet`, `testnet`, `testnet4`, `signet`, `regtest`)
    pub const CHAIN: &str = "BTC_CHAIN";

    /// Override for the explorer API base URL
    pub const EXPLORER_URL: &str = "EXPLORER_URL";

    /// Request timeout override in seconds
    pub const EXPLORER_TIMEOUT_SECS: &str = "EXPLORER_TIMEOUT_SECS";
}

/// Bitcoin chains the engine can target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Mainnet,
    Testnet,
    Testnet4,
    Signet,
    Regtest,
}

impl Chain {
    /// Address and consensus parameters for this chain.
    ///
    /// Testnet4 shares testnet address prefixes.
    pub fn network(&self) -> Network {
        match self {
            Chain::Mainnet => Network::Bitcoin,
            Chain::Testnet | Chain::Testnet4 => Network::Testnet,
            Chain::Signet => Network::Signet,
            Chain::Regtest => Network::Regtest,
        }
    }

    /// Default explorer API base for this chain
    pub fn default_explorer_url(&self) -> &'static str {
        match self {
            Chain::Mainnet => network::MAINNET_API_BASE,
            Chain::Testnet => network::TESTNET_API_BASE,
            Chain::Testnet4 => network::TESTNET4_API_BASE,
            Chain::Signet => network::SIGNET_API_BASE,
            Chain::Regtest => network::REGTEST_API_BASE,
        }
    }
}

impl std::str::FromStr for Chain {
    type Err = SwapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mainnet" | "bitcoin" => Ok(Chain::Mainnet),
            "testnet" | "testnet3" => Ok(Chain::Testnet),
            "testnet4" => Ok(Chain::Testnet4),
            "signet" => Ok(Chain::Signet),
            "regtest" => Ok(Chain::Regtest),
            other => Err(SwapError::input(
                "chain",
                format!("unknown chain '{}'", other),
            )),
        }
    }
}

impl std::fmt::Display for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Chain::Mainnet => "mainnet",
            Chain::Testnet => "testnet",
            Chain::Testnet4 => "testnet4",
            Chain::Signet => "signet",
            Chain::Regtest => "regtest",
        };
        f.write_str(name)
    }
}

/// Runtime configuration for one engine instance
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub chain: Chain,
    pub explorer_url: String,
    pub request_timeout: Duration,
}

impl EngineConfig {
    /// Configuration with the chain's default explorer
    pub fn new(chain: Chain) -> Self {
        Self {
            chain,
            explorer_url: chain.default_explorer_url().to_string(),
            request_timeout: network::REQUEST_TIMEOUT,
        }
    }

    /// Load from the process environment, reading `.env` first when present.
    ///
    /// Unset variables fall back to testnet4 and its mempool.space endpoint.
    pub fn from_env() -> SwapResult<Self> {
        dotenv::dotenv().ok();

        let chain = match std_env::var(env::CHAIN) {
            Ok(value) => value.parse()?,
            Err(_) => Chain::Testnet4,
        };
        let mut config = Self::new(chain);

        if let Ok(url) = std_env::var(env::EXPLORER_URL) {
            config.explorer_url = url.trim_end_matches('/').to_string();
        }
        if let Ok(secs) = std_env::var(env::EXPLORER_TIMEOUT_SECS) {
            let secs: u64 = secs.parse().map_err(|_| {
                SwapError::input(env::EXPLORER_TIMEOUT_SECS, "expected whole seconds")
            })?;
            config.request_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }

    /// bitcoin network parameters for addresses
    pub fn network(&self) -> Network {
        self.chain.network()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_parsing() {
        assert_eq!("mainnet".parse::<Chain>().unwrap(), Chain::Mainnet);
        assert_eq!("Testnet4".parse::<Chain>().unwrap(), Chain::Testnet4);
        assert_eq!(" regtest ".parse::<Chain>().unwrap(), Chain::Regtest);
        assert!("litecoin".parse::<Chain>().is_err());
    }

    #[test]
    fn test_testnet4_uses_testnet_params() {
        assert_eq!(Chain::Testnet4.network(), Network::Testnet);
        assert_eq!(
            EngineConfig::new(Chain::Testnet4).explorer_url,
            network::TESTNET4_API_BASE
        );
    }

    #[test]
    fn test_chain_display_round_trips() {
        for chain in [
            Chain::Mainnet,
            Chain::Testnet,
            Chain::Testnet4,
            Chain::Signet,
            Chain::Regtest,
        ] {
            assert_eq!(chain.to_string().parse::<Chain>().unwrap(), chain);
        }
    }
}
