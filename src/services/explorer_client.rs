use std::str::FromStr;

use async_trait::async_trait;
use bitcoin::{Address, ScriptBuf, Txid};
use log::debug;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::ChainProvider;
use crate::config::EngineConfig;
use crate::error::{NetworkError, SwapError, SwapResult};
use crate::types::{BlockInfo, TxInfo, TxOutInfo, Utxo};

/// UTXO entry from `/address/:address/utxo`
#[derive(Debug, Deserialize)]
struct UtxoEntry {
    txid: String,
    vout: u32,
    value: u64,
}

/// Confirmation status attached to transactions
#[derive(Debug, Deserialize)]
struct TxStatus {
    confirmed: bool,
    block_height: Option<u32>,
    block_time: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TxOutput {
    scriptpubkey: String,
    value: u64,
}

/// Transaction detail from `/tx/:txid`
#[derive(Debug, Deserialize)]
struct TxEntry {
    vout: Vec<TxOutput>,
    status: TxStatus,
}

/// Block header summary from `/block/:hash`
#[derive(Debug, Deserialize)]
struct BlockEntry {
    height: u32,
    timestamp: u64,
}

/// Client for an Esplora-compatible explorer API (mempool.space and friends)
#[derive(Debug, Clone)]
pub struct MempoolExplorer {
    client: Client,
    api_base: String,
}

impl MempoolExplorer {
    /// Create a new explorer client
    pub fn new(config: &EngineConfig) -> SwapResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SwapError::provider("client_creation", e.to_string()))?;

        Ok(Self {
            client,
            api_base: config.explorer_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    async fn get(&self, path: &str) -> SwapResult<Response> {
        let url = format!("{}{}", self.api_base, path);
        debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SwapError::Network { source: e })?;
        check_status(response).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> SwapResult<T> {
        self.get(path)
            .await?
            .json()
            .await
            .map_err(|e| SwapError::Network { source: e })
    }

    async fn get_text(&self, path: &str) -> SwapResult<String> {
        let text = self
            .get(path)
            .await?
            .text()
            .await
            .map_err(|e| SwapError::Network { source: e })?;
        Ok(text.trim().to_string())
    }
}

async fn check_status(response: Response) -> SwapResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(NetworkError::HttpError {
        status: status.as_u16(),
        message,
    }
    .into())
}

fn parse_txid(value: &str) -> SwapResult<Txid> {
    Txid::from_str(value.trim()).map_err(|e| {
        NetworkError::InvalidResponse {
            message: format!("bad txid '{}': {}", value, e),
        }
        .into()
    })
}

#[async_trait]
impl ChainProvider for MempoolExplorer {
    async fn get_utxos(&self, address: &Address) -> SwapResult<Vec<Utxo>> {
        let entries: Vec<UtxoEntry> = self.get_json(&format!("/address/{}/utxo", address)).await?;
        entries
            .into_iter()
            .map(|entry| -> SwapResult<Utxo> {
                Ok(Utxo {
                    txid: parse_txid(&entry.txid)?,
                    vout: entry.vout,
                    value_sat: entry.value,
                })
            })
            .collect()
    }

    async fn get_current_block_info(&self) -> SwapResult<BlockInfo> {
        let height: u32 = self
            .get_text("/blocks/tip/height")
            .await?
            .parse()
            .map_err(|_| NetworkError::InvalidResponse {
                message: "tip height is not a number".to_string(),
            })?;
        let hash = self.get_text("/blocks/tip/hash").await?;
        let block: BlockEntry = self.get_json(&format!("/block/{}", hash)).await?;

        // tip may advance between calls; the fetched block wins
        if block.height != height {
            debug!("Tip moved from {} to {} while reading", height, block.height);
        }
        Ok(BlockInfo {
            height: block.height,
            timestamp: block.timestamp,
        })
    }

    async fn get_transaction(&self, txid: &Txid) -> SwapResult<TxInfo> {
        let entry: TxEntry = self.get_json(&format!("/tx/{}", txid)).await?;

        let outputs = entry
            .vout
            .into_iter()
            .map(|out| -> SwapResult<TxOutInfo> {
                let script = hex::decode(&out.scriptpubkey).map_err(|e| NetworkError::InvalidResponse {
                    message: format!("bad scriptpubkey hex: {}", e),
                })?;
                Ok(TxOutInfo {
                    value_sat: out.value,
                    script_pubkey: ScriptBuf::from_bytes(script),
                })
            })
            .collect::<SwapResult<Vec<_>>>()?;

        let confirmation = match (entry.status.confirmed, entry.status.block_height, entry.status.block_time) {
            (true, Some(height), Some(timestamp)) => Some(BlockInfo { height, timestamp }),
            _ => None,
        };

        Ok(TxInfo {
            outputs,
            confirmation,
        })
    }

    async fn broadcast(&self, raw_tx_hex: &str) -> SwapResult<Txid> {
        let url = format!("{}/tx", self.api_base);
        let response = self
            .client
            .post(&url)
            .body(raw_tx_hex.to_string())
            .send()
            .await
            .map_err(|e| SwapError::Network { source: e })?;
        let text = check_status(response)
            .await?
            .text()
            .await
            .map_err(|e| SwapError::Network { source: e })?;
        parse_txid(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Chain;

    #[test]
    fn test_tx_entry_parsing() {
        let json = r#"{
            "txid": "b6a4139c8df6177127ee8e0e4189e53268c0d7ead7eea44674ffa96ad20ed691",
            "vout": [
                {"scriptpubkey": "5120aa", "scriptpubkey_type": "v1_p2tr", "value": 100000},
                {"scriptpubkey": "6a0101", "scriptpubkey_type": "op_return", "value": 0}
            ],
            "status": {"confirmed": true, "block_height": 90000, "block_time": 1750000000}
        }"#;
        let entry: TxEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.vout.len(), 2);
        assert_eq!(entry.vout[0].value, 100_000);
        assert!(entry.status.confirmed);
        assert_eq!(entry.status.block_time, Some(1_750_000_000));
    }

    #[test]
    fn test_unconfirmed_status_parsing() {
        let status: TxStatus = serde_json::from_str(r#"{"confirmed": false}"#).unwrap();
        assert!(!status.confirmed);
        assert!(status.block_height.is_none());
    }

    #[test]
    fn test_api_base_trailing_slash() {
        let mut config = EngineConfig::new(Chain::Signet);
        config.explorer_url = "https://example.org/api/".to_string();
        let explorer = MempoolExplorer::new(&config).unwrap();
        assert_eq!(explorer.api_base(), "https://example.org/api");
    }

    #[tokio::test]
    #[ignore] // Requires network access
    async fn test_live_tip() {
        let explorer = MempoolExplorer::new(&EngineConfig::new(Chain::Testnet4)).unwrap();
        let tip = explorer.get_current_block_info().await.unwrap();
        assert!(tip.height > 0);
        assert!(tip.timestamp > 1_700_000_000);
    }
}
