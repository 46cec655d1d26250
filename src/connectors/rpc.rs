// src/connectors/rpc.rs
//
// Ethereum JSON-RPC endpoint over HTTP.

use super::{ChainError, ReceiptInfo};
use crate::traits::LedgerClient;
use alloy::primitives::{hex, Address, Bytes, B256, U256};
use async_trait::async_trait;
use log::debug;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use url::Url;

#[derive(Deserialize, Debug)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize, Debug)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Deserialize, Debug)]
struct RawReceipt {
    #[serde(rename = "blockNumber")]
    block_number: Option<String>,
    status: Option<String>,
}

/// A single JSON-RPC endpoint.
pub struct RpcClient {
    url: Url,
    endpoint: String,
    http_client: reqwest::Client,
    next_id: AtomicU64,
}

impl RpcClient {
    /// Creates a client for `url`. Every request is bounded by `timeout`.
    pub fn new(url: &str, timeout: Duration) -> Result<Self, ChainError> {
        let parsed = Url::parse(url).map_err(|e| ChainError::Decode(format!("bad RPC URL {}: {}", url, e)))?;
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChainError::Transport(e.to_string()))?;

        Ok(Self {
            endpoint: parsed.to_string(),
            url: parsed,
            http_client,
            next_id: AtomicU64::new(1),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, ChainError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        debug!("RpcClient[{}]: {} #{}", self.endpoint, method, id);

        let response = self
            .http_client
            .post(self.url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| ChainError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ChainError::Transport(format!("HTTP {}", response.status())));
        }

        let parsed: RpcResponse = response
            .json()
            .await
            .map_err(|e| ChainError::Transport(format!("bad response body: {}", e)))?;

        if let Some(err) = parsed.error {
            return Err(ChainError::Rpc {
                code: err.code,
                message: err.message,
            });
        }

        serde_json::from_value(parsed.result)
            .map_err(|e| ChainError::Decode(format!("{}: {}", method, e)))
    }
}

#[async_trait]
impl LedgerClient for RpcClient {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        let raw: String = self.call("eth_blockNumber", json!([])).await?;
        parse_u64(&raw)
    }

    async fn balance(&self, address: Address) -> Result<U256, ChainError> {
        let raw: String = self
            .call("eth_getBalance", json!([address.to_string(), "latest"]))
            .await?;
        parse_u256(&raw)
    }

    async fn gas_price(&self) -> Result<u128, ChainError> {
        let raw: String = self.call("eth_gasPrice", json!([])).await?;
        let value = parse_u256(&raw)?;
        u128::try_from(value).map_err(|_| ChainError::Decode(format!("gas price out of range: {}", raw)))
    }

    async fn transaction_count(&self, address: Address) -> Result<u64, ChainError> {
        let raw: String = self
            .call("eth_getTransactionCount", json!([address.to_string(), "pending"]))
            .await?;
        parse_u64(&raw)
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<B256, ChainError> {
        let hash: String = self
            .call("eth_sendRawTransaction", json!([hex::encode_prefixed(&raw)]))
            .await?;
        B256::from_str(&hash).map_err(|e| ChainError::Decode(format!("bad tx hash {}: {}", hash, e)))
    }

    async fn transaction_receipt(&self, hash: B256) -> Result<Option<ReceiptInfo>, ChainError> {
        let receipt: Option<RawReceipt> = self
            .call("eth_getTransactionReceipt", json!([hex::encode_prefixed(hash)]))
            .await?;

        let Some(receipt) = receipt else {
            return Ok(None);
        };
        // Some nodes return a receipt stub before inclusion.
        let Some(block) = receipt.block_number else {
            return Ok(None);
        };

        Ok(Some(ReceiptInfo {
            block_number: parse_u64(&block)?,
            success: receipt.status.as_deref().map(parse_u64).transpose()?.unwrap_or(1) == 1,
        }))
    }
}

/// Parses a hex quantity ("0x1a") into a u64.
fn parse_u64(raw: &str) -> Result<u64, ChainError> {
    let digits = raw.trim_start_matches("0x");
    u64::from_str_radix(digits, 16).map_err(|e| ChainError::Decode(format!("bad quantity {}: {}", raw, e)))
}

fn parse_u256(raw: &str) -> Result<U256, ChainError> {
    let digits = raw.trim_start_matches("0x");
    U256::from_str_radix(digits, 16).map_err(|e| ChainError::Decode(format!("bad quantity {}: {}", raw, e)))
}
