use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use alloy_primitives::{hex, Address, B256, U256};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};
use url::Url;

use super::{ChainView, TransferLog, TxReceipt, TRANSFER_TOPIC};
use crate::errors::ChainError;

/// Bounded exponential backoff applied to transport-level RPC failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            cap: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        let millis = self.base.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        Duration::from_millis(millis as u64).min(self.cap)
    }
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: Value,
    id: u64,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReceipt {
    status: String,
    block_number: String,
    logs: Vec<RawLog>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLog {
    address: Address,
    topics: Vec<B256>,
    data: String,
    block_number: Option<String>,
    transaction_hash: Option<B256>,
}

/// Async EVM JSON-RPC client over HTTP.
pub struct RpcClient {
    http: reqwest::Client,
    url: Url,
    next_id: AtomicU64,
    retry: RetryPolicy,
}

impl RpcClient {
    pub fn new(url: Url, retry: RetryPolicy) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
            next_id: AtomicU64::new(1),
            retry,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn call_once<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, ChainError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
        };
        let response = self
            .http
            .post(self.url.clone())
            .json(&request)
            .send()
            .await?;
        let status = response.status();
        if status.is_server_error() {
            return Err(ChainError::Unavailable(format!("http status {status}")));
        }
        let body: RpcResponse<T> = response.json().await?;
        if let Some(error) = body.error {
            return Err(ChainError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        body.result
            .ok_or_else(|| ChainError::MalformedResponse("empty result".to_string()))
    }

    /// Issue one RPC call, retrying transport failures with bounded
    /// exponential backoff.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, ChainError> {
        let mut attempt = 0;
        loop {
            match self.call_once(method, params.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt + 1 < self.retry.max_attempts => {
                    let delay = self.retry.delay(attempt);
                    warn!(%method, attempt, ?delay, error = %err, "rpc call failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    debug!(%method, attempt, error = %err, "rpc call exhausted");
                    return Err(err);
                }
            }
        }
    }

    pub async fn get_balance(&self, address: Address) -> Result<U256, ChainError> {
        let raw: String = self
            .call("eth_getBalance", json!([address, "latest"]))
            .await?;
        parse_u256(&raw)
    }

    pub async fn eth_call(&self, to: Address, data: &str) -> Result<Vec<u8>, ChainError> {
        let raw: String = self
            .call("eth_call", json!([{ "to": to, "data": data }, "latest"]))
            .await?;
        hex::decode(raw.trim_start_matches("0x"))
            .map_err(|e| ChainError::MalformedResponse(e.to_string()))
    }

    pub async fn send_transaction(
        &self,
        from: Address,
        to: Address,
        data: &str,
    ) -> Result<B256, ChainError> {
        self.call(
            "eth_sendTransaction",
            json!([{ "from": from, "to": to, "data": data }]),
        )
        .await
    }
}

#[async_trait]
impl ChainView for RpcClient {
    async fn block_number(&self) -> Result<u64, ChainError> {
        let raw: String = self.call("eth_blockNumber", json!([])).await?;
        parse_quantity(&raw)
    }

    async fn transaction_receipt(&self, tx_hash: B256) -> Result<Option<TxReceipt>, ChainError> {
        let raw: Option<RawReceipt> = self
            .call("eth_getTransactionReceipt", json!([tx_hash]))
            .await?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let block_number = parse_quantity(&raw.block_number)?;
        let status = parse_quantity(&raw.status)? == 1;
        let transfers = raw
            .logs
            .iter()
            .filter_map(|log| decode_transfer(log, tx_hash, block_number))
            .collect();
        Ok(Some(TxReceipt {
            status,
            block_number,
            transfers,
        }))
    }

    async fn transfer_logs(
        &self,
        token: Address,
        to: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TransferLog>, ChainError> {
        let filter = json!([{
            "address": token,
            "fromBlock": format!("0x{from_block:x}"),
            "toBlock": format!("0x{to_block:x}"),
            "topics": [TRANSFER_TOPIC, Value::Null, to.into_word()],
        }]);
        let raw: Vec<RawLog> = self.call("eth_getLogs", filter).await?;
        let mut transfers = Vec::with_capacity(raw.len());
        for log in raw {
            let block = match &log.block_number {
                Some(value) => parse_quantity(value)?,
                None => continue,
            };
            let Some(tx_hash) = log.transaction_hash else {
                continue;
            };
            if let Some(transfer) = decode_transfer(&log, tx_hash, block) {
                transfers.push(transfer);
            }
        }
        Ok(transfers)
    }
}

fn decode_transfer(log: &RawLog, tx_hash: B256, block_number: u64) -> Option<TransferLog> {
    if log.topics.len() < 3 || log.topics[0] != TRANSFER_TOPIC {
        return None;
    }
    let data = hex::decode(log.data.trim_start_matches("0x")).ok()?;
    if data.len() < 32 {
        return None;
    }
    Some(TransferLog {
        token: log.address,
        from: Address::from_word(log.topics[1]),
        to: Address::from_word(log.topics[2]),
        amount: U256::from_be_slice(&data[..32]),
        tx_hash,
        block_number,
    })
}

/// Parse a hex quantity (`0x`-prefixed) into u64.
pub fn parse_quantity(raw: &str) -> Result<u64, ChainError> {
    let trimmed = raw.trim_start_matches("0x");
    u64::from_str_radix(trimmed, 16)
        .map_err(|_| ChainError::MalformedResponse(format!("bad quantity {raw:?}")))
}

/// Parse a hex quantity into a full-width integer (balances).
pub fn parse_u256(raw: &str) -> Result<U256, ChainError> {
    let trimmed = raw.trim_start_matches("0x");
    U256::from_str_radix(trimmed, 16)
        .map_err(|_| ChainError::MalformedResponse(format!("bad quantity {raw:?}")))
}
