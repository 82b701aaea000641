use alloy_primitives::{hex, Address, U256};
use async_trait::async_trait;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use super::{rpc::RpcClient, ChainView};
use crate::{
    config::{parse_address, ChainConfig},
    errors::ChainError,
    types::{ChainId, UnixMillis},
};

const SELECTOR_BALANCE_OF: [u8; 4] = [0x70, 0xa0, 0x82, 0x31];
const SELECTOR_DECIMALS: [u8; 4] = [0x31, 0x3c, 0xe5, 0x67];
const SELECTOR_SYMBOL: [u8; 4] = [0x95, 0xd8, 0x9b, 0x41];

/// One position inside a treasury snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBalance {
    pub token: Address,
    pub symbol: String,
    pub decimals: u8,
    pub raw_balance: U256,
    pub usd_value: Option<f64>,
}

impl TokenBalance {
    /// Balance scaled by the token's decimals, for ratio math only.
    pub fn units(&self) -> f64 {
        super::u256_to_f64(self.raw_balance) / 10f64.powi(i32::from(self.decimals))
    }
}

/// Balances of one treasury wallet on one chain at one block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreasurySnapshot {
    pub chain_id: ChainId,
    pub wallet: Address,
    pub block_number: u64,
    pub taken_at: UnixMillis,
    pub balances: Vec<TokenBalance>,
}

impl TreasurySnapshot {
    pub fn total_usd(&self) -> f64 {
        self.balances
            .iter()
            .filter_map(|b| b.usd_value)
            .sum()
    }
}

/// Reads treasury balances. Implementations must not mutate chain state.
#[async_trait]
pub trait TreasuryReader: Send + Sync {
    async fn snapshot(&self, chain: &ChainConfig) -> Result<TreasurySnapshot, ChainError>;
}

/// JSON-RPC implementation of [`TreasuryReader`].
pub struct RpcTreasuryReader {
    retry: super::rpc::RetryPolicy,
}

impl RpcTreasuryReader {
    pub fn new(retry: super::rpc::RetryPolicy) -> Self {
        Self { retry }
    }
}

#[async_trait]
impl TreasuryReader for RpcTreasuryReader {
    async fn snapshot(&self, chain: &ChainConfig) -> Result<TreasurySnapshot, ChainError> {
        let url = Url::parse(&chain.rpc_url)
            .map_err(|e| ChainError::MalformedResponse(e.to_string()))?;
        let rpc = RpcClient::new(url, self.retry.clone());
        let wallet = chain
            .treasury()
            .map_err(|e| ChainError::MalformedResponse(e.to_string()))?;

        let block_number = rpc.block_number().await?;
        let mut balances = Vec::with_capacity(chain.tokens.len() + 1);

        let native = rpc.get_balance(wallet).await?;
        balances.push(TokenBalance {
            token: Address::ZERO,
            symbol: "NATIVE".to_string(),
            decimals: 18,
            raw_balance: native,
            usd_value: None,
        });

        for token_cfg in &chain.tokens {
            let token = parse_address("chains.tokens.address", &token_cfg.address)
                .map_err(|e| ChainError::MalformedResponse(e.to_string()))?;
            let raw_balance = rpc
                .eth_call(token, &encode_address_call(SELECTOR_BALANCE_OF, wallet))
                .await
                .map(|bytes| decode_u256(&bytes))?;
            let decimals = match rpc.eth_call(token, &encode_call(SELECTOR_DECIMALS)).await {
                Ok(bytes) => decode_u8(&bytes),
                Err(err) => {
                    warn!(%token, error = %err, "decimals() failed, assuming 18");
                    18
                }
            };
            let symbol = match rpc.eth_call(token, &encode_call(SELECTOR_SYMBOL)).await {
                Ok(bytes) => decode_string(&bytes),
                Err(_) => String::new(),
            };
            let usd_value = token_cfg.usd_price.map(|price| {
                let units = super::u256_to_f64(raw_balance) / 10f64.powi(i32::from(decimals));
                units * price
            });
            balances.push(TokenBalance {
                token,
                symbol,
                decimals,
                raw_balance,
                usd_value,
            });
        }

        Ok(TreasurySnapshot {
            chain_id: chain.chain_id(),
            wallet,
            block_number,
            taken_at: UnixMillis::now(),
            balances,
        })
    }
}

/// Snapshot every configured chain concurrently; failures are reported
/// per-chain so one unreachable RPC does not blank the whole run.
pub async fn snapshot_all(
    reader: &dyn TreasuryReader,
    chains: &[ChainConfig],
) -> Vec<Result<TreasurySnapshot, ChainError>> {
    join_all(chains.iter().map(|chain| reader.snapshot(chain))).await
}

fn encode_call(selector: [u8; 4]) -> String {
    format!("0x{}", hex::encode(selector))
}

fn encode_address_call(selector: [u8; 4], address: Address) -> String {
    let mut data = Vec::with_capacity(36);
    data.extend_from_slice(&selector);
    data.extend_from_slice(address.into_word().as_slice());
    format!("0x{}", hex::encode(data))
}

fn decode_u256(bytes: &[u8]) -> U256 {
    if bytes.len() >= 32 {
        U256::from_be_slice(&bytes[..32])
    } else {
        U256::from_be_slice(bytes)
    }
}

fn decode_u8(bytes: &[u8]) -> u8 {
    bytes.last().copied().unwrap_or(18)
}

/// Decode an ABI-encoded string return; falls back to trimming a bytes32
/// symbol (some older tokens return that instead).
fn decode_string(bytes: &[u8]) -> String {
    if bytes.len() >= 64 {
        let len = decode_u256(&bytes[32..64]);
        let len = u64::try_from(len).map(|v| v as usize).unwrap_or(0);
        if bytes.len() >= 64 + len {
            return String::from_utf8_lossy(&bytes[64..64 + len]).into_owned();
        }
    }
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\0')
        .to_string()
}
