pub mod rpc;
pub mod treasury;
pub mod verifier;

use alloy_primitives::{b256, Address, B256, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::ChainError;

/// keccak256("Transfer(address,address,uint256)")
pub const TRANSFER_TOPIC: B256 =
    b256!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef");

/// Lossy widening of a full-width balance for ratio math. Budget-affecting
/// quantities never go through this.
pub fn u256_to_f64(value: U256) -> f64 {
    value
        .as_limbs()
        .iter()
        .rev()
        .fold(0.0, |acc, &limb| acc * 2f64.powi(64) + limb as f64)
}

/// A decoded ERC-20 Transfer event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferLog {
    pub token: Address,
    pub from: Address,
    pub to: Address,
    pub amount: U256,
    pub tx_hash: B256,
    pub block_number: u64,
}

/// Transaction receipt reduced to what settlement verification needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub status: bool,
    pub block_number: u64,
    pub transfers: Vec<TransferLog>,
}

/// Read-only view of one EVM chain. The production implementation is the
/// JSON-RPC client; tests substitute in-memory fakes.
#[async_trait]
pub trait ChainView: Send + Sync {
    async fn block_number(&self) -> Result<u64, ChainError>;

    async fn transaction_receipt(&self, tx_hash: B256) -> Result<Option<TxReceipt>, ChainError>;

    /// Transfer events on `token` into `to` within the block window.
    async fn transfer_logs(
        &self,
        token: Address,
        to: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TransferLog>, ChainError>;
}
