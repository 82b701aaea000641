use alloy_primitives::{hex, Address, B256, U256};
use async_trait::async_trait;
use tracing::info;

use crate::{chain::rpc::RpcClient, errors::ChainError, types::MicroUsdc};

const SELECTOR_TRANSFER: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];

/// Emits USDC transfers on Base. Kept as a seam so the pipeline never
/// depends on how payments are signed; tests substitute a fake.
#[async_trait]
pub trait UsdcWallet: Send + Sync {
    async fn transfer(&self, to: Address, amount: MicroUsdc) -> Result<B256, ChainError>;
}

/// Wallet backed by a node-managed account (`eth_sendTransaction`). This
/// is the demo deployment; key custody stays in the node.
pub struct NodeWallet {
    rpc: RpcClient,
    usdc: Address,
    from: Address,
}

impl NodeWallet {
    pub fn new(rpc: RpcClient, usdc: Address, from: Address) -> Self {
        Self { rpc, usdc, from }
    }
}

#[async_trait]
impl UsdcWallet for NodeWallet {
    async fn transfer(&self, to: Address, amount: MicroUsdc) -> Result<B256, ChainError> {
        let data = encode_transfer(to, amount);
        let tx_hash = self.rpc.send_transaction(self.from, self.usdc, &data).await?;
        info!(%to, %amount, %tx_hash, "usdc transfer submitted");
        Ok(tx_hash)
    }
}

/// Stand-in wallet for dry-run deployments; any transfer attempt fails.
pub struct DisabledWallet;

#[async_trait]
impl UsdcWallet for DisabledWallet {
    async fn transfer(&self, _to: Address, _amount: MicroUsdc) -> Result<B256, ChainError> {
        Err(ChainError::Unavailable("wallet disabled".to_string()))
    }
}

fn encode_transfer(to: Address, amount: MicroUsdc) -> String {
    let mut data = Vec::with_capacity(68);
    data.extend_from_slice(&SELECTOR_TRANSFER);
    data.extend_from_slice(to.into_word().as_slice());
    data.extend_from_slice(&U256::from(amount.into_inner()).to_be_bytes::<32>());
    format!("0x{}", hex::encode(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_transfer_calldata() {
        let to = Address::repeat_byte(0xbb);
        let data = encode_transfer(to, MicroUsdc::new(250_000));
        assert!(data.starts_with("0xa9059cbb"));
        // selector + two 32-byte words
        assert_eq!(data.len(), 2 + 8 + 64 + 64);
        assert!(data.ends_with(&format!("{:064x}", 250_000)));
    }
}
