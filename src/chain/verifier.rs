use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use alloy_primitives::{Address, B256, U256};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::ChainView;
use crate::{
    errors::StoreError,
    store::Store,
    types::{InvoiceId, MicroUsdc},
};

pub const REASON_TX_ALREADY_USED: &str = "tx_already_used";
pub const REASON_RPC_UNAVAILABLE: &str = "rpc_unavailable";

/// How far back `watch` scans for an inbound transfer on each poll.
const WATCH_LOOKBACK_BLOCKS: u64 = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    pub verified: bool,
    pub amount: MicroUsdc,
    pub sender: Option<Address>,
    pub block: u64,
    pub confirmations: u64,
    pub reason: Option<&'static str>,
}

impl VerificationResult {
    fn rejected(reason: &'static str) -> Self {
        Self {
            verified: false,
            amount: MicroUsdc::ZERO,
            sender: None,
            block: 0,
            confirmations: 0,
            reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchOutcome {
    Settled { tx_hash: B256 },
    TimedOut,
}

/// Confirms that a transaction hash on Base settles a USDC transfer of at
/// least a given amount to the gateway recipient. Keeps the consumed-hash
/// set that prevents one settlement from paying two invoices.
pub struct SettlementVerifier {
    chain: Arc<dyn ChainView>,
    usdc: Address,
    recipient: Address,
    confirmation_blocks: u64,
    poll_interval: Duration,
    consumed: Mutex<HashSet<B256>>,
    store: Arc<Store>,
}

impl SettlementVerifier {
    pub fn new(
        chain: Arc<dyn ChainView>,
        store: Arc<Store>,
        usdc: Address,
        recipient: Address,
        confirmation_blocks: u64,
        poll_interval: Duration,
    ) -> Result<Self, StoreError> {
        let consumed: HashSet<B256> = store.consumed_tx_hashes()?.into_iter().collect();
        Ok(Self {
            chain,
            usdc,
            recipient,
            confirmation_blocks,
            poll_interval,
            consumed: Mutex::new(consumed),
            store,
        })
    }

    pub fn is_consumed(&self, tx_hash: B256) -> bool {
        self.consumed.lock().expect("consumed lock").contains(&tx_hash)
    }

    /// Bind a verified hash to its invoice. Returns `false` when some other
    /// invoice got there first (both in memory and on disk).
    pub fn mark_consumed(
        &self,
        tx_hash: B256,
        invoice_id: &InvoiceId,
    ) -> Result<bool, StoreError> {
        let mut consumed = self.consumed.lock().expect("consumed lock");
        if consumed.contains(&tx_hash) {
            return Ok(false);
        }
        let fresh = self.store.insert_consumed_tx(tx_hash, invoice_id)?;
        if fresh {
            consumed.insert(tx_hash);
        }
        Ok(fresh)
    }

    /// Check a settlement hash against the invoice terms. Never returns an
    /// error: chain trouble that survives the RPC retry budget comes back
    /// as an unverified result with `rpc_unavailable`.
    pub async fn verify(
        &self,
        tx_hash: B256,
        min_amount: MicroUsdc,
        expected_sender: Option<Address>,
    ) -> VerificationResult {
        if self.is_consumed(tx_hash) {
            return VerificationResult::rejected(REASON_TX_ALREADY_USED);
        }

        let receipt = match self.chain.transaction_receipt(tx_hash).await {
            Ok(Some(receipt)) => receipt,
            Ok(None) => return VerificationResult::rejected("receipt_not_found"),
            Err(err) => {
                warn!(%tx_hash, error = %err, "receipt lookup failed");
                return VerificationResult::rejected(REASON_RPC_UNAVAILABLE);
            }
        };
        if !receipt.status {
            return VerificationResult::rejected("tx_reverted");
        }

        let transfer = receipt
            .transfers
            .iter()
            .find(|t| t.token == self.usdc && t.to == self.recipient);
        let Some(transfer) = transfer else {
            return VerificationResult::rejected("no_matching_transfer");
        };

        // USDC carries six decimals, so the raw transfer value is already
        // micro-USDC.
        let amount = MicroUsdc::new(u64::try_from(transfer.amount).unwrap_or(u64::MAX));
        if amount < min_amount {
            return VerificationResult::rejected("amount_below_invoice");
        }
        if let Some(expected) = expected_sender {
            if transfer.from != expected {
                return VerificationResult::rejected("sender_mismatch");
            }
        }

        let tip = match self.chain.block_number().await {
            Ok(tip) => tip,
            Err(err) => {
                warn!(%tx_hash, error = %err, "block number lookup failed");
                return VerificationResult::rejected(REASON_RPC_UNAVAILABLE);
            }
        };
        let confirmations = tip.saturating_sub(receipt.block_number);
        if confirmations < self.confirmation_blocks {
            return VerificationResult {
                verified: false,
                amount,
                sender: Some(transfer.from),
                block: receipt.block_number,
                confirmations,
                reason: Some("insufficient_confirmations"),
            };
        }

        info!(%tx_hash, %amount, confirmations, "settlement verified");
        VerificationResult {
            verified: true,
            amount,
            sender: Some(transfer.from),
            block: receipt.block_number,
            confirmations,
            reason: None,
        }
    }

    /// Long-poll for an inbound transfer covering `min_amount` until the
    /// deadline. Scans the trailing block window on each poll; chain
    /// errors are logged and polling continues.
    pub async fn watch(&self, min_amount: MicroUsdc, deadline: Instant) -> WatchOutcome {
        loop {
            if Instant::now() >= deadline {
                return WatchOutcome::TimedOut;
            }
            match self.scan_once(min_amount).await {
                Some(tx_hash) => return WatchOutcome::Settled { tx_hash },
                None => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return WatchOutcome::TimedOut;
                    }
                    tokio::time::sleep(self.poll_interval.min(remaining)).await;
                }
            }
        }
    }

    async fn scan_once(&self, min_amount: MicroUsdc) -> Option<B256> {
        let tip = match self.chain.block_number().await {
            Ok(tip) => tip,
            Err(err) => {
                warn!(error = %err, "watch: block number lookup failed");
                return None;
            }
        };
        let from_block = tip.saturating_sub(WATCH_LOOKBACK_BLOCKS);
        let logs = match self
            .chain
            .transfer_logs(self.usdc, self.recipient, from_block, tip)
            .await
        {
            Ok(logs) => logs,
            Err(err) => {
                warn!(error = %err, "watch: log scan failed");
                return None;
            }
        };
        let min = U256::from(min_amount.into_inner());
        for log in logs {
            if log.amount >= min && !self.is_consumed(log.tx_hash) {
                debug!(tx_hash = %log.tx_hash, block = log.block_number, "watch: candidate settlement");
                return Some(log.tx_hash);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{TransferLog, TxReceipt};
    use crate::errors::ChainError;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct FakeChain {
        tip: u64,
        receipts: HashMap<B256, TxReceipt>,
        logs: Vec<TransferLog>,
    }

    #[async_trait]
    impl ChainView for FakeChain {
        async fn block_number(&self) -> Result<u64, ChainError> {
            Ok(self.tip)
        }

        async fn transaction_receipt(
            &self,
            tx_hash: B256,
        ) -> Result<Option<TxReceipt>, ChainError> {
            Ok(self.receipts.get(&tx_hash).cloned())
        }

        async fn transfer_logs(
            &self,
            token: Address,
            to: Address,
            from_block: u64,
            to_block: u64,
        ) -> Result<Vec<TransferLog>, ChainError> {
            Ok(self
                .logs
                .iter()
                .filter(|l| {
                    l.token == token
                        && l.to == to
                        && l.block_number >= from_block
                        && l.block_number <= to_block
                })
                .cloned()
                .collect())
        }
    }

    fn usdc() -> Address {
        Address::repeat_byte(0x01)
    }

    fn recipient() -> Address {
        Address::repeat_byte(0x02)
    }

    fn sender() -> Address {
        Address::repeat_byte(0x03)
    }

    fn settled_receipt(tx: B256, amount: u64, block: u64) -> TxReceipt {
        TxReceipt {
            status: true,
            block_number: block,
            transfers: vec![TransferLog {
                token: usdc(),
                from: sender(),
                to: recipient(),
                amount: U256::from(amount),
                tx_hash: tx,
                block_number: block,
            }],
        }
    }

    fn verifier(chain: FakeChain) -> (tempfile::TempDir, SettlementVerifier) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(Store::open(dir.path().join("db")).expect("store"));
        let verifier = SettlementVerifier::new(
            Arc::new(chain),
            store,
            usdc(),
            recipient(),
            3,
            Duration::from_millis(5),
        )
        .expect("verifier");
        (dir, verifier)
    }

    #[tokio::test]
    async fn verifies_matching_transfer() {
        let tx = B256::repeat_byte(0xaa);
        let chain = FakeChain {
            tip: 103,
            receipts: HashMap::from([(tx, settled_receipt(tx, 250_000, 100))]),
            logs: vec![],
        };
        let (_dir, verifier) = verifier(chain);
        let result = verifier
            .verify(tx, MicroUsdc::new(250_000), Some(sender()))
            .await;
        assert!(result.verified, "reason: {:?}", result.reason);
        assert_eq!(result.amount, MicroUsdc::new(250_000));
        assert_eq!(result.confirmations, 3);
    }

    #[tokio::test]
    async fn rejects_insufficient_confirmations() {
        let tx = B256::repeat_byte(0xaa);
        let chain = FakeChain {
            tip: 101,
            receipts: HashMap::from([(tx, settled_receipt(tx, 250_000, 100))]),
            logs: vec![],
        };
        let (_dir, verifier) = verifier(chain);
        let result = verifier.verify(tx, MicroUsdc::new(250_000), None).await;
        assert!(!result.verified);
        assert_eq!(result.reason, Some("insufficient_confirmations"));
        assert_eq!(result.confirmations, 1);
    }

    #[tokio::test]
    async fn rejects_amount_below_invoice() {
        let tx = B256::repeat_byte(0xaa);
        let chain = FakeChain {
            tip: 110,
            receipts: HashMap::from([(tx, settled_receipt(tx, 100_000, 100))]),
            logs: vec![],
        };
        let (_dir, verifier) = verifier(chain);
        let result = verifier.verify(tx, MicroUsdc::new(250_000), None).await;
        assert!(!result.verified);
        assert_eq!(result.reason, Some("amount_below_invoice"));
    }

    #[tokio::test]
    async fn rejects_consumed_hash() {
        let tx = B256::repeat_byte(0xaa);
        let chain = FakeChain {
            tip: 110,
            receipts: HashMap::from([(tx, settled_receipt(tx, 250_000, 100))]),
            logs: vec![],
        };
        let (_dir, verifier) = verifier(chain);
        assert!(verifier
            .mark_consumed(tx, &InvoiceId::new("inv-1"))
            .unwrap());
        let result = verifier.verify(tx, MicroUsdc::new(250_000), None).await;
        assert!(!result.verified);
        assert_eq!(result.reason, Some(REASON_TX_ALREADY_USED));

        // Second bind loses.
        assert!(!verifier
            .mark_consumed(tx, &InvoiceId::new("inv-2"))
            .unwrap());
    }

    #[tokio::test]
    async fn rejects_sender_mismatch() {
        let tx = B256::repeat_byte(0xaa);
        let chain = FakeChain {
            tip: 110,
            receipts: HashMap::from([(tx, settled_receipt(tx, 250_000, 100))]),
            logs: vec![],
        };
        let (_dir, verifier) = verifier(chain);
        let result = verifier
            .verify(tx, MicroUsdc::new(250_000), Some(Address::repeat_byte(0x99)))
            .await;
        assert!(!result.verified);
        assert_eq!(result.reason, Some("sender_mismatch"));
    }

    #[tokio::test]
    async fn watch_finds_inbound_transfer() {
        let tx = B256::repeat_byte(0xbb);
        let chain = FakeChain {
            tip: 200,
            receipts: HashMap::new(),
            logs: vec![TransferLog {
                token: usdc(),
                from: sender(),
                to: recipient(),
                amount: U256::from(300_000u64),
                tx_hash: tx,
                block_number: 180,
            }],
        };
        let (_dir, verifier) = verifier(chain);
        let outcome = verifier
            .watch(
                MicroUsdc::new(250_000),
                Instant::now() + Duration::from_millis(100),
            )
            .await;
        assert_eq!(outcome, WatchOutcome::Settled { tx_hash: tx });
    }

    #[tokio::test]
    async fn watch_times_out_without_match() {
        let chain = FakeChain {
            tip: 200,
            receipts: HashMap::new(),
            logs: vec![],
        };
        let (_dir, verifier) = verifier(chain);
        let outcome = verifier
            .watch(
                MicroUsdc::new(250_000),
                Instant::now() + Duration::from_millis(20),
            )
            .await;
        assert_eq!(outcome, WatchOutcome::TimedOut);
    }
}
