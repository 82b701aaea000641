use alloy_primitives::{Address, B256};
use serde::{Deserialize, Serialize};

use crate::{
    chain::treasury::TokenBalance,
    escalation::Level,
    metrics::Metrics,
    types::{ChainId, InvoiceId, MicroUsdc, RunId, RunNumber, UnixMillis},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Skipped
        )
    }
}

/// Structured payload for the run row's metadata column. Every field is
/// schema-checked through serde; nothing free-form goes to disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunMetadata {
    pub spent_before: MicroUsdc,
    /// Dwell at the run's starting level, captured so a replay can
    /// reconstruct cooldown decisions.
    #[serde(default)]
    pub dwell_ms_before: u64,
    #[serde(default)]
    pub snapshot_ids: Vec<u64>,
    #[serde(default)]
    pub invoice_count: u32,
    #[serde(default)]
    pub skip_reason: Option<String>,
    /// Metrics captured for deterministic replay.
    #[serde(default)]
    pub metrics: Option<Metrics>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub run_number: RunNumber,
    pub scheduled_at: UnixMillis,
    pub started_at: Option<UnixMillis>,
    pub completed_at: Option<UnixMillis>,
    pub status: RunStatus,
    pub level_before: Level,
    pub level_after: Level,
    pub spend_delta: MicroUsdc,
    pub snapshot_id: Option<u64>,
    pub error: Option<String>,
    pub metadata: RunMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: u64,
    pub run_id: RunId,
    pub endpoint: String,
    pub amount: MicroUsdc,
    pub invoice_id: Option<InvoiceId>,
    pub tx_hash: Option<B256>,
    pub status: PaymentStatus,
    pub created_at: UnixMillis,
    pub settled_at: Option<UnixMillis>,
    pub block_number: Option<u64>,
    pub confirmations: Option<u64>,
    pub failure: Option<String>,
}

/// One attempted state-machine transition, successful or not. Appended
/// once, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub id: u64,
    pub run_id: RunId,
    pub from_level: Level,
    pub to_level: Level,
    pub trigger: String,
    pub successful: bool,
    pub guards_passed: Vec<String>,
    pub guards_failed: Vec<String>,
    pub cost: MicroUsdc,
    pub payment_id: Option<u64>,
    pub snapshot_id: Option<u64>,
    pub at: UnixMillis,
    /// Milliseconds since process start; strictly ordered with `id`.
    pub monotonic_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: u64,
    pub run_id: RunId,
    pub chain_id: ChainId,
    pub wallet: Address,
    pub block_number: u64,
    pub taken_at: UnixMillis,
    pub balances: Vec<TokenBalance>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumedTxRecord {
    pub tx_hash: B256,
    pub invoice_id: InvoiceId,
    pub consumed_at: UnixMillis,
}
