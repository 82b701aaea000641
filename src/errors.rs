use thiserror::Error;

use crate::{
    escalation::Level,
    types::{InvoiceId, MicroUsdc},
};

/// Budget failures. Never retryable; the state machine redirects to
/// `BudgetBlocked` instead of propagating these upward.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BudgetError {
    #[error("insufficient budget: requested {requested}, remaining {remaining}")]
    InsufficientFunds {
        requested: MicroUsdc,
        remaining: MicroUsdc,
    },
    #[error("unknown reservation handle {0}")]
    UnknownReservation(u64),
}

/// Terminal outcomes of one payment-pipeline attempt.
#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("budget blocked: {0}")]
    BudgetBlocked(BudgetError),
    #[error("invoice {0} expired before settlement")]
    InvoiceExpired(InvoiceId),
    #[error("settlement for invoice {0} not observed before deadline")]
    VerificationTimeout(InvoiceId),
    #[error("settlement rejected: {reason}")]
    SettlementFailed { invoice: InvoiceId, reason: String },
    #[error("upstream gateway error: {0}")]
    UpstreamError(String),
}

/// Chain-facing failures. Transport-level errors are retried inside the RPC
/// client; what escapes here is already past the retry budget.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("rpc unavailable: {0}")]
    Unavailable(String),
    #[error("malformed rpc response: {0}")]
    MalformedResponse(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ChainError {
    /// Transport-level failures are worth another attempt; node-reported
    /// errors and decode failures are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChainError::Http(_) | ChainError::Unavailable(_))
    }
}

/// State-machine rejections that are caller errors rather than guard
/// failures (guard failures are recorded on the ledger, not raised).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("no transition from {from} for trigger {trigger}")]
    InvalidTransition { from: Level, trigger: String },
    #[error("upward transitions may not skip levels: {from} -> {to}")]
    SkippedLevel { from: Level, to: Level },
}

/// Persistence failures. A single write is retried once by the store; a
/// repeat failure escapes as this and fails the run.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sled(#[from] sled::Error),
    #[error(transparent)]
    Encode(#[from] serde_json::Error),
    #[error("corrupt record in {tree}: {detail}")]
    Corrupt { tree: &'static str, detail: String },
    #[error("missing row {key} in {tree}")]
    Missing { tree: &'static str, key: u64 },
}

/// Configuration problems surface before anything else starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config field {field}: {why}")]
    Invalid { field: &'static str, why: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, why: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            why: why.into(),
        }
    }
}

/// Run-level failure recorded on the run row.
#[derive(Debug, Error)]
pub enum SentinelError {
    #[error(transparent)]
    Budget(#[from] BudgetError),
    #[error(transparent)]
    Payment(#[from] PaymentError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("run exceeded its {0} ms deadline")]
    RunTimeout(u64),
    #[error("run {0} not found")]
    UnknownRun(u64),
}

impl SentinelError {
    /// Fatal errors halt the scheduler after the current tick; everything
    /// else waits for the next one.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SentinelError::Store(_) | SentinelError::Config(_))
    }
}
