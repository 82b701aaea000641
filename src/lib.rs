//! Advisory escalation agent for multi-chain EVM treasuries.
//!
//! On a cron cadence the agent snapshots treasury balances, computes
//! liquidity-risk metrics, and walks an escalation ladder. Levels that
//! justify spending real money buy market data through an HTTP 402 flow
//! settled with on-chain USDC on Base, all bounded by a hard integer
//! micro-USDC budget. The agent is advisory only; it never moves
//! treasury funds.

pub mod agent;
pub mod budget;
pub mod chain;
pub mod config;
pub mod errors;
pub mod escalation;
pub mod gateway;
pub mod metrics;
pub mod observer;
pub mod payment;
pub mod store;
pub mod types;

pub use agent::{replay, CronSchedule, ReplayReport, RunSummary, Scheduler, Sentinel};
pub use budget::{BudgetLedger, BudgetReserve, BudgetSnapshot, BudgetStatus, ReservationHandle};
pub use config::{ChainConfig, RiskConfig, SentinelConfig, TokenConfig};
pub use errors::{
    BudgetError, ChainError, ConfigError, PaymentError, SentinelError, StateError, StoreError,
};
pub use escalation::{EscalationMachine, Level, StepOutcome, Trigger};
pub use gateway::{MarketDataGateway, MarketDepth, MarketEndpoint};
pub use metrics::{MetricEngine, Metrics};
pub use observer::{LogObserver, Observers, SentinelObserver};
pub use types::{ChainId, InvoiceId, MicroUsdc, RunId, RunNumber, UnixMillis};
