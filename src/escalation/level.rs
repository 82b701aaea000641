use std::fmt;

use serde::{Deserialize, Serialize};

/// The escalation ladder. Regular levels are totally ordered 0..5;
/// `BudgetBlocked` sits off-ladder and is reachable only through the
/// budget guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Level {
    L0Idle,
    L1Monitor,
    L2Alert,
    L3MarketData,
    L4Critical,
    L5Emergency,
    BudgetBlocked,
}

impl Level {
    /// Position on the ladder; `None` for the off-ladder sink.
    pub fn rank(self) -> Option<u8> {
        match self {
            Level::L0Idle => Some(0),
            Level::L1Monitor => Some(1),
            Level::L2Alert => Some(2),
            Level::L3MarketData => Some(3),
            Level::L4Critical => Some(4),
            Level::L5Emergency => Some(5),
            Level::BudgetBlocked => None,
        }
    }

    pub fn from_rank(rank: u8) -> Option<Level> {
        match rank {
            0 => Some(Level::L0Idle),
            1 => Some(Level::L1Monitor),
            2 => Some(Level::L2Alert),
            3 => Some(Level::L3MarketData),
            4 => Some(Level::L4Critical),
            5 => Some(Level::L5Emergency),
            _ => None,
        }
    }

    pub fn is_regular(self) -> bool {
        self.rank().is_some()
    }

    pub fn next_up(self) -> Option<Level> {
        self.rank().and_then(|r| Level::from_rank(r + 1))
    }

    pub fn next_down(self) -> Option<Level> {
        match self.rank() {
            Some(rank) if rank > 0 => Level::from_rank(rank - 1),
            _ => None,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Level::L0Idle => "L0_IDLE",
            Level::L1Monitor => "L1_MONITOR",
            Level::L2Alert => "L2_ALERT",
            Level::L3MarketData => "L3_MARKET_DATA",
            Level::L4Critical => "L4_CRITICAL",
            Level::L5Emergency => "L5_EMERGENCY",
            Level::BudgetBlocked => "BUDGET_BLOCKED",
        };
        write!(f, "{name}")
    }
}

/// What asked the machine to move. `ManualOverride` is the only trigger
/// allowed to skip levels upward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    MetricTick,
    RiskThreshold,
    NeedMarketData,
    CriticalMetric,
    Emergency,
    CooldownOk,
    BudgetExhausted,
    BudgetRestored,
    ManualOverride(Level),
}

impl Trigger {
    pub fn name(&self) -> &'static str {
        match self {
            Trigger::MetricTick => "metric-tick",
            Trigger::RiskThreshold => "risk-threshold",
            Trigger::NeedMarketData => "need-market-data",
            Trigger::CriticalMetric => "critical-metric",
            Trigger::Emergency => "emergency",
            Trigger::CooldownOk => "cooldown-ok",
            Trigger::BudgetExhausted => "budget-exhausted",
            Trigger::BudgetRestored => "budget-restored",
            Trigger::ManualOverride(_) => "manual-override",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
