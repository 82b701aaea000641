use std::time::Duration;

use crate::{
    budget::BudgetSnapshot,
    config::RiskConfig,
    metrics::{volatility::VolRegime, Metrics},
    types::MicroUsdc,
};

/// Everything a guard may look at. Assembled by the machine inside its
/// critical section so every guard of one attempt sees the same snapshot.
pub struct GuardInput<'a> {
    pub dwell: Duration,
    pub cooldown: Duration,
    pub paused: bool,
    pub metrics: &'a Metrics,
    pub budget: BudgetSnapshot,
    /// Estimated cost of the attempted transition.
    pub cost: MicroUsdc,
    pub risk: &'a RiskConfig,
    pub minimum_operational: MicroUsdc,
    pub warning_threshold: MicroUsdc,
}

/// Named guard predicates. All pure functions of the input; results are
/// recorded by name on the transition row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    SystemNotPaused,
    RiskThreshold,
    CooldownOk,
    Budget,
    LcrCritical,
    DepthCrisis,
    CooldownElapsed,
    BudgetDepleted,
    BudgetRestored,
}

impl Guard {
    pub fn name(self) -> &'static str {
        match self {
            Guard::SystemNotPaused => "system_not_paused",
            Guard::RiskThreshold => "risk_threshold",
            Guard::CooldownOk => "cooldown_ok",
            Guard::Budget => "budget",
            Guard::LcrCritical => "lcr_critical",
            Guard::DepthCrisis => "depth_crisis",
            Guard::CooldownElapsed => "cooldown_elapsed",
            Guard::BudgetDepleted => "budget_depleted",
            Guard::BudgetRestored => "budget_restored",
        }
    }

    pub fn evaluate(self, input: &GuardInput<'_>) -> bool {
        match self {
            Guard::SystemNotPaused => !input.paused,
            // Elevated volatility or an LCR below threshold both justify
            // closer monitoring.
            Guard::RiskThreshold => {
                input.metrics.regime >= VolRegime::Elevated
                    || input
                        .metrics
                        .lcr
                        .map(|r| r < input.risk.lcr_threshold)
                        .unwrap_or(false)
            }
            Guard::CooldownOk | Guard::CooldownElapsed => input.dwell >= input.cooldown,
            Guard::Budget => input.budget.remaining >= input.cost,
            Guard::LcrCritical => input
                .metrics
                .lcr
                .map(|r| r < input.risk.lcr_critical)
                .unwrap_or(false),
            // No depth data means no evidence of a crisis.
            Guard::DepthCrisis => input
                .metrics
                .depth_at_one_percent()
                .map(|depth| depth < input.risk.depth_crisis_min_usd)
                .unwrap_or(false),
            Guard::BudgetDepleted => input.budget.remaining < input.minimum_operational,
            Guard::BudgetRestored => input.budget.remaining >= input.warning_threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::score::RiskLevel;

    fn metrics(regime: VolRegime, lcr: Option<f64>) -> Metrics {
        Metrics {
            lcr,
            total_value_usd: 1_000_000.0,
            positions: vec![],
            avg_half_life_hours: Some(1.0),
            annualized_volatility: Some(0.2),
            regime,
            depth_bands: None,
            impact: None,
            risk_score: 10,
            risk_level: RiskLevel::Low,
        }
    }

    fn budget(remaining: u64) -> BudgetSnapshot {
        BudgetSnapshot {
            limit: MicroUsdc::new(10_000_000),
            spent: MicroUsdc::new(10_000_000 - remaining),
            reserved: MicroUsdc::ZERO,
            remaining: MicroUsdc::new(remaining),
            blocked: remaining < 50_000,
        }
    }

    fn input<'a>(metrics: &'a Metrics, risk: &'a RiskConfig, remaining: u64) -> GuardInput<'a> {
        GuardInput {
            dwell: Duration::from_secs(600),
            cooldown: Duration::from_secs(300),
            paused: false,
            metrics,
            budget: budget(remaining),
            cost: MicroUsdc::new(500_000),
            risk,
            minimum_operational: MicroUsdc::new(50_000),
            warning_threshold: MicroUsdc::new(500_000),
        }
    }

    #[test]
    fn risk_threshold_fires_on_volatility_or_lcr() {
        let risk = RiskConfig::default();
        let elevated = metrics(VolRegime::Elevated, Some(1.5));
        assert!(Guard::RiskThreshold.evaluate(&input(&elevated, &risk, 10_000_000)));

        let weak_lcr = metrics(VolRegime::Low, Some(0.9));
        assert!(Guard::RiskThreshold.evaluate(&input(&weak_lcr, &risk, 10_000_000)));

        let calm = metrics(VolRegime::Normal, Some(1.5));
        assert!(!Guard::RiskThreshold.evaluate(&input(&calm, &risk, 10_000_000)));
    }

    #[test]
    fn cooldown_respects_dwell() {
        let risk = RiskConfig::default();
        let m = metrics(VolRegime::Low, None);
        let mut i = input(&m, &risk, 10_000_000);
        assert!(Guard::CooldownOk.evaluate(&i));
        i.dwell = Duration::from_secs(10);
        assert!(!Guard::CooldownOk.evaluate(&i));
        assert!(!Guard::CooldownElapsed.evaluate(&i));
    }

    #[test]
    fn budget_guard_checks_estimate() {
        let risk = RiskConfig::default();
        let m = metrics(VolRegime::Low, None);
        assert!(Guard::Budget.evaluate(&input(&m, &risk, 500_000)));
        assert!(!Guard::Budget.evaluate(&input(&m, &risk, 499_999)));
    }

    #[test]
    fn budget_depleted_and_restored_are_disjoint() {
        let risk = RiskConfig::default();
        let m = metrics(VolRegime::Low, None);
        let depleted = input(&m, &risk, 40_000);
        assert!(Guard::BudgetDepleted.evaluate(&depleted));
        assert!(!Guard::BudgetRestored.evaluate(&depleted));

        let healthy = input(&m, &risk, 600_000);
        assert!(!Guard::BudgetDepleted.evaluate(&healthy));
        assert!(Guard::BudgetRestored.evaluate(&healthy));
    }

    #[test]
    fn lcr_critical_requires_a_finite_ratio() {
        let risk = RiskConfig::default();
        let unbounded = metrics(VolRegime::Low, None);
        assert!(!Guard::LcrCritical.evaluate(&input(&unbounded, &risk, 10_000_000)));
        let critical = metrics(VolRegime::Low, Some(0.5));
        assert!(Guard::LcrCritical.evaluate(&input(&critical, &risk, 10_000_000)));
    }
}
