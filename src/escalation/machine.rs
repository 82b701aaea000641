use std::{
    sync::{Arc, Mutex},
    time::Instant,
};

use tracing::{debug, info};

use super::{
    context::EscalationContext,
    guards::{Guard, GuardInput},
    ledger::{monotonic_ms, TransitionLedger},
    Level, Trigger,
};
use crate::{
    budget::BudgetStatus,
    config::RiskConfig,
    errors::{PaymentError, StateError, StoreError},
    gateway::MarketEndpoint,
    metrics::Metrics,
    observer::Observers,
    store::{records::TransitionRecord, Store},
    types::{MicroUsdc, RunId},
};

/// Static row of the transition table.
struct TransitionSpec {
    target: Level,
    guards: &'static [Guard],
    cost: MicroUsdc,
    /// Market data purchased as part of the transition.
    endpoints: &'static [MarketEndpoint],
}

fn spec_for(from: Level, trigger: Trigger) -> Option<TransitionSpec> {
    match (from, trigger) {
        (Level::L0Idle, Trigger::MetricTick) => Some(TransitionSpec {
            target: Level::L1Monitor,
            guards: &[Guard::SystemNotPaused],
            cost: MicroUsdc::ZERO,
            endpoints: &[],
        }),
        (Level::L1Monitor, Trigger::RiskThreshold) => Some(TransitionSpec {
            target: Level::L2Alert,
            guards: &[Guard::RiskThreshold],
            cost: MicroUsdc::ZERO,
            endpoints: &[],
        }),
        (Level::L2Alert, Trigger::NeedMarketData) => Some(TransitionSpec {
            target: Level::L3MarketData,
            guards: &[Guard::CooldownOk, Guard::Budget],
            cost: MicroUsdc::new(500_000),
            endpoints: &[MarketEndpoint::LiquidityDepth],
        }),
        (Level::L3MarketData, Trigger::CriticalMetric) => Some(TransitionSpec {
            target: Level::L4Critical,
            guards: &[Guard::LcrCritical, Guard::Budget],
            cost: MicroUsdc::new(1_000_000),
            endpoints: &[MarketEndpoint::OrderBook],
        }),
        (Level::L4Critical, Trigger::Emergency) => Some(TransitionSpec {
            target: Level::L5Emergency,
            guards: &[Guard::DepthCrisis, Guard::Budget],
            cost: MicroUsdc::new(2_000_000),
            endpoints: &[MarketEndpoint::LiquidityDepth],
        }),
        (from, Trigger::CooldownOk) if from.rank().map(|r| r >= 1).unwrap_or(false) => {
            Some(TransitionSpec {
                target: from.next_down().expect("rank >= 1"),
                guards: &[Guard::CooldownElapsed],
                cost: MicroUsdc::ZERO,
                endpoints: &[],
            })
        }
        (from, Trigger::BudgetExhausted) if from.rank().map(|r| r >= 2).unwrap_or(false) => {
            Some(TransitionSpec {
                target: Level::BudgetBlocked,
                guards: &[Guard::BudgetDepleted],
                cost: MicroUsdc::ZERO,
                endpoints: &[],
            })
        }
        (Level::BudgetBlocked, Trigger::BudgetRestored) => Some(TransitionSpec {
            target: Level::L1Monitor,
            guards: &[Guard::BudgetRestored],
            cost: MicroUsdc::ZERO,
            endpoints: &[],
        }),
        // The manual override skips the ladder but still may not run while
        // paused.
        (_, Trigger::ManualOverride(target)) if target.is_regular() => Some(TransitionSpec {
            target,
            guards: &[Guard::SystemNotPaused],
            cost: MicroUsdc::ZERO,
            endpoints: &[],
        }),
        _ => None,
    }
}

/// A paid transition whose guards passed; the payment must settle before
/// the level actually changes.
#[derive(Debug, Clone)]
pub struct PendingTransition {
    pub run_id: RunId,
    pub from: Level,
    pub target: Level,
    pub trigger: String,
    pub cost_estimate: MicroUsdc,
    pub endpoints: Vec<MarketEndpoint>,
    pub guards_passed: Vec<String>,
    pub snapshot_id: Option<u64>,
}

#[derive(Debug)]
pub enum StepOutcome {
    /// Transition applied; level changed.
    Applied(TransitionRecord),
    /// Guards passed but the transition carries a payment; call
    /// [`EscalationMachine::finalize_payment`] with the pipeline outcome.
    PaymentPending(PendingTransition),
    /// A guard failed; recorded, level unchanged.
    Rejected(TransitionRecord),
    /// Budget guard failed on a paid transition; redirected to the
    /// blocked sink.
    Redirected(TransitionRecord),
}

impl StepOutcome {
    pub fn record(&self) -> Option<&TransitionRecord> {
        match self {
            StepOutcome::Applied(r) | StepOutcome::Rejected(r) | StepOutcome::Redirected(r) => {
                Some(r)
            }
            StepOutcome::PaymentPending(_) => None,
        }
    }
}

/// Owns the escalation level and mediates every transition. One mutex
/// serializes context reads and writes, so each attempt's guards see a
/// consistent snapshot.
pub struct EscalationMachine {
    ctx: Mutex<EscalationContext>,
    budget: Arc<dyn BudgetStatus>,
    ledger: TransitionLedger,
    store: Arc<Store>,
    observers: Observers,
    risk: RiskConfig,
    minimum_operational: MicroUsdc,
    warning_threshold: MicroUsdc,
}

impl EscalationMachine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        initial: EscalationContext,
        budget: Arc<dyn BudgetStatus>,
        ledger: TransitionLedger,
        store: Arc<Store>,
        observers: Observers,
        risk: RiskConfig,
        minimum_operational: MicroUsdc,
        warning_threshold: MicroUsdc,
    ) -> Self {
        Self {
            ctx: Mutex::new(initial),
            budget,
            ledger,
            store,
            observers,
            risk,
            minimum_operational,
            warning_threshold,
        }
    }

    pub fn current_level(&self) -> Level {
        self.ctx.lock().expect("machine lock").level
    }

    pub fn dwell(&self) -> std::time::Duration {
        self.ctx.lock().expect("machine lock").dwell(Instant::now())
    }

    pub fn set_paused(&self, paused: bool) {
        self.ctx.lock().expect("machine lock").paused = paused;
    }

    pub fn is_paused(&self) -> bool {
        self.ctx.lock().expect("machine lock").paused
    }

    pub fn ledger(&self) -> &TransitionLedger {
        &self.ledger
    }

    /// Highest-priority feasible trigger for the current tick, or `None`
    /// when the machine has nothing to do. Priority:
    /// budget-exhausted > emergency > critical-metric > need-market-data >
    /// risk-threshold > metric-tick > cooldown-ok.
    pub fn next_trigger(&self, metrics: &Metrics) -> Option<Trigger> {
        let ctx = self.ctx.lock().expect("machine lock");
        let status = self.budget.status();
        let now = Instant::now();
        let risk_present = self.guard_input(&*ctx, metrics, MicroUsdc::ZERO, now, |input| {
            Guard::RiskThreshold.evaluate(input)
        });

        if ctx.level == Level::BudgetBlocked {
            if status.remaining >= self.warning_threshold {
                return Some(Trigger::BudgetRestored);
            }
            return None;
        }
        let rank = ctx.level.rank()?;

        if rank >= 2 && status.remaining < self.minimum_operational {
            return Some(Trigger::BudgetExhausted);
        }
        if ctx.level == Level::L4Critical
            && self.guard_input(&*ctx, metrics, MicroUsdc::ZERO, now, |input| {
                Guard::DepthCrisis.evaluate(input)
            })
        {
            return Some(Trigger::Emergency);
        }
        if ctx.level == Level::L3MarketData
            && self.guard_input(&*ctx, metrics, MicroUsdc::ZERO, now, |input| {
                Guard::LcrCritical.evaluate(input)
            })
        {
            return Some(Trigger::CriticalMetric);
        }
        if ctx.level == Level::L2Alert && risk_present {
            return Some(Trigger::NeedMarketData);
        }
        if ctx.level == Level::L1Monitor && risk_present {
            return Some(Trigger::RiskThreshold);
        }
        if ctx.level == Level::L0Idle && !ctx.paused {
            return Some(Trigger::MetricTick);
        }
        if rank >= 1 && !risk_present && ctx.dwell(now) >= ctx.cooldown {
            return Some(Trigger::CooldownOk);
        }
        None
    }

    fn guard_input<R>(
        &self,
        ctx: &EscalationContext,
        metrics: &Metrics,
        cost: MicroUsdc,
        now: Instant,
        f: impl FnOnce(&GuardInput<'_>) -> R,
    ) -> R {
        let input = GuardInput {
            dwell: ctx.dwell(now),
            cooldown: ctx.cooldown,
            paused: ctx.paused,
            metrics,
            budget: self.budget.status(),
            cost,
            risk: &self.risk,
            minimum_operational: self.minimum_operational,
            warning_threshold: self.warning_threshold,
        };
        f(&input)
    }

    /// One transition attempt. Guard evaluation and any level change
    /// happen under the context lock.
    pub fn attempt(
        &self,
        run_id: RunId,
        trigger: Trigger,
        metrics: &Metrics,
        snapshot_id: Option<u64>,
    ) -> Result<StepOutcome, SentinelStepError> {
        let mut ctx = self.ctx.lock().expect("machine lock");
        let from = ctx.level;
        let spec = spec_for(from, trigger).ok_or_else(|| {
            SentinelStepError::State(StateError::InvalidTransition {
                from,
                trigger: trigger.name().to_string(),
            })
        })?;

        // Upward moves are single-step unless manually overridden.
        if !matches!(trigger, Trigger::ManualOverride(_)) {
            if let (Some(f), Some(t)) = (from.rank(), spec.target.rank()) {
                if t > f + 1 {
                    return Err(SentinelStepError::State(StateError::SkippedLevel {
                        from,
                        to: spec.target,
                    }));
                }
            }
        }

        let now = Instant::now();
        let mut passed = Vec::new();
        let mut failed = Vec::new();
        let mut budget_failed = false;
        self.guard_input(&*ctx, metrics, spec.cost, now, |input| {
            for guard in spec.guards {
                if guard.evaluate(input) {
                    passed.push(guard.name().to_string());
                } else {
                    failed.push(guard.name().to_string());
                    if *guard == Guard::Budget {
                        budget_failed = true;
                    }
                }
            }
        });

        if budget_failed && from.rank().map(|r| r >= 2).unwrap_or(false) {
            // Reserve would fail; redirect to the blocked sink instead of
            // surfacing an error.
            ctx.enter(Level::BudgetBlocked, now);
            let record = self.append(
                run_id,
                from,
                Level::BudgetBlocked,
                trigger.name(),
                true,
                passed,
                failed,
                MicroUsdc::ZERO,
                None,
                snapshot_id,
            )?;
            info!(%from, "budget guard failed, machine blocked");
            return Ok(StepOutcome::Redirected(record));
        }

        if !failed.is_empty() {
            let record = self.append(
                run_id,
                from,
                spec.target,
                trigger.name(),
                false,
                passed,
                failed,
                MicroUsdc::ZERO,
                None,
                snapshot_id,
            )?;
            debug!(%from, target = %spec.target, "guards failed");
            return Ok(StepOutcome::Rejected(record));
        }

        if !spec.endpoints.is_empty() {
            // Level changes only once the payment settles.
            return Ok(StepOutcome::PaymentPending(PendingTransition {
                run_id,
                from,
                target: spec.target,
                trigger: trigger.name().to_string(),
                cost_estimate: spec.cost,
                endpoints: spec.endpoints.to_vec(),
                guards_passed: passed,
                snapshot_id,
            }));
        }

        ctx.enter(spec.target, now);
        let record = self.append(
            run_id,
            from,
            spec.target,
            trigger.name(),
            true,
            passed,
            failed,
            MicroUsdc::ZERO,
            None,
            snapshot_id,
        )?;
        Ok(StepOutcome::Applied(record))
    }

    /// Complete a paid transition with the pipeline outcome.
    pub fn finalize_payment(
        &self,
        pending: PendingTransition,
        outcome: Result<(Option<u64>, MicroUsdc), &PaymentError>,
    ) -> Result<StepOutcome, StoreError> {
        let mut ctx = self.ctx.lock().expect("machine lock");
        let now = Instant::now();
        match outcome {
            Ok((payment_id, cost_paid)) => {
                ctx.enter(pending.target, now);
                let record = self.append(
                    pending.run_id,
                    pending.from,
                    pending.target,
                    &pending.trigger,
                    true,
                    pending.guards_passed,
                    Vec::new(),
                    cost_paid,
                    payment_id,
                    pending.snapshot_id,
                )?;
                let status = self.budget.status();
                if status.remaining < self.warning_threshold {
                    self.observers.notify_budget_warning(&status);
                }
                Ok(StepOutcome::Applied(record))
            }
            Err(PaymentError::BudgetBlocked(_)) => {
                ctx.enter(Level::BudgetBlocked, now);
                let record = self.append(
                    pending.run_id,
                    pending.from,
                    Level::BudgetBlocked,
                    pending.trigger.as_str(),
                    true,
                    pending.guards_passed,
                    vec![Guard::Budget.name().to_string()],
                    MicroUsdc::ZERO,
                    None,
                    pending.snapshot_id,
                )?;
                Ok(StepOutcome::Redirected(record))
            }
            Err(err) => {
                let record = self.append(
                    pending.run_id,
                    pending.from,
                    pending.target,
                    pending.trigger.as_str(),
                    false,
                    pending.guards_passed,
                    vec![format!("payment:{err}")],
                    MicroUsdc::ZERO,
                    None,
                    pending.snapshot_id,
                )?;
                Ok(StepOutcome::Rejected(record))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn append(
        &self,
        run_id: RunId,
        from: Level,
        to: Level,
        trigger: &str,
        successful: bool,
        guards_passed: Vec<String>,
        guards_failed: Vec<String>,
        cost: MicroUsdc,
        payment_id: Option<u64>,
        snapshot_id: Option<u64>,
    ) -> Result<TransitionRecord, StoreError> {
        let record = TransitionRecord {
            id: self.store.next_transition_id()?,
            run_id,
            from_level: from,
            to_level: to,
            trigger: trigger.to_string(),
            successful,
            guards_passed,
            guards_failed,
            cost,
            payment_id,
            snapshot_id,
            at: crate::types::UnixMillis::now(),
            monotonic_ms: monotonic_ms(),
        };
        self.ledger.append(record.clone())?;
        self.observers.notify_transition(&record);
        Ok(record)
    }
}

/// Errors out of one attempt: invalid transitions are caller errors,
/// store failures are fatal.
#[derive(Debug, thiserror::Error)]
pub enum SentinelStepError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        budget::{BudgetLedger, BudgetReserve, BudgetStatus},
        metrics::{score::RiskLevel, volatility::VolRegime},
        types::InvoiceId,
    };
    use std::time::Duration;

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

    struct Rig {
        _dir: tempfile::TempDir,
        machine: EscalationMachine,
        budget: Arc<BudgetLedger>,
    }

    fn rig_with(level: Level, dwell: Duration, spent: u64) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("db")).unwrap());
        let budget = Arc::new(BudgetLedger::with_spent(
            MicroUsdc::new(10_000_000),
            MicroUsdc::new(50_000),
            MicroUsdc::new(spent),
        ));
        let mut ctx = EscalationContext::starting_at(level, Duration::from_secs(300));
        ctx.entered_at = Instant::now() - dwell;
        let machine = EscalationMachine::new(
            ctx,
            budget.clone(),
            TransitionLedger::new(store.clone(), 1_000),
            store,
            Observers::new(),
            RiskConfig::default(),
            MicroUsdc::new(50_000),
            MicroUsdc::new(500_000),
        );
        Rig {
            _dir: dir,
            machine,
            budget,
        }
    }

    #[test]
    fn metric_tick_starts_monitoring() {
        let rig = rig_with(Level::L0Idle, Duration::ZERO, 0);
        let m = metrics(VolRegime::Low, None);
        assert_eq!(rig.machine.next_trigger(&m), Some(Trigger::MetricTick));
        let outcome = rig
            .machine
            .attempt(RunId::new(1), Trigger::MetricTick, &m, None)
            .unwrap();
        assert!(matches!(outcome, StepOutcome::Applied(_)));
        assert_eq!(rig.machine.current_level(), Level::L1Monitor);
    }

    #[test]
    fn paused_system_stays_idle() {
        let rig = rig_with(Level::L0Idle, Duration::ZERO, 0);
        rig.machine.set_paused(true);
        let m = metrics(VolRegime::Low, None);
        assert_eq!(rig.machine.next_trigger(&m), None);
        let outcome = rig
            .machine
            .attempt(RunId::new(1), Trigger::MetricTick, &m, None)
            .unwrap();
        assert!(matches!(outcome, StepOutcome::Rejected(_)));
        assert_eq!(rig.machine.current_level(), Level::L0Idle);
    }

    #[test]
    fn paid_transition_goes_through_pending() {
        let rig = rig_with(Level::L2Alert, Duration::from_secs(600), 0);
        let m = metrics(VolRegime::Elevated, Some(1.3));
        assert_eq!(rig.machine.next_trigger(&m), Some(Trigger::NeedMarketData));
        let outcome = rig
            .machine
            .attempt(RunId::new(1), Trigger::NeedMarketData, &m, None)
            .unwrap();
        let StepOutcome::PaymentPending(pending) = outcome else {
            panic!("expected pending payment");
        };
        // Level unchanged until the payment settles.
        assert_eq!(rig.machine.current_level(), Level::L2Alert);
        assert_eq!(pending.guards_passed, vec!["cooldown_ok", "budget"]);

        // Simulate the pipeline committing 250k.
        let handle = rig.budget.reserve(MicroUsdc::new(250_000)).unwrap();
        rig.budget.commit(handle).unwrap();
        let outcome = rig
            .machine
            .finalize_payment(pending, Ok((Some(7), MicroUsdc::new(250_000))))
            .unwrap();
        let StepOutcome::Applied(record) = outcome else {
            panic!("expected applied");
        };
        assert_eq!(rig.machine.current_level(), Level::L3MarketData);
        assert_eq!(record.cost, MicroUsdc::new(250_000));
        assert_eq!(record.payment_id, Some(7));
    }

    #[test]
    fn budget_guard_failure_redirects_to_blocked() {
        // S2: spent 9.9 of 10 USDC, L3 -> L4 costs 1 USDC.
        let rig = rig_with(Level::L3MarketData, Duration::from_secs(600), 9_900_000);
        let m = metrics(VolRegime::High, Some(0.5));
        let outcome = rig
            .machine
            .attempt(RunId::new(1), Trigger::CriticalMetric, &m, None)
            .unwrap();
        let StepOutcome::Redirected(record) = outcome else {
            panic!("expected redirect");
        };
        assert_eq!(rig.machine.current_level(), Level::BudgetBlocked);
        assert_eq!(record.to_level, Level::BudgetBlocked);
        assert_eq!(record.cost, MicroUsdc::ZERO);
        assert!(record.guards_failed.contains(&"budget".to_string()));

        // Upward triggers are rejected until the budget recovers.
        let err = rig
            .machine
            .attempt(RunId::new(1), Trigger::CriticalMetric, &m, None)
            .unwrap_err();
        assert!(matches!(err, SentinelStepError::State(_)));
    }

    #[test]
    fn blocked_machine_recovers_after_reset() {
        let rig = rig_with(Level::L3MarketData, Duration::from_secs(600), 9_990_000);
        let m = metrics(VolRegime::Low, None);
        assert_eq!(
            rig.machine.next_trigger(&m),
            Some(Trigger::BudgetExhausted)
        );
        let outcome = rig
            .machine
            .attempt(RunId::new(1), Trigger::BudgetExhausted, &m, None)
            .unwrap();
        assert!(matches!(outcome, StepOutcome::Applied(_)));
        assert_eq!(rig.machine.current_level(), Level::BudgetBlocked);

        rig.budget.reset();
        assert_eq!(rig.machine.next_trigger(&m), Some(Trigger::BudgetRestored));
        let outcome = rig
            .machine
            .attempt(RunId::new(2), Trigger::BudgetRestored, &m, None)
            .unwrap();
        assert!(matches!(outcome, StepOutcome::Applied(_)));
        assert_eq!(rig.machine.current_level(), Level::L1Monitor);
    }

    #[test]
    fn cooldown_gates_deescalation() {
        let rig = rig_with(Level::L2Alert, Duration::from_secs(10), 0);
        let m = metrics(VolRegime::Low, None);
        // Dwell too short: trigger not proposed, explicit attempt rejected.
        assert_eq!(rig.machine.next_trigger(&m), None);
        let outcome = rig
            .machine
            .attempt(RunId::new(1), Trigger::CooldownOk, &m, None)
            .unwrap();
        assert!(matches!(outcome, StepOutcome::Rejected(_)));
        assert_eq!(rig.machine.current_level(), Level::L2Alert);

        let settled = rig_with(Level::L2Alert, Duration::from_secs(600), 0);
        assert_eq!(settled.machine.next_trigger(&m), Some(Trigger::CooldownOk));
        let outcome = settled
            .machine
            .attempt(RunId::new(1), Trigger::CooldownOk, &m, None)
            .unwrap();
        assert!(matches!(outcome, StepOutcome::Applied(_)));
        assert_eq!(settled.machine.current_level(), Level::L1Monitor);
    }

    #[test]
    fn manual_override_may_skip_levels() {
        let rig = rig_with(Level::L0Idle, Duration::ZERO, 0);
        let m = metrics(VolRegime::Low, None);
        let outcome = rig
            .machine
            .attempt(
                RunId::new(1),
                Trigger::ManualOverride(Level::L4Critical),
                &m,
                None,
            )
            .unwrap();
        assert!(matches!(outcome, StepOutcome::Applied(_)));
        assert_eq!(rig.machine.current_level(), Level::L4Critical);
    }

    #[test]
    fn failed_payment_leaves_level_unchanged() {
        let rig = rig_with(Level::L2Alert, Duration::from_secs(600), 0);
        let m = metrics(VolRegime::Elevated, Some(1.3));
        let outcome = rig
            .machine
            .attempt(RunId::new(1), Trigger::NeedMarketData, &m, None)
            .unwrap();
        let StepOutcome::PaymentPending(pending) = outcome else {
            panic!("expected pending");
        };
        let err = PaymentError::InvoiceExpired(InvoiceId::new("inv-9"));
        let outcome = rig.machine.finalize_payment(pending, Err(&err)).unwrap();
        let StepOutcome::Rejected(record) = outcome else {
            panic!("expected rejected");
        };
        assert_eq!(rig.machine.current_level(), Level::L2Alert);
        assert!(!record.successful);
        assert_eq!(record.cost, MicroUsdc::ZERO);
    }

    #[test]
    fn successful_costs_sum_to_spend() {
        // Invariant: sum of successful transition costs equals final spend.
        let rig = rig_with(Level::L2Alert, Duration::from_secs(600), 0);
        let m = metrics(VolRegime::Elevated, Some(1.3));
        let StepOutcome::PaymentPending(pending) = rig
            .machine
            .attempt(RunId::new(1), Trigger::NeedMarketData, &m, None)
            .unwrap()
        else {
            panic!("expected pending");
        };
        let handle = rig.budget.reserve(MicroUsdc::new(250_000)).unwrap();
        rig.budget.commit(handle).unwrap();
        rig.machine
            .finalize_payment(pending, Ok((None, MicroUsdc::new(250_000))))
            .unwrap();

        let total: u64 = rig
            .machine
            .ledger()
            .recent(100)
            .iter()
            .filter(|t| t.successful)
            .map(|t| t.cost.into_inner())
            .sum();
        assert_eq!(total, rig.budget.status().spent.into_inner());
    }
}
