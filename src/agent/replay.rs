use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::info;

use crate::{
    budget::{BudgetLedger, BudgetReserve},
    config::SentinelConfig,
    errors::{ConfigError, PaymentError, SentinelError},
    escalation::{
        machine::SentinelStepError, EscalationContext, EscalationMachine, StepOutcome,
        TransitionLedger,
    },
    observer::Observers,
    store::{records::TransitionRecord, Store},
    types::RunId,
};

/// Outcome of a deterministic replay.
#[derive(Debug)]
pub struct ReplayReport {
    pub run_id: RunId,
    pub recorded: Vec<TransitionRecord>,
    pub replayed: Vec<TransitionRecord>,
    /// True when the replayed sequence matches the recorded one
    /// (comparing levels, trigger, outcome and cost; ids and timestamps
    /// differ by construction).
    pub matches: bool,
}

fn same_transition(a: &TransitionRecord, b: &TransitionRecord) -> bool {
    a.from_level == b.from_level
        && a.to_level == b.to_level
        && a.trigger == b.trigger
        && a.successful == b.successful
        && a.cost == b.cost
}

/// Reconstruct a recorded run against its persisted snapshot + metrics.
///
/// Only `dry_run = true` is supported: no payments are made, the real
/// ledger is untouched, and all replay rows land in a throwaway store.
/// Paid transitions are resolved from the recorded outcome so the
/// reconstruction is deterministic.
pub fn replay(
    store: &Store,
    cfg: &SentinelConfig,
    run_id: RunId,
    dry_run: bool,
) -> Result<ReplayReport, SentinelError> {
    if !dry_run {
        return Err(SentinelError::Config(ConfigError::invalid(
            "dry_run",
            "replay only supports dry_run = true",
        )));
    }

    let run = store.get_run(run_id)?;
    let recorded = store.transitions_for_run(run_id)?;
    let metrics = run.metadata.metrics.clone().ok_or_else(|| {
        SentinelError::Config(ConfigError::invalid(
            "run",
            format!("run {run_id} carries no recorded metrics"),
        ))
    })?;

    // Shadow world: same limits, same starting spend, fresh store.
    let shadow_store = Arc::new(Store::open_temporary()?);
    let budget = Arc::new(BudgetLedger::with_spent(
        cfg.budget_limit(),
        cfg.minimum_operational(),
        run.metadata.spent_before,
    ));
    let mut ctx = EscalationContext::starting_at(run.level_before, cfg.cooldown());
    ctx.entered_at = Instant::now() - Duration::from_millis(run.metadata.dwell_ms_before);
    let machine = EscalationMachine::new(
        ctx,
        budget.clone(),
        TransitionLedger::new(shadow_store.clone(), 1_000),
        shadow_store,
        Observers::new(),
        cfg.risk.clone(),
        cfg.minimum_operational(),
        cfg.warning_threshold(),
    );

    let mut replayed = Vec::new();
    for _ in 0..recorded.len().max(8) {
        let Some(trigger) = machine.next_trigger(&metrics) else {
            break;
        };
        let outcome = machine
            .attempt(run_id, trigger, &metrics, None)
            .map_err(|err| match err {
                SentinelStepError::State(e) => SentinelError::State(e),
                SentinelStepError::Store(e) => SentinelError::Store(e),
            })?;
        match outcome {
            StepOutcome::Applied(record) => replayed.push(record),
            StepOutcome::Rejected(record) | StepOutcome::Redirected(record) => {
                replayed.push(record);
                break;
            }
            StepOutcome::PaymentPending(pending) => {
                // Resolve the payment from what actually happened.
                let original = recorded.iter().find(|r| {
                    r.from_level == pending.from
                        && r.to_level == pending.target
                        && r.trigger == pending.trigger
                });
                let outcome = match original {
                    Some(orig) if orig.successful => {
                        let handle = budget
                            .reserve(orig.cost)
                            .map_err(SentinelError::Budget)?;
                        budget.commit(handle).map_err(SentinelError::Budget)?;
                        machine.finalize_payment(pending, Ok((orig.payment_id, orig.cost)))?
                    }
                    _ => {
                        let err = PaymentError::UpstreamError("replay".to_string());
                        machine.finalize_payment(pending, Err(&err))?
                    }
                };
                match outcome {
                    StepOutcome::Applied(record) => replayed.push(record),
                    StepOutcome::Rejected(record) | StepOutcome::Redirected(record) => {
                        replayed.push(record);
                        break;
                    }
                    StepOutcome::PaymentPending(_) => unreachable!("finalize never re-pends"),
                }
            }
        }
    }

    let matches = recorded.len() == replayed.len()
        && recorded
            .iter()
            .zip(replayed.iter())
            .all(|(a, b)| same_transition(a, b));
    info!(
        run_id = run_id.into_inner(),
        recorded = recorded.len(),
        replayed = replayed.len(),
        matches,
        "replay finished"
    );

    Ok(ReplayReport {
        run_id,
        recorded,
        replayed,
        matches,
    })
}
