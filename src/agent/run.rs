use std::sync::Arc;

use serde_json::json;
use tracing::{error, info, warn};

use crate::{
    budget::{BudgetLedger, BudgetStatus},
    chain::treasury::{snapshot_all, TreasuryReader, TreasurySnapshot},
    config::SentinelConfig,
    errors::{PaymentError, SentinelError},
    escalation::{machine::SentinelStepError, EscalationMachine, Level, PendingTransition, StepOutcome},
    gateway::{MarketDataGateway, MarketDepth, MarketEndpoint},
    metrics::{MetricEngine, Metrics},
    store::{
        records::{RunMetadata, RunRecord, RunStatus, SnapshotRecord},
        Store,
    },
    types::{MicroUsdc, RunId, UnixMillis},
};

/// At most this many transitions are attempted per tick; the ladder has
/// six levels so anything deeper indicates a loop.
const MAX_STEPS_PER_RUN: usize = 8;

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: RunId,
    pub status: RunStatus,
    pub level_before: Level,
    pub level_after: Level,
    pub spend_delta: MicroUsdc,
    pub transitions: usize,
}

/// Operator-facing aggregate of the agent's current state.
#[derive(Debug, Clone)]
pub struct SentinelStatus {
    pub level: Level,
    pub budget: crate::budget::BudgetSnapshot,
    pub consumed_tx: usize,
    pub last_run: Option<RunRecord>,
}

struct BodyOutcome {
    snapshot_ids: Vec<u64>,
    metrics: Metrics,
    transitions: usize,
    invoice_count: u32,
}

/// One agent instance: every dependency is passed in at construction, so
/// tests wire fakes directly.
pub struct Sentinel {
    cfg: SentinelConfig,
    store: Arc<Store>,
    budget: Arc<BudgetLedger>,
    reader: Arc<dyn TreasuryReader>,
    engine: MetricEngine,
    machine: EscalationMachine,
    gateway: Arc<MarketDataGateway>,
}

impl Sentinel {
    pub fn new(
        cfg: SentinelConfig,
        store: Arc<Store>,
        budget: Arc<BudgetLedger>,
        reader: Arc<dyn TreasuryReader>,
        engine: MetricEngine,
        machine: EscalationMachine,
        gateway: Arc<MarketDataGateway>,
    ) -> Self {
        Self {
            cfg,
            store,
            budget,
            reader,
            engine,
            machine,
            gateway,
        }
    }

    pub fn machine(&self) -> &EscalationMachine {
        &self.machine
    }

    pub fn budget(&self) -> &BudgetLedger {
        &self.budget
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn status(&self) -> SentinelStatus {
        SentinelStatus {
            level: self.machine.current_level(),
            budget: self.budget.status(),
            consumed_tx: self.store.consumed_tx_count(),
            last_run: self
                .store
                .recent_runs(1)
                .ok()
                .and_then(|mut runs| runs.pop()),
        }
    }

    pub fn flush(&self) -> Result<(), SentinelError> {
        self.store.flush()?;
        Ok(())
    }

    /// Persist a SKIPPED row for a tick that could not run.
    pub fn record_skip(
        &self,
        scheduled_at: UnixMillis,
        reason: &str,
    ) -> Result<RunId, SentinelError> {
        let id = self.store.next_run_id()?;
        let level = self.machine.current_level();
        let record = RunRecord {
            id,
            run_number: self.store.next_run_number()?,
            scheduled_at,
            started_at: None,
            completed_at: Some(UnixMillis::now()),
            status: RunStatus::Skipped,
            level_before: level,
            level_after: level,
            spend_delta: MicroUsdc::ZERO,
            snapshot_id: None,
            error: None,
            metadata: RunMetadata {
                spent_before: self.budget.status().spent,
                skip_reason: Some(reason.to_string()),
                ..RunMetadata::default()
            },
        };
        self.store.put_run(&record)?;
        info!(run_id = id.into_inner(), reason, "tick skipped");
        Ok(id)
    }

    /// One scheduled run: snapshot, metrics, escalation, market data,
    /// persistence. The run row exists before any linked row.
    pub async fn run_once(&self, scheduled_at: UnixMillis) -> Result<RunSummary, SentinelError> {
        let run_id = self.store.next_run_id()?;
        let run_number = self.store.next_run_number()?;
        let level_before = self.machine.current_level();
        let spent_before = self.budget.status().spent;
        let dwell_ms_before = self.machine.dwell().as_millis() as u64;

        let mut record = RunRecord {
            id: run_id,
            run_number,
            scheduled_at,
            started_at: None,
            completed_at: None,
            status: RunStatus::Pending,
            level_before,
            level_after: level_before,
            spend_delta: MicroUsdc::ZERO,
            snapshot_id: None,
            error: None,
            metadata: RunMetadata {
                spent_before,
                dwell_ms_before,
                ..RunMetadata::default()
            },
        };
        self.store.put_run(&record)?;

        record.status = RunStatus::Running;
        record.started_at = Some(UnixMillis::now());
        self.store.put_run(&record)?;

        let outcome = tokio::time::timeout(self.cfg.run_timeout(), self.run_body(run_id)).await;

        let spent_after = self.budget.status().spent;
        record.level_after = self.machine.current_level();
        record.spend_delta = spent_after.saturating_sub(spent_before);
        record.completed_at = Some(UnixMillis::now());

        match outcome {
            Ok(Ok(body)) => {
                record.status = RunStatus::Completed;
                record.snapshot_id = body.snapshot_ids.first().copied();
                record.metadata.snapshot_ids = body.snapshot_ids;
                record.metadata.invoice_count = body.invoice_count;
                record.metadata.metrics = Some(body.metrics);
                self.store.put_run(&record)?;
                Ok(RunSummary {
                    run_id,
                    status: RunStatus::Completed,
                    level_before,
                    level_after: record.level_after,
                    spend_delta: record.spend_delta,
                    transitions: body.transitions,
                })
            }
            Ok(Err(err)) => {
                record.status = RunStatus::Failed;
                record.error = Some(err.to_string());
                self.store.put_run(&record)?;
                Err(err)
            }
            Err(_elapsed) => {
                let err = SentinelError::RunTimeout(self.cfg.run_timeout_ms);
                record.status = RunStatus::Failed;
                record.error = Some(err.to_string());
                self.store.put_run(&record)?;
                Err(err)
            }
        }
    }

    async fn run_body(&self, run_id: RunId) -> Result<BodyOutcome, SentinelError> {
        // Snapshot every chain; one unreachable RPC degrades the run, all
        // of them failing aborts it.
        let results = snapshot_all(self.reader.as_ref(), &self.cfg.chains).await;
        let mut snapshots: Vec<TreasurySnapshot> = Vec::new();
        let mut first_error = None;
        for result in results {
            match result {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(err) => {
                    warn!(error = %err, "chain snapshot failed");
                    first_error.get_or_insert(err);
                }
            }
        }
        if snapshots.is_empty() {
            if let Some(err) = first_error {
                return Err(SentinelError::Chain(err));
            }
        }

        let mut snapshot_ids = Vec::with_capacity(snapshots.len());
        for snapshot in &snapshots {
            let id = self.store.next_snapshot_id()?;
            self.store.append_snapshot(&SnapshotRecord {
                id,
                run_id,
                chain_id: snapshot.chain_id,
                wallet: snapshot.wallet,
                block_number: snapshot.block_number,
                taken_at: snapshot.taken_at,
                balances: snapshot.balances.clone(),
            })?;
            snapshot_ids.push(id);
        }
        let primary_snapshot = snapshot_ids.first().copied();

        let mut metrics = self.engine.compute(&snapshots, None);
        info!(
            run_id = run_id.into_inner(),
            total_usd = metrics.total_value_usd,
            regime = ?metrics.regime,
            risk_score = metrics.risk_score,
            "metrics computed"
        );

        let mut transitions = 0usize;
        let mut invoice_count = 0u32;
        for _ in 0..MAX_STEPS_PER_RUN {
            let Some(trigger) = self.machine.next_trigger(&metrics) else {
                break;
            };
            let outcome = self
                .machine
                .attempt(run_id, trigger, &metrics, primary_snapshot)
                .map_err(|err| match err {
                    SentinelStepError::State(e) => SentinelError::State(e),
                    SentinelStepError::Store(e) => SentinelError::Store(e),
                })?;
            match outcome {
                StepOutcome::Applied(_) => {
                    transitions += 1;
                }
                StepOutcome::Rejected(_) | StepOutcome::Redirected(_) => {
                    transitions += 1;
                    break;
                }
                StepOutcome::PaymentPending(pending) => {
                    transitions += 1;
                    if self.cfg.dry_run {
                        let err = PaymentError::UpstreamError(
                            "dry run: payments disabled".to_string(),
                        );
                        self.machine.finalize_payment(pending, Err(&err))?;
                        break;
                    }
                    invoice_count += 1;
                    match self.execute_payment(run_id, &pending).await {
                        Ok((payment_id, cost_paid, depth)) => {
                            self.machine
                                .finalize_payment(pending, Ok((payment_id, cost_paid)))?;
                            if let Some(book) = depth {
                                metrics.attach_depth(&book);
                            }
                        }
                        Err(err) => {
                            error!(error = %err, "market data payment failed");
                            self.machine.finalize_payment(pending, Err(&err))?;
                            break;
                        }
                    }
                }
            }
        }

        Ok(BodyOutcome {
            snapshot_ids,
            metrics,
            transitions,
            invoice_count,
        })
    }

    /// Execute the market-data purchases attached to a pending
    /// transition. Returns the last payment row id, the total committed
    /// spend, and any order-book payload for the metric refresh.
    async fn execute_payment(
        &self,
        run_id: RunId,
        pending: &PendingTransition,
    ) -> Result<(Option<u64>, MicroUsdc, Option<MarketDepth>), PaymentError> {
        let mut total = MicroUsdc::ZERO;
        let mut payment_id = None;
        let mut depth = None;
        for endpoint in &pending.endpoints {
            let params = json!({ "instrument": self.cfg.market_instrument });
            let (body, meta) = self.gateway.fetch_raw(run_id, *endpoint, &params).await?;
            total = total
                .checked_add(meta.cost_paid)
                .unwrap_or(MicroUsdc::new(u64::MAX));
            payment_id = meta.payment_id.or(payment_id);
            if matches!(
                endpoint,
                MarketEndpoint::LiquidityDepth | MarketEndpoint::OrderBook
            ) {
                match serde_json::from_slice::<MarketDepth>(&body) {
                    Ok(book) => depth = Some(book),
                    Err(err) => {
                        warn!(error = %err, "unparseable depth payload");
                    }
                }
            }
        }
        Ok((payment_id, total, depth))
    }
}
