use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    budget::BudgetSnapshot, payment::invoice::Receipt, store::records::TransitionRecord,
};

/// Typed observer surface. Components call these with strongly typed
/// records; there are no dynamic event names. All hooks default to no-ops
/// so observers implement only what they care about.
pub trait SentinelObserver: Send + Sync {
    fn on_transition(&self, _transition: &TransitionRecord) {}
    fn on_payment_settled(&self, _receipt: &Receipt) {}
    fn on_budget_warning(&self, _status: &BudgetSnapshot) {}
}

/// Shared observer list. Cheap to clone; registration happens at the
/// composition root before the scheduler starts.
#[derive(Clone, Default)]
pub struct Observers {
    list: Vec<Arc<dyn SentinelObserver>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, observer: Arc<dyn SentinelObserver>) {
        self.list.push(observer);
    }

    pub fn notify_transition(&self, transition: &TransitionRecord) {
        for observer in &self.list {
            observer.on_transition(transition);
        }
    }

    pub fn notify_payment_settled(&self, receipt: &Receipt) {
        for observer in &self.list {
            observer.on_payment_settled(receipt);
        }
    }

    pub fn notify_budget_warning(&self, status: &BudgetSnapshot) {
        for observer in &self.list {
            observer.on_budget_warning(status);
        }
    }
}

/// Stock observer that mirrors every event into the structured log.
pub struct LogObserver;

impl SentinelObserver for LogObserver {
    fn on_transition(&self, transition: &TransitionRecord) {
        info!(
            run_id = transition.run_id.into_inner(),
            from = %transition.from_level,
            to = %transition.to_level,
            trigger = %transition.trigger,
            successful = transition.successful,
            cost = %transition.cost,
            "escalation transition"
        );
    }

    fn on_payment_settled(&self, receipt: &Receipt) {
        info!(
            invoice_id = %receipt.invoice_id,
            tx_hash = %receipt.tx_hash,
            amount = %receipt.amount_observed,
            confirmations = receipt.confirmations,
            "payment settled"
        );
    }

    fn on_budget_warning(&self, status: &BudgetSnapshot) {
        warn!(
            remaining = %status.remaining,
            spent = %status.spent,
            limit = %status.limit,
            blocked = status.blocked,
            "budget running low"
        );
    }
}
