use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, OnceLock},
    time::Instant,
};

use crate::{errors::StoreError, store::records::TransitionRecord, store::Store};

/// Default size of the in-memory window.
pub const DEFAULT_LEDGER_CAP: usize = 1_000;

static PROCESS_START: OnceLock<Instant> = OnceLock::new();

/// Milliseconds since process start; strictly ordered with ledger ids.
pub fn monotonic_ms() -> u64 {
    let start = *PROCESS_START.get_or_init(Instant::now);
    Instant::now().duration_since(start).as_millis() as u64
}

/// Append-only log of every attempted transition. Rows are persisted
/// immediately; a capped window is kept in memory for the status surface
/// and evicted entries simply age out (they are already on disk).
pub struct TransitionLedger {
    cap: usize,
    recent: Mutex<VecDeque<TransitionRecord>>,
    store: Arc<Store>,
}

impl TransitionLedger {
    pub fn new(store: Arc<Store>, cap: usize) -> Self {
        Self {
            cap,
            recent: Mutex::new(VecDeque::new()),
            store,
        }
    }

    pub fn append(&self, record: TransitionRecord) -> Result<(), StoreError> {
        self.store.append_transition(&record)?;
        let mut recent = self.recent.lock().expect("ledger lock");
        if recent.len() >= self.cap {
            recent.pop_front();
        }
        recent.push_back(record);
        Ok(())
    }

    pub fn recent(&self, limit: usize) -> Vec<TransitionRecord> {
        let recent = self.recent.lock().expect("ledger lock");
        recent.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.recent.lock().expect("ledger lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        escalation::Level,
        types::{MicroUsdc, RunId, UnixMillis},
    };

    fn record(id: u64) -> TransitionRecord {
        TransitionRecord {
            id,
            run_id: RunId::new(1),
            from_level: Level::L0Idle,
            to_level: Level::L1Monitor,
            trigger: "metric-tick".to_string(),
            successful: true,
            guards_passed: vec![],
            guards_failed: vec![],
            cost: MicroUsdc::ZERO,
            payment_id: None,
            snapshot_id: None,
            at: UnixMillis::now(),
            monotonic_ms: monotonic_ms(),
        }
    }

    #[test]
    fn window_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("db")).unwrap());
        let ledger = TransitionLedger::new(store.clone(), 3);
        for id in 1..=5 {
            ledger.append(record(id)).unwrap();
        }
        assert_eq!(ledger.len(), 3);
        let recent = ledger.recent(10);
        assert_eq!(recent[0].id, 5);
        assert_eq!(recent[2].id, 3);
        // Evicted entries are still on disk.
        assert_eq!(store.transitions_for_run(RunId::new(1)).unwrap().len(), 5);
    }

    #[test]
    fn monotonic_clock_never_goes_backwards() {
        let a = monotonic_ms();
        let b = monotonic_ms();
        assert!(b >= a);
    }
}
