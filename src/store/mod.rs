pub mod records;

use std::path::Path;

use alloy_primitives::B256;
use serde::{de::DeserializeOwned, Serialize};
use tracing::warn;

use crate::{
    errors::StoreError,
    types::{InvoiceId, RunId, RunNumber, UnixMillis},
};
use records::{ConsumedTxRecord, PaymentRecord, RunRecord, SnapshotRecord, TransitionRecord};

const TREE_RUNS: &str = "runs";
const TREE_PAYMENTS: &str = "payments";
const TREE_TRANSITIONS: &str = "transitions";
const TREE_SNAPSHOTS: &str = "snapshots";
const TREE_CONSUMED_TX: &str = "consumed_tx";
const TREE_META: &str = "meta";

/// Embedded store backing all durable state. One sled tree per table;
/// row keys are big-endian ids so range scans come back in append order.
/// Linked rows (payments, transitions, snapshots) are keyed by
/// `run_id ++ row_id` so per-run lookups are prefix scans.
pub struct Store {
    db: sled::Db,
    runs: sled::Tree,
    payments: sled::Tree,
    transitions: sled::Tree,
    snapshots: sled::Tree,
    consumed_tx: sled::Tree,
    meta: sled::Tree,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::from_db(sled::Config::new().path(path).open()?)
    }

    /// In-memory store for replays; nothing survives the process.
    pub fn open_temporary() -> Result<Self, StoreError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        Ok(Self {
            runs: db.open_tree(TREE_RUNS)?,
            payments: db.open_tree(TREE_PAYMENTS)?,
            transitions: db.open_tree(TREE_TRANSITIONS)?,
            snapshots: db.open_tree(TREE_SNAPSHOTS)?,
            consumed_tx: db.open_tree(TREE_CONSUMED_TX)?,
            meta: db.open_tree(TREE_META)?,
            db,
        })
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    // Monotonic counters -------------------------------------------------

    fn bump(&self, counter: &str) -> Result<u64, StoreError> {
        let value = self.meta.update_and_fetch(counter, |old| {
            let next = old.map(decode_u64).unwrap_or(0) + 1;
            Some(next.to_be_bytes().to_vec())
        })?;
        Ok(value.map(|ivec| decode_u64(&ivec)).unwrap_or(1))
    }

    pub fn next_run_id(&self) -> Result<RunId, StoreError> {
        self.bump("run_id").map(RunId::new)
    }

    pub fn next_run_number(&self) -> Result<RunNumber, StoreError> {
        self.bump("run_number").map(RunNumber::new)
    }

    pub fn next_payment_id(&self) -> Result<u64, StoreError> {
        self.bump("payment_id")
    }

    pub fn next_transition_id(&self) -> Result<u64, StoreError> {
        self.bump("transition_id")
    }

    pub fn next_snapshot_id(&self) -> Result<u64, StoreError> {
        self.bump("snapshot_id")
    }

    // Runs ---------------------------------------------------------------

    pub fn put_run(&self, record: &RunRecord) -> Result<(), StoreError> {
        self.insert(&self.runs, &record.id.into_inner().to_be_bytes(), record)
    }

    pub fn get_run(&self, id: RunId) -> Result<RunRecord, StoreError> {
        let key = id.into_inner().to_be_bytes();
        match self.runs.get(key)? {
            Some(bytes) => decode(TREE_RUNS, &bytes),
            None => Err(StoreError::Missing {
                tree: TREE_RUNS,
                key: id.into_inner(),
            }),
        }
    }

    /// Most recent runs, newest first.
    pub fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>, StoreError> {
        let mut out = Vec::with_capacity(limit);
        for item in self.runs.iter().rev().take(limit) {
            let (_, bytes) = item?;
            out.push(decode(TREE_RUNS, &bytes)?);
        }
        Ok(out)
    }

    // Payments -----------------------------------------------------------

    pub fn append_payment(&self, record: &PaymentRecord) -> Result<(), StoreError> {
        self.insert(
            &self.payments,
            &linked_key(record.run_id, record.id),
            record,
        )
    }

    pub fn payments_for_run(&self, run_id: RunId) -> Result<Vec<PaymentRecord>, StoreError> {
        self.scan_linked(&self.payments, TREE_PAYMENTS, run_id)
    }

    // Transitions --------------------------------------------------------

    pub fn append_transition(&self, record: &TransitionRecord) -> Result<(), StoreError> {
        self.insert(
            &self.transitions,
            &linked_key(record.run_id, record.id),
            record,
        )
    }

    pub fn transitions_for_run(&self, run_id: RunId) -> Result<Vec<TransitionRecord>, StoreError> {
        self.scan_linked(&self.transitions, TREE_TRANSITIONS, run_id)
    }

    // Snapshots ----------------------------------------------------------

    pub fn append_snapshot(&self, record: &SnapshotRecord) -> Result<(), StoreError> {
        self.insert(
            &self.snapshots,
            &linked_key(record.run_id, record.id),
            record,
        )
    }

    pub fn snapshots_for_run(&self, run_id: RunId) -> Result<Vec<SnapshotRecord>, StoreError> {
        self.scan_linked(&self.snapshots, TREE_SNAPSHOTS, run_id)
    }

    // Consumed transaction hashes ----------------------------------------

    /// Record a settlement hash as consumed. Returns `false` when the hash
    /// was already bound to an earlier invoice.
    pub fn insert_consumed_tx(
        &self,
        tx_hash: B256,
        invoice_id: &InvoiceId,
    ) -> Result<bool, StoreError> {
        let record = ConsumedTxRecord {
            tx_hash,
            invoice_id: invoice_id.clone(),
            consumed_at: UnixMillis::now(),
        };
        let value = serde_json::to_vec(&record)?;
        let outcome = self.consumed_tx.compare_and_swap(
            tx_hash.as_slice(),
            None as Option<&[u8]>,
            Some(value),
        )?;
        Ok(outcome.is_ok())
    }

    pub fn consumed_tx_hashes(&self) -> Result<Vec<B256>, StoreError> {
        let mut out = Vec::new();
        for item in self.consumed_tx.iter() {
            let (_, bytes) = item?;
            let record: ConsumedTxRecord = decode(TREE_CONSUMED_TX, &bytes)?;
            out.push(record.tx_hash);
        }
        Ok(out)
    }

    pub fn consumed_tx_count(&self) -> usize {
        self.consumed_tx.len()
    }

    // Internals ----------------------------------------------------------

    /// Writes retry once; a second failure escapes and fails the run.
    fn insert<T: Serialize>(
        &self,
        tree: &sled::Tree,
        key: &[u8],
        record: &T,
    ) -> Result<(), StoreError> {
        let value = serde_json::to_vec(record)?;
        if let Err(first) = tree.insert(key, value.clone()) {
            warn!(error = %first, "store write failed, retrying once");
            tree.insert(key, value)?;
        }
        Ok(())
    }

    fn scan_linked<T: DeserializeOwned>(
        &self,
        tree: &sled::Tree,
        name: &'static str,
        run_id: RunId,
    ) -> Result<Vec<T>, StoreError> {
        let prefix = run_id.into_inner().to_be_bytes();
        let mut out = Vec::new();
        for item in tree.scan_prefix(prefix) {
            let (_, bytes) = item?;
            out.push(decode(name, &bytes)?);
        }
        Ok(out)
    }
}

fn linked_key(run_id: RunId, row_id: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&run_id.into_inner().to_be_bytes());
    key[8..].copy_from_slice(&row_id.to_be_bytes());
    key
}

fn decode_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let len = bytes.len().min(8);
    buf[8 - len..].copy_from_slice(&bytes[..len]);
    u64::from_be_bytes(buf)
}

fn decode<T: DeserializeOwned>(tree: &'static str, bytes: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Corrupt {
        tree,
        detail: e.to_string(),
    })
}
