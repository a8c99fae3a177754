//! Transaction service
//!
//! One transaction per engine. While a transaction is active, write
//! operations queue in memory instead of touching disk; reads materialize
//! a "current view" by replaying the queue over the on-disk state, so a
//! session always reads its own writes. Commit replays the queue through
//! the engine's direct-write path; rollback restores the per-table
//! snapshots taken lazily when a table was first modified. Either terminal
//! transition resets the service completely.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{ErrorCode, Result, StoreError};
use crate::query::Filter;
use crate::types::{Record, WriteMode};

use super::writer::apply_update;

/// Transaction state machine phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnPhase {
    Idle,
    Active,
    Committing,
    RollingBack,
}

/// One sub-operation of a bulk write
#[derive(Debug, Clone)]
pub enum BulkOp {
    Insert { records: Vec<Record> },
    Update { data: Value, filter: Filter },
    Delete { filter: Filter },
}

/// A write operation queued inside a transaction
#[derive(Clone)]
pub enum QueuedOp {
    Write { records: Vec<Record>, mode: WriteMode },
    Update { data: Value, filter: Filter },
    Delete { filter: Filter },
    Bulk { ops: Vec<BulkOp> },
}

pub(crate) struct TxnState {
    pub phase: TxnPhase,
    /// Queue in arrival order: (table, op)
    pub ops: Vec<(String, QueuedOp)>,
    /// Deep copies of each touched table, taken on first touch. `None`
    /// records that the table did not exist when the transaction touched
    /// it, so rollback removes it instead of restoring records.
    pub snapshots: HashMap<String, Option<Vec<Record>>>,
    /// Materialized current views, invalidated whenever the queue grows
    views: HashMap<String, Vec<Record>>,
}

impl TxnState {
    fn new() -> Self {
        Self {
            phase: TxnPhase::Idle,
            ops: Vec::new(),
            snapshots: HashMap::new(),
            views: HashMap::new(),
        }
    }

    fn reset(&mut self) {
        *self = TxnState::new();
    }
}

/// The transaction service. The engine owns exactly one.
pub struct TransactionService {
    state: std::sync::Mutex<TxnState>,
}

impl TransactionService {
    pub fn new() -> Self {
        Self {
            state: std::sync::Mutex::new(TxnState::new()),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().expect("txn lock poisoned").phase == TxnPhase::Active
    }

    /// Enter `Active`. Requires `Idle`.
    pub fn begin(&self) -> Result<()> {
        let mut state = self.state.lock().expect("txn lock poisoned");
        if state.phase != TxnPhase::Idle {
            return Err(StoreError::new(
                ErrorCode::TransactionInProgress,
                "a transaction is already in progress",
            ));
        }
        state.phase = TxnPhase::Active;
        Ok(())
    }

    /// Queue an operation on a table. `snapshot` supplies the table's
    /// current on-disk records (`None` when the table does not exist yet)
    /// and runs only the first time the table is touched in this
    /// transaction.
    pub fn queue<F>(&self, table: &str, op: QueuedOp, snapshot: F) -> Result<()>
    where
        F: FnOnce() -> Result<Option<Vec<Record>>>,
    {
        let mut state = self.state.lock().expect("txn lock poisoned");
        if state.phase != TxnPhase::Active {
            return Err(StoreError::new(
                ErrorCode::NoTransactionInProgress,
                "no transaction in progress",
            ));
        }
        if !state.snapshots.contains_key(table) {
            let records = snapshot()?;
            state.snapshots.insert(table.to_string(), records);
        }
        state.ops.push((table.to_string(), op));
        // The queued op invalidates any materialized view of this table.
        state.views.remove(table);
        Ok(())
    }

    /// The transaction's view of a table: the on-disk state with every
    /// queued op replayed in order. Views are cached until the queue
    /// grows. `base` loads the on-disk records.
    pub fn current_view<F>(&self, table: &str, base: F) -> Result<Vec<Record>>
    where
        F: FnOnce() -> Result<Vec<Record>>,
    {
        let mut state = self.state.lock().expect("txn lock poisoned");
        if state.phase != TxnPhase::Active {
            return Err(StoreError::new(
                ErrorCode::NoTransactionInProgress,
                "no transaction in progress",
            ));
        }
        if let Some(view) = state.views.get(table) {
            return Ok(view.clone());
        }

        // Replay over the snapshot when we have one (it equals the disk
        // state at first touch; a not-yet-existing table reads as empty),
        // otherwise over a fresh disk read.
        let mut records = match state.snapshots.get(table) {
            Some(Some(snapshot)) => snapshot.clone(),
            Some(None) => Vec::new(),
            None => base()?,
        };
        for (op_table, op) in &state.ops {
            if op_table == table {
                apply_queued_op(&mut records, op);
            }
        }
        state.views.insert(table.to_string(), records.clone());
        Ok(records)
    }

    /// Transition to `Committing` and hand the queue to the caller. The
    /// caller replays it and must finish with [`finish`].
    pub fn take_for_commit(&self) -> Result<Vec<(String, QueuedOp)>> {
        let mut state = self.state.lock().expect("txn lock poisoned");
        if state.phase != TxnPhase::Active {
            return Err(StoreError::new(
                ErrorCode::NoTransactionInProgress,
                "no transaction in progress",
            ));
        }
        state.phase = TxnPhase::Committing;
        Ok(state.ops.clone())
    }

    /// Transition to `RollingBack` and hand out the snapshots to restore
    /// (`None` marks a table that must not exist after the restore).
    /// Also used when a commit replay fails halfway.
    pub fn take_for_rollback(&self) -> Result<HashMap<String, Option<Vec<Record>>>> {
        let mut state = self.state.lock().expect("txn lock poisoned");
        match state.phase {
            TxnPhase::Active | TxnPhase::Committing => {}
            _ => {
                return Err(StoreError::new(
                    ErrorCode::NoTransactionInProgress,
                    "no transaction in progress",
                ))
            }
        }
        state.phase = TxnPhase::RollingBack;
        Ok(state.snapshots.clone())
    }

    /// Terminal reset back to `Idle`; the next `begin` starts clean
    pub fn finish(&self) {
        self.state.lock().expect("txn lock poisoned").reset();
    }
}

impl Default for TransactionService {
    fn default() -> Self {
        Self::new()
    }
}

/// Replay one queued op against an in-memory record array
pub(crate) fn apply_queued_op(records: &mut Vec<Record>, op: &QueuedOp) {
    match op {
        QueuedOp::Write { records: new, mode } => match mode {
            WriteMode::Append => records.extend(new.iter().cloned()),
            WriteMode::Overwrite => *records = new.clone(),
        },
        QueuedOp::Update { data, filter } => {
            for record in records.iter_mut() {
                if filter.matches(record) {
                    apply_update(record, data);
                }
            }
        }
        QueuedOp::Delete { filter } => {
            records.retain(|r| !filter.matches(r));
        }
        QueuedOp::Bulk { ops } => {
            for bulk_op in ops {
                match bulk_op {
                    BulkOp::Insert { records: new } => records.extend(new.iter().cloned()),
                    BulkOp::Update { data, filter } => {
                        for record in records.iter_mut() {
                            if filter.matches(record) {
                                apply_update(record, data);
                            }
                        }
                    }
                    BulkOp::Delete { filter } => {
                        records.retain(|r| !filter.matches(r));
                    }
                }
            }
        }
    }
}
