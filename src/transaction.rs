//! Write transactions.
//!
//! A [`Transaction`] wraps an [`UndoLog`]. Writes apply immediately and
//! notify dependent views; `commit` asks every view touched by the
//! transaction to resolve its pending groups (fallback recompute, then target
//! writes) until nothing is left pending, and `rollback` reverts every write
//! in reverse and discards in-flight view state. A failed write rolls the
//! transaction back on the spot, and a transaction dropped while still active
//! rolls back.

use crate::error::{Result, ViewError};
use crate::handler::ViewHandler;
use crate::table::{Row, Table};
use crate::undo::UndoLog;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Transaction ID type
pub type TxnId = u64;

static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

/// Upper bound on resolve rounds at commit. Each round resolves the views
/// written to by the previous one, so this bounds the depth of view chains.
const MAX_RESOLVE_ROUNDS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    Active,
    Committed,
    RolledBack,
}

pub struct Transaction {
    id: TxnId,
    status: TxnStatus,
    undo: UndoLog,
}

impl Transaction {
    pub fn begin() -> Self {
        let id = NEXT_TXN_ID.fetch_add(1, Ordering::SeqCst);
        log::trace!("txn {}: begin", id);
        Transaction {
            id,
            status: TxnStatus::Active,
            undo: UndoLog::new(),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn status(&self) -> TxnStatus {
        self.status
    }

    fn ensure_active(&self) -> Result<()> {
        if self.status != TxnStatus::Active {
            return Err(ViewError::Transaction(format!(
                "Transaction {} is not active (status: {:?})",
                self.id, self.status
            )));
        }
        Ok(())
    }

    /// Append a row to `table`, returning its position.
    pub fn insert(&mut self, table: &Rc<RefCell<Table>>, row: Row) -> Result<usize> {
        self.ensure_active()?;
        let result = self.undo.insert(table, row);
        self.check_write(result)
    }

    pub fn delete(&mut self, table: &Rc<RefCell<Table>>, index: usize) -> Result<Row> {
        self.ensure_active()?;
        let result = self.undo.delete(table, index);
        self.check_write(result)
    }

    pub fn update(&mut self, table: &Rc<RefCell<Table>>, index: usize, row: Row) -> Result<Row> {
        self.ensure_active()?;
        let result = self.undo.update(table, index, row);
        self.check_write(result)
    }

    /// Rebuild a view from its refresh plan inside this transaction. Used
    /// after the view's source set changed.
    pub fn refresh_view(&mut self, view: &Rc<RefCell<ViewHandler>>) -> Result<()> {
        self.ensure_active()?;
        let result = match view.try_borrow_mut() {
            Ok(mut handler) => handler.refresh(&mut self.undo),
            Err(_) => Err(ViewError::Transaction("view is already borrowed".to_string())),
        };
        self.check_write(result)
    }

    /// Roll the whole transaction back if a write failed. A failed write may
    /// have changed its table and reached only some of its dependents, so
    /// nothing after it can be committed.
    fn check_write<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            log::debug!("txn {}: write failed, rolling back: {}", self.id, e);
            if let Err(undo_err) = self.abort() {
                log::warn!("txn {}: rollback after failed write also failed: {}", self.id, undo_err);
            }
        }
        result
    }

    /// Resolve all pending view work, then make the writes permanent.
    ///
    /// On any error the transaction is rolled back and the error returned.
    pub fn commit(mut self) -> Result<()> {
        self.ensure_active()?;
        if let Err(e) = self.resolve_dependents() {
            log::debug!("txn {}: resolve failed, rolling back: {}", self.id, e);
            if let Err(undo_err) = self.abort() {
                log::warn!("txn {}: rollback after failed commit also failed: {}", self.id, undo_err);
            }
            return Err(e);
        }
        log::debug!("txn {}: commit ({} writes)", self.id, self.undo.len());
        self.undo.release();
        self.status = TxnStatus::Committed;
        Ok(())
    }

    pub fn rollback(mut self) -> Result<()> {
        self.ensure_active()?;
        self.abort()
    }

    fn resolve_dependents(&mut self) -> Result<()> {
        for round in 0..MAX_RESOLVE_ROUNDS {
            let pending: Vec<_> = self
                .undo
                .notified_dependents()
                .into_iter()
                .filter(|d| d.try_borrow().map(|d| d.has_pending()).unwrap_or(false))
                .collect();
            if pending.is_empty() {
                return Ok(());
            }
            log::trace!("txn {}: resolve round {} over {} views", self.id, round, pending.len());
            for dependent in pending {
                let mut dep = dependent
                    .try_borrow_mut()
                    .map_err(|_| ViewError::Transaction("view is already borrowed".to_string()))?;
                log::trace!("txn {}: resolving '{}'", self.id, dep.dependent_name());
                dep.resolve(&mut self.undo)?;
            }
        }
        Err(ViewError::Transaction(format!(
            "view maintenance did not settle after {} rounds",
            MAX_RESOLVE_ROUNDS
        )))
    }

    fn abort(&mut self) -> Result<()> {
        self.status = TxnStatus::RolledBack;
        let result = self.undo.rollback();
        for dependent in self.undo.notified_dependents() {
            if let Ok(mut dep) = dependent.try_borrow_mut() {
                dep.discard_pending();
            }
        }
        self.undo.release();
        log::debug!("txn {}: rolled back", self.id);
        result
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.status == TxnStatus::Active {
            if let Err(e) = self.abort() {
                log::warn!("txn {}: rollback on drop failed: {}", self.id, e);
            }
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Transaction {{ id: {}, status: {:?}, undo: {:?} }}", self.id, self.status, self.undo)
    }
}
