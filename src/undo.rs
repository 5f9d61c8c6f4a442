//! Undo log: the single write path for every table.
//!
//! Each write mutates the table, records its inverse, then notifies the
//! table's dependents with the before/after images. Source writes issued by a
//! caller and target writes issued by a view handler both go through here, so
//! an abort reverts them together.

use crate::changeset::RowChange;
use crate::error::{Result, ViewError};
use crate::table::{Row, Table, TableDependent};
use std::cell::RefCell;
use std::rc::Rc;

/// Inverse of one applied write.
enum UndoEntry {
    /// A row was inserted at `index`; undo deletes it.
    Inserted {
        table: Rc<RefCell<Table>>,
        index: usize,
    },
    /// `row` was deleted from `index`; undo re-inserts it there.
    Deleted {
        table: Rc<RefCell<Table>>,
        index: usize,
        row: Row,
    },
    /// The row at `index` was replaced; undo restores `previous`.
    Updated {
        table: Rc<RefCell<Table>>,
        index: usize,
        previous: Row,
    },
}

impl UndoEntry {
    fn revert(self) -> Result<()> {
        match self {
            UndoEntry::Inserted { table, index } => {
                borrow_table(&table)?.delete_row_at(index)?;
            }
            UndoEntry::Deleted { table, index, row } => {
                borrow_table(&table)?.insert_row_at(index, &row)?;
            }
            UndoEntry::Updated { table, index, previous } => {
                borrow_table(&table)?.update_row_at(index, &previous)?;
            }
        }
        Ok(())
    }
}

fn borrow_table(table: &Rc<RefCell<Table>>) -> Result<std::cell::RefMut<'_, Table>> {
    table
        .try_borrow_mut()
        .map_err(|_| ViewError::Storage("table is already borrowed".to_string()))
}

/// Ordered record of the writes made by one transaction.
#[derive(Default)]
pub struct UndoLog {
    entries: Vec<UndoEntry>,
    /// Every dependent that received a notification, in first-notified order.
    notified: Vec<Rc<RefCell<dyn TableDependent>>>,
}

impl UndoLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded writes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a row to `table`. Returns its position.
    pub fn insert(&mut self, table: &Rc<RefCell<Table>>, row: Row) -> Result<usize> {
        let (source, index, dependents) = {
            let mut t = borrow_table(table)?;
            let index = t.len();
            t.insert_row_at(index, &row)?;
            (t.name().to_string(), index, t.live_dependents())
        };
        self.entries.push(UndoEntry::Inserted {
            table: Rc::clone(table),
            index,
        });
        self.notify(&source, dependents, RowChange::inserted(&row))?;
        Ok(index)
    }

    /// Delete the row at `index`, returning its image.
    pub fn delete(&mut self, table: &Rc<RefCell<Table>>, index: usize) -> Result<Row> {
        let (source, removed, dependents) = {
            let mut t = borrow_table(table)?;
            let removed = t.delete_row_at(index)?;
            (t.name().to_string(), removed, t.live_dependents())
        };
        self.entries.push(UndoEntry::Deleted {
            table: Rc::clone(table),
            index,
            row: removed.clone(),
        });
        self.notify(&source, dependents, RowChange::deleted(&removed))?;
        Ok(removed)
    }

    /// Replace the row at `index`, returning the previous image.
    pub fn update(&mut self, table: &Rc<RefCell<Table>>, index: usize, row: Row) -> Result<Row> {
        let (source, previous, dependents) = {
            let mut t = borrow_table(table)?;
            let previous = t.update_row_at(index, &row)?;
            (t.name().to_string(), previous, t.live_dependents())
        };
        self.entries.push(UndoEntry::Updated {
            table: Rc::clone(table),
            index,
            previous: previous.clone(),
        });
        self.notify(&source, dependents, RowChange::updated(&previous, &row))?;
        Ok(previous)
    }

    /// Deliver one change to every dependent of `source`, in registration order.
    ///
    /// The source table is not borrowed here, so a dependent may read it. A
    /// dependent that is already borrowed means a write cycle between views.
    fn notify(
        &mut self,
        source: &str,
        dependents: Vec<Rc<RefCell<dyn TableDependent>>>,
        change: RowChange<'_>,
    ) -> Result<()> {
        for dependent in dependents {
            if !self.notified.iter().any(|d| Rc::ptr_eq(d, &dependent)) {
                self.notified.push(Rc::clone(&dependent));
            }
            let mut dep = dependent.try_borrow_mut().map_err(|_| {
                ViewError::invariant(source, "dependent re-entered while handling its own write")
            })?;
            dep.on_source_row_changed(source, change.before, change.after)?;
        }
        Ok(())
    }

    /// Dependents notified so far.
    pub fn notified_dependents(&self) -> Vec<Rc<RefCell<dyn TableDependent>>> {
        self.notified.clone()
    }

    /// Revert every write, newest first. Dependents are not notified.
    ///
    /// All entries are attempted; the first failure is returned.
    pub fn rollback(&mut self) -> Result<()> {
        let mut first_error = None;
        let entries = std::mem::take(&mut self.entries);
        log::debug!("undo: reverting {} writes", entries.len());
        for entry in entries.into_iter().rev() {
            if let Err(e) = entry.revert() {
                log::warn!("undo: revert failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Forget all entries and notified dependents; the writes stay.
    pub fn release(&mut self) {
        self.entries.clear();
        self.notified.clear();
    }
}

impl std::fmt::Debug for UndoLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "UndoLog {{ entries: {}, notified: {} }}",
            self.entries.len(),
            self.notified.len()
        )
    }
}
