/// Row change notifications delivered from source tables to dependent views.
///
/// Every write to a table produces exactly one [`RowChange`] carrying the
/// before and/or after image of the affected row. Dependents receive the
/// change synchronously, before the write returns, in the order the writes
/// were issued.
///
/// # Change Types
///
/// - insert: only an after image
/// - delete: only a before image
/// - update: both images; views treat it as delete-then-insert

use crate::table::Row;

/// Kind of a row change, derived from which images are present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Delete,
    Update,
}

/// A single row mutation as seen by dependents.
#[derive(Debug, Clone, Copy)]
pub struct RowChange<'a> {
    pub before: Option<&'a Row>,
    pub after: Option<&'a Row>,
}

impl<'a> RowChange<'a> {
    pub fn inserted(row: &'a Row) -> Self {
        RowChange { before: None, after: Some(row) }
    }

    pub fn deleted(row: &'a Row) -> Self {
        RowChange { before: Some(row), after: None }
    }

    pub fn updated(before: &'a Row, after: &'a Row) -> Self {
        RowChange { before: Some(before), after: Some(after) }
    }

    /// Returns None when neither image is present.
    pub fn kind(&self) -> Option<ChangeKind> {
        match (self.before, self.after) {
            (None, Some(_)) => Some(ChangeKind::Insert),
            (Some(_), None) => Some(ChangeKind::Delete),
            (Some(_), Some(_)) => Some(ChangeKind::Update),
            (None, None) => None,
        }
    }
}

/// Helper to adjust row positions after an insert or delete
///
/// When a row is inserted at index I, all positions >= I are incremented.
/// When a row is deleted at index I, all positions > I are decremented and a
/// position == I no longer exists.
pub struct IndexAdjuster;

impl IndexAdjuster {
    pub fn adjust_for_insert(position: usize, insert_index: usize) -> usize {
        if position >= insert_index {
            position + 1
        } else {
            position
        }
    }

    /// Returns Some(new_position) or None if the position was the deleted row
    pub fn adjust_for_delete(position: usize, delete_index: usize) -> Option<usize> {
        if position == delete_index {
            None
        } else if position > delete_index {
            Some(position - 1)
        } else {
            Some(position)
        }
    }

    /// Shift every position held in a key index for an insert at `insert_index`.
    pub fn adjust_positions_for_insert<'a, I>(positions: I, insert_index: usize)
    where
        I: IntoIterator<Item = &'a mut usize>,
    {
        for position in positions {
            *position = Self::adjust_for_insert(*position, insert_index);
        }
    }

    /// Shift every position for a delete at `delete_index`. The caller removes
    /// the entry that pointed at the deleted row before calling this.
    pub fn adjust_positions_for_delete<'a, I>(positions: I, delete_index: usize)
    where
        I: IntoIterator<Item = &'a mut usize>,
    {
        for position in positions {
            if *position > delete_index {
                *position -= 1;
            }
        }
    }
}
