/// Table Implementation
///
/// A Table is a collection of typed columns with a schema. Tables are shared
/// as `Rc<RefCell<Table>>`; the crate is single-threaded and relies on that
/// serialization rather than locks.
///
/// Writes are not public: they go through [`UndoLog`](crate::undo::UndoLog),
/// which records the inverse of every mutation and then notifies the table's
/// dependents. That keeps source-table writes and view-table writes on one
/// transactional path.
///
/// # Examples
///
/// ```
/// use aggview::{Table, Schema, ColumnType};
///
/// let schema = Schema::new(vec![
///     ("id".to_string(), ColumnType::Int32, false),
///     ("name".to_string(), ColumnType::String, false),
/// ]);
/// let table = Table::new("users".to_string(), schema);
/// assert!(table.is_empty());
/// assert_eq!(table.schema().get_column_index("name"), Some(1));
/// ```

use crate::changeset::IndexAdjuster;
use crate::column::{Column, ColumnType, ColumnValue};
use crate::error::{Result, ViewError};
use crate::undo::UndoLog;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

/// A row image: column name to value.
pub type Row = HashMap<String, ColumnValue>;

/// Hint for selecting the underlying storage strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageHint {
    /// Contiguous arrays. Best for append-mostly source tables.
    #[default]
    FastReads,

    /// Blocked storage. Best for tables with frequent deletes and inserts
    /// anywhere, such as view target tables.
    FastUpdates,
}

impl StorageHint {
    /// Parse a storage hint from a string.
    ///
    /// Accepts: "fast_reads", "fast_updates"
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "fast_reads" | "fastreads" => Ok(StorageHint::FastReads),
            "fast_updates" | "fastupdates" => Ok(StorageHint::FastUpdates),
            _ => Err(ViewError::Definition(format!(
                "Unknown storage hint: '{}'. Use 'fast_reads' or 'fast_updates'",
                s
            ))),
        }
    }

    pub(crate) fn use_tiered_vector(&self) -> bool {
        matches!(self, StorageHint::FastUpdates)
    }
}

/// Schema definition with column names, types, nullability and an optional
/// primary key.
///
/// # Examples
///
/// ```
/// use aggview::{Schema, ColumnType};
///
/// let schema = Schema::new(vec![
///     ("region".to_string(), ColumnType::String, false),
///     ("total".to_string(), ColumnType::Int64, true),
/// ])
/// .with_primary_key(&["region"])
/// .unwrap();
///
/// assert_eq!(schema.primary_key(), Some(&[0][..]));
/// ```
#[derive(Debug, Clone)]
pub struct Schema {
    columns: Vec<(String, ColumnType, bool)>, // (name, type, nullable)
    primary_key: Option<Vec<usize>>,
}

impl Schema {
    pub fn new(columns: Vec<(String, ColumnType, bool)>) -> Self {
        Schema {
            columns,
            primary_key: None,
        }
    }

    /// Declare a unique key over the named columns. An empty key is allowed
    /// and limits the table to a single row.
    pub fn with_primary_key(mut self, names: &[&str]) -> Result<Self> {
        let mut key = Vec::with_capacity(names.len());
        for name in names {
            let idx = self
                .get_column_index(name)
                .ok_or_else(|| ViewError::Storage(format!("Primary key column '{}' not found", name)))?;
            key.push(idx);
        }
        self.primary_key = Some(key);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn get_column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|(name, _, _)| name.as_str()).collect()
    }

    pub fn get_column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|(n, _, _)| n == name)
    }

    /// Returns (name, type, nullable) for the column at `index`.
    pub fn get_column_info(&self, index: usize) -> Option<(&str, ColumnType, bool)> {
        self.columns.get(index).map(|(name, ty, nullable)| (name.as_str(), *ty, *nullable))
    }

    pub fn get_column_type(&self, name: &str) -> Option<ColumnType> {
        self.columns.iter()
            .find(|(n, _, _)| n == name)
            .map(|(_, ty, _)| *ty)
    }

    pub fn is_column_nullable(&self, name: &str) -> Option<bool> {
        self.columns.iter()
            .find(|(n, _, _)| n == name)
            .map(|(_, _, nullable)| *nullable)
    }

    /// Column positions forming the primary key, if one is declared.
    pub fn primary_key(&self) -> Option<&[usize]> {
        self.primary_key.as_deref()
    }
}

/// Something that must hear about every row change on a table.
///
/// Tables only hold `Weak` references to dependents; the dependent owns the
/// relationship and adds or removes itself.
pub trait TableDependent {
    /// Name used in logs and errors.
    fn dependent_name(&self) -> &str;

    /// Called synchronously for every write to a table the dependent is
    /// registered on, in write order.
    fn on_source_row_changed(
        &mut self,
        source: &str,
        before: Option<&Row>,
        after: Option<&Row>,
    ) -> Result<()>;

    /// True when changes have been applied that are not yet written out.
    fn has_pending(&self) -> bool;

    /// Finish all pending work, writing through `undo`.
    fn resolve(&mut self, undo: &mut UndoLog) -> Result<()>;

    /// Drop in-flight state after an abort.
    fn discard_pending(&mut self);
}

pub type DependentRef = Weak<RefCell<dyn TableDependent>>;

/// Root table owning its data.
pub struct Table {
    name: String,
    schema: Schema,
    columns: Vec<Column>,
    row_count: usize,
    /// Primary key value -> row position. Present iff the schema has a key.
    key_index: Option<HashMap<Vec<ColumnValue>, usize>>,
    dependents: Vec<DependentRef>,
}

impl Table {
    /// Create a new table with default settings (FastReads storage).
    pub fn new(name: String, schema: Schema) -> Self {
        Self::with_hint(name, schema, StorageHint::default())
    }

    pub fn with_hint(name: String, schema: Schema, hint: StorageHint) -> Self {
        let use_tiered_vector = hint.use_tiered_vector();
        let columns: Vec<Column> = schema
            .columns
            .iter()
            .map(|(col_name, col_type, nullable)| {
                Column::new_with_options(col_name.clone(), *col_type, *nullable, use_tiered_vector)
            })
            .collect();

        let key_index = schema.primary_key.as_ref().map(|_| HashMap::new());

        Table {
            name,
            schema,
            columns,
            row_count: 0,
            key_index,
            dependents: Vec::new(),
        }
    }

    /// Convenience for building a shared table.
    pub fn shared(name: &str, schema: Schema) -> Rc<RefCell<Table>> {
        Rc::new(RefCell::new(Table::new(name.to_string(), schema)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn len(&self) -> usize {
        self.row_count
    }

    pub fn is_empty(&self) -> bool {
        self.row_count == 0
    }

    pub fn get_value(&self, row: usize, column: &str) -> Result<ColumnValue> {
        let col_idx = self.schema
            .get_column_index(column)
            .ok_or_else(|| ViewError::Storage(format!("Column '{}' not found in '{}'", column, self.name)))?;

        self.columns[col_idx].get(row)
    }

    pub fn get_row(&self, row: usize) -> Result<Row> {
        if row >= self.row_count {
            return Err(ViewError::Storage(format!("Row {} out of range [0, {})", row, self.row_count)));
        }

        let mut result = HashMap::with_capacity(self.columns.len());
        for col in &self.columns {
            result.insert(col.name().to_string(), col.get(row)?);
        }
        Ok(result)
    }

    /// Values of a row in schema order.
    pub fn get_row_values(&self, row: usize) -> Result<Vec<ColumnValue>> {
        self.columns.iter().map(|col| col.get(row)).collect()
    }

    pub fn iter_rows(&self) -> TableRowIterator<'_> {
        TableRowIterator {
            table: self,
            index: 0,
        }
    }

    /// All rows in schema order, position by position.
    pub fn snapshot(&self) -> Result<Vec<Vec<ColumnValue>>> {
        (0..self.row_count).map(|i| self.get_row_values(i)).collect()
    }

    /// Position of the row with the given primary key.
    pub fn find_by_key(&self, key: &[ColumnValue]) -> Option<usize> {
        self.key_index.as_ref()?.get(key).copied()
    }

    fn key_of(&self, row: &Row) -> Option<Vec<ColumnValue>> {
        let key_columns = self.schema.primary_key.as_ref()?;
        Some(
            key_columns
                .iter()
                .map(|&i| {
                    let name = self.columns[i].name();
                    row.get(name).cloned().unwrap_or(ColumnValue::Null)
                })
                .collect(),
        )
    }

    /// Validate a full row image against every column without mutating.
    fn check_row(&self, row: &Row) -> Result<()> {
        for col in &self.columns {
            let value = row.get(col.name()).ok_or_else(|| {
                ViewError::Storage(format!("Missing value for column '{}' in '{}'", col.name(), self.name))
            })?;
            col.check(value)?;
        }
        Ok(())
    }

    // ==================== Raw write path (undo log only) ====================

    pub(crate) fn insert_row_at(&mut self, index: usize, row: &Row) -> Result<()> {
        if index > self.row_count {
            return Err(ViewError::Storage(format!("Index {} out of range [0, {}]", index, self.row_count)));
        }
        self.check_row(row)?;

        let key = self.key_of(row);
        if let (Some(key), Some(key_index)) = (&key, &self.key_index) {
            if key_index.contains_key(key) {
                return Err(ViewError::Storage(format!(
                    "Duplicate primary key {:?} in '{}'",
                    key, self.name
                )));
            }
        }

        for col in self.columns.iter_mut() {
            let value = row.get(col.name()).cloned().unwrap_or(ColumnValue::Null);
            col.insert(index, value)?;
        }
        self.row_count += 1;

        if let (Some(key), Some(key_index)) = (key, self.key_index.as_mut()) {
            IndexAdjuster::adjust_positions_for_insert(key_index.values_mut(), index);
            key_index.insert(key, index);
        }
        Ok(())
    }

    pub(crate) fn delete_row_at(&mut self, index: usize) -> Result<Row> {
        if index >= self.row_count {
            return Err(ViewError::Storage(format!("Row {} out of range [0, {})", index, self.row_count)));
        }

        let mut removed = HashMap::with_capacity(self.columns.len());
        for col in self.columns.iter_mut() {
            removed.insert(col.name().to_string(), col.delete(index)?);
        }
        self.row_count -= 1;

        if let Some(key) = self.key_of(&removed) {
            if let Some(key_index) = self.key_index.as_mut() {
                key_index.remove(&key);
                IndexAdjuster::adjust_positions_for_delete(key_index.values_mut(), index);
            }
        }
        Ok(removed)
    }

    /// Replace the row at `index`, returning the previous image.
    pub(crate) fn update_row_at(&mut self, index: usize, row: &Row) -> Result<Row> {
        let old = self.get_row(index)?;
        self.check_row(row)?;

        let old_key = self.key_of(&old);
        let new_key = self.key_of(row);
        if let (Some(new_key), Some(key_index)) = (&new_key, &self.key_index) {
            if Some(new_key) != old_key.as_ref() && key_index.contains_key(new_key) {
                return Err(ViewError::Storage(format!(
                    "Duplicate primary key {:?} in '{}'",
                    new_key, self.name
                )));
            }
        }

        for col in self.columns.iter_mut() {
            let value = row.get(col.name()).cloned().unwrap_or(ColumnValue::Null);
            col.set(index, value)?;
        }

        if let (Some(old_key), Some(new_key), Some(key_index)) = (old_key, new_key, self.key_index.as_mut()) {
            if old_key != new_key {
                key_index.remove(&old_key);
                key_index.insert(new_key, index);
            }
        }
        Ok(old)
    }

    // ==================== Dependents ====================

    /// Register a dependent. Registering the same dependent twice is a no-op.
    pub fn register_dependent(&mut self, dependent: DependentRef) {
        if !self.has_dependent(&dependent) {
            log::trace!("table '{}': registered dependent", self.name);
            self.dependents.push(dependent);
        }
    }

    /// Remove a dependent. Returns false if it was not registered.
    pub fn deregister_dependent(&mut self, dependent: &DependentRef) -> bool {
        let removed = self.has_dependent(dependent);
        self.dependents.retain(|d| !Weak::ptr_eq(d, dependent) && d.strong_count() > 0);
        if removed {
            log::trace!("table '{}': deregistered dependent", self.name);
        }
        removed
    }

    pub fn has_dependent(&self, dependent: &DependentRef) -> bool {
        self.dependents.iter().any(|d| Weak::ptr_eq(d, dependent))
    }

    /// Number of registered dependents that are still alive.
    pub fn dependent_count(&self) -> usize {
        self.dependents.iter().filter(|d| d.strong_count() > 0).count()
    }

    /// Upgraded dependents, in registration order.
    pub fn live_dependents(&self) -> Vec<Rc<RefCell<dyn TableDependent>>> {
        self.dependents.iter().filter_map(Weak::upgrade).collect()
    }
}

pub struct TableRowIterator<'a> {
    table: &'a Table,
    index: usize,
}

impl<'a> Iterator for TableRowIterator<'a> {
    type Item = Row;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.table.row_count {
            None
        } else {
            let result = self.table.get_row(self.index).ok();
            self.index += 1;
            result
        }
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Table {{ name: '{}', columns: {}, rows: {}, dependents: {} }}",
            self.name,
            self.schema.len(),
            self.row_count,
            self.dependent_count()
        )
    }
}
