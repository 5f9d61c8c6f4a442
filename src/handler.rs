//! View handler: maintains one materialized aggregate view.
//!
//! The handler owns the view's target table and the ordered list of source
//! tables it depends on. Each source holds a weak back-reference to the
//! handler and notifies it synchronously of every row change; the handler
//! folds the change into per-group state. When the enclosing transaction
//! commits, [`resolve`](TableDependent::resolve) runs the fallback plan of any
//! extremum that was invalidated and writes the affected groups to the target
//! table through the same undo log as every other write.
//!
//! # Examples
//!
//! ```
//! use aggview::{ColumnType, ColumnValue, ScanPlanner, Schema, Table, Transaction, ViewHandler, ViewSpec};
//! use std::collections::HashMap;
//!
//! let scores = Table::shared("scores", Schema::new(vec![
//!     ("team".to_string(), ColumnType::String, false),
//!     ("points".to_string(), ColumnType::Int32, false),
//! ]));
//! let mut tables = HashMap::new();
//! tables.insert("scores".to_string(), scores.clone());
//!
//! let spec = ViewSpec::from_json(r#"{
//!     "name": "best_by_team",
//!     "sources": ["scores"],
//!     "group_by": [{"name": "team"}],
//!     "aggregates": [{"name": "best", "kind": "max", "expr": "points"}]
//! }"#).unwrap();
//! let definition = ScanPlanner::compile(&spec, &tables).unwrap();
//! let target = ScanPlanner::target_table(&definition, &tables).unwrap();
//! let view = ViewHandler::install(target.clone(), definition, &tables).unwrap();
//!
//! let mut txn = Transaction::begin();
//! for points in [5, 3, 8] {
//!     let mut row = HashMap::new();
//!     row.insert("team".to_string(), ColumnValue::String("red".to_string()));
//!     row.insert("points".to_string(), ColumnValue::Int32(points));
//!     txn.insert(&scores, row).unwrap();
//! }
//! txn.commit().unwrap();
//!
//! let red = [ColumnValue::String("red".to_string())];
//! let pos = target.borrow().find_by_key(&red).unwrap();
//! assert_eq!(target.borrow().get_value(pos, "best").unwrap(), ColumnValue::Int32(8));
//! assert_eq!(view.borrow().stats().fallback_executions, 0);
//! ```

use crate::aggregate::{GroupKey, GroupState};
use crate::changeset::RowChange;
use crate::column::ColumnType;
use crate::definition::ViewDefinition;
use crate::error::{Result, ViewError};
use crate::fallback;
use crate::table::{DependentRef, Row, Table, TableDependent};
use crate::transaction::Transaction;
use crate::undo::UndoLog;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::{Rc, Weak};

/// Maintenance counters, cumulative over the handler's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerStats {
    /// Row changes received from sources.
    pub notifications: u64,
    /// Fallback plans executed.
    pub fallback_executions: u64,
    /// Target rows inserted or updated.
    pub rows_upserted: u64,
    /// Target rows deleted.
    pub rows_deleted: u64,
    /// Full refreshes run.
    pub refreshes: u64,
}

pub struct ViewHandler {
    definition: ViewDefinition,
    /// None once destroyed.
    target: Option<Rc<RefCell<Table>>>,
    sources: Vec<Rc<RefCell<Table>>>,
    /// Names of `sources`, same order.
    source_names: Vec<String>,
    /// Groups touched by the active transaction.
    pending: BTreeMap<GroupKey, GroupState>,
    self_ref: DependentRef,
    stats: HandlerStats,
}

impl ViewHandler {
    /// Install a view: validate the definition against `tables` and the
    /// target schema, register on every source, and fill an empty target from
    /// the refresh plan.
    ///
    /// On failure nothing stays registered and the target is unchanged.
    pub fn install(
        target: Rc<RefCell<Table>>,
        definition: ViewDefinition,
        tables: &HashMap<String, Rc<RefCell<Table>>>,
    ) -> Result<Rc<RefCell<ViewHandler>>> {
        let view = definition.name().to_string();
        let mut sources = Vec::with_capacity(definition.source_tables().len());
        for name in definition.source_tables() {
            let table = tables.get(name).ok_or_else(|| {
                ViewError::Definition(format!("view '{}': source table '{}' not found", view, name))
            })?;
            if Rc::ptr_eq(table, &target) {
                return Err(ViewError::Definition(format!(
                    "view '{}': target table cannot also be a source",
                    view
                )));
            }
            sources.push(Rc::clone(table));
        }
        Self::check_target_schema(&definition, &target.borrow())?;
        let needs_refresh = target.borrow().is_empty();

        let handler = Rc::new_cyclic(|weak: &Weak<RefCell<ViewHandler>>| {
            let self_ref: DependentRef = weak.clone();
            RefCell::new(ViewHandler {
                definition,
                target: Some(target),
                sources: Vec::new(),
                source_names: Vec::new(),
                pending: BTreeMap::new(),
                self_ref,
                stats: HandlerStats::default(),
            })
        });

        let populated = Self::register_and_populate(&handler, &sources, needs_refresh);
        if let Err(e) = populated {
            log::debug!("view '{}': install failed: {}", view, e);
            handler.borrow_mut().destroy();
            return Err(e);
        }
        log::debug!("view '{}': installed over {} sources", view, sources.len());
        Ok(handler)
    }

    fn register_and_populate(
        handler: &Rc<RefCell<ViewHandler>>,
        sources: &[Rc<RefCell<Table>>],
        needs_refresh: bool,
    ) -> Result<()> {
        {
            let mut h = handler.borrow_mut();
            for source in sources {
                h.add_source_table(source)?;
            }
        }
        if needs_refresh {
            let mut txn = Transaction::begin();
            txn.refresh_view(handler)?;
            txn.commit()?;
        }
        Ok(())
    }

    fn check_target_schema(definition: &ViewDefinition, target: &Table) -> Result<()> {
        let fail = |msg: String| ViewError::Definition(format!("view '{}': {}", definition.name(), msg));
        let expected = definition.target_column_names();
        let actual = target.schema().get_column_names();
        if actual.len() != expected.len() || actual.iter().zip(&expected).any(|(a, e)| *a != e.as_str()) {
            return Err(fail(format!(
                "target '{}' has columns {:?}, expected {:?}",
                target.name(),
                actual,
                expected
            )));
        }
        let key: Vec<usize> = (0..definition.group_by().len()).collect();
        if target.schema().primary_key() != Some(&key[..]) {
            return Err(fail(format!(
                "target '{}' must be keyed on the group-by columns",
                target.name()
            )));
        }
        match target.schema().get_column_type(definition.count_column()) {
            Some(ColumnType::Int32 | ColumnType::Int64) => Ok(()),
            other => Err(fail(format!("row count column has type {:?}", other))),
        }
    }

    pub fn name(&self) -> &str {
        self.definition.name()
    }

    pub fn definition(&self) -> &ViewDefinition {
        &self.definition
    }

    /// The target table, or None after `destroy`.
    pub fn target_table(&self) -> Option<&Rc<RefCell<Table>>> {
        self.target.as_ref()
    }

    pub fn source_tables(&self) -> &[Rc<RefCell<Table>>] {
        &self.sources
    }

    pub fn source_names(&self) -> &[String] {
        &self.source_names
    }

    pub fn stats(&self) -> &HandlerStats {
        &self.stats
    }

    pub fn is_destroyed(&self) -> bool {
        self.target.is_none()
    }

    /// Whether this handler is in `table`'s dependent list.
    pub fn is_registered_on(&self, table: &Rc<RefCell<Table>>) -> bool {
        table.borrow().has_dependent(&self.self_ref)
    }

    fn live_target(&self) -> Result<Rc<RefCell<Table>>> {
        self.target
            .clone()
            .ok_or_else(|| ViewError::invariant(self.name(), "view has been destroyed"))
    }

    /// Add a source and register on it. Adding a table already in the source
    /// list does nothing.
    pub fn add_source_table(&mut self, table: &Rc<RefCell<Table>>) -> Result<()> {
        let target = self.live_target()?;
        if self.sources.iter().any(|s| Rc::ptr_eq(s, table)) {
            return Ok(());
        }
        if Rc::ptr_eq(&target, table) {
            return Err(ViewError::Definition(format!(
                "view '{}': target table cannot also be a source",
                self.name()
            )));
        }
        let name = {
            let mut t = table
                .try_borrow_mut()
                .map_err(|_| ViewError::Storage("source table is already borrowed".to_string()))?;
            t.register_dependent(self.self_ref.clone());
            t.name().to_string()
        };
        log::debug!("view '{}': added source '{}'", self.name(), name);
        self.sources.push(Rc::clone(table));
        self.source_names.push(name);
        Ok(())
    }

    /// Remove a source and deregister from it. The view is not recomputed;
    /// the caller follows up with a refresh. Returns false if `table` was not
    /// a source.
    pub fn drop_source_table(&mut self, table: &Rc<RefCell<Table>>) -> Result<bool> {
        let position = match self.sources.iter().position(|s| Rc::ptr_eq(s, table)) {
            Some(position) => position,
            None => return Ok(false),
        };
        table
            .try_borrow_mut()
            .map_err(|_| ViewError::Storage("source table is already borrowed".to_string()))?
            .deregister_dependent(&self.self_ref);
        self.sources.remove(position);
        let name = self.source_names.remove(position);
        log::debug!("view '{}': dropped source '{}'", self.name(), name);
        Ok(true)
    }

    /// Deregister from every source and release the target. Safe to call
    /// more than once.
    pub fn destroy(&mut self) {
        if self.target.is_none() && self.sources.is_empty() {
            return;
        }
        for (source, name) in self.sources.drain(..).zip(self.source_names.drain(..)) {
            match source.try_borrow_mut() {
                Ok(mut table) => {
                    table.deregister_dependent(&self.self_ref);
                }
                Err(_) => log::warn!(
                    "view '{}': source '{}' busy during destroy; leaving a dead registration",
                    self.definition.name(),
                    name
                ),
            }
        }
        self.pending.clear();
        self.target = None;
        log::debug!("view '{}': destroyed", self.definition.name());
    }

    /// Replace the target contents with the refresh plan's result.
    ///
    /// The plan runs before any target row is touched, so a failing plan
    /// leaves the target as it was.
    pub fn refresh(&mut self, undo: &mut UndoLog) -> Result<()> {
        let target = self.live_target()?;
        self.pending.clear();
        let rows = fallback::run_refresh(&self.definition)?;
        let names = self.definition.target_column_names();

        loop {
            let len = target.borrow().len();
            if len == 0 {
                break;
            }
            undo.delete(&target, len - 1)?;
            self.stats.rows_deleted += 1;
        }
        for values in rows {
            let row: Row = names.iter().cloned().zip(values).collect();
            undo.insert(&target, row)?;
            self.stats.rows_upserted += 1;
        }
        self.stats.refreshes += 1;
        log::debug!("view '{}': refreshed", self.name());
        Ok(())
    }

    /// Make sure `key` has state in `pending`, loading it from the target row
    /// if there is one.
    fn load_group(&mut self, key: &GroupKey) -> Result<()> {
        if self.pending.contains_key(key) {
            return Ok(());
        }
        let target = self.live_target()?;
        let t = target
            .try_borrow()
            .map_err(|_| ViewError::invariant(self.name(), "target table is being written"))?;
        let state = match t.find_by_key(key) {
            Some(position) => {
                let values = t.get_row_values(position)?;
                let key_len = self.definition.group_by().len();
                GroupState::from_persisted(self.definition.aggregates(), &values[key_len], &values[key_len + 1..])
                    .map_err(|msg| ViewError::invariant(self.name(), msg))?
            }
            None => GroupState::empty(self.definition.aggregates()),
        };
        drop(t);
        self.pending.insert(key.clone(), state);
        Ok(())
    }

    fn apply_delete(&mut self, row: &Row) -> Result<()> {
        let key = self.definition.group_key(row)?;
        let arguments = self.definition.arguments(row)?;
        self.load_group(&key)?;
        let view = self.definition.name();
        let state = self
            .pending
            .get_mut(&key)
            .ok_or_else(|| ViewError::invariant(view, "group state missing after load"))?;
        state
            .apply_delete(self.definition.aggregates(), &arguments)
            .map_err(|msg| ViewError::invariant(view, format!("group {:?}: {}", key, msg)))
    }

    fn apply_insert(&mut self, row: &Row) -> Result<()> {
        let key = self.definition.group_key(row)?;
        let arguments = self.definition.arguments(row)?;
        self.load_group(&key)?;
        let view = self.definition.name();
        let state = self
            .pending
            .get_mut(&key)
            .ok_or_else(|| ViewError::invariant(view, "group state missing after load"))?;
        state
            .apply_insert(self.definition.aggregates(), &arguments)
            .map_err(|msg| ViewError::invariant(view, format!("group {:?}: {}", key, msg)))
    }

    fn target_row(&self, key: &GroupKey, state: &GroupState) -> Row {
        self.definition
            .target_column_names()
            .into_iter()
            .zip(key.iter().cloned().chain(state.output_values()))
            .collect()
    }

    /// Upsert or delete the target row of one resolved group.
    fn write_group(&mut self, undo: &mut UndoLog, key: &GroupKey, state: &GroupState) -> Result<()> {
        let target = self.live_target()?;
        let position = target.borrow().find_by_key(key);

        if state.count() == 0 {
            if let Some(position) = position {
                undo.delete(&target, position)?;
                self.stats.rows_deleted += 1;
            }
            return Ok(());
        }

        let row = self.target_row(key, state);
        match position {
            Some(position) => {
                let current = target.borrow().get_row(position)?;
                if current == row {
                    return Ok(());
                }
                undo.update(&target, position, row)?;
            }
            None => {
                undo.insert(&target, row)?;
            }
        }
        self.stats.rows_upserted += 1;
        Ok(())
    }
}

impl TableDependent for ViewHandler {
    fn dependent_name(&self) -> &str {
        self.definition.name()
    }

    /// Fold one source row change into the pending group state. An update is
    /// a delete of `before` followed by an insert of `after`, which may land
    /// in a different group.
    fn on_source_row_changed(&mut self, source: &str, before: Option<&Row>, after: Option<&Row>) -> Result<()> {
        if self.target.is_none() {
            return Err(ViewError::invariant(self.name(), "notified after destroy"));
        }
        if !self.source_names.iter().any(|name| name == source) {
            return Err(ViewError::invariant(
                self.name(),
                format!("notification from unregistered table '{}'", source),
            ));
        }
        let kind = RowChange { before, after }
            .kind()
            .ok_or_else(|| ViewError::invariant(self.name(), "notification without row images"))?;
        log::trace!("view '{}': {:?} from '{}'", self.name(), kind, source);
        self.stats.notifications += 1;
        if let Some(row) = before {
            self.apply_delete(row)?;
        }
        if let Some(row) = after {
            self.apply_insert(row)?;
        }
        Ok(())
    }

    fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Recompute invalidated extrema, then write every pending group, in key
    /// order.
    fn resolve(&mut self, undo: &mut UndoLog) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        log::trace!("view '{}': resolving {} groups", self.name(), pending.len());
        for (key, mut state) in pending {
            if state.count() > 0 {
                let ran = fallback::recompute_pending(&self.definition, &key, &mut state)?;
                self.stats.fallback_executions += ran as u64;
            }
            self.write_group(undo, &key, &state)?;
        }
        Ok(())
    }

    fn discard_pending(&mut self) {
        if !self.pending.is_empty() {
            log::trace!("view '{}': discarding {} pending groups", self.name(), self.pending.len());
            self.pending.clear();
        }
    }
}

impl Drop for ViewHandler {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for ViewHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewHandler")
            .field("name", &self.definition.name())
            .field("sources", &self.source_names)
            .field("pending", &self.pending.len())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::ColumnValue;
    use crate::definition::{AggregateKind, ViewSpec};
    use crate::error::PlanExecutionError;
    use crate::plan::{PlanRow, QueryPlan, ScanPlanner};
    use crate::table::Schema;
    use proptest::prelude::*;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn s(v: &str) -> ColumnValue {
        ColumnValue::String(v.to_string())
    }

    fn scores_table(name: &str) -> Rc<RefCell<Table>> {
        Table::shared(
            name,
            Schema::new(vec![
                ("team".to_string(), ColumnType::String, false),
                ("points".to_string(), ColumnType::Int32, true),
            ]),
        )
    }

    fn score(team: &str, points: i32) -> Row {
        let mut row = HashMap::new();
        row.insert("team".to_string(), s(team));
        row.insert("points".to_string(), ColumnValue::Int32(points));
        row
    }

    fn catalog(tables: &[&Rc<RefCell<Table>>]) -> HashMap<String, Rc<RefCell<Table>>> {
        tables
            .iter()
            .map(|t| (t.borrow().name().to_string(), Rc::clone(t)))
            .collect()
    }

    const BY_TEAM: &str = r#"{
        "name": "by_team",
        "sources": ["scores"],
        "group_by": [{"name": "team"}],
        "aggregates": [
            {"name": "total", "kind": "sum", "expr": "points"},
            {"name": "lo", "kind": "min", "expr": "points"},
            {"name": "hi", "kind": "max", "expr": "points"}
        ]
    }"#;

    struct Fixture {
        scores: Rc<RefCell<Table>>,
        target: Rc<RefCell<Table>>,
        view: Rc<RefCell<ViewHandler>>,
    }

    fn fixture(initial: &[(&str, i32)]) -> Fixture {
        init_logging();
        let scores = scores_table("scores");
        let mut txn = Transaction::begin();
        for (team, points) in initial {
            txn.insert(&scores, score(team, *points)).unwrap();
        }
        txn.commit().unwrap();

        let tables = catalog(&[&scores]);
        let definition = ScanPlanner::compile(&ViewSpec::from_json(BY_TEAM).unwrap(), &tables).unwrap();
        let target = ScanPlanner::target_table(&definition, &tables).unwrap();
        let view = ViewHandler::install(Rc::clone(&target), definition, &tables).unwrap();
        Fixture { scores, target, view }
    }

    fn position_of(table: &Rc<RefCell<Table>>, team: &str, points: i32) -> usize {
        let wanted = score(team, points);
        table.borrow().iter_rows().position(|row| row == wanted).unwrap()
    }

    /// (row_count, total, lo, hi) of one team.
    fn group(target: &Rc<RefCell<Table>>, team: &str) -> Option<Vec<ColumnValue>> {
        let t = target.borrow();
        let position = t.find_by_key(&[s(team)])?;
        Some(t.get_row_values(position).unwrap()[1..].to_vec())
    }

    fn ints(values: &[i64]) -> Vec<ColumnValue> {
        values.iter().map(|v| ColumnValue::Int64(*v)).collect()
    }

    #[test]
    fn test_install_refreshes_empty_target() {
        let f = fixture(&[("red", 5), ("red", 3), ("blue", 1)]);
        assert_eq!(f.target.borrow().len(), 2);
        assert_eq!(group(&f.target, "red").unwrap(), ints(&[2, 8, 3, 5]));
        assert_eq!(f.view.borrow().stats().refreshes, 1);
        assert!(f.view.borrow().is_registered_on(&f.scores));
    }

    #[test]
    fn test_delete_max_runs_fallback() {
        let f = fixture(&[("red", 5), ("red", 3), ("red", 8)]);
        assert_eq!(group(&f.target, "red").unwrap(), ints(&[3, 16, 3, 8]));

        let mut txn = Transaction::begin();
        txn.delete(&f.scores, position_of(&f.scores, "red", 8)).unwrap();
        txn.commit().unwrap();

        assert_eq!(group(&f.target, "red").unwrap(), ints(&[2, 8, 3, 5]));
        assert_eq!(f.view.borrow().stats().fallback_executions, 1);
    }

    #[test]
    fn test_delete_non_extremum_is_local() {
        let f = fixture(&[("red", 5), ("red", 3), ("red", 8)]);
        let mut txn = Transaction::begin();
        txn.delete(&f.scores, position_of(&f.scores, "red", 5)).unwrap();
        txn.commit().unwrap();

        assert_eq!(group(&f.target, "red").unwrap(), ints(&[2, 11, 3, 8]));
        assert_eq!(f.view.borrow().stats().fallback_executions, 0);
    }

    #[test]
    fn test_tied_extremum_recomputed() {
        let f = fixture(&[("red", 8), ("red", 8), ("red", 1)]);
        let mut txn = Transaction::begin();
        txn.delete(&f.scores, position_of(&f.scores, "red", 8)).unwrap();
        txn.commit().unwrap();
        assert_eq!(group(&f.target, "red").unwrap(), ints(&[2, 9, 1, 8]));
        assert_eq!(f.view.borrow().stats().fallback_executions, 1);
    }

    #[test]
    fn test_one_fallback_per_group_per_transaction() {
        let f = fixture(&[("red", 9), ("red", 8), ("red", 7), ("red", 1)]);
        let mut txn = Transaction::begin();
        txn.delete(&f.scores, position_of(&f.scores, "red", 9)).unwrap();
        txn.delete(&f.scores, position_of(&f.scores, "red", 8)).unwrap();
        txn.commit().unwrap();
        assert_eq!(group(&f.target, "red").unwrap(), ints(&[2, 8, 1, 7]));
        assert_eq!(f.view.borrow().stats().fallback_executions, 1);
    }

    #[test]
    fn test_update_moves_between_groups() {
        let f = fixture(&[("red", 5), ("red", 8), ("blue", 2)]);
        let notifications = f.view.borrow().stats().notifications;

        let mut txn = Transaction::begin();
        txn.update(&f.scores, position_of(&f.scores, "red", 8), score("blue", 8))
            .unwrap();
        txn.commit().unwrap();

        assert_eq!(group(&f.target, "red").unwrap(), ints(&[1, 5, 5, 5]));
        assert_eq!(group(&f.target, "blue").unwrap(), ints(&[2, 10, 2, 8]));
        assert_eq!(f.view.borrow().stats().notifications, notifications + 1);
        assert_eq!(f.view.borrow().stats().fallback_executions, 1);
    }

    #[test]
    fn test_empty_group_row_deleted() {
        let f = fixture(&[("red", 5), ("blue", 2)]);
        let mut txn = Transaction::begin();
        txn.delete(&f.scores, position_of(&f.scores, "red", 5)).unwrap();
        txn.commit().unwrap();
        assert!(group(&f.target, "red").is_none());
        assert_eq!(f.target.borrow().len(), 1);
        assert_eq!(f.view.borrow().stats().fallback_executions, 0);
    }

    #[test]
    fn test_rollback_restores_target() {
        let f = fixture(&[("red", 5), ("red", 8), ("blue", 2)]);
        let before = f.target.borrow().snapshot().unwrap();

        let mut txn = Transaction::begin();
        txn.delete(&f.scores, position_of(&f.scores, "red", 8)).unwrap();
        txn.insert(&f.scores, score("green", 4)).unwrap();
        assert!(f.view.borrow().has_pending());
        txn.rollback().unwrap();

        assert!(!f.view.borrow().has_pending());
        assert_eq!(f.target.borrow().snapshot().unwrap(), before);
        assert_eq!(f.scores.borrow().len(), 3);
    }

    #[test]
    fn test_failing_fallback_aborts_transaction() {
        init_logging();
        let scores = scores_table("scores");
        let tables = catalog(&[&scores]);
        let refresh = Rc::new(|_: &[ColumnValue]| -> std::result::Result<Vec<PlanRow>, PlanExecutionError> {
            Ok(Vec::new())
        });
        let failing = Rc::new(|_: &[ColumnValue]| -> std::result::Result<Vec<PlanRow>, PlanExecutionError> {
            Err(PlanExecutionError::new("hi fallback", "index unavailable"))
        });
        let definition = ViewDefinition::builder("hi_by_team")
            .source("scores")
            .group_by("team", "team")
            .aggregate("hi", AggregateKind::Max, "points")
            .refresh_plan(refresh)
            .fallback_plan("hi", failing)
            .build()
            .unwrap();
        let target = ScanPlanner::target_table(&definition, &tables).unwrap();
        let view = ViewHandler::install(Rc::clone(&target), definition, &tables).unwrap();

        let mut txn = Transaction::begin();
        txn.insert(&scores, score("red", 5)).unwrap();
        txn.insert(&scores, score("red", 8)).unwrap();
        txn.commit().unwrap();
        let before = target.borrow().snapshot().unwrap();

        let mut txn = Transaction::begin();
        txn.delete(&scores, position_of(&scores, "red", 8)).unwrap();
        let err = txn.commit().unwrap_err();
        assert!(err.is_recompute());
        assert_eq!(target.borrow().snapshot().unwrap(), before);
        assert_eq!(scores.borrow().len(), 2);
        assert!(!view.borrow().has_pending());
    }

    #[test]
    fn test_definition_errors() {
        init_logging();
        let scores = scores_table("scores");
        let tables = catalog(&[&scores]);
        let definition = || ScanPlanner::compile(&ViewSpec::from_json(BY_TEAM).unwrap(), &tables).unwrap();

        let empty = HashMap::new();
        let target = ScanPlanner::target_table(&definition(), &tables).unwrap();
        let err = ViewHandler::install(Rc::clone(&target), definition(), &empty).unwrap_err();
        assert!(err.is_definition());

        let err = ViewHandler::install(Rc::clone(&scores), definition(), &tables).unwrap_err();
        assert!(err.is_definition());

        let wrong = Table::shared(
            "wrong",
            Schema::new(vec![("team".to_string(), ColumnType::String, false)])
                .with_primary_key(&["team"])
                .unwrap(),
        );
        assert!(ViewHandler::install(wrong, definition(), &tables).unwrap_err().is_definition());
        assert_eq!(scores.borrow().dependent_count(), 0);
    }

    #[test]
    fn test_failed_install_leaves_no_registration() {
        init_logging();
        let scores = scores_table("scores");
        let mut txn = Transaction::begin();
        txn.insert(&scores, score("red", 1)).unwrap();
        txn.commit().unwrap();
        let tables = catalog(&[&scores]);

        let bad_refresh = Rc::new(|_: &[ColumnValue]| -> std::result::Result<Vec<PlanRow>, PlanExecutionError> {
            Ok(vec![vec![ColumnValue::String("red".to_string())]])
        });
        let unused = Rc::new(|_: &[ColumnValue]| -> std::result::Result<Vec<PlanRow>, PlanExecutionError> {
            Ok(Vec::new())
        });
        let definition = ViewDefinition::builder("v")
            .source("scores")
            .group_by("team", "team")
            .aggregate("hi", AggregateKind::Max, "points")
            .refresh_plan(bad_refresh)
            .fallback_plan("hi", unused)
            .build()
            .unwrap();
        let target = ScanPlanner::target_table(&definition, &tables).unwrap();
        let err = ViewHandler::install(Rc::clone(&target), definition, &tables).unwrap_err();
        assert!(err.is_recompute());
        assert!(target.borrow().is_empty());
        assert_eq!(scores.borrow().dependent_count(), 0);
    }

    #[test]
    fn test_invariant_violations() {
        let f = fixture(&[("red", 5)]);
        let mut view = f.view.borrow_mut();

        let err = view.on_source_row_changed("scores", Some(&score("ghost", 1)), None).unwrap_err();
        assert!(err.is_invariant_violation());
        view.discard_pending();

        let err = view.on_source_row_changed("other", None, Some(&score("red", 1))).unwrap_err();
        assert!(err.is_invariant_violation());

        let err = view.on_source_row_changed("scores", None, None).unwrap_err();
        assert!(err.is_invariant_violation());
    }

    #[test]
    fn test_destroy_and_drop_deregister() {
        let f = fixture(&[("red", 5)]);
        assert_eq!(f.scores.borrow().dependent_count(), 1);
        f.view.borrow_mut().destroy();
        f.view.borrow_mut().destroy();
        assert_eq!(f.scores.borrow().dependent_count(), 0);
        assert!(f.view.borrow().is_destroyed());

        let g = fixture(&[("red", 5)]);
        let scores = Rc::clone(&g.scores);
        drop(g);
        assert_eq!(scores.borrow().dependent_count(), 0);

        // Writes after the view is gone are not observed by anyone.
        let mut txn = Transaction::begin();
        txn.insert(&scores, score("red", 1)).unwrap();
        txn.commit().unwrap();
    }

    #[test]
    fn test_add_drop_source_then_refresh() {
        let f = fixture(&[("red", 5)]);
        let extra = scores_table("extra");
        let mut txn = Transaction::begin();
        txn.insert(&extra, score("red", 10)).unwrap();
        txn.commit().unwrap();

        f.view.borrow_mut().add_source_table(&extra).unwrap();
        f.view.borrow_mut().add_source_table(&extra).unwrap();
        assert_eq!(f.view.borrow().source_names(), ["scores", "extra"]);
        assert_eq!(extra.borrow().dependent_count(), 1);

        // Adding a source does not recompute: the existing ("red", 10) is not counted.
        assert_eq!(group(&f.target, "red").unwrap(), ints(&[1, 5, 5, 5]));

        // Changes to the new source are maintained from here on.
        let mut txn = Transaction::begin();
        txn.insert(&extra, score("red", 20)).unwrap();
        txn.commit().unwrap();
        assert_eq!(group(&f.target, "red").unwrap(), ints(&[2, 25, 5, 20]));

        assert!(f.view.borrow_mut().drop_source_table(&extra).unwrap());
        assert!(!f.view.borrow_mut().drop_source_table(&extra).unwrap());
        assert!(!f.view.borrow().is_registered_on(&extra));
        assert_eq!(group(&f.target, "red").unwrap(), ints(&[2, 25, 5, 20]));

        // The refresh plan reads "scores" only, so the refresh drops every
        // contribution from "extra".
        let mut txn = Transaction::begin();
        txn.refresh_view(&f.view).unwrap();
        txn.commit().unwrap();
        assert_eq!(group(&f.target, "red").unwrap(), ints(&[1, 5, 5, 5]));
        assert_eq!(f.view.borrow().stats().refreshes, 2);

        let target_err = f.view.borrow_mut().add_source_table(&f.target).unwrap_err();
        assert!(target_err.is_definition());
    }

    #[test]
    fn test_failed_notification_rolls_back_source_write() {
        init_logging();
        let scores = scores_table("scores");
        let tables = catalog(&[&scores]);
        let spec = ViewSpec::from_json(
            r#"{
                "name": "shares",
                "sources": ["scores"],
                "group_by": [{"name": "team"}],
                "aggregates": [{"name": "share", "kind": "sum", "expr": "100 / points"}]
            }"#,
        )
        .unwrap();
        let definition = ScanPlanner::compile(&spec, &tables).unwrap();
        let target = ScanPlanner::target_table(&definition, &tables).unwrap();
        let view = ViewHandler::install(Rc::clone(&target), definition, &tables).unwrap();

        let mut txn = Transaction::begin();
        txn.insert(&scores, score("red", 5)).unwrap();
        txn.commit().unwrap();

        // Dividing by zero fails in the view, after the row reached "scores".
        let mut txn = Transaction::begin();
        txn.insert(&scores, score("red", 4)).unwrap();
        assert!(txn.insert(&scores, score("red", 0)).is_err());
        assert_eq!(txn.status(), crate::transaction::TxnStatus::RolledBack);
        assert!(txn.commit().is_err());

        assert_eq!(scores.borrow().len(), 1);
        assert!(!view.borrow().has_pending());
        assert_eq!(group(&target, "red").unwrap(), ints(&[1, 20]));
        assert_eq!(
            target.borrow().snapshot().unwrap(),
            view.borrow().definition().refresh_plan().execute(&[]).unwrap()
        );
    }

    #[test]
    fn test_refresh_view_in_transaction() {
        let f = fixture(&[("red", 5), ("blue", 1)]);
        let mut txn = Transaction::begin();
        txn.refresh_view(&f.view).unwrap();
        txn.commit().unwrap();
        assert_eq!(f.target.borrow().len(), 2);
        assert_eq!(f.view.borrow().stats().refreshes, 2);
    }

    #[test]
    fn test_cascading_view() {
        let f = fixture(&[("red", 5), ("blue", 2)]);
        let tables = catalog(&[&f.scores, &f.target]);
        let spec = ViewSpec::from_json(
            r#"{"name": "top", "sources": ["by_team"],
                "aggregates": [{"name": "best_total", "kind": "max", "expr": "total"},
                               {"name": "teams", "kind": "count"}]}"#,
        )
        .unwrap();
        let definition = ScanPlanner::compile(&spec, &tables).unwrap();
        let top_target = ScanPlanner::target_table(&definition, &tables).unwrap();
        let top = ViewHandler::install(Rc::clone(&top_target), definition, &tables).unwrap();
        assert_eq!(top_target.borrow().get_row_values(0).unwrap(), ints(&[2, 5, 2]));

        // Dropping the red group removes the top total; `top` recomputes.
        let mut txn = Transaction::begin();
        txn.delete(&f.scores, position_of(&f.scores, "red", 5)).unwrap();
        txn.commit().unwrap();
        assert_eq!(top_target.borrow().len(), 1);
        assert_eq!(top_target.borrow().get_row_values(0).unwrap(), ints(&[1, 2, 1]));
        assert_eq!(top.borrow().stats().fallback_executions, 1);

        // Blue's total is replaced by a larger one: no recompute needed.
        let mut txn = Transaction::begin();
        txn.insert(&f.scores, score("blue", 9)).unwrap();
        txn.commit().unwrap();
        assert_eq!(top_target.borrow().get_row_values(0).unwrap(), ints(&[1, 11, 1]));
        assert_eq!(top.borrow().stats().fallback_executions, 1);

        // Removing the last group empties the single-row view.
        let mut txn = Transaction::begin();
        txn.delete(&f.scores, 0).unwrap();
        txn.delete(&f.scores, 0).unwrap();
        txn.commit().unwrap();
        assert!(f.target.borrow().is_empty());
        assert!(top_target.borrow().is_empty());
    }

    #[derive(Debug, Clone)]
    enum RegistrationOp {
        Add(usize),
        Drop(usize),
    }

    fn registration_op() -> impl Strategy<Value = RegistrationOp> {
        prop_oneof![
            (0..3usize).prop_map(RegistrationOp::Add),
            (0..3usize).prop_map(RegistrationOp::Drop),
        ]
    }

    proptest! {
        #[test]
        fn prop_registration_symmetry(ops in proptest::collection::vec(registration_op(), 0..24)) {
            let f = fixture(&[]);
            let tables: Vec<_> = (0..3).map(|i| scores_table(&format!("t{}", i))).collect();
            for op in ops {
                let mut view = f.view.borrow_mut();
                match op {
                    RegistrationOp::Add(i) => view.add_source_table(&tables[i]).unwrap(),
                    RegistrationOp::Drop(i) => {
                        view.drop_source_table(&tables[i]).unwrap();
                    }
                }
                for table in &tables {
                    let listed = view.source_tables().iter().any(|s| Rc::ptr_eq(s, table));
                    prop_assert_eq!(view.is_registered_on(table), listed);
                    prop_assert_eq!(table.borrow().dependent_count(), usize::from(listed));
                }
                prop_assert_eq!(view.source_tables().len(), view.source_names().len());
            }
        }
    }

    #[test]
    fn test_plan_sees_writes_from_same_transaction() {
        let f = fixture(&[("red", 9), ("red", 4)]);
        let mut txn = Transaction::begin();
        txn.insert(&f.scores, score("red", 7)).unwrap();
        txn.delete(&f.scores, position_of(&f.scores, "red", 9)).unwrap();
        txn.commit().unwrap();
        assert_eq!(group(&f.target, "red").unwrap(), ints(&[2, 11, 4, 7]));
    }

    #[test]
    fn test_refresh_plan_reads_sources() {
        let f = fixture(&[("red", 9)]);
        let view = f.view.borrow();
        let plan: &Rc<dyn QueryPlan> = view.definition().refresh_plan();
        assert_eq!(plan.execute(&[]).unwrap().len(), 1);
    }
}
