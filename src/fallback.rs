//! Fallback recompute engine.
//!
//! Runs the narrow plan of every MIN/MAX aggregate of a group whose extremum
//! was invalidated, and the refresh plan when a view is rebuilt. Both share
//! one execution path; plan failures and ill-formed results become
//! [`ViewError::Recompute`]. Nothing is retried.

use crate::aggregate::{GroupKey, GroupState};
use crate::column::ColumnValue;
use crate::definition::ViewDefinition;
use crate::error::{Result, ViewError};
use crate::plan::{PlanRow, QueryPlan};
use std::collections::HashSet;
use std::rc::Rc;

fn execute_plan(view: &str, plan: &Rc<dyn QueryPlan>, params: &[ColumnValue]) -> Result<Vec<PlanRow>> {
    let label = plan.label();
    log::trace!("view '{}': executing '{}' with {:?}", view, label, params);
    plan.execute(params).map_err(|e| {
        log::debug!("view '{}': plan '{}' failed: {}", view, label, e);
        ViewError::recompute(view, e)
    })
}

/// Single extremum from a fallback result: no row is NULL, one row yields its
/// first value.
fn single_value(view: &str, label: &str, mut rows: Vec<PlanRow>) -> Result<ColumnValue> {
    if rows.len() > 1 {
        return Err(ViewError::ill_formed(
            view,
            format!("fallback '{}' returned {} rows", label, rows.len()),
        ));
    }
    match rows.pop() {
        None => Ok(ColumnValue::Null),
        Some(row) => row
            .into_iter()
            .next()
            .ok_or_else(|| ViewError::ill_formed(view, format!("fallback '{}' returned an empty row", label))),
    }
}

/// Recompute every pending extremum of `state`. Returns how many plans ran.
pub(crate) fn recompute_pending(definition: &ViewDefinition, key: &GroupKey, state: &mut GroupState) -> Result<usize> {
    let view = definition.name();
    let pending = state.pending_fallbacks();
    for &index in &pending {
        let spec = &definition.aggregates()[index];
        let plan = definition
            .fallback_plan(index)
            .ok_or_else(|| ViewError::ill_formed(view, format!("no fallback plan for '{}'", spec.name)))?;
        let rows = execute_plan(view, plan, key)?;
        let value = single_value(view, &plan.label(), rows)?;
        log::debug!("view '{}': {} for {:?} recomputed as {}", view, spec, key, value);
        state
            .resolve_extremum(index, value)
            .map_err(|msg| ViewError::invariant(view, msg))?;
    }
    Ok(pending.len())
}

/// Run the refresh plan and check its rows against the target layout.
pub(crate) fn run_refresh(definition: &ViewDefinition) -> Result<Vec<PlanRow>> {
    let view = definition.name();
    let rows = execute_plan(view, definition.refresh_plan(), &[])?;
    let width = definition.target_column_names().len();
    let key_len = definition.group_by().len();
    let mut keys = HashSet::with_capacity(rows.len());
    for row in &rows {
        if row.len() != width {
            return Err(ViewError::ill_formed(
                view,
                format!("refresh row has {} values, expected {}", row.len(), width),
            ));
        }
        match row[key_len].as_i64() {
            Some(count) if count > 0 => {}
            _ => {
                return Err(ViewError::ill_formed(
                    view,
                    format!("refresh row has invalid row count {}", row[key_len]),
                ))
            }
        }
        if !keys.insert(&row[..key_len]) {
            return Err(ViewError::ill_formed(
                view,
                format!("refresh returned group {:?} twice", &row[..key_len]),
            ));
        }
    }
    log::debug!("view '{}': refresh produced {} rows", view, rows.len());
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::AggregateKind;
    use crate::error::PlanExecutionError;
    use std::cell::Cell;

    type PlanResult = std::result::Result<Vec<PlanRow>, PlanExecutionError>;

    fn definition(refresh: Rc<dyn QueryPlan>, fallback: Rc<dyn QueryPlan>) -> ViewDefinition {
        ViewDefinition::builder("v")
            .source("t")
            .group_by("g", "g")
            .aggregate("hi", AggregateKind::Max, "x")
            .refresh_plan(refresh)
            .fallback_plan("hi", fallback)
            .build()
            .unwrap()
    }

    fn constant(rows: Vec<PlanRow>) -> Rc<dyn QueryPlan> {
        Rc::new(move |_: &[ColumnValue]| -> PlanResult { Ok(rows.clone()) })
    }

    fn pending_state(def: &ViewDefinition) -> GroupState {
        let specs = def.aggregates();
        let mut state = GroupState::empty(specs);
        state.apply_insert(specs, &[ColumnValue::Int32(5)]).unwrap();
        state.apply_insert(specs, &[ColumnValue::Int32(8)]).unwrap();
        state.apply_delete(specs, &[ColumnValue::Int32(8)]).unwrap();
        state
    }

    #[test]
    fn test_recompute_replaces_candidate() {
        let calls = Rc::new(Cell::new(0));
        let seen = Rc::clone(&calls);
        let fallback: Rc<dyn QueryPlan> = Rc::new(move |params: &[ColumnValue]| -> PlanResult {
            seen.set(seen.get() + 1);
            assert_eq!(params, &[ColumnValue::Int32(1)]);
            Ok(vec![vec![ColumnValue::Int32(5)]])
        });
        let def = definition(constant(vec![]), fallback);
        let mut state = pending_state(&def);

        let ran = recompute_pending(&def, &vec![ColumnValue::Int32(1)], &mut state).unwrap();
        assert_eq!(ran, 1);
        assert_eq!(calls.get(), 1);
        assert_eq!(state.output_values()[1], ColumnValue::Int32(5));

        // Nothing pending: no plan runs.
        assert_eq!(recompute_pending(&def, &vec![ColumnValue::Int32(1)], &mut state).unwrap(), 0);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_ill_formed_results() {
        let key = vec![ColumnValue::Int32(1)];

        let two_rows = definition(constant(vec![]), constant(vec![vec![ColumnValue::Int32(1)], vec![ColumnValue::Int32(2)]]));
        let mut state = pending_state(&two_rows);
        assert!(recompute_pending(&two_rows, &key, &mut state).unwrap_err().is_recompute());

        let empty_row = definition(constant(vec![]), constant(vec![vec![]]));
        let mut state = pending_state(&empty_row);
        assert!(recompute_pending(&empty_row, &key, &mut state).unwrap_err().is_recompute());

        let no_rows = definition(constant(vec![]), constant(vec![]));
        let mut state = pending_state(&no_rows);
        recompute_pending(&no_rows, &key, &mut state).unwrap();
        assert!(state.output_values()[1].is_null());
    }

    #[test]
    fn test_plan_failure_is_recompute_error() {
        let failing: Rc<dyn QueryPlan> =
            Rc::new(|_: &[ColumnValue]| -> PlanResult { Err(PlanExecutionError::new("max(x)", "disk on fire")) });
        let def = definition(constant(vec![]), failing);
        let mut state = pending_state(&def);
        let err = recompute_pending(&def, &vec![ColumnValue::Int32(1)], &mut state).unwrap_err();
        assert!(err.is_recompute());
        assert!(err.to_string().contains("disk on fire"));
    }

    #[test]
    fn test_refresh_validation() {
        let ok = definition(
            constant(vec![vec![ColumnValue::Int32(1), ColumnValue::Int64(2), ColumnValue::Int32(9)]]),
            constant(vec![]),
        );
        assert_eq!(run_refresh(&ok).unwrap().len(), 1);

        let narrow = definition(constant(vec![vec![ColumnValue::Int32(1)]]), constant(vec![]));
        assert!(run_refresh(&narrow).unwrap_err().is_recompute());

        let zero = definition(
            constant(vec![vec![ColumnValue::Int32(1), ColumnValue::Int64(0), ColumnValue::Null]]),
            constant(vec![]),
        );
        assert!(run_refresh(&zero).is_err());

        let row = vec![ColumnValue::Int32(1), ColumnValue::Int64(1), ColumnValue::Null];
        let duplicate = definition(constant(vec![row.clone(), row]), constant(vec![]));
        assert!(run_refresh(&duplicate).is_err());
    }
}
