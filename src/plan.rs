//! Query plans.
//!
//! A [`QueryPlan`] is an opaque, pre-compiled executable: given bound
//! parameters it produces a row set. The refresh plan of a view ignores its
//! parameters and returns every target row; a fallback plan takes a group key
//! and returns at most one row holding that group's extremum. Both go through
//! the same trait, and any `Fn(&[ColumnValue]) -> Result<Vec<PlanRow>, _>`
//! closure is a plan.
//!
//! [`ScanPlanner`] compiles a [`ViewSpec`] into a [`ViewDefinition`] whose
//! plans scan the source tables, and creates the matching target table.

use crate::aggregate::{GroupKey, GroupState};
use crate::column::{ColumnType, ColumnValue};
use crate::definition::{AggregateKind, AggregateSpec, GroupByColumn, ViewDefinition, ViewSpec};
use crate::error::{PlanExecutionError, Result, ViewError};
use crate::expr::Expr;
use crate::table::{Row, Schema, StorageHint, Table};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

/// One result row, values in output column order.
pub type PlanRow = Vec<ColumnValue>;

/// Produce rows for bound parameters.
pub trait QueryPlan {
    /// Name used in logs and errors.
    fn label(&self) -> String {
        "anonymous plan".to_string()
    }

    fn execute(&self, params: &[ColumnValue]) -> std::result::Result<Vec<PlanRow>, PlanExecutionError>;
}

impl<F> QueryPlan for F
where
    F: Fn(&[ColumnValue]) -> std::result::Result<Vec<PlanRow>, PlanExecutionError>,
{
    fn execute(&self, params: &[ColumnValue]) -> std::result::Result<Vec<PlanRow>, PlanExecutionError> {
        self(params)
    }
}

/// Visit every row of every source, in source order then row order.
fn scan_sources<F>(label: &str, sources: &[Rc<RefCell<Table>>], mut visit: F) -> std::result::Result<(), PlanExecutionError>
where
    F: FnMut(&Row) -> std::result::Result<(), PlanExecutionError>,
{
    for source in sources {
        let table = source
            .try_borrow()
            .map_err(|_| PlanExecutionError::new(label, "source table is being written"))?;
        for index in 0..table.len() {
            let row = table
                .get_row(index)
                .map_err(|e| PlanExecutionError::new(label, e.to_string()))?;
            visit(&row)?;
        }
    }
    Ok(())
}

fn eval_key(label: &str, group_by: &[Expr], row: &Row) -> std::result::Result<GroupKey, PlanExecutionError> {
    group_by
        .iter()
        .map(|e| e.eval(row).map_err(|err| PlanExecutionError::new(label, err.to_string())))
        .collect()
}

/// Fallback plan: scans the sources for rows of one group and returns their
/// MIN or MAX.
///
/// Returns no rows when the group has no rows, `[[NULL]]` when it has rows but
/// every argument is NULL, and `[[extremum]]` otherwise.
pub struct GroupExtremumPlan {
    label: String,
    kind: AggregateKind,
    sources: Vec<Rc<RefCell<Table>>>,
    group_by: Vec<Expr>,
    argument: Expr,
}

impl GroupExtremumPlan {
    pub fn new(
        label: String,
        kind: AggregateKind,
        sources: Vec<Rc<RefCell<Table>>>,
        group_by: Vec<Expr>,
        argument: Expr,
    ) -> Self {
        GroupExtremumPlan {
            label,
            kind,
            sources,
            group_by,
            argument,
        }
    }
}

impl QueryPlan for GroupExtremumPlan {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn execute(&self, params: &[ColumnValue]) -> std::result::Result<Vec<PlanRow>, PlanExecutionError> {
        if params.len() != self.group_by.len() {
            return Err(PlanExecutionError::new(
                &self.label,
                format!("expected {} parameters, got {}", self.group_by.len(), params.len()),
            ));
        }
        let mut matched = false;
        let mut best: Option<ColumnValue> = None;
        scan_sources(&self.label, &self.sources, |row| {
            if eval_key(&self.label, &self.group_by, row)? != params {
                return Ok(());
            }
            matched = true;
            let value = self
                .argument
                .eval(row)
                .map_err(|e| PlanExecutionError::new(&self.label, e.to_string()))?;
            if value.is_null() {
                return Ok(());
            }
            let replace = match &best {
                None => true,
                Some(current) => self.kind.more_extreme(&value, current),
            };
            if replace {
                best = Some(value);
            }
            Ok(())
        })?;
        if !matched {
            return Ok(Vec::new());
        }
        Ok(vec![vec![best.unwrap_or(ColumnValue::Null)]])
    }
}

/// Refresh plan: hash aggregate over all sources, one output row per group in
/// key order, laid out as the target table.
pub struct FullRefreshPlan {
    label: String,
    sources: Vec<Rc<RefCell<Table>>>,
    group_by: Vec<GroupByColumn>,
    aggregates: Vec<AggregateSpec>,
}

impl FullRefreshPlan {
    pub fn new(
        label: String,
        sources: Vec<Rc<RefCell<Table>>>,
        group_by: Vec<GroupByColumn>,
        aggregates: Vec<AggregateSpec>,
    ) -> Self {
        FullRefreshPlan {
            label,
            sources,
            group_by,
            aggregates,
        }
    }
}

impl QueryPlan for FullRefreshPlan {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn execute(&self, _params: &[ColumnValue]) -> std::result::Result<Vec<PlanRow>, PlanExecutionError> {
        let exprs: Vec<Expr> = self.group_by.iter().map(|g| g.expr.clone()).collect();
        let mut groups: BTreeMap<GroupKey, GroupState> = BTreeMap::new();
        scan_sources(&self.label, &self.sources, |row| {
            let key = eval_key(&self.label, &exprs, row)?;
            let arguments = self
                .aggregates
                .iter()
                .map(|a| a.argument(row))
                .collect::<Result<Vec<_>>>()
                .map_err(|e| PlanExecutionError::new(&self.label, e.to_string()))?;
            groups
                .entry(key)
                .or_insert_with(|| GroupState::empty(&self.aggregates))
                .apply_insert(&self.aggregates, &arguments)
                .map_err(|e| PlanExecutionError::new(&self.label, e))
        })?;
        Ok(groups
            .into_iter()
            .map(|(mut key, state)| {
                key.extend(state.output_values());
                key
            })
            .collect())
    }
}

/// Compiles view specs into scan-based plans.
pub struct ScanPlanner;

impl ScanPlanner {
    /// Compile `spec` against the tables in `tables`.
    ///
    /// Every source must exist and carry every column the view references.
    pub fn compile(spec: &ViewSpec, tables: &HashMap<String, Rc<RefCell<Table>>>) -> Result<ViewDefinition> {
        let sources = Self::lookup_sources(&spec.name, &spec.sources, tables)?;
        let builder = spec.to_builder();

        let refresh = FullRefreshPlan::new(
            format!("refresh {}", spec.name),
            sources.clone(),
            builder.group_by_columns().to_vec(),
            builder.aggregate_specs().to_vec(),
        );
        let group_exprs: Vec<Expr> = builder.group_by_columns().iter().map(|g| g.expr.clone()).collect();
        let fallbacks: Vec<(String, Rc<dyn QueryPlan>)> = builder
            .aggregate_specs()
            .iter()
            .filter(|a| a.kind.is_extremum())
            .filter_map(|a| {
                let argument = a.expr.clone()?;
                let plan = GroupExtremumPlan::new(
                    format!("{} fallback {}", spec.name, a),
                    a.kind,
                    sources.clone(),
                    group_exprs.clone(),
                    argument,
                );
                Some((a.name.clone(), Rc::new(plan) as Rc<dyn QueryPlan>))
            })
            .collect();

        let mut builder = builder.refresh_plan(Rc::new(refresh));
        for (name, plan) in fallbacks {
            builder = builder.fallback_plan(&name, plan);
        }
        let definition = builder.build()?;

        for source in &sources {
            let table = source.borrow();
            for column in definition.referenced_columns() {
                if table.schema().get_column_index(&column).is_none() {
                    return Err(ViewError::Definition(format!(
                        "view '{}': column '{}' not found in source '{}'",
                        spec.name,
                        column,
                        table.name()
                    )));
                }
            }
        }
        log::debug!("compiled view '{}' over {:?}", spec.name, spec.sources);
        Ok(definition)
    }

    fn lookup_sources(
        view: &str,
        names: &[String],
        tables: &HashMap<String, Rc<RefCell<Table>>>,
    ) -> Result<Vec<Rc<RefCell<Table>>>> {
        names
            .iter()
            .map(|name| {
                tables
                    .get(name)
                    .cloned()
                    .ok_or_else(|| ViewError::Definition(format!("view '{}': source table '{}' not found", view, name)))
            })
            .collect()
    }

    /// Target schema for `definition`, with types inferred from the sources.
    ///
    /// Group-by columns form the primary key; with no group-by the key is
    /// empty and the view holds at most one row.
    pub fn target_schema(
        definition: &ViewDefinition,
        tables: &HashMap<String, Rc<RefCell<Table>>>,
    ) -> Result<Schema> {
        let sources = Self::lookup_sources(definition.name(), definition.source_tables(), tables)?;
        let infer = |expr: &Expr| -> Result<ColumnType> {
            let mut inferred: Option<ColumnType> = None;
            for source in &sources {
                let ty = expr.infer_type(source.borrow().schema()).ok_or_else(|| {
                    ViewError::Definition(format!(
                        "view '{}': cannot infer type of '{}' over '{}'",
                        definition.name(),
                        expr,
                        source.borrow().name()
                    ))
                })?;
                match inferred {
                    Some(previous) if previous != ty => {
                        return Err(ViewError::Definition(format!(
                            "view '{}': '{}' has type {:?} in one source and {:?} in another",
                            definition.name(),
                            expr,
                            previous,
                            ty
                        )))
                    }
                    _ => inferred = Some(ty),
                }
            }
            inferred.ok_or_else(|| ViewError::Definition(format!("view '{}': no sources", definition.name())))
        };

        let mut columns = Vec::new();
        for group in definition.group_by() {
            columns.push((group.name.clone(), infer(&group.expr)?, true));
        }
        columns.push((definition.count_column().to_string(), ColumnType::Int64, false));
        for aggregate in definition.aggregates() {
            let ty = match (aggregate.kind, &aggregate.expr) {
                (AggregateKind::Count, _) => ColumnType::Int64,
                (_, None) => {
                    return Err(ViewError::Definition(format!(
                        "view '{}': aggregate '{}' has no argument",
                        definition.name(),
                        aggregate.name
                    )))
                }
                (AggregateKind::Sum, Some(expr)) => match infer(expr)? {
                    ColumnType::Int32 | ColumnType::Int64 => ColumnType::Int64,
                    ColumnType::Float32 | ColumnType::Float64 => ColumnType::Float64,
                    other => {
                        return Err(ViewError::Definition(format!(
                            "view '{}': SUM over non-numeric {:?} in '{}'",
                            definition.name(),
                            other,
                            aggregate.name
                        )))
                    }
                },
                (AggregateKind::Min | AggregateKind::Max, Some(expr)) => infer(expr)?,
            };
            let nullable = aggregate.kind != AggregateKind::Count;
            columns.push((aggregate.name.clone(), ty, nullable));
        }

        let key: Vec<&str> = definition.group_by().iter().map(|g| g.name.as_str()).collect();
        Schema::new(columns).with_primary_key(&key)
    }

    /// Create an empty target table for `definition`.
    pub fn target_table(
        definition: &ViewDefinition,
        tables: &HashMap<String, Rc<RefCell<Table>>>,
    ) -> Result<Rc<RefCell<Table>>> {
        let schema = Self::target_schema(definition, tables)?;
        Ok(Rc::new(RefCell::new(Table::with_hint(
            definition.name().to_string(),
            schema,
            StorageHint::FastUpdates,
        ))))
    }
}
