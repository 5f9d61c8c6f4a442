//! View definitions.
//!
//! A [`ViewDefinition`] is the compiled, immutable description of a view:
//! group-by expressions, aggregates, the refresh plan and one fallback plan per
//! MIN/MAX aggregate. It is built with [`ViewDefinitionBuilder`], or compiled
//! from a serialized [`ViewSpec`] by [`ScanPlanner`](crate::plan::ScanPlanner).
//!
//! # Examples
//!
//! ```
//! use aggview::ViewSpec;
//!
//! let spec = ViewSpec::from_json(r#"{
//!     "name": "sales_by_region",
//!     "sources": ["sales"],
//!     "group_by": [{"name": "region"}],
//!     "aggregates": [
//!         {"name": "revenue", "kind": "sum", "expr": "price * qty"},
//!         {"name": "largest", "kind": "max", "expr": "price * qty"}
//!     ]
//! }"#).unwrap();
//!
//! assert_eq!(spec.count_column, "row_count");
//! assert_eq!(spec.aggregates.len(), 2);
//! ```

use crate::aggregate::GroupKey;
use crate::column::ColumnValue;
use crate::error::{Result, ViewError};
use crate::expr::{parse_expr, Expr};
use crate::plan::QueryPlan;
use crate::table::Row;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

/// Aggregate function kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateKind {
    Sum,
    Count,
    Min,
    Max,
}

impl AggregateKind {
    /// Parse a kind from a string.
    ///
    /// Accepts: "sum", "count", "min", "max" (any case)
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sum" => Ok(AggregateKind::Sum),
            "count" => Ok(AggregateKind::Count),
            "min" => Ok(AggregateKind::Min),
            "max" => Ok(AggregateKind::Max),
            _ => Err(ViewError::Definition(format!("Unknown aggregate kind: '{}'", s))),
        }
    }

    /// MIN and MAX cannot be maintained by subtraction.
    pub fn is_extremum(&self) -> bool {
        matches!(self, AggregateKind::Min | AggregateKind::Max)
    }

    /// Whether `value` is strictly more extreme than `current`.
    pub fn more_extreme(&self, value: &ColumnValue, current: &ColumnValue) -> bool {
        match self {
            AggregateKind::Min => value < current,
            AggregateKind::Max => value > current,
            _ => false,
        }
    }

    /// Whether `value` is more extreme than or equal to `current`.
    pub fn at_least_as_extreme(&self, value: &ColumnValue, current: &ColumnValue) -> bool {
        self.is_extremum() && (value == current || self.more_extreme(value, current))
    }
}

impl fmt::Display for AggregateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AggregateKind::Sum => "SUM",
            AggregateKind::Count => "COUNT",
            AggregateKind::Min => "MIN",
            AggregateKind::Max => "MAX",
        };
        write!(f, "{}", name)
    }
}

/// One output column of the group-by key.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupByColumn {
    pub name: String,
    pub expr: Expr,
}

/// One aggregate output column. `expr` is None only for `COUNT(*)`.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateSpec {
    pub name: String,
    pub kind: AggregateKind,
    pub expr: Option<Expr>,
}

impl AggregateSpec {
    /// Argument value for `row`. `COUNT(*)` counts every row, so it yields a
    /// non-null marker.
    pub fn argument(&self, row: &Row) -> Result<ColumnValue> {
        match &self.expr {
            Some(expr) => expr.eval(row),
            None => Ok(ColumnValue::Int64(1)),
        }
    }
}

impl fmt::Display for AggregateSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.expr {
            Some(expr) => write!(f, "{}({})", self.kind, expr),
            None => write!(f, "{}(*)", self.kind),
        }
    }
}

/// Compiled, immutable view definition.
pub struct ViewDefinition {
    name: String,
    source_tables: Vec<String>,
    group_by: Vec<GroupByColumn>,
    count_column: String,
    aggregates: Vec<AggregateSpec>,
    refresh_plan: Rc<dyn QueryPlan>,
    /// Parallel to `aggregates`; Some exactly for MIN/MAX.
    fallback_plans: Vec<Option<Rc<dyn QueryPlan>>>,
}

impl ViewDefinition {
    pub fn builder(name: &str) -> ViewDefinitionBuilder {
        ViewDefinitionBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source_tables(&self) -> &[String] {
        &self.source_tables
    }

    pub fn group_by(&self) -> &[GroupByColumn] {
        &self.group_by
    }

    pub fn count_column(&self) -> &str {
        &self.count_column
    }

    pub fn aggregates(&self) -> &[AggregateSpec] {
        &self.aggregates
    }

    pub fn refresh_plan(&self) -> &Rc<dyn QueryPlan> {
        &self.refresh_plan
    }

    /// Fallback plan of the aggregate at `index`, if it has one.
    pub fn fallback_plan(&self, index: usize) -> Option<&Rc<dyn QueryPlan>> {
        self.fallback_plans.get(index).and_then(Option::as_ref)
    }

    /// Target table column names: group-by, row count, aggregates.
    pub fn target_column_names(&self) -> Vec<String> {
        self.group_by
            .iter()
            .map(|g| g.name.clone())
            .chain(std::iter::once(self.count_column.clone()))
            .chain(self.aggregates.iter().map(|a| a.name.clone()))
            .collect()
    }

    /// Every source column referenced by a group-by or aggregate expression.
    pub fn referenced_columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = self
            .group_by
            .iter()
            .flat_map(|g| g.expr.columns())
            .chain(self.aggregates.iter().filter_map(|a| a.expr.as_ref()).flat_map(|e| e.columns()))
            .collect();
        columns.sort();
        columns.dedup();
        columns
    }

    /// Group-by key of a source row.
    pub fn group_key(&self, row: &Row) -> Result<GroupKey> {
        self.group_by.iter().map(|g| g.expr.eval(row)).collect()
    }

    /// Aggregate arguments of a source row, in aggregate order.
    pub fn arguments(&self, row: &Row) -> Result<Vec<ColumnValue>> {
        self.aggregates.iter().map(|a| a.argument(row)).collect()
    }
}

impl fmt::Debug for ViewDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let aggregates: Vec<String> = self.aggregates.iter().map(|a| a.to_string()).collect();
        f.debug_struct("ViewDefinition")
            .field("name", &self.name)
            .field("source_tables", &self.source_tables)
            .field("group_by", &self.group_by.iter().map(|g| &g.name).collect::<Vec<_>>())
            .field("aggregates", &aggregates)
            .finish()
    }
}

pub const DEFAULT_COUNT_COLUMN: &str = "row_count";

/// Builder for [`ViewDefinition`]. Expressions are parsed as they are added;
/// parse errors are reported by [`build`](Self::build).
pub struct ViewDefinitionBuilder {
    name: String,
    sources: Vec<String>,
    group_by: Vec<GroupByColumn>,
    count_column: String,
    aggregates: Vec<AggregateSpec>,
    refresh_plan: Option<Rc<dyn QueryPlan>>,
    fallback_plans: Vec<(String, Rc<dyn QueryPlan>)>,
    errors: Vec<String>,
}

impl ViewDefinitionBuilder {
    pub fn new(name: &str) -> Self {
        ViewDefinitionBuilder {
            name: name.to_string(),
            sources: Vec::new(),
            group_by: Vec::new(),
            count_column: DEFAULT_COUNT_COLUMN.to_string(),
            aggregates: Vec::new(),
            refresh_plan: None,
            fallback_plans: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn source(mut self, table: &str) -> Self {
        self.sources.push(table.to_string());
        self
    }

    /// Add a group-by output column computed by `expr`.
    pub fn group_by(mut self, name: &str, expr: &str) -> Self {
        match parse_expr(expr) {
            Ok(expr) => self.group_by.push(GroupByColumn {
                name: name.to_string(),
                expr,
            }),
            Err(e) => self.errors.push(format!("group-by '{}': {}", name, e)),
        }
        self
    }

    pub fn count_column(mut self, name: &str) -> Self {
        self.count_column = name.to_string();
        self
    }

    /// Add an aggregate. `"*"` as the expression means `COUNT(*)`.
    pub fn aggregate(mut self, name: &str, kind: AggregateKind, expr: &str) -> Self {
        if expr.trim() == "*" {
            if kind != AggregateKind::Count {
                self.errors.push(format!("aggregate '{}': only COUNT accepts '*'", name));
                return self;
            }
            self.aggregates.push(AggregateSpec {
                name: name.to_string(),
                kind,
                expr: None,
            });
            return self;
        }
        match parse_expr(expr) {
            Ok(expr) => self.aggregates.push(AggregateSpec {
                name: name.to_string(),
                kind,
                expr: Some(expr),
            }),
            Err(e) => self.errors.push(format!("aggregate '{}': {}", name, e)),
        }
        self
    }

    pub fn refresh_plan(mut self, plan: Rc<dyn QueryPlan>) -> Self {
        self.refresh_plan = Some(plan);
        self
    }

    /// Attach the fallback plan for the MIN/MAX aggregate named `aggregate`.
    pub fn fallback_plan(mut self, aggregate: &str, plan: Rc<dyn QueryPlan>) -> Self {
        self.fallback_plans.push((aggregate.to_string(), plan));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    pub fn group_by_columns(&self) -> &[GroupByColumn] {
        &self.group_by
    }

    pub fn aggregate_specs(&self) -> &[AggregateSpec] {
        &self.aggregates
    }

    /// Validate and produce the definition.
    pub fn build(self) -> Result<ViewDefinition> {
        if let Some(first) = self.errors.first() {
            return Err(ViewError::Definition(format!("view '{}': {}", self.name, first)));
        }
        let fail = |msg: String| ViewError::Definition(format!("view '{}': {}", self.name, msg));

        if self.name.is_empty() {
            return Err(ViewError::Definition("view name is empty".to_string()));
        }
        if self.sources.is_empty() {
            return Err(fail("no source tables".to_string()));
        }
        let mut seen = HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.as_str()) {
                return Err(fail(format!("source table '{}' listed twice", source)));
            }
        }

        let mut names = HashSet::new();
        let outputs = self
            .group_by
            .iter()
            .map(|g| &g.name)
            .chain(std::iter::once(&self.count_column))
            .chain(self.aggregates.iter().map(|a| &a.name));
        for name in outputs {
            if name.is_empty() {
                return Err(fail("empty output column name".to_string()));
            }
            if !names.insert(name.as_str()) {
                return Err(fail(format!("duplicate output column '{}'", name)));
            }
        }

        let refresh_plan = self
            .refresh_plan
            .clone()
            .ok_or_else(|| fail("missing refresh plan".to_string()))?;

        for (aggregate, _) in &self.fallback_plans {
            if !self.aggregates.iter().any(|a| &a.name == aggregate) {
                return Err(fail(format!("fallback plan for unknown aggregate '{}'", aggregate)));
            }
        }

        let mut fallback_plans = Vec::with_capacity(self.aggregates.len());
        for aggregate in &self.aggregates {
            let mut plans = self.fallback_plans.iter().filter(|(name, _)| name == &aggregate.name);
            let plan = plans.next().map(|(_, plan)| Rc::clone(plan));
            if plans.next().is_some() {
                return Err(fail(format!("more than one fallback plan for '{}'", aggregate.name)));
            }
            match (aggregate.kind.is_extremum(), &plan) {
                (true, None) => {
                    return Err(fail(format!("{} aggregate '{}' has no fallback plan", aggregate.kind, aggregate.name)))
                }
                (false, Some(_)) => {
                    return Err(fail(format!(
                        "{} aggregate '{}' does not take a fallback plan",
                        aggregate.kind, aggregate.name
                    )))
                }
                _ => {}
            }
            fallback_plans.push(plan);
        }

        Ok(ViewDefinition {
            name: self.name,
            source_tables: self.sources,
            group_by: self.group_by,
            count_column: self.count_column,
            aggregates: self.aggregates,
            refresh_plan,
            fallback_plans,
        })
    }
}

fn default_count_column() -> String {
    DEFAULT_COUNT_COLUMN.to_string()
}

/// Group-by entry of a [`ViewSpec`]. `expr` defaults to the column `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupBySpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expr: Option<String>,
}

/// Aggregate entry of a [`ViewSpec`]. A missing `expr` means `COUNT(*)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateEntry {
    pub name: String,
    pub kind: AggregateKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expr: Option<String>,
}

/// Serialized catalog entry for a view. Plans are not part of it; they are
/// compiled by [`ScanPlanner`](crate::plan::ScanPlanner).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewSpec {
    pub name: String,
    pub sources: Vec<String>,
    #[serde(default)]
    pub group_by: Vec<GroupBySpec>,
    #[serde(default = "default_count_column")]
    pub count_column: String,
    #[serde(default)]
    pub aggregates: Vec<AggregateEntry>,
}

impl ViewSpec {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| ViewError::Definition(format!("invalid view spec: {}", e)))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| ViewError::Definition(format!("cannot serialize view spec: {}", e)))
    }

    /// Builder carrying everything but the plans.
    pub fn to_builder(&self) -> ViewDefinitionBuilder {
        let mut builder = ViewDefinitionBuilder::new(&self.name).count_column(&self.count_column);
        for source in &self.sources {
            builder = builder.source(source);
        }
        for group in &self.group_by {
            builder = builder.group_by(&group.name, group.expr.as_deref().unwrap_or(&group.name));
        }
        for aggregate in &self.aggregates {
            builder = builder.aggregate(&aggregate.name, aggregate.kind, aggregate.expr.as_deref().unwrap_or("*"));
        }
        builder
    }
}
