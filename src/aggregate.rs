//! Aggregate row state and the delta algebra.
//!
//! A [`GroupState`] holds the running aggregates of one group: the row count
//! and, per aggregate, a running sum, a non-null count, or a MIN/MAX
//! candidate with a `fallback_pending` flag. Inserts and deletes are applied
//! with already-evaluated aggregate arguments.
//!
//! Deleting the current extremum cannot be resolved locally: a tied or next
//! best row may or may not remain, so the aggregate is flagged and the
//! candidate is left stale until a fallback plan recomputes it.

use crate::column::ColumnValue;
use crate::definition::{AggregateKind, AggregateSpec};

/// Tuple of group-by values identifying one view row.
pub type GroupKey = Vec<ColumnValue>;

/// Running value of one aggregate within one group.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregateState {
    /// NULL until the first non-null input.
    Sum(ColumnValue),
    /// Number of non-null inputs (every row for `COUNT(*)`).
    Count(i64),
    Extremum {
        candidate: ColumnValue,
        fallback_pending: bool,
    },
}

impl AggregateState {
    fn empty(kind: AggregateKind) -> Self {
        match kind {
            AggregateKind::Sum => AggregateState::Sum(ColumnValue::Null),
            AggregateKind::Count => AggregateState::Count(0),
            AggregateKind::Min | AggregateKind::Max => AggregateState::Extremum {
                candidate: ColumnValue::Null,
                fallback_pending: false,
            },
        }
    }

    /// Rebuild from a persisted target value.
    fn persisted(kind: AggregateKind, value: &ColumnValue) -> Result<Self, String> {
        match kind {
            AggregateKind::Sum => Ok(AggregateState::Sum(value.clone())),
            AggregateKind::Count => value
                .as_i64()
                .map(AggregateState::Count)
                .ok_or_else(|| format!("persisted COUNT value {} is not an integer", value)),
            AggregateKind::Min | AggregateKind::Max => Ok(AggregateState::Extremum {
                candidate: value.clone(),
                fallback_pending: false,
            }),
        }
    }

    fn insert(&mut self, kind: AggregateKind, value: &ColumnValue) -> Result<(), String> {
        if value.is_null() {
            return Ok(());
        }
        match self {
            AggregateState::Sum(total) => {
                if !value.is_numeric() {
                    return Err(format!("SUM input {} is not numeric", value));
                }
                // Int64(0) + v widens integers to Int64 and floats to Float64.
                let base = if total.is_null() { ColumnValue::Int64(0) } else { total.clone() };
                *total = base.add(value).map_err(|e| e.to_string())?;
            }
            AggregateState::Count(n) => *n += 1,
            AggregateState::Extremum {
                candidate,
                fallback_pending,
            } => {
                if *fallback_pending {
                    // Anything at least as extreme as the stale candidate beats
                    // every remaining row.
                    if kind.at_least_as_extreme(value, candidate) {
                        *candidate = value.clone();
                        *fallback_pending = false;
                    }
                } else if candidate.is_null() || kind.more_extreme(value, candidate) {
                    *candidate = value.clone();
                }
            }
        }
        Ok(())
    }

    fn delete(&mut self, value: &ColumnValue) -> Result<(), String> {
        if value.is_null() {
            return Ok(());
        }
        match self {
            AggregateState::Sum(total) => {
                if !value.is_numeric() {
                    return Err(format!("SUM input {} is not numeric", value));
                }
                if total.is_null() {
                    return Err(format!("delete of {} from a SUM with no inputs", value));
                }
                *total = total.sub(value).map_err(|e| e.to_string())?;
            }
            AggregateState::Count(n) => {
                if *n == 0 {
                    return Err("delete from a COUNT that is already zero".to_string());
                }
                *n -= 1;
            }
            AggregateState::Extremum {
                candidate,
                fallback_pending,
            } => {
                if value == candidate {
                    *fallback_pending = true;
                }
            }
        }
        Ok(())
    }

    /// Final value, or the stale candidate for a pending extremum.
    pub fn value(&self) -> ColumnValue {
        match self {
            AggregateState::Sum(total) => total.clone(),
            AggregateState::Count(n) => ColumnValue::Int64(*n),
            AggregateState::Extremum { candidate, .. } => candidate.clone(),
        }
    }

    pub fn fallback_pending(&self) -> bool {
        matches!(self, AggregateState::Extremum { fallback_pending: true, .. })
    }
}

/// Running aggregates of one group.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupState {
    count: i64,
    aggregates: Vec<AggregateState>,
}

impl GroupState {
    /// State of a group that has no rows.
    pub fn empty(specs: &[AggregateSpec]) -> Self {
        GroupState {
            count: 0,
            aggregates: specs.iter().map(|s| AggregateState::empty(s.kind)).collect(),
        }
    }

    /// Load from a target row's row count and aggregate values.
    pub fn from_persisted(specs: &[AggregateSpec], count: &ColumnValue, values: &[ColumnValue]) -> Result<Self, String> {
        let count = count
            .as_i64()
            .ok_or_else(|| format!("persisted row count {} is not an integer", count))?;
        if count <= 0 {
            return Err(format!("persisted row count {} is not positive", count));
        }
        if values.len() != specs.len() {
            return Err(format!("expected {} aggregate values, found {}", specs.len(), values.len()));
        }
        let aggregates = specs
            .iter()
            .zip(values)
            .map(|(spec, value)| AggregateState::persisted(spec.kind, value))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(GroupState { count, aggregates })
    }

    pub fn count(&self) -> i64 {
        self.count
    }

    pub fn aggregates(&self) -> &[AggregateState] {
        &self.aggregates
    }

    /// Apply one inserted row. `arguments` are in aggregate order.
    pub fn apply_insert(&mut self, specs: &[AggregateSpec], arguments: &[ColumnValue]) -> Result<(), String> {
        self.check_width(arguments)?;
        for ((state, spec), value) in self.aggregates.iter_mut().zip(specs).zip(arguments) {
            state.insert(spec.kind, value)?;
        }
        self.count += 1;
        Ok(())
    }

    /// Apply one deleted row. When the count reaches zero the aggregates
    /// reset and no fallback is needed.
    pub fn apply_delete(&mut self, specs: &[AggregateSpec], arguments: &[ColumnValue]) -> Result<(), String> {
        if self.count == 0 {
            return Err("delete from a group with no rows".to_string());
        }
        self.check_width(arguments)?;
        self.count -= 1;
        if self.count == 0 {
            self.aggregates = specs.iter().map(|s| AggregateState::empty(s.kind)).collect();
            return Ok(());
        }
        for (state, value) in self.aggregates.iter_mut().zip(arguments) {
            state.delete(value)?;
        }
        Ok(())
    }

    fn check_width(&self, arguments: &[ColumnValue]) -> Result<(), String> {
        if arguments.len() != self.aggregates.len() {
            return Err(format!(
                "expected {} aggregate arguments, found {}",
                self.aggregates.len(),
                arguments.len()
            ));
        }
        Ok(())
    }

    /// Positions of aggregates waiting on a fallback recompute.
    pub fn pending_fallbacks(&self) -> Vec<usize> {
        self.aggregates
            .iter()
            .enumerate()
            .filter(|(_, a)| a.fallback_pending())
            .map(|(i, _)| i)
            .collect()
    }

    /// Install a recomputed extremum and clear its pending flag.
    pub fn resolve_extremum(&mut self, index: usize, value: ColumnValue) -> Result<(), String> {
        match self.aggregates.get_mut(index) {
            Some(AggregateState::Extremum {
                candidate,
                fallback_pending,
            }) => {
                *candidate = value;
                *fallback_pending = false;
                Ok(())
            }
            _ => Err(format!("aggregate {} is not MIN/MAX", index)),
        }
    }

    /// Row count followed by every aggregate value, in target column order.
    pub fn output_values(&self) -> Vec<ColumnValue> {
        std::iter::once(ColumnValue::Int64(self.count))
            .chain(self.aggregates.iter().map(AggregateState::value))
            .collect()
    }
}
