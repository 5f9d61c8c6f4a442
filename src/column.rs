/// Column storage and the value model shared by tables, expressions and views.
///
/// A Column is an array-like random-access container of typed, optionally
/// nullable values, backed by a [`Sequence`].
///
/// `ColumnValue` carries a total order and a hash consistent with it, so values
/// can be used directly as group-by keys: numbers of different widths compare
/// numerically (`Int32(1) == Int64(1) == Float64(1.0)`), NULL sorts first.

use crate::error::{Result, ViewError};
use crate::sequence::{ArraySequence, Sequence, TieredVectorSequence};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::{self, Debug};
use std::hash::{Hash, Hasher};

/// Column data types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Int32,
    Int64,
    Float32,
    Float64,
    String,
    Bool,
}

/// Column value enum to support multiple types
#[derive(Debug, Clone)]
pub enum ColumnValue {
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    String(String),
    Bool(bool),
    Null,
}

/// Numeric view of a value used for arithmetic and cross-width comparison.
#[derive(Debug, Clone, Copy)]
enum Numeric {
    Int(i64),
    Float(f64),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    pub fn is_numeric(&self) -> bool {
        self.numeric().is_some()
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            ColumnValue::Int32(v) => Some(*v),
            _ => None,
        }
    }

    /// Integer value of any integer width.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ColumnValue::Int32(v) => Some(*v as i64),
            ColumnValue::Int64(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric value of any width, widened to f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self.numeric()? {
            Numeric::Int(v) => Some(v as f64),
            Numeric::Float(v) => Some(v),
        }
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            ColumnValue::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ColumnValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Type of the value, or None for NULL.
    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            ColumnValue::Int32(_) => Some(ColumnType::Int32),
            ColumnValue::Int64(_) => Some(ColumnType::Int64),
            ColumnValue::Float32(_) => Some(ColumnType::Float32),
            ColumnValue::Float64(_) => Some(ColumnType::Float64),
            ColumnValue::String(_) => Some(ColumnType::String),
            ColumnValue::Bool(_) => Some(ColumnType::Bool),
            ColumnValue::Null => None,
        }
    }

    fn numeric(&self) -> Option<Numeric> {
        match self {
            ColumnValue::Int32(v) => Some(Numeric::Int(*v as i64)),
            ColumnValue::Int64(v) => Some(Numeric::Int(*v)),
            ColumnValue::Float32(v) => Some(Numeric::Float(*v as f64)),
            ColumnValue::Float64(v) => Some(Numeric::Float(*v)),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            ColumnValue::Null => 0,
            ColumnValue::Bool(_) => 1,
            ColumnValue::Int32(_)
            | ColumnValue::Int64(_)
            | ColumnValue::Float32(_)
            | ColumnValue::Float64(_) => 2,
            ColumnValue::String(_) => 3,
        }
    }

    fn arithmetic(
        &self,
        other: &ColumnValue,
        op: &str,
        int_op: fn(i64, i64) -> Option<i64>,
        float_op: fn(f64, f64) -> f64,
    ) -> Result<ColumnValue> {
        if self.is_null() || other.is_null() {
            return Ok(ColumnValue::Null);
        }
        let (lhs, rhs) = match (self.numeric(), other.numeric()) {
            (Some(lhs), Some(rhs)) => (lhs, rhs),
            _ => {
                return Err(ViewError::Expression(format!(
                    "Cannot apply '{}' to {} and {}",
                    op, self, other
                )))
            }
        };
        match (lhs, rhs) {
            (Numeric::Int(a), Numeric::Int(b)) => int_op(a, b)
                .map(ColumnValue::Int64)
                .ok_or_else(|| ViewError::Expression(format!("Integer overflow or division by zero in {} {} {}", a, op, b))),
            _ => {
                let a = self.as_f64().unwrap_or_default();
                let b = other.as_f64().unwrap_or_default();
                Ok(ColumnValue::Float64(float_op(a, b)))
            }
        }
    }

    /// SQL addition: NULL-propagating, integers widen to Int64, any float
    /// operand yields Float64.
    pub fn add(&self, other: &ColumnValue) -> Result<ColumnValue> {
        self.arithmetic(other, "+", i64::checked_add, |a, b| a + b)
    }

    pub fn sub(&self, other: &ColumnValue) -> Result<ColumnValue> {
        self.arithmetic(other, "-", i64::checked_sub, |a, b| a - b)
    }

    pub fn mul(&self, other: &ColumnValue) -> Result<ColumnValue> {
        self.arithmetic(other, "*", i64::checked_mul, |a, b| a * b)
    }

    /// Integer division truncates; integer division by zero is an error.
    pub fn div(&self, other: &ColumnValue) -> Result<ColumnValue> {
        self.arithmetic(other, "/", i64::checked_div, |a, b| a / b)
    }

    pub fn neg(&self) -> Result<ColumnValue> {
        ColumnValue::Int64(0).sub(self)
    }
}

impl Ord for ColumnValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.rank().cmp(&other.rank()) {
            Ordering::Equal => {}
            unequal => return unequal,
        }
        match (self, other) {
            (ColumnValue::Bool(a), ColumnValue::Bool(b)) => a.cmp(b),
            (ColumnValue::String(a), ColumnValue::String(b)) => a.cmp(b),
            (ColumnValue::Null, ColumnValue::Null) => Ordering::Equal,
            _ => match (self.numeric(), other.numeric()) {
                (Some(Numeric::Int(a)), Some(Numeric::Int(b))) => a.cmp(&b),
                (Some(Numeric::Int(a)), Some(Numeric::Float(b))) => cmp_int_float(a, b),
                (Some(Numeric::Float(a)), Some(Numeric::Int(b))) => cmp_int_float(b, a).reverse(),
                (Some(Numeric::Float(a)), Some(Numeric::Float(b))) => {
                    // -0.0 and 0.0 are equal; everything else follows total_cmp.
                    if a == b {
                        Ordering::Equal
                    } else {
                        a.total_cmp(&b)
                    }
                }
                _ => Ordering::Equal,
            },
        }
    }
}

/// 2^63 as f64: the first float above every i64.
const I64_BOUND: f64 = 9_223_372_036_854_775_808.0;

/// Exact comparison of an integer with a float, without rounding the integer.
fn cmp_int_float(i: i64, f: f64) -> Ordering {
    if f.is_nan() {
        return if f.is_sign_negative() { Ordering::Greater } else { Ordering::Less };
    }
    if f >= I64_BOUND {
        return Ordering::Less;
    }
    if f < -I64_BOUND {
        return Ordering::Greater;
    }
    let whole = f.trunc();
    match i.cmp(&(whole as i64)) {
        Ordering::Equal if f > whole => Ordering::Less,
        Ordering::Equal if f < whole => Ordering::Greater,
        other => other,
    }
}

/// The integer equal to `f`, if there is one.
fn integral_value(f: f64) -> Option<i64> {
    if f.fract() == 0.0 && (-I64_BOUND..I64_BOUND).contains(&f) {
        Some(f as i64)
    } else {
        None
    }
}

impl PartialOrd for ColumnValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ColumnValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ColumnValue {}

impl Hash for ColumnValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            ColumnValue::Bool(v) => v.hash(state),
            ColumnValue::String(v) => v.hash(state),
            ColumnValue::Null => {}
            _ => match self.numeric() {
                Some(Numeric::Int(v)) => v.hash(state),
                // Integral floats hash like the equal integer.
                Some(Numeric::Float(v)) => match integral_value(v) {
                    Some(i) => i.hash(state),
                    None => v.to_bits().hash(state),
                },
                None => {}
            },
        }
    }
}

impl fmt::Display for ColumnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnValue::Int32(v) => write!(f, "{}", v),
            ColumnValue::Int64(v) => write!(f, "{}", v),
            ColumnValue::Float32(v) => write!(f, "{}", v),
            ColumnValue::Float64(v) => write!(f, "{}", v),
            ColumnValue::String(v) => write!(f, "'{}'", v),
            ColumnValue::Bool(v) => write!(f, "{}", v),
            ColumnValue::Null => write!(f, "NULL"),
        }
    }
}

/// Column class that wraps a Sequence.
/// Handles type checking and nullable values.
pub struct Column {
    name: String,
    column_type: ColumnType,
    nullable: bool,
    sequence: Box<dyn Sequence<ColumnValue>>,
}

impl Column {
    pub fn new(name: String, column_type: ColumnType, nullable: bool) -> Self {
        Self::new_with_options(name, column_type, nullable, false)
    }

    pub fn new_with_options(
        name: String,
        column_type: ColumnType,
        nullable: bool,
        use_tiered_vector: bool,
    ) -> Self {
        let sequence: Box<dyn Sequence<ColumnValue>> = if use_tiered_vector {
            Box::new(TieredVectorSequence::new())
        } else {
            Box::new(ArraySequence::new())
        };

        Column {
            name,
            column_type,
            nullable,
            sequence,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn column_type(&self) -> ColumnType {
        self.column_type
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    pub fn len(&self) -> usize {
        self.sequence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }

    /// Validate and convert value to the column's type.
    ///
    /// Integers are accepted by wider integer and float columns, so aggregate
    /// results computed as Int64 can be written to an Int32 column only when
    /// they fit.
    fn validate_value(&self, value: ColumnValue) -> Result<ColumnValue> {
        if value.is_null() {
            if !self.nullable {
                return Err(ViewError::Storage(format!("Column '{}' is not nullable", self.name)));
            }
            return Ok(ColumnValue::Null);
        }

        let mismatch = |value: &ColumnValue| {
            ViewError::Storage(format!(
                "Type mismatch for column '{}': expected {:?}, got {:?}",
                self.name, self.column_type, value
            ))
        };

        match (&value, self.column_type) {
            (ColumnValue::Int32(_), ColumnType::Int32)
            | (ColumnValue::Int64(_), ColumnType::Int64)
            | (ColumnValue::Float32(_), ColumnType::Float32)
            | (ColumnValue::Float64(_), ColumnType::Float64)
            | (ColumnValue::String(_), ColumnType::String)
            | (ColumnValue::Bool(_), ColumnType::Bool) => Ok(value),
            (ColumnValue::Int32(v), ColumnType::Int64) => Ok(ColumnValue::Int64(*v as i64)),
            (ColumnValue::Int64(v), ColumnType::Int32) => i32::try_from(*v)
                .map(ColumnValue::Int32)
                .map_err(|_| mismatch(&value)),
            (ColumnValue::Float32(v), ColumnType::Float64) => Ok(ColumnValue::Float64(*v as f64)),
            (ColumnValue::Int32(_) | ColumnValue::Int64(_), ColumnType::Float64) => {
                Ok(ColumnValue::Float64(value.as_f64().unwrap_or_default()))
            }
            _ => Err(mismatch(&value)),
        }
    }

    pub fn get(&self, index: usize) -> Result<ColumnValue> {
        self.sequence.get(index)
    }

    pub fn set(&mut self, index: usize, value: ColumnValue) -> Result<()> {
        let value = self.validate_value(value)?;
        self.sequence.set(index, value)
    }

    pub fn insert(&mut self, index: usize, value: ColumnValue) -> Result<()> {
        let value = self.validate_value(value)?;
        self.sequence.insert(index, value)
    }

    pub fn delete(&mut self, index: usize) -> Result<ColumnValue> {
        self.sequence.delete(index)
    }

    pub fn append(&mut self, value: ColumnValue) -> Result<()> {
        let value = self.validate_value(value)?;
        self.sequence.append(value);
        Ok(())
    }

    /// Check a value against the column without storing it.
    pub fn check(&self, value: &ColumnValue) -> Result<()> {
        self.validate_value(value.clone()).map(|_| ())
    }

    pub fn is_null(&self, index: usize) -> Result<bool> {
        Ok(self.sequence.get(index)?.is_null())
    }

    pub fn iter(&self) -> Box<dyn Iterator<Item = ColumnValue> + '_> {
        self.sequence.iter()
    }
}

impl Debug for Column {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Column {{ name: '{}', type: {:?}, nullable: {}, len: {} }}",
            self.name,
            self.column_type,
            self.nullable,
            self.len()
        )
    }
}
