/// AggView - Incrementally Maintained Aggregate Views
///
/// Materialized SUM / COUNT / MIN / MAX views over in-memory columnar tables.
/// Source tables notify their views of every row change inside the writing
/// transaction; views fold the change into per-group state and, at commit,
/// recompute invalidated extrema with narrow fallback plans before writing
/// their target tables through the same undo log as every other write.

pub mod sequence;
pub mod column;
pub mod table;
pub mod changeset;
pub mod error;
pub mod expr;
pub mod plan;
pub mod definition;
pub mod aggregate;
pub mod fallback;
pub mod handler;
pub mod undo;
pub mod transaction;

pub use sequence::{ArraySequence, Sequence, TieredVectorSequence};
pub use column::{Column, ColumnType, ColumnValue};
pub use table::{DependentRef, Row, Schema, StorageHint, Table, TableDependent};
pub use changeset::{ChangeKind, IndexAdjuster, RowChange};
pub use error::{PlanExecutionError, Result, ViewError};
pub use expr::{parse_expr, BinaryOp, Expr};
pub use plan::{FullRefreshPlan, GroupExtremumPlan, PlanRow, QueryPlan, ScanPlanner};
pub use definition::{
    AggregateEntry, AggregateKind, AggregateSpec, GroupByColumn, GroupBySpec, ViewDefinition,
    ViewDefinitionBuilder, ViewSpec,
};
pub use aggregate::{AggregateState, GroupKey, GroupState};
pub use handler::{HandlerStats, ViewHandler};
pub use undo::UndoLog;
pub use transaction::{Transaction, TxnId, TxnStatus};
