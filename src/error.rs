//! Error types for view maintenance.
//!
//! Every fallible operation in the crate returns [`Result<T>`], an alias over
//! [`ViewError`]. Errors are never retried inside the crate: they surface to the
//! write-transaction driver, which rolls the whole transaction back.

use thiserror::Error;

/// Failure reported by a [`QueryPlan`](crate::plan::QueryPlan) while executing.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("plan '{plan}' failed: {message}")]
pub struct PlanExecutionError {
    pub plan: String,
    pub message: String,
}

impl PlanExecutionError {
    pub fn new(plan: impl Into<String>, message: impl Into<String>) -> Self {
        PlanExecutionError {
            plan: plan.into(),
            message: message.into(),
        }
    }
}

/// Primary error type for the crate.
#[derive(Debug, Error)]
pub enum ViewError {
    /// The view definition is malformed or does not match the catalog.
    /// Raised at install time; the handler is not installed.
    #[error("view definition error: {0}")]
    Definition(String),

    /// A fallback or refresh plan failed or returned an ill-formed result.
    #[error("recompute failed for view '{view}': {message}")]
    Recompute {
        view: String,
        message: String,
        #[source]
        source: Option<PlanExecutionError>,
    },

    /// A notification or state transition that can only come from an
    /// integration bug (e.g. deleting from a group that does not exist).
    #[error("invariant violation in view '{view}': {message}")]
    InvariantViolation { view: String, message: String },

    /// Table or column level failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Expression parse or evaluation failure (overflow, division by zero,
    /// non-numeric operand).
    #[error("expression error: {0}")]
    Expression(String),

    /// Operation on a transaction that already committed or rolled back.
    #[error("transaction error: {0}")]
    Transaction(String),
}

impl ViewError {
    pub(crate) fn invariant(view: &str, message: impl Into<String>) -> Self {
        ViewError::InvariantViolation {
            view: view.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn recompute(view: &str, source: PlanExecutionError) -> Self {
        ViewError::Recompute {
            view: view.to_string(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    pub(crate) fn ill_formed(view: &str, message: impl Into<String>) -> Self {
        ViewError::Recompute {
            view: view.to_string(),
            message: message.into(),
            source: None,
        }
    }

    /// Whether the error was raised while validating a definition.
    pub fn is_definition(&self) -> bool {
        matches!(self, ViewError::Definition(_))
    }

    /// Whether the error came from a failed or malformed plan execution.
    pub fn is_recompute(&self) -> bool {
        matches!(self, ViewError::Recompute { .. })
    }

    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, ViewError::InvariantViolation { .. })
    }
}

pub type Result<T> = std::result::Result<T, ViewError>;
