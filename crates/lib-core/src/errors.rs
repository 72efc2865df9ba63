use std::fmt::Display;

use crate::domain::DbType;

pub type Result<T> = std::result::Result<T, SquillError>;

/// Error kinds surfaced by the execution substrate.
///
/// The predicate evaluator does not return these directly; it yields
/// [`crate::logical::Logical::Error`] and parks the concrete error in the
/// worker's error slot, mirroring the out-of-band error channel the scan
/// loops expect.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SquillError {
    #[error("session {0} does not exist or has expired")]
    SessionExpired(u32),

    #[error("maximum number of session variables ({0}) exceeded")]
    TooManyVariables(usize),

    #[error("maximum number of prepared statements ({0}) exceeded")]
    TooManyStatements(usize),

    #[error("prepared statement '{0}' does not exist")]
    PreparedNameNotFound(String),

    #[error("session variable '{0}' does not exist")]
    VariableNotFound(String),

    #[error("out of virtual memory: unable to allocate {0} bytes")]
    OutOfVirtualMemory(usize),

    #[error("invalid datatype for {0}: expected {1}")]
    InvalidDatatype(&'static str, &'static str),

    #[error("value does not fit in a {0} of precision {1}")]
    StringOverflow(DbType, u16),

    #[error("cannot coerce {0} into {1}")]
    DomainConflict(DbType, DbType),

    #[error("SQL statement recursion depth {0} exceeded")]
    MaxRecursionSqlDepth(usize),

    #[error("overflow in {0}")]
    ArithOverflow(&'static str),

    #[error("division by zero")]
    ZeroDivide,

    #[error("query interrupted")]
    Interrupted,

    #[error("no free transaction entries")]
    TranEntriesExhausted,

    #[error("internal invariant broken: {0}")]
    Internal(&'static str),

    #[error("operation failed")]
    Failed,
}

impl SquillError {
    /// True when the error indicates a broken invariant rather than a
    /// user-recoverable condition.
    pub fn is_internal(&self) -> bool {
        matches!(self, SquillError::Internal(_) | SquillError::Failed)
    }
}

/// An error slot owned by one worker. Evaluation paths that return a
/// [`crate::logical::Logical`] record the concrete failure here.
#[derive(Debug, Default)]
pub struct ErrorSlot {
    last: Option<SquillError>,
}

impl ErrorSlot {
    pub fn set(&mut self, err: SquillError) {
        log::debug!("error slot set: {err}");
        if self.last.is_none() {
            self.last = Some(err);
        }
    }

    /// Overwrite even if an error is already pending.
    pub fn force(&mut self, err: SquillError) {
        self.last = Some(err);
    }

    pub fn take(&mut self) -> Option<SquillError> {
        self.last.take()
    }

    pub fn peek(&self) -> Option<&SquillError> {
        self.last.as_ref()
    }

    pub fn is_set(&self) -> bool {
        self.last.is_some()
    }
}

impl Display for ErrorSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.last {
            Some(err) => write!(f, "{err}"),
            None => write!(f, "no error"),
        }
    }
}
