//! Typed errors for the orchestration core.

use thiserror::Error;

/// Errors raised by the registry, allocation and invariant checks.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// A source with the same id is already registered.
    #[error("source '{0}' is already registered")]
    DuplicateSource(String),

    /// No source with this id is registered.
    #[error("source '{0}' is not registered")]
    UnknownSource(String),

    /// A capital-safety or configuration invariant does not hold.
    ///
    /// Always fatal: startup is refused or the loop halts.
    #[error("invariant violated [{invariant}]: {detail}")]
    InvariantViolation {
        invariant: &'static str,
        detail: String,
    },
}

impl EngineError {
    /// Build an invariant violation.
    pub fn invariant(invariant: &'static str, detail: impl Into<String>) -> Self {
        Self::InvariantViolation {
            invariant,
            detail: detail.into(),
        }
    }

    /// Name of the violated invariant, if this is a violation.
    pub fn invariant_name(&self) -> Option<&'static str> {
        match self {
            Self::InvariantViolation { invariant, .. } => Some(*invariant),
            _ => None,
        }
    }

    /// Whether this error must stop the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvariantViolation { .. })
    }
}

/// A specialized Result type for core operations.
pub type Result<T> = std::result::Result<T, EngineError>;
