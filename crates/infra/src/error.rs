//! Engine-level error model.

use thiserror::Error;

use campusres_core::DomainError;

use crate::command_dispatcher::DispatchError;
use crate::event_store::EventStoreError;

pub type EngineResult<T> = Result<T, EngineError>;

/// Error returned by every engine operation.
///
/// Bulk partial failure is not represented here; it is a normal outcome.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Malformed input. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Operation not legal from the current status; `status` is that status.
    #[error("invalid state '{status}': {message}")]
    InvalidState { status: String, message: String },

    #[error("insufficient inventory: requested {requested}, available {available}")]
    InsufficientInventory { requested: u32, available: i64 },

    #[error("{0} not found")]
    NotFound(String),

    /// Lost an optimistic concurrency race. The only retryable kind.
    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl EngineError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::ConcurrencyConflict(_))
    }

    /// HTTP-style status for the transport layer.
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::Validation(_) => 400,
            EngineError::NotFound(_) => 404,
            EngineError::InvalidState { .. } | EngineError::ConcurrencyConflict(_) => 409,
            EngineError::InsufficientInventory { .. } => 422,
            EngineError::Storage(_) => 500,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation_error",
            EngineError::InvalidState { .. } => "invalid_state",
            EngineError::InsufficientInventory { .. } => "insufficient_inventory",
            EngineError::NotFound(_) => "not_found",
            EngineError::ConcurrencyConflict(_) => "concurrency_conflict",
            EngineError::Storage(_) => "storage_error",
        }
    }
}

impl From<DomainError> for EngineError {
    fn from(value: DomainError) -> Self {
        DispatchError::from(value).into()
    }
}

impl From<EventStoreError> for EngineError {
    fn from(value: EventStoreError) -> Self {
        DispatchError::from(value).into()
    }
}

impl From<DispatchError> for EngineError {
    fn from(value: DispatchError) -> Self {
        match value {
            DispatchError::Concurrency(msg) => EngineError::ConcurrencyConflict(msg),
            DispatchError::Validation(msg) => EngineError::Validation(msg),
            DispatchError::InvalidState { status, message } => {
                EngineError::InvalidState { status, message }
            }
            DispatchError::InsufficientInventory {
                requested,
                available,
            } => EngineError::InsufficientInventory {
                requested,
                available,
            },
            DispatchError::NotFound => EngineError::NotFound("resource".to_string()),
            // A broken invariant is an engine fault, not caller input.
            DispatchError::InvariantViolation(msg)
            | DispatchError::Deserialize(msg)
            | DispatchError::Publish(msg) => EngineError::Storage(msg),
            DispatchError::Store(e) => EngineError::Storage(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_conflicts_are_retryable() {
        assert!(EngineError::ConcurrencyConflict("x".into()).is_retryable());
        assert!(!EngineError::Validation("x".into()).is_retryable());
        assert!(!EngineError::Storage("x".into()).is_retryable());
    }

    #[test]
    fn domain_errors_keep_their_kind() {
        let e: EngineError = DomainError::invalid_state("REJECTED", "nope").into();
        assert_eq!(e.status_code(), 409);
        assert_eq!(e.code(), "invalid_state");
        assert!(matches!(e, EngineError::InvalidState { status, .. } if status == "REJECTED"));

        let e: EngineError = DomainError::insufficient(3, 2).into();
        assert_eq!(
            e,
            EngineError::InsufficientInventory {
                requested: 3,
                available: 2
            }
        );
        assert_eq!(EngineError::from(DomainError::validation("bad")).status_code(), 400);
        assert_eq!(EngineError::from(DomainError::NotFound).status_code(), 404);
    }

    #[test]
    fn invariant_violations_are_engine_faults() {
        let e: EngineError = DomainError::invariant("request holds no reserved stock").into();
        assert!(matches!(e, EngineError::Storage(_)));
        assert_eq!(e.status_code(), 500);
        assert!(!e.is_retryable());
    }

    #[test]
    fn store_concurrency_becomes_conflict() {
        let e: EngineError = EventStoreError::Concurrency("stale".into()).into();
        assert!(e.is_retryable());
    }
}
