//! Error types for the atlasflow orchestration core.
//!
//! The taxonomy separates three failure planes: activity failures (the work
//! itself went wrong, classified transient or permanent), infrastructure
//! failures (ledger or store unavailable, the work is unjudged), and
//! compensation failures (undo went wrong). Coordinator surfaces wrap these
//! in [`OrchestrationError`].

use crate::core::{EntityId, ErrorClass, ErrorDetail};
use thiserror::Error;

/// Failure of an activity body.
///
/// Activities classify their own failures: transient errors are retried
/// under the stage retry policy, permanent errors fail the stage attempt
/// immediately. Infrastructure problems are never expressed through this
/// type; those surface as [`LedgerError`] or [`StoreError`].
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ActivityError {
    /// Transient or permanent.
    pub class: ErrorClass,
    /// What went wrong.
    pub message: String,
}

impl ActivityError {
    /// Creates a transient activity failure.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Transient,
            message: message.into(),
        }
    }

    /// Creates a permanent activity failure.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Permanent,
            message: message.into(),
        }
    }

    /// Returns true if another attempt may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.class.is_retryable()
    }

    /// Converts to a record-level error detail attributed to `activity`.
    #[must_use]
    pub fn into_detail(self, activity: &str) -> ErrorDetail {
        ErrorDetail {
            class: self.class,
            message: self.message,
            activity: Some(activity.to_string()),
        }
    }
}

/// Failure of the idempotency ledger itself.
///
/// A ledger failure aborts the whole stage dispatch without recording a
/// result; the dispatch is re-driven later as if it had never started.
#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    /// The ledger backend could not be reached.
    #[error("idempotency ledger unavailable: {reason}")]
    Unavailable {
        /// Why the ledger refused.
        reason: String,
    },

    /// A stored result could not be encoded or decoded.
    #[error("ledger serialization failed for key '{key}': {reason}")]
    Serialization {
        /// The idempotency key involved.
        key: String,
        /// The serde failure.
        reason: String,
    },
}

impl LedgerError {
    /// Creates an unavailable error.
    #[must_use]
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    /// Creates a serialization error.
    #[must_use]
    pub fn serialization(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Serialization {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Failure of the entity store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// No entity with this identifier.
    #[error("entity not found: {id}")]
    NotFound {
        /// The missing identifier.
        id: EntityId,
    },

    /// An entity with this identifier already exists.
    #[error("entity already exists: {id}")]
    AlreadyExists {
        /// The duplicate identifier.
        id: EntityId,
    },

    /// A version-checked write lost to a concurrent writer.
    #[error("version conflict on entity {id}: expected {expected}, found {actual}")]
    Conflict {
        /// The contested identifier.
        id: EntityId,
        /// Version the writer read.
        expected: u64,
        /// Version actually stored.
        actual: u64,
    },

    /// The store backend could not be reached.
    #[error("entity store unavailable: {reason}")]
    Unavailable {
        /// Why the store refused.
        reason: String,
    },
}

impl StoreError {
    /// Creates an unavailable error.
    #[must_use]
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    /// Returns true for conflicts, which the caller resolves by reloading
    /// and re-deciding rather than by backing off.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Failure of a compensating action.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct CompensationError {
    /// What went wrong.
    pub message: String,
    /// True when retrying the compensator may succeed.
    pub retryable: bool,
}

impl CompensationError {
    /// Creates a retryable compensation failure.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a fatal compensation failure. The walk stops and the entity
    /// is flagged for manual intervention.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Top-level error of coordinator operations.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// The entity identifier is not registered.
    #[error("unknown entity: {id}")]
    UnknownEntity {
        /// The unknown identifier.
        id: EntityId,
    },

    /// The entity store failed.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// The idempotency ledger failed.
    #[error("{0}")]
    Ledger(#[from] LedgerError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_error_classes() {
        let soft = ActivityError::transient("rate limited");
        assert!(soft.is_transient());
        assert_eq!(soft.class, ErrorClass::Transient);

        let hard = ActivityError::permanent("unsupported content type");
        assert!(!hard.is_transient());
        assert_eq!(hard.to_string(), "unsupported content type");
    }

    #[test]
    fn test_activity_error_into_detail() {
        let detail = ActivityError::permanent("no text").into_detail("fetch-clean-text");
        assert_eq!(detail.activity.as_deref(), Some("fetch-clean-text"));
        assert_eq!(detail.class, ErrorClass::Permanent);
    }

    #[test]
    fn test_ledger_error_display() {
        let err = LedgerError::unavailable("connection refused");
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_store_conflict_predicate() {
        let id = EntityId::new();
        let conflict = StoreError::Conflict {
            id,
            expected: 3,
            actual: 4,
        };
        assert!(conflict.is_conflict());
        assert!(!StoreError::NotFound { id }.is_conflict());
        assert!(conflict.to_string().contains("expected 3"));
    }

    #[test]
    fn test_compensation_error_retryable() {
        assert!(CompensationError::transient("store busy").retryable);
        assert!(!CompensationError::fatal("artifact gone wrong").retryable);
    }

    #[test]
    fn test_orchestration_error_from_store() {
        let id = EntityId::new();
        let err: OrchestrationError = StoreError::NotFound { id }.into();
        assert!(matches!(err, OrchestrationError::Store(_)));
    }
}
