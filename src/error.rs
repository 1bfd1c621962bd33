//! Error types for the resolution core.
//!
//! All errors are strongly typed using thiserror so callers can match on the
//! exact failure: a malformed signal, an unreachable dependency, a terminal
//! review item, a missing entity or a conflicting merge.

use thiserror::Error;

use crate::entity::EntityId;
use crate::record::RecordId;
use crate::review::ReviewItemId;
use crate::storage::StorageError;

/// The signal a validation failure refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    /// Email address.
    Email,
    /// Phone number.
    Phone,
    /// Person name.
    Name,
    /// Postal address.
    Address,
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Email => write!(f, "email"),
            Self::Phone => write!(f, "phone"),
            Self::Name => write!(f, "name"),
            Self::Address => write!(f, "address"),
        }
    }
}

/// Validation errors for individual signals and configuration values.
///
/// A malformed signal never aborts a resolution: the resolver degrades that
/// signal's score to 0 and records the issue on the decision.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Malformed {signal}: {reason}")]
    MalformedSignal {
        signal: SignalKind,
        reason: String,
    },

    #[error("Name '{value}' is shorter than the minimum length of {min_length}")]
    NameTooShort {
        value: String,
        min_length: usize,
    },

    #[error("Score {value} is out of range [0.0, 1.0]")]
    ScoreOutOfRange {
        value: f64,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },

    #[error("Review action '{action}' cannot be applied to {kind} items")]
    UnsupportedAction {
        action: String,
        kind: String,
    },
}

impl ValidationError {
    /// Shorthand for a malformed signal.
    #[must_use]
    pub fn malformed(signal: SignalKind, reason: impl Into<String>) -> Self {
        Self::MalformedSignal {
            signal,
            reason: reason.into(),
        }
    }
}

/// Errors raised while resolving records or review items.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("Resolution unavailable for record {record_id:?}: {reason}")]
    ResolutionUnavailable {
        record_id: Option<RecordId>,
        reason: String,
    },

    #[error("Review item {id} is already resolved")]
    AlreadyResolved {
        id: ReviewItemId,
    },

    #[error("Review item not found: {id}")]
    ReviewItemNotFound {
        id: ReviewItemId,
    },

    #[error("Entity not found: {id}")]
    EntityNotFound {
        id: EntityId,
    },

    #[error("Merge conflict between {canonical} and {candidate}: {reason}")]
    MergeConflict {
        canonical: EntityId,
        candidate: EntityId,
        reason: String,
    },

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Resolution queue '{lane}' is full (capacity {capacity})")]
    QueueFull {
        lane: String,
        capacity: usize,
    },

    #[error("Resolution lane '{lane}' is disconnected")]
    Disconnected {
        lane: String,
    },
}

impl ResolutionError {
    /// Creates a `ResolutionUnavailable` error.
    #[must_use]
    pub fn unavailable(record_id: Option<RecordId>, reason: impl Into<String>) -> Self {
        Self::ResolutionUnavailable {
            record_id,
            reason: reason.into(),
        }
    }
}

/// Top-level error type for the resolution core.
#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Resolution error: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("Storage error: {0}")]
    Storage(StorageError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl From<StorageError> for ResolverError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::EntityNotFound(id) => {
                Self::Resolution(ResolutionError::EntityNotFound { id })
            }
            StorageError::ReviewItemNotFound(id) => {
                Self::Resolution(ResolutionError::ReviewItemNotFound { id })
            }
            StorageError::AlreadyResolved(id) => {
                Self::Resolution(ResolutionError::AlreadyResolved { id })
            }
            StorageError::ConnectionError(reason) | StorageError::Timeout(reason) => {
                Self::Resolution(ResolutionError::unavailable(None, reason))
            }
            other => Self::Storage(other),
        }
    }
}

impl ResolverError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if a dependency was unreachable.
    #[must_use]
    pub const fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::Resolution(ResolutionError::ResolutionUnavailable { .. })
        )
    }

    /// Returns true if the target review item was already terminal.
    #[must_use]
    pub const fn is_already_resolved(&self) -> bool {
        matches!(self, Self::Resolution(ResolutionError::AlreadyResolved { .. }))
    }

    /// Returns true if an entity referenced by the operation does not exist.
    #[must_use]
    pub const fn is_entity_not_found(&self) -> bool {
        matches!(self, Self::Resolution(ResolutionError::EntityNotFound { .. }))
    }

    /// Returns true if a merge was refused because of prior merges.
    #[must_use]
    pub const fn is_merge_conflict(&self) -> bool {
        matches!(self, Self::Resolution(ResolutionError::MergeConflict { .. }))
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) => false,
            Self::Resolution(e) => matches!(
                e,
                ResolutionError::ResolutionUnavailable { .. }
                    | ResolutionError::Timeout { .. }
                    | ResolutionError::QueueFull { .. }
            ),
            Self::Storage(_) | Self::Internal { .. } => false,
        }
    }

    /// Attaches the record id to an unavailable error that was raised without one.
    #[must_use]
    pub fn for_record(self, record: RecordId) -> Self {
        match self {
            Self::Resolution(ResolutionError::ResolutionUnavailable {
                record_id: None,
                reason,
            }) => Self::Resolution(ResolutionError::ResolutionUnavailable {
                record_id: Some(record),
                reason,
            }),
            other => other,
        }
    }
}

/// Result type alias for resolution operations.
pub type ResolverResult<T> = Result<T, ResolverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_signal_message() {
        let err = ValidationError::malformed(SignalKind::Email, "missing '@'");
        let msg = format!("{err}");
        assert!(msg.contains("email"));
        assert!(msg.contains("missing '@'"));
    }

    #[test]
    fn test_already_resolved_is_not_retryable() {
        let err: ResolverError = ResolutionError::AlreadyResolved {
            id: ReviewItemId::new(),
        }
        .into();
        assert!(err.is_already_resolved());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_unavailable_is_retryable() {
        let err: ResolverError = ResolutionError::unavailable(None, "store down").into();
        assert!(err.is_unavailable());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_storage_connection_error_maps_to_unavailable() {
        let err: ResolverError = StorageError::ConnectionError("refused".to_string()).into();
        assert!(err.is_unavailable());
        let msg = format!("{err}");
        assert!(msg.contains("refused"));
    }

    #[test]
    fn test_storage_entity_not_found_maps_to_resolution() {
        let id = EntityId::new();
        let err: ResolverError = StorageError::EntityNotFound(id).into();
        assert!(err.is_entity_not_found());
    }

    #[test]
    fn test_for_record_fills_missing_record_id() {
        let record = RecordId::new();
        let err: ResolverError = ResolutionError::unavailable(None, "timeout").into();
        let err = err.for_record(record);
        let ResolverError::Resolution(ResolutionError::ResolutionUnavailable { record_id, .. }) =
            err
        else {
            panic!("expected unavailable");
        };
        assert_eq!(record_id, Some(record));
    }

    #[test]
    fn test_validation_is_not_retryable() {
        let err: ResolverError = ValidationError::InvalidConfig {
            reason: "weights".to_string(),
        }
        .into();
        assert!(err.is_validation());
        assert!(!err.is_retryable());
    }
}
