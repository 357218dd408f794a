//! Reconciliation error taxonomy

use thiserror::Error;

use crate::store::StoreError;

/// Errors that abort a single reconcile invocation.
///
/// None of these leave partial writes behind: translation and serialization
/// fail before anything is written, and store failures abort before the
/// status step.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Malformed ClusterIngress content
    #[error("Invalid ClusterIngress spec: {0}")]
    InvalidSpec(String),
    /// Gateway configuration could not be encoded
    #[error("Failed to serialize gateway configuration: {0}")]
    SerializationFailed(String),
    /// Reading from the object store failed
    #[error("Object store unavailable: {0}")]
    BackendUnavailable(String),
    /// Optimistic-concurrency clash on write
    #[error("Conflicting write: {0}")]
    Conflict(String),
}

impl ReconcileError {
    /// Map a failed read. Callers handle `NotFound` themselves before this.
    pub fn from_read(err: StoreError) -> Self {
        Self::BackendUnavailable(err.to_string())
    }

    /// Map a failed write. Anything that a fresh read would resolve is a
    /// conflict; transport failures stay backend errors.
    pub fn from_write(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { .. }
            | StoreError::AlreadyExists { .. }
            | StoreError::NotFound { .. } => Self::Conflict(err.to_string()),
            StoreError::Backend(_) => Self::BackendUnavailable(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_conflicts() {
        let err = ReconcileError::from_write(StoreError::Conflict {
            kind: "Service",
            name: "ambassador/hello".to_string(),
            message: "the object has been modified".to_string(),
        });
        assert!(matches!(err, ReconcileError::Conflict(_)));

        let err = ReconcileError::from_write(StoreError::AlreadyExists {
            kind: "Service",
            name: "ambassador/hello".to_string(),
        });
        assert!(matches!(err, ReconcileError::Conflict(_)));
    }

    #[test]
    fn test_write_backend_failure() {
        let err = ReconcileError::from_write(StoreError::Backend("connection reset".to_string()));
        assert!(matches!(err, ReconcileError::BackendUnavailable(_)));
        assert_eq!(
            err.to_string(),
            "Object store unavailable: Object store request failed: connection reset"
        );
    }

    #[test]
    fn test_read_failure() {
        let err = ReconcileError::from_read(StoreError::Backend("timeout".to_string()));
        assert!(matches!(err, ReconcileError::BackendUnavailable(_)));
    }
}
