use thiserror::Error;

use crate::locking::LockError;
use crate::machine::types::{FailureKind, State, TransitionResult};
use crate::storage::StorageError;

/// Errors raised by `execute`, `coordinate` and batch runs.
///
/// Validation failures are *returned* as `TransitionResult { success: false }`
/// from `validate`; only execution paths convert them into this type.
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("{message}")]
    InvalidTransition {
        from: State,
        to: State,
        message: String,
    },

    #[error("{message}")]
    PermissionDenied {
        from: State,
        to: State,
        missing: Vec<String>,
        message: String,
    },

    #[error("could not acquire lock '{key}' after {attempts} attempt(s): {source}")]
    LockAcquisition {
        key: String,
        attempts: u32,
        #[source]
        source: LockError,
    },

    #[error("{message}")]
    StateTransition {
        message: String,
        #[source]
        source: Option<StorageError>,
    },

    #[error("batch aborted at {entity_kind}#{entity_id} after {completed} completed transition(s): {message}")]
    BatchAborted {
        entity_kind: String,
        entity_id: String,
        message: String,
        completed: usize,
    },
}

/// Fieldless classification of a [`TransitionError`], for callers mapping
/// errors onto status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidTransition,
    PermissionDenied,
    LockAcquisition,
    StateTransition,
    BatchAborted,
}

impl TransitionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransitionError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            TransitionError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            TransitionError::LockAcquisition { .. } => ErrorKind::LockAcquisition,
            TransitionError::StateTransition { .. } => ErrorKind::StateTransition,
            TransitionError::BatchAborted { .. } => ErrorKind::BatchAborted,
        }
    }

    /// Convert a failed validation result into the matching error variant.
    ///
    /// Classification uses the result's [`FailureKind`], never its message.
    pub fn from_failed_result(result: &TransitionResult) -> Self {
        let message = result
            .error
            .clone()
            .unwrap_or_else(|| "Transition validation failed".to_string());

        match result.failure_kind {
            Some(FailureKind::InvalidTransition) => TransitionError::InvalidTransition {
                from: result.from_state.clone(),
                to: result.to_state.clone(),
                message,
            },
            Some(FailureKind::PermissionDenied) => TransitionError::PermissionDenied {
                from: result.from_state.clone(),
                to: result.to_state.clone(),
                missing: result.missing_permissions.clone(),
                message,
            },
            Some(FailureKind::BusinessRule) | Some(FailureKind::PreTransition) | None => {
                TransitionError::StateTransition {
                    message,
                    source: None,
                }
            }
        }
    }

    /// Wrap a storage fault, keeping the original cause for diagnostics.
    pub fn storage(message: impl Into<String>, source: StorageError) -> Self {
        TransitionError::StateTransition {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn missing_permissions(&self) -> &[String] {
        match self {
            TransitionError::PermissionDenied { missing, .. } => missing,
            _ => &[],
        }
    }
}
