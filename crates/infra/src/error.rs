//! Infrastructure error model.
//!
//! Domain rejections pass through untouched as [`EngineError::Domain`];
//! anything the storage backend throws becomes [`EngineError::Store`], which
//! callers see as the fatal `storage_unavailable` kind.

use thiserror::Error;

use boxoffice_core::{DomainError, ErrorKind};

/// Storage-level failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A writer panicked while holding an in-memory lock.
    #[error("lock poisoned: {0}")]
    Poisoned(&'static str),

    #[error("backend error in {operation}: {message}")]
    Backend {
        operation: &'static str,
        message: String,
    },
}

/// Error returned by every engine operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Domain(e) => e.kind(),
            EngineError::Store(_) => ErrorKind::StorageUnavailable,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind().is_fatal()
    }

    pub fn as_domain(&self) -> Option<&DomainError> {
        match self {
            EngineError::Domain(e) => Some(e),
            EngineError::Store(_) => None,
        }
    }
}

/// Failure reported by an external collaborator (email, QR, PDF, config lookups).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{service} failed: {message}")]
pub struct ExternalServiceError {
    pub service: &'static str,
    pub message: String,
}

impl ExternalServiceError {
    pub fn new(service: &'static str, message: impl Into<String>) -> Self {
        Self {
            service,
            message: message.into(),
        }
    }
}

impl From<ExternalServiceError> for DomainError {
    fn from(err: ExternalServiceError) -> Self {
        DomainError::ExternalService(err.to_string())
    }
}

impl From<ExternalServiceError> for EngineError {
    fn from(err: ExternalServiceError) -> Self {
        EngineError::Domain(err.into())
    }
}
