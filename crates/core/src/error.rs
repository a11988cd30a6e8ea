//! Domain error model.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (validation,
/// inventory, seating, state transitions). Storage failures belong to the
/// infrastructure layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Malformed input (non-positive quantity, blank names, ...).
    #[error("validation failed: {0}")]
    Validation(String),

    /// The referenced event, booking, ticket type or waitlist entry does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Not enough tickets left; `available` is the count observed at decision time.
    #[error("insufficient inventory: requested {requested}, available {available}")]
    InsufficientInventory { requested: u32, available: u32 },

    #[error("seat count mismatch: {expected} tickets requested but {actual} seats supplied")]
    SeatCountMismatch { expected: u32, actual: u32 },

    #[error("duplicate seat numbers in request: {0:?}")]
    DuplicateSeat(Vec<u32>),

    #[error("seats {seats:?} are outside the venue range 1..={capacity}")]
    SeatOutOfRange { seats: Vec<u32>, capacity: u32 },

    #[error("seats already booked: {0:?}")]
    SeatAlreadyBooked(Vec<u32>),

    /// A per-event feature toggle is switched off.
    #[error("feature disabled: {0}")]
    FeatureDisabled(String),

    /// Unique ID generation kept colliding. Fatal.
    #[error("could not generate a unique identifier after {attempts} attempts")]
    IdGenerationExhausted { attempts: u32 },

    /// A status transition is not allowed from the current state.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// A conflicting record already exists or a concurrent writer won.
    #[error("conflict: {0}")]
    Conflict(String),

    /// An external collaborator (email, QR, PDF) failed. Never fatal.
    #[error("external service error: {0}")]
    ExternalService(String),
}

/// Machine-checkable error discriminant.
///
/// `DomainError` carries the human-readable message; `ErrorKind` is what
/// callers branch on.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    InsufficientInventory,
    SeatCountMismatch,
    DuplicateSeat,
    SeatOutOfRange,
    SeatAlreadyBooked,
    FeatureDisabled,
    IdGenerationExhausted,
    InvalidTransition,
    Conflict,
    ExternalService,
    StorageUnavailable,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InsufficientInventory => "insufficient_inventory",
            ErrorKind::SeatCountMismatch => "seat_count_mismatch",
            ErrorKind::DuplicateSeat => "duplicate_seat",
            ErrorKind::SeatOutOfRange => "seat_out_of_range",
            ErrorKind::SeatAlreadyBooked => "seat_already_booked",
            ErrorKind::FeatureDisabled => "feature_disabled",
            ErrorKind::IdGenerationExhausted => "id_generation_exhausted",
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::Conflict => "conflict",
            ErrorKind::ExternalService => "external_service_error",
            ErrorKind::StorageUnavailable => "storage_unavailable",
        }
    }

    /// Fatal kinds surface to the caller as hard failures rather than
    /// business rejections.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ErrorKind::IdGenerationExhausted | ErrorKind::StorageUnavailable
        )
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn invalid_transition(msg: impl Into<String>) -> Self {
        Self::InvalidTransition(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn feature_disabled(feature: impl Into<String>) -> Self {
        Self::FeatureDisabled(feature.into())
    }

    pub fn insufficient(requested: u32, available: u32) -> Self {
        Self::InsufficientInventory {
            requested,
            available,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DomainError::Validation(_) => ErrorKind::Validation,
            DomainError::NotFound(_) => ErrorKind::NotFound,
            DomainError::InsufficientInventory { .. } => ErrorKind::InsufficientInventory,
            DomainError::SeatCountMismatch { .. } => ErrorKind::SeatCountMismatch,
            DomainError::DuplicateSeat(_) => ErrorKind::DuplicateSeat,
            DomainError::SeatOutOfRange { .. } => ErrorKind::SeatOutOfRange,
            DomainError::SeatAlreadyBooked(_) => ErrorKind::SeatAlreadyBooked,
            DomainError::FeatureDisabled(_) => ErrorKind::FeatureDisabled,
            DomainError::IdGenerationExhausted { .. } => ErrorKind::IdGenerationExhausted,
            DomainError::InvalidTransition(_) => ErrorKind::InvalidTransition,
            DomainError::Conflict(_) => ErrorKind::Conflict,
            DomainError::ExternalService(_) => ErrorKind::ExternalService,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_inventory_reports_remaining_count() {
        let err = DomainError::insufficient(3, 1);
        assert_eq!(err.kind(), ErrorKind::InsufficientInventory);
        assert_eq!(
            err.to_string(),
            "insufficient inventory: requested 3, available 1"
        );
    }

    #[test]
    fn only_id_exhaustion_and_storage_are_fatal() {
        assert!(ErrorKind::IdGenerationExhausted.is_fatal());
        assert!(ErrorKind::StorageUnavailable.is_fatal());
        assert!(!ErrorKind::SeatAlreadyBooked.is_fatal());
        assert!(!ErrorKind::ExternalService.is_fatal());
    }

    #[test]
    fn kind_serializes_as_snake_case() {
        let json = serde_json::to_string(&ErrorKind::SeatOutOfRange).unwrap();
        assert_eq!(json, "\"seat_out_of_range\"");
    }
}
