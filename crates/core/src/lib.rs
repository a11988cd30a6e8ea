//! `boxoffice-core`: shared building blocks for the ticketing engine.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the error taxonomy, and optimistic versioning helpers.

pub mod aggregate;
pub mod error;
pub mod id;

pub use aggregate::{AggregateRoot, ExpectedVersion};
pub use error::{DomainError, DomainResult, ErrorKind};
pub use id::{BookingId, CommissionId, EventId, OrganizerId, TicketTypeId, UserId, WaitlistEntryId};
