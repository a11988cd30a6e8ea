//! Infrastructure layer: storage, collaborators, side-effect outbox and the
//! booking / waitlist services that tie the domain crates together.

pub mod collaborators;
pub mod config;
pub mod error;
pub mod jobs;
pub mod publisher;
pub mod side_effects;
pub mod store;

/// Booking write path (reserve, seats, persist, side effects).
pub mod booking_factory;
/// Waitlist joins, notifications and expiry.
pub mod waitlist_queue;
/// Organizer statistics reconciliation.
pub mod statistics;
/// Background expiry of overdue waitlist notifications.
pub mod sweeper;
/// Wiring of stores, collaborators and services into one engine.
pub mod engine;

#[cfg(test)]
pub(crate) mod testing;


pub use booking_factory::{BookingFactory, CreateBooking};
pub use config::EngineConfig;
pub use engine::{BackgroundHandles, Collaborators, Engine, EngineContext, Stores};
pub use error::{EngineError, EngineResult, ExternalServiceError, StoreError};
pub use statistics::StatisticsReconciler;
pub use sweeper::{ExpirySweeper, ExpirySweeperHandle};
pub use waitlist_queue::{CleanupOutcome, JoinWaitlist, NotifyOutcome, WaitlistQueue, WaitlistView};
