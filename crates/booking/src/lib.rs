//! Booking domain module.
//!
//! Booking records and their status machine, human-readable codes, and the
//! organizer/platform revenue split. Pure domain logic: the write path that
//! ties bookings to inventory lives in the infrastructure crate.

pub mod booking;
pub mod codes;
pub mod commission;

pub use booking::{
    Booking, BookingClosed, BookingConfirmed, BookingEvent, BookingStatus, CommissionSnapshot,
    NewBooking, TicketTypeSnapshot,
};
pub use codes::{BookingReference, CodeGenerator, RandomCodeGenerator, TicketCode};
pub use commission::{
    Commission, CommissionCalculator, CommissionRate, CommissionSplit, CommissionStatus,
    OrganizerStats, OrganizerStatsDelta,
};
