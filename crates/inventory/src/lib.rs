//! Ticket inventory domain module.
//!
//! Business rules for per-event capacity and numbered seating, implemented
//! purely as deterministic domain logic (no IO, no storage). Atomicity of a
//! reservation is the storage layer's job: it must run [`EventInventory::reserve`]
//! under the same lock / guarded update that persists the result.

pub mod ledger;
pub mod seats;

pub use ledger::{
    EventInventory, InventoryEvent, NewTicketType, PublishInventory, Release, Reservation,
    StoredInventory, TicketType, TicketsReleased, TicketsReserved,
};
pub use seats::SeatAllocator;
