//! Storage boundaries for the write path.
//!
//! Each trait method is one atomic step against the backend. In particular
//! [`InventoryLedger::reserve`] is a single conditional decrement and
//! [`BookingStore::insert_guarded`] re-checks seat conflicts in the same
//! critical section that persists the booking.

pub mod in_memory;
pub mod postgres;

use std::collections::BTreeSet;
use std::sync::Arc;

use boxoffice_booking::{Booking, BookingReference, Commission, TicketCode};
use boxoffice_core::{BookingId, EventId, ExpectedVersion, OrganizerId, TicketTypeId, UserId, WaitlistEntryId};
use boxoffice_inventory::{EventInventory, Release, Reservation};
use boxoffice_waitlist::{NewWaitlistEntry, WaitlistEntry};
use chrono::{DateTime, Utc};

use crate::error::{EngineResult, StoreError};

pub use in_memory::{
    InMemoryBookingStore, InMemoryCommissionStore, InMemoryInventoryLedger, InMemoryWaitlistStore,
};
pub use postgres::PostgresInventoryLedger;

pub trait InventoryLedger: Send + Sync {
    /// Store the inventory of a newly published event. `Conflict` if it exists.
    fn publish(&self, inventory: EventInventory) -> EngineResult<()>;

    fn get(&self, event_id: EventId) -> Result<Option<EventInventory>, StoreError>;

    /// Atomically check `available >= quantity` and decrement.
    fn reserve(
        &self,
        event_id: EventId,
        ticket_type: Option<TicketTypeId>,
        quantity: u32,
    ) -> EngineResult<Reservation>;

    /// Increment the matching counter, clamped at its original quantity.
    fn release(
        &self,
        event_id: EventId,
        ticket_type_name: Option<&str>,
        quantity: u32,
    ) -> EngineResult<Release>;

    fn reprice(&self, event_id: EventId, ticket_type: TicketTypeId, price: u64) -> EngineResult<()>;
}

pub trait BookingStore: Send + Sync {
    /// Persist a new booking. Fails with `SeatAlreadyBooked` if any of its seats
    /// is held by an active booking of the same event, or `Conflict` if its
    /// reference or a ticket code is already taken.
    fn insert_guarded(&self, booking: Booking) -> EngineResult<()>;

    fn get(&self, id: BookingId) -> Result<Option<Booking>, StoreError>;

    /// Replace a booking whose stored version still equals `expected`.
    fn update(&self, booking: &Booking, expected: ExpectedVersion) -> EngineResult<()>;

    fn remove(&self, id: BookingId, expected: ExpectedVersion) -> EngineResult<Booking>;

    fn by_user(&self, user_id: UserId) -> Result<Vec<Booking>, StoreError>;

    fn by_event(&self, event_id: EventId) -> Result<Vec<Booking>, StoreError>;

    /// Seats held by active bookings of the event.
    fn held_seats(&self, event_id: EventId) -> Result<BTreeSet<u32>, StoreError>;

    fn reference_exists(&self, reference: &BookingReference) -> Result<bool, StoreError>;

    fn ticket_code_exists(&self, code: &TicketCode) -> Result<bool, StoreError>;
}

pub trait CommissionStore: Send + Sync {
    /// One commission per booking; a second insert is a `Conflict`.
    fn insert(&self, commission: Commission) -> EngineResult<()>;

    fn by_booking(&self, booking_id: BookingId) -> Result<Option<Commission>, StoreError>;

    fn by_organizer(&self, organizer_id: OrganizerId) -> Result<Vec<Commission>, StoreError>;
}

pub trait WaitlistStore: Send + Sync {
    /// Insert a `waiting` entry, assigning its advisory position in the same
    /// critical section. `Conflict` if the user already has an active entry
    /// in that queue.
    fn join(&self, new: NewWaitlistEntry) -> EngineResult<WaitlistEntry>;

    fn get(&self, id: WaitlistEntryId) -> Result<Option<WaitlistEntry>, StoreError>;

    fn update(&self, entry: &WaitlistEntry, expected: ExpectedVersion) -> EngineResult<()>;

    fn remove(&self, id: WaitlistEntryId, expected: ExpectedVersion) -> EngineResult<WaitlistEntry>;

    /// Every entry (any status) of one (event, ticket type) queue.
    fn queue(&self, event_id: EventId, ticket_type: Option<&str>) -> Result<Vec<WaitlistEntry>, StoreError>;

    fn by_event(&self, event_id: EventId) -> Result<Vec<WaitlistEntry>, StoreError>;

    fn by_user(&self, user_id: UserId) -> Result<Vec<WaitlistEntry>, StoreError>;

    /// Notified entries whose window closed at or before `now`.
    fn overdue(&self, now: DateTime<Utc>) -> Result<Vec<WaitlistEntry>, StoreError>;
}

macro_rules! forward_arc {
    ($tr:ident { $( fn $m:ident(&self $(, $a:ident : $t:ty)* ) -> $r:ty; )* }) => {
        impl<T> $tr for Arc<T>
        where
            T: $tr + ?Sized,
        {
            $(
                fn $m(&self $(, $a: $t)*) -> $r {
                    (**self).$m($($a),*)
                }
            )*
        }
    };
}

forward_arc!(InventoryLedger {
    fn publish(&self, inventory: EventInventory) -> EngineResult<()>;
    fn get(&self, event_id: EventId) -> Result<Option<EventInventory>, StoreError>;
    fn reserve(&self, event_id: EventId, ticket_type: Option<TicketTypeId>, quantity: u32) -> EngineResult<Reservation>;
    fn release(&self, event_id: EventId, ticket_type_name: Option<&str>, quantity: u32) -> EngineResult<Release>;
    fn reprice(&self, event_id: EventId, ticket_type: TicketTypeId, price: u64) -> EngineResult<()>;
});

forward_arc!(BookingStore {
    fn insert_guarded(&self, booking: Booking) -> EngineResult<()>;
    fn get(&self, id: BookingId) -> Result<Option<Booking>, StoreError>;
    fn update(&self, booking: &Booking, expected: ExpectedVersion) -> EngineResult<()>;
    fn remove(&self, id: BookingId, expected: ExpectedVersion) -> EngineResult<Booking>;
    fn by_user(&self, user_id: UserId) -> Result<Vec<Booking>, StoreError>;
    fn by_event(&self, event_id: EventId) -> Result<Vec<Booking>, StoreError>;
    fn held_seats(&self, event_id: EventId) -> Result<BTreeSet<u32>, StoreError>;
    fn reference_exists(&self, reference: &BookingReference) -> Result<bool, StoreError>;
    fn ticket_code_exists(&self, code: &TicketCode) -> Result<bool, StoreError>;
});

forward_arc!(CommissionStore {
    fn insert(&self, commission: Commission) -> EngineResult<()>;
    fn by_booking(&self, booking_id: BookingId) -> Result<Option<Commission>, StoreError>;
    fn by_organizer(&self, organizer_id: OrganizerId) -> Result<Vec<Commission>, StoreError>;
});

forward_arc!(WaitlistStore {
    fn join(&self, new: NewWaitlistEntry) -> EngineResult<WaitlistEntry>;
    fn get(&self, id: WaitlistEntryId) -> Result<Option<WaitlistEntry>, StoreError>;
    fn update(&self, entry: &WaitlistEntry, expected: ExpectedVersion) -> EngineResult<()>;
    fn remove(&self, id: WaitlistEntryId, expected: ExpectedVersion) -> EngineResult<WaitlistEntry>;
    fn queue(&self, event_id: EventId, ticket_type: Option<&str>) -> Result<Vec<WaitlistEntry>, StoreError>;
    fn by_event(&self, event_id: EventId) -> Result<Vec<WaitlistEntry>, StoreError>;
    fn by_user(&self, user_id: UserId) -> Result<Vec<WaitlistEntry>, StoreError>;
    fn overdue(&self, now: DateTime<Utc>) -> Result<Vec<WaitlistEntry>, StoreError>;
});
