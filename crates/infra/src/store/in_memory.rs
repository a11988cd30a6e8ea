//! In-memory stores for tests/dev and single-process deployments.
//!
//! Every mutation runs under the store's write lock, which is what makes
//! check-then-write sequences atomic here.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use tracing::debug;

use boxoffice_booking::{Booking, BookingReference, Commission, TicketCode};
use boxoffice_core::{
    AggregateRoot, BookingId, CommissionId, DomainError, EventId, ExpectedVersion, OrganizerId,
    TicketTypeId, UserId, WaitlistEntryId,
};
use boxoffice_inventory::{EventInventory, Release, Reservation, SeatAllocator};
use boxoffice_waitlist::{NewWaitlistEntry, WaitlistEntry, insert_position};

use super::{BookingStore, CommissionStore, InventoryLedger, WaitlistStore};
use crate::error::{EngineResult, StoreError};

#[derive(Debug, Default)]
pub struct InMemoryInventoryLedger {
    events: RwLock<HashMap<EventId, EventInventory>>,
}

impl InMemoryInventoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutate<T>(
        &self,
        event_id: EventId,
        f: impl FnOnce(&mut EventInventory) -> Result<T, DomainError>,
    ) -> EngineResult<T> {
        let mut events = self
            .events
            .write()
            .map_err(|_| StoreError::Poisoned("inventory"))?;
        let inventory = events
            .get_mut(&event_id)
            .ok_or_else(|| DomainError::not_found(format!("event {event_id}")))?;
        // Work on a copy so a failed step leaves the stored record untouched.
        let mut next = inventory.clone();
        let out = f(&mut next)?;
        *inventory = next;
        Ok(out)
    }
}

impl InventoryLedger for InMemoryInventoryLedger {
    fn publish(&self, inventory: EventInventory) -> EngineResult<()> {
        let mut events = self
            .events
            .write()
            .map_err(|_| StoreError::Poisoned("inventory"))?;
        let event_id = inventory.event_id();
        if events.contains_key(&event_id) {
            return Err(DomainError::conflict(format!("inventory for event {event_id} already exists")).into());
        }
        events.insert(event_id, inventory);
        Ok(())
    }

    fn get(&self, event_id: EventId) -> Result<Option<EventInventory>, StoreError> {
        let events = self
            .events
            .read()
            .map_err(|_| StoreError::Poisoned("inventory"))?;
        Ok(events.get(&event_id).cloned())
    }

    fn reserve(
        &self,
        event_id: EventId,
        ticket_type: Option<TicketTypeId>,
        quantity: u32,
    ) -> EngineResult<Reservation> {
        self.mutate(event_id, |inv| inv.reserve(ticket_type, quantity))
    }

    fn release(
        &self,
        event_id: EventId,
        ticket_type_name: Option<&str>,
        quantity: u32,
    ) -> EngineResult<Release> {
        self.mutate(event_id, |inv| inv.release(ticket_type_name, quantity))
    }

    fn reprice(&self, event_id: EventId, ticket_type: TicketTypeId, price: u64) -> EngineResult<()> {
        self.mutate(event_id, |inv| inv.reprice(ticket_type, price))
    }
}

#[derive(Debug, Default)]
struct BookingTables {
    rows: HashMap<BookingId, Booking>,
    references: HashSet<BookingReference>,
    ticket_codes: HashSet<TicketCode>,
}

#[derive(Debug, Default)]
pub struct InMemoryBookingStore {
    tables: RwLock<BookingTables>,
}

impl InMemoryBookingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn held(rows: &HashMap<BookingId, Booking>, event_id: EventId) -> BTreeSet<u32> {
        rows.values()
            .filter(|b| b.event_id() == event_id && b.is_active())
            .flat_map(|b| b.seats().iter().copied())
            .collect()
    }
}

impl BookingStore for InMemoryBookingStore {
    fn insert_guarded(&self, booking: Booking) -> EngineResult<()> {
        let mut t = self
            .tables
            .write()
            .map_err(|_| StoreError::Poisoned("bookings"))?;

        if t.rows.contains_key(&booking.id_typed()) {
            return Err(DomainError::conflict(format!("booking {} already exists", booking.id_typed())).into());
        }
        if t.references.contains(booking.reference()) {
            return Err(DomainError::conflict(format!("booking reference {} is taken", booking.reference())).into());
        }
        if let Some(code) = booking.ticket_codes().iter().find(|c| t.ticket_codes.contains(*c)) {
            return Err(DomainError::conflict(format!("ticket code {code} is taken")).into());
        }
        if !booking.seats().is_empty() {
            let taken = SeatAllocator::conflicts(booking.seats(), &Self::held(&t.rows, booking.event_id()));
            if !taken.is_empty() {
                debug!(booking = %booking.reference(), seats = ?taken, "seat conflict at insert");
                return Err(DomainError::SeatAlreadyBooked(taken).into());
            }
        }

        t.references.insert(booking.reference().clone());
        t.ticket_codes.extend(booking.ticket_codes().iter().cloned());
        t.rows.insert(booking.id_typed(), booking);
        Ok(())
    }

    fn get(&self, id: BookingId) -> Result<Option<Booking>, StoreError> {
        let t = self.tables.read().map_err(|_| StoreError::Poisoned("bookings"))?;
        Ok(t.rows.get(&id).cloned())
    }

    fn update(&self, booking: &Booking, expected: ExpectedVersion) -> EngineResult<()> {
        let mut t = self
            .tables
            .write()
            .map_err(|_| StoreError::Poisoned("bookings"))?;
        let current = t
            .rows
            .get_mut(&booking.id_typed())
            .ok_or_else(|| DomainError::not_found(format!("booking {}", booking.id_typed())))?;
        expected.check(current.version())?;
        *current = booking.clone();
        Ok(())
    }

    fn remove(&self, id: BookingId, expected: ExpectedVersion) -> EngineResult<Booking> {
        let mut t = self
            .tables
            .write()
            .map_err(|_| StoreError::Poisoned("bookings"))?;
        let current = t
            .rows
            .get(&id)
            .ok_or_else(|| DomainError::not_found(format!("booking {id}")))?;
        expected.check(current.version())?;

        let removed = t
            .rows
            .remove(&id)
            .ok_or_else(|| DomainError::not_found(format!("booking {id}")))?;
        t.references.remove(removed.reference());
        for code in removed.ticket_codes() {
            t.ticket_codes.remove(code);
        }
        Ok(removed)
    }

    fn by_user(&self, user_id: UserId) -> Result<Vec<Booking>, StoreError> {
        let t = self.tables.read().map_err(|_| StoreError::Poisoned("bookings"))?;
        Ok(t.rows.values().filter(|b| b.user_id() == user_id).cloned().collect())
    }

    fn by_event(&self, event_id: EventId) -> Result<Vec<Booking>, StoreError> {
        let t = self.tables.read().map_err(|_| StoreError::Poisoned("bookings"))?;
        Ok(t.rows.values().filter(|b| b.event_id() == event_id).cloned().collect())
    }

    fn held_seats(&self, event_id: EventId) -> Result<BTreeSet<u32>, StoreError> {
        let t = self.tables.read().map_err(|_| StoreError::Poisoned("bookings"))?;
        Ok(Self::held(&t.rows, event_id))
    }

    fn reference_exists(&self, reference: &BookingReference) -> Result<bool, StoreError> {
        let t = self.tables.read().map_err(|_| StoreError::Poisoned("bookings"))?;
        Ok(t.references.contains(reference))
    }

    fn ticket_code_exists(&self, code: &TicketCode) -> Result<bool, StoreError> {
        let t = self.tables.read().map_err(|_| StoreError::Poisoned("bookings"))?;
        Ok(t.ticket_codes.contains(code))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCommissionStore {
    rows: RwLock<HashMap<CommissionId, Commission>>,
}

impl InMemoryCommissionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CommissionStore for InMemoryCommissionStore {
    fn insert(&self, commission: Commission) -> EngineResult<()> {
        let mut rows = self
            .rows
            .write()
            .map_err(|_| StoreError::Poisoned("commissions"))?;
        if rows.values().any(|c| c.booking_id == commission.booking_id) {
            return Err(DomainError::conflict(format!(
                "booking {} already has a commission",
                commission.booking_id
            ))
            .into());
        }
        rows.insert(commission.id, commission);
        Ok(())
    }

    fn by_booking(&self, booking_id: BookingId) -> Result<Option<Commission>, StoreError> {
        let rows = self.rows.read().map_err(|_| StoreError::Poisoned("commissions"))?;
        Ok(rows.values().find(|c| c.booking_id == booking_id).cloned())
    }

    fn by_organizer(&self, organizer_id: OrganizerId) -> Result<Vec<Commission>, StoreError> {
        let rows = self.rows.read().map_err(|_| StoreError::Poisoned("commissions"))?;
        let mut out: Vec<Commission> = rows
            .values()
            .filter(|c| c.organizer_id == organizer_id)
            .cloned()
            .collect();
        out.sort_by_key(|c| c.created_at);
        Ok(out)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryWaitlistStore {
    rows: RwLock<HashMap<WaitlistEntryId, WaitlistEntry>>,
}

impl InMemoryWaitlistStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WaitlistStore for InMemoryWaitlistStore {
    fn join(&self, mut new: NewWaitlistEntry) -> EngineResult<WaitlistEntry> {
        let mut rows = self
            .rows
            .write()
            .map_err(|_| StoreError::Poisoned("waitlist"))?;

        let queue: Vec<&WaitlistEntry> = rows
            .values()
            .filter(|e| e.in_queue(new.event_id, new.ticket_type.as_deref()))
            .collect();
        if queue.iter().any(|e| e.user_id() == new.user_id && e.is_active()) {
            return Err(DomainError::conflict("user is already on this waitlist").into());
        }
        new.position = insert_position(queue);

        let entry = WaitlistEntry::join(new)?;
        rows.insert(entry.id_typed(), entry.clone());
        Ok(entry)
    }

    fn get(&self, id: WaitlistEntryId) -> Result<Option<WaitlistEntry>, StoreError> {
        let rows = self.rows.read().map_err(|_| StoreError::Poisoned("waitlist"))?;
        Ok(rows.get(&id).cloned())
    }

    fn update(&self, entry: &WaitlistEntry, expected: ExpectedVersion) -> EngineResult<()> {
        let mut rows = self
            .rows
            .write()
            .map_err(|_| StoreError::Poisoned("waitlist"))?;
        let current = rows
            .get_mut(&entry.id_typed())
            .ok_or_else(|| DomainError::not_found(format!("waitlist entry {}", entry.id_typed())))?;
        expected.check(current.version())?;
        *current = entry.clone();
        Ok(())
    }

    fn remove(&self, id: WaitlistEntryId, expected: ExpectedVersion) -> EngineResult<WaitlistEntry> {
        let mut rows = self
            .rows
            .write()
            .map_err(|_| StoreError::Poisoned("waitlist"))?;
        let current = rows
            .get(&id)
            .ok_or_else(|| DomainError::not_found(format!("waitlist entry {id}")))?;
        expected.check(current.version())?;
        rows.remove(&id)
            .ok_or_else(|| DomainError::not_found(format!("waitlist entry {id}")).into())
    }

    fn queue(&self, event_id: EventId, ticket_type: Option<&str>) -> Result<Vec<WaitlistEntry>, StoreError> {
        let rows = self.rows.read().map_err(|_| StoreError::Poisoned("waitlist"))?;
        Ok(rows
            .values()
            .filter(|e| e.in_queue(event_id, ticket_type))
            .cloned()
            .collect())
    }

    fn by_event(&self, event_id: EventId) -> Result<Vec<WaitlistEntry>, StoreError> {
        let rows = self.rows.read().map_err(|_| StoreError::Poisoned("waitlist"))?;
        Ok(rows.values().filter(|e| e.event_id() == event_id).cloned().collect())
    }

    fn by_user(&self, user_id: UserId) -> Result<Vec<WaitlistEntry>, StoreError> {
        let rows = self.rows.read().map_err(|_| StoreError::Poisoned("waitlist"))?;
        Ok(rows.values().filter(|e| e.user_id() == user_id).cloned().collect())
    }

    fn overdue(&self, now: DateTime<Utc>) -> Result<Vec<WaitlistEntry>, StoreError> {
        let rows = self.rows.read().map_err(|_| StoreError::Poisoned("waitlist"))?;
        Ok(rows.values().filter(|e| e.is_overdue(now)).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boxoffice_booking::{
        CodeGenerator, CommissionCalculator, CommissionRate, NewBooking, RandomCodeGenerator,
    };
    use boxoffice_core::ErrorKind;
    use boxoffice_inventory::{NewTicketType, PublishInventory};

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn booking(event_id: EventId, seats: Vec<u32>) -> Booking {
        let g = RandomCodeGenerator;
        let quantity = u32::try_from(seats.len()).unwrap().max(1);
        Booking::confirm(NewBooking {
            id: BookingId::new(),
            reference: g.booking_reference(),
            user_id: UserId::new(),
            event_id,
            organizer_id: OrganizerId::new(),
            quantity,
            unit_price: 1_000,
            ticket_type: None,
            seats,
            ticket_codes: (0..quantity).map(|_| g.ticket_code()).collect(),
            commission: CommissionCalculator::compute(1_000 * u64::from(quantity), CommissionRate::DEFAULT),
            created_at: test_time(),
        })
        .unwrap()
    }

    #[test]
    fn failed_reserve_does_not_touch_stored_inventory() {
        let ledger = InMemoryInventoryLedger::new();
        let ga = NewTicketType {
            id: TicketTypeId::new(),
            name: "GA".to_string(),
            price: 1_000,
            quantity: 2,
        };
        let ga_id = ga.id;
        let inv = EventInventory::publish(PublishInventory {
            event_id: EventId::new(),
            organizer_id: OrganizerId::new(),
            starts_at: test_time(),
            base_price: 0,
            total_tickets: 0,
            ticket_types: vec![ga],
            seat_capacity: None,
        })
        .unwrap();
        let ev = inv.event_id();
        ledger.publish(inv).unwrap();

        let err = ledger.reserve(ev, Some(ga_id), 3).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientInventory);
        assert_eq!(ledger.get(ev).unwrap().unwrap().available_tickets(), 2);

        let err = ledger.reserve(EventId::new(), None, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn insert_guarded_rejects_held_seats() {
        let store = InMemoryBookingStore::new();
        let ev = EventId::new();
        store.insert_guarded(booking(ev, vec![1, 2])).unwrap();

        let err = store.insert_guarded(booking(ev, vec![2, 3])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SeatAlreadyBooked);

        // Different event, same seat numbers: fine.
        store.insert_guarded(booking(EventId::new(), vec![2, 3])).unwrap();
        assert_eq!(store.held_seats(ev).unwrap().into_iter().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn cancelled_bookings_free_their_seats() {
        let store = InMemoryBookingStore::new();
        let ev = EventId::new();
        let mut b = booking(ev, vec![5]);
        store.insert_guarded(b.clone()).unwrap();

        b.cancel(test_time()).unwrap();
        store.update(&b, ExpectedVersion::Exact(0)).unwrap();
        assert!(store.held_seats(ev).unwrap().is_empty());
        store.insert_guarded(booking(ev, vec![5])).unwrap();
    }

    #[test]
    fn stale_update_is_a_conflict() {
        let store = InMemoryBookingStore::new();
        let mut b = booking(EventId::new(), vec![]);
        store.insert_guarded(b.clone()).unwrap();
        b.cancel(test_time()).unwrap();
        store.update(&b, ExpectedVersion::Exact(0)).unwrap();

        let err = store.update(&b, ExpectedVersion::Exact(0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn second_commission_for_a_booking_conflicts() {
        let store = InMemoryCommissionStore::new();
        let b = booking(EventId::new(), vec![]);
        let make = || {
            Commission::new(
                CommissionId::new(),
                b.id_typed(),
                b.event_id(),
                b.organizer_id(),
                1_000,
                1,
                CommissionCalculator::compute(1_000, CommissionRate::DEFAULT),
                test_time(),
            )
        };
        store.insert(make()).unwrap();
        assert_eq!(store.insert(make()).unwrap_err().kind(), ErrorKind::Conflict);
    }

    #[test]
    fn waitlist_join_assigns_positions_and_blocks_duplicates() {
        let store = InMemoryWaitlistStore::new();
        let ev = EventId::new();
        let user = UserId::new();
        let new = |user_id| NewWaitlistEntry {
            id: WaitlistEntryId::new(),
            user_id,
            event_id: ev,
            ticket_type: Some("GA".to_string()),
            quantity: 1,
            priority: 0,
            position: 0,
            created_at: test_time(),
        };

        assert_eq!(store.join(new(user)).unwrap().stored_position(), 1);
        assert_eq!(store.join(new(UserId::new())).unwrap().stored_position(), 2);

        let err = store.join(new(user)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }
}
