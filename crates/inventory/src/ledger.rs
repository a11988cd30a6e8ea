use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use boxoffice_core::{AggregateRoot, DomainError, DomainResult, EventId, OrganizerId, TicketTypeId};
use boxoffice_events::Event;

/// A named price tier within an event, with its own capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketType {
    pub id: TicketTypeId,
    pub name: String,
    /// Price in smallest currency unit (e.g., cents).
    pub price: u64,
    /// Original capacity of this tier. `available` never exceeds it.
    pub quantity: u32,
    pub available: u32,
}

/// Ticket type as supplied when an event is published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTicketType {
    pub id: TicketTypeId,
    pub name: String,
    pub price: u64,
    pub quantity: u32,
}

/// Input for creating an inventory when an event is published.
///
/// Either `ticket_types` is non-empty, or `total_tickets` sizes a single
/// aggregate counter sold at `base_price`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishInventory {
    pub event_id: EventId,
    pub organizer_id: OrganizerId,
    pub starts_at: DateTime<Utc>,
    pub base_price: u64,
    pub total_tickets: u32,
    pub ticket_types: Vec<NewTicketType>,
    /// Number of numbered seats in the venue, if seating is assigned.
    pub seat_capacity: Option<u32>,
}

/// Per-event inventory: either one aggregate counter or a list of ticket types
/// whose sums define the aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventInventory {
    event_id: EventId,
    organizer_id: OrganizerId,
    starts_at: DateTime<Utc>,
    base_price: u64,
    seat_capacity: Option<u32>,
    ticket_types: Vec<TicketType>,
    total_tickets: u32,
    available_tickets: u32,
    version: u64,
}

/// Inventory as loaded back from storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredInventory {
    pub event_id: EventId,
    pub organizer_id: OrganizerId,
    pub starts_at: DateTime<Utc>,
    pub base_price: u64,
    pub seat_capacity: Option<u32>,
    pub ticket_types: Vec<TicketType>,
    pub total_tickets: u32,
    pub available_tickets: u32,
    pub version: u64,
}

/// Outcome of a successful reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub event_id: EventId,
    pub ticket_type_id: Option<TicketTypeId>,
    pub ticket_type_name: Option<String>,
    pub unit_price: u64,
    pub quantity: u32,
    /// What is left of the reserved counter after the decrement.
    pub remaining: u32,
}

/// Outcome of a release. `released` can be lower than requested when the
/// counter was clamped at its original quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub released: u32,
    pub available: u32,
}

impl EventInventory {
    /// Create the inventory for a freshly published event.
    pub fn publish(input: PublishInventory) -> DomainResult<Self> {
        if input.seat_capacity == Some(0) {
            return Err(DomainError::validation("seat_capacity must be positive"));
        }

        let mut ticket_types = Vec::with_capacity(input.ticket_types.len());
        for tt in input.ticket_types {
            let name = tt.name.trim().to_string();
            if name.is_empty() {
                return Err(DomainError::validation("ticket type name cannot be empty"));
            }
            if tt.quantity == 0 {
                return Err(DomainError::validation(format!(
                    "ticket type '{name}' must have a positive quantity"
                )));
            }
            if ticket_types.iter().any(|t: &TicketType| t.name == name || t.id == tt.id) {
                return Err(DomainError::validation(format!(
                    "duplicate ticket type '{name}'"
                )));
            }
            ticket_types.push(TicketType {
                id: tt.id,
                name,
                price: tt.price,
                quantity: tt.quantity,
                available: tt.quantity,
            });
        }

        if ticket_types.is_empty() && input.total_tickets == 0 {
            return Err(DomainError::validation(
                "an event needs ticket types or a positive total_tickets",
            ));
        }

        let mut inventory = Self {
            event_id: input.event_id,
            organizer_id: input.organizer_id,
            starts_at: input.starts_at,
            base_price: input.base_price,
            seat_capacity: input.seat_capacity,
            ticket_types,
            total_tickets: input.total_tickets,
            available_tickets: input.total_tickets,
            version: 0,
        };
        inventory.recompute_totals();
        Ok(inventory)
    }

    /// Rehydrate a persisted inventory, rejecting rows that break the counters.
    pub fn restore(stored: StoredInventory) -> DomainResult<Self> {
        let inventory = Self {
            event_id: stored.event_id,
            organizer_id: stored.organizer_id,
            starts_at: stored.starts_at,
            base_price: stored.base_price,
            seat_capacity: stored.seat_capacity,
            ticket_types: stored.ticket_types,
            total_tickets: stored.total_tickets,
            available_tickets: stored.available_tickets,
            version: stored.version,
        };
        inventory.check_invariants()?;
        Ok(inventory)
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn organizer_id(&self) -> OrganizerId {
        self.organizer_id
    }

    pub fn starts_at(&self) -> DateTime<Utc> {
        self.starts_at
    }

    pub fn base_price(&self) -> u64 {
        self.base_price
    }

    pub fn seat_capacity(&self) -> Option<u32> {
        self.seat_capacity
    }

    pub fn ticket_types(&self) -> &[TicketType] {
        &self.ticket_types
    }

    pub fn total_tickets(&self) -> u32 {
        self.total_tickets
    }

    pub fn available_tickets(&self) -> u32 {
        self.available_tickets
    }

    pub fn uses_ticket_types(&self) -> bool {
        !self.ticket_types.is_empty()
    }

    pub fn has_started(&self, now: DateTime<Utc>) -> bool {
        self.starts_at <= now
    }

    pub fn ticket_type(&self, id: TicketTypeId) -> Option<&TicketType> {
        self.ticket_types.iter().find(|t| t.id == id)
    }

    pub fn ticket_type_by_name(&self, name: &str) -> Option<&TicketType> {
        self.ticket_types.iter().find(|t| t.name == name)
    }

    /// Take `quantity` tickets from the matching counter.
    ///
    /// Check and decrement happen in this one call; callers must hold the
    /// record exclusively for its duration.
    pub fn reserve(
        &mut self,
        ticket_type: Option<TicketTypeId>,
        quantity: u32,
    ) -> DomainResult<Reservation> {
        if quantity == 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }

        let reservation = if self.uses_ticket_types() {
            let id = ticket_type.ok_or_else(|| {
                DomainError::validation("this event sells ticket types; one must be selected")
            })?;
            let tt = self
                .ticket_types
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(|| DomainError::not_found(format!("ticket type {id}")))?;

            if tt.available < quantity {
                return Err(DomainError::insufficient(quantity, tt.available));
            }
            tt.available -= quantity;

            Reservation {
                event_id: self.event_id,
                ticket_type_id: Some(tt.id),
                ticket_type_name: Some(tt.name.clone()),
                unit_price: tt.price,
                quantity,
                remaining: tt.available,
            }
        } else {
            if let Some(id) = ticket_type {
                return Err(DomainError::not_found(format!("ticket type {id}")));
            }
            if self.available_tickets < quantity {
                return Err(DomainError::insufficient(quantity, self.available_tickets));
            }
            self.available_tickets -= quantity;

            Reservation {
                event_id: self.event_id,
                ticket_type_id: None,
                ticket_type_name: None,
                unit_price: self.base_price,
                quantity,
                remaining: self.available_tickets,
            }
        };

        self.recompute_totals();
        self.version += 1;
        Ok(reservation)
    }

    /// Give `quantity` tickets back to the matching counter, clamped at the
    /// counter's original quantity.
    pub fn release(&mut self, ticket_type_name: Option<&str>, quantity: u32) -> DomainResult<Release> {
        if quantity == 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }

        let release = if self.uses_ticket_types() {
            let name = ticket_type_name.ok_or_else(|| {
                DomainError::validation("this event sells ticket types; a ticket type name is required")
            })?;
            let tt = self
                .ticket_types
                .iter_mut()
                .find(|t| t.name == name)
                .ok_or_else(|| DomainError::not_found(format!("ticket type '{name}'")))?;

            let before = tt.available;
            tt.available = tt.available.saturating_add(quantity).min(tt.quantity);
            Release {
                released: tt.available - before,
                available: tt.available,
            }
        } else {
            let before = self.available_tickets;
            self.available_tickets = self
                .available_tickets
                .saturating_add(quantity)
                .min(self.total_tickets);
            Release {
                released: self.available_tickets - before,
                available: self.available_tickets,
            }
        };

        self.recompute_totals();
        self.version += 1;
        Ok(release)
    }

    /// Change a tier's price. Existing bookings keep the price they snapshotted.
    pub fn reprice(&mut self, ticket_type: TicketTypeId, price: u64) -> DomainResult<()> {
        let tt = self
            .ticket_types
            .iter_mut()
            .find(|t| t.id == ticket_type)
            .ok_or_else(|| DomainError::not_found(format!("ticket type {ticket_type}")))?;
        tt.price = price;
        self.version += 1;
        Ok(())
    }

    /// Verify `0 <= available <= quantity` per tier and that aggregates equal
    /// the per-tier sums.
    pub fn check_invariants(&self) -> DomainResult<()> {
        for tt in &self.ticket_types {
            if tt.available > tt.quantity {
                return Err(DomainError::conflict(format!(
                    "ticket type '{}' has available {} above quantity {}",
                    tt.name, tt.available, tt.quantity
                )));
            }
        }
        if self.uses_ticket_types() {
            let total: u32 = self.ticket_types.iter().map(|t| t.quantity).sum();
            let available: u32 = self.ticket_types.iter().map(|t| t.available).sum();
            if total != self.total_tickets || available != self.available_tickets {
                return Err(DomainError::conflict("aggregate counters drifted from ticket types"));
            }
        } else if self.available_tickets > self.total_tickets {
            return Err(DomainError::conflict("available_tickets above total_tickets"));
        }
        Ok(())
    }

    fn recompute_totals(&mut self) {
        if self.uses_ticket_types() {
            self.total_tickets = self.ticket_types.iter().map(|t| t.quantity).sum();
            self.available_tickets = self.ticket_types.iter().map(|t| t.available).sum();
        }
    }
}

impl AggregateRoot for EventInventory {
    type Id = EventId;

    fn id(&self) -> &Self::Id {
        &self.event_id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Event: TicketsReserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketsReserved {
    pub event_id: EventId,
    pub ticket_type: Option<String>,
    pub quantity: u32,
    pub remaining: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Event: TicketsReleased.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketsReleased {
    pub event_id: EventId,
    pub ticket_type: Option<String>,
    pub released: u32,
    pub available: u32,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InventoryEvent {
    TicketsReserved(TicketsReserved),
    TicketsReleased(TicketsReleased),
}

impl Event for InventoryEvent {
    fn event_type(&self) -> &'static str {
        match self {
            InventoryEvent::TicketsReserved(_) => "inventory.tickets.reserved",
            InventoryEvent::TicketsReleased(_) => "inventory.tickets.released",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            InventoryEvent::TicketsReserved(e) => e.occurred_at,
            InventoryEvent::TicketsReleased(e) => e.occurred_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boxoffice_core::ErrorKind;
    use proptest::prelude::*;

    fn tier(name: &str, price: u64, quantity: u32) -> NewTicketType {
        NewTicketType {
            id: TicketTypeId::new(),
            name: name.to_string(),
            price,
            quantity,
        }
    }

    fn typed_event(tiers: Vec<NewTicketType>) -> EventInventory {
        EventInventory::publish(PublishInventory {
            event_id: EventId::new(),
            organizer_id: OrganizerId::new(),
            starts_at: Utc::now() + chrono::Duration::days(30),
            base_price: 0,
            total_tickets: 0,
            ticket_types: tiers,
            seat_capacity: None,
        })
        .unwrap()
    }

    fn general_admission(total: u32) -> EventInventory {
        EventInventory::publish(PublishInventory {
            event_id: EventId::new(),
            organizer_id: OrganizerId::new(),
            starts_at: Utc::now() + chrono::Duration::days(30),
            base_price: 2_500,
            total_tickets: total,
            ticket_types: vec![],
            seat_capacity: None,
        })
        .unwrap()
    }

    #[test]
    fn publish_sums_ticket_types_into_aggregate() {
        let inv = typed_event(vec![tier("VIP", 10_000, 10), tier("GA", 3_000, 90)]);
        assert_eq!(inv.total_tickets(), 100);
        assert_eq!(inv.available_tickets(), 100);
        inv.check_invariants().unwrap();
    }

    #[test]
    fn publish_rejects_duplicate_tier_names() {
        let err = EventInventory::publish(PublishInventory {
            event_id: EventId::new(),
            organizer_id: OrganizerId::new(),
            starts_at: Utc::now(),
            base_price: 0,
            total_tickets: 0,
            ticket_types: vec![tier("GA", 1, 1), tier("GA", 2, 2)],
            seat_capacity: None,
        })
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn selling_out_a_tier_then_one_more_is_insufficient() {
        let vip = tier("VIP", 10_000, 10);
        let vip_id = vip.id;
        let mut inv = typed_event(vec![vip, tier("GA", 3_000, 5)]);

        let r = inv.reserve(Some(vip_id), 10).unwrap();
        assert_eq!(r.remaining, 0);
        assert_eq!(r.ticket_type_name.as_deref(), Some("VIP"));
        assert_eq!(inv.ticket_type(vip_id).unwrap().available, 0);

        let err = inv.reserve(Some(vip_id), 1).unwrap_err();
        assert_eq!(err, DomainError::insufficient(1, 0));
        assert_eq!(inv.ticket_type(vip_id).unwrap().available, 0);
        assert_eq!(inv.available_tickets(), 5);
    }

    #[test]
    fn failed_reserve_leaves_version_untouched() {
        let mut inv = general_admission(2);
        let before = inv.version();
        assert!(inv.reserve(None, 3).is_err());
        assert_eq!(inv.version(), before);
        assert_eq!(inv.available_tickets(), 2);
    }

    #[test]
    fn typed_event_requires_a_ticket_type() {
        let mut inv = typed_event(vec![tier("GA", 3_000, 5)]);
        let err = inv.reserve(None, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = inv.reserve(Some(TicketTypeId::new()), 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn aggregate_event_decrements_directly() {
        let mut inv = general_admission(4);
        let r = inv.reserve(None, 3).unwrap();
        assert_eq!(r.unit_price, 2_500);
        assert_eq!(r.remaining, 1);
        assert_eq!(inv.available_tickets(), 1);
        assert_eq!(inv.total_tickets(), 4);
    }

    #[test]
    fn release_is_clamped_at_original_quantity() {
        let ga = tier("GA", 3_000, 5);
        let ga_id = ga.id;
        let mut inv = typed_event(vec![ga]);

        inv.reserve(Some(ga_id), 2).unwrap();
        let rel = inv.release(Some("GA"), 4).unwrap();
        assert_eq!(rel.released, 2);
        assert_eq!(rel.available, 5);
        inv.check_invariants().unwrap();
    }

    #[test]
    fn release_on_unknown_tier_is_not_found() {
        let mut inv = typed_event(vec![tier("GA", 3_000, 5)]);
        let err = inv.release(Some("Balcony"), 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn reprice_does_not_touch_counters() {
        let ga = tier("GA", 3_000, 5);
        let ga_id = ga.id;
        let mut inv = typed_event(vec![ga]);
        inv.reprice(ga_id, 4_000).unwrap();
        assert_eq!(inv.ticket_type(ga_id).unwrap().price, 4_000);
        assert_eq!(inv.ticket_type(ga_id).unwrap().available, 5);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: across any sequence of reservations and releases of what
        /// was actually reserved, `available + outstanding == quantity`.
        #[test]
        fn reserve_release_conserves_tickets(
            ops in prop::collection::vec((any::<bool>(), 1u32..6), 1..60)
        ) {
            let ga = tier("GA", 1_000, 20);
            let ga_id = ga.id;
            let mut inv = typed_event(vec![ga]);
            let mut held: Vec<u32> = Vec::new();

            for (is_reserve, qty) in ops {
                if is_reserve {
                    if inv.reserve(Some(ga_id), qty).is_ok() {
                        held.push(qty);
                    }
                } else if let Some(q) = held.pop() {
                    inv.release(Some("GA"), q).unwrap();
                }

                let outstanding: u32 = held.iter().sum();
                let tt = inv.ticket_type(ga_id).unwrap();
                prop_assert_eq!(tt.available + outstanding, tt.quantity);
                prop_assert!(inv.check_invariants().is_ok());
            }
        }
    }
}
