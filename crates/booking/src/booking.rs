use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use boxoffice_core::{AggregateRoot, BookingId, DomainError, DomainResult, EventId, OrganizerId, UserId};
use boxoffice_events::Event;

use crate::codes::{BookingReference, TicketCode};
use crate::commission::{CommissionRate, CommissionSplit};

/// Booking status lifecycle. `Cancelled` and `Refunded` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Confirmed,
    Cancelled,
    Refunded,
}

impl BookingStatus {
    /// Active bookings hold inventory and seats.
    pub fn is_active(self) -> bool {
        matches!(self, BookingStatus::Confirmed)
    }
}

/// Ticket type as it was at purchase time. Later repricing of the live tier
/// does not touch it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketTypeSnapshot {
    pub name: String,
    pub price: u64,
}

/// Commission figures embedded in the booking when it is confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionSnapshot {
    pub rate: CommissionRate,
    pub commission_amount: u64,
    pub organizer_amount: u64,
    pub platform_amount: u64,
}

impl From<CommissionSplit> for CommissionSnapshot {
    fn from(split: CommissionSplit) -> Self {
        Self {
            rate: split.rate,
            commission_amount: split.commission_amount,
            organizer_amount: split.organizer_amount,
            platform_amount: split.platform_amount,
        }
    }
}

/// Everything needed to confirm a booking once inventory is reserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    pub id: BookingId,
    pub reference: BookingReference,
    pub user_id: UserId,
    pub event_id: EventId,
    pub organizer_id: OrganizerId,
    pub quantity: u32,
    pub unit_price: u64,
    pub ticket_type: Option<TicketTypeSnapshot>,
    pub seats: Vec<u32>,
    pub ticket_codes: Vec<TicketCode>,
    pub commission: CommissionSplit,
    pub created_at: DateTime<Utc>,
}

/// Aggregate root: Booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    id: BookingId,
    reference: BookingReference,
    user_id: UserId,
    event_id: EventId,
    organizer_id: OrganizerId,
    quantity: u32,
    unit_price: u64,
    total_amount: u64,
    ticket_type: Option<TicketTypeSnapshot>,
    seats: Vec<u32>,
    ticket_codes: Vec<TicketCode>,
    status: BookingStatus,
    commission: CommissionSnapshot,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: u64,
}

impl Booking {
    /// Build a `confirmed` booking, validating the derived fields up front.
    pub fn confirm(new: NewBooking) -> DomainResult<Self> {
        if new.quantity == 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }

        let expected = usize::try_from(new.quantity).unwrap_or(usize::MAX);
        if new.ticket_codes.len() != expected {
            return Err(DomainError::validation(format!(
                "{} ticket codes for {} tickets",
                new.ticket_codes.len(),
                new.quantity
            )));
        }
        let distinct: BTreeSet<&TicketCode> = new.ticket_codes.iter().collect();
        if distinct.len() != new.ticket_codes.len() {
            return Err(DomainError::validation("ticket codes must be unique"));
        }

        if !new.seats.is_empty() && new.seats.len() != expected {
            return Err(DomainError::SeatCountMismatch {
                expected: new.quantity,
                actual: u32::try_from(new.seats.len()).unwrap_or(u32::MAX),
            });
        }

        if let Some(tt) = &new.ticket_type {
            if tt.price != new.unit_price {
                return Err(DomainError::validation(
                    "unit price must match the ticket type snapshot",
                ));
            }
        }

        let total_amount = new
            .unit_price
            .checked_mul(u64::from(new.quantity))
            .ok_or_else(|| DomainError::validation("booking total overflows"))?;
        if new.commission.subtotal != total_amount {
            return Err(DomainError::validation(
                "commission must be computed on the booking total",
            ));
        }

        Ok(Self {
            id: new.id,
            reference: new.reference,
            user_id: new.user_id,
            event_id: new.event_id,
            organizer_id: new.organizer_id,
            quantity: new.quantity,
            unit_price: new.unit_price,
            total_amount,
            ticket_type: new.ticket_type,
            seats: new.seats,
            ticket_codes: new.ticket_codes,
            status: BookingStatus::Confirmed,
            commission: new.commission.into(),
            created_at: new.created_at,
            updated_at: new.created_at,
            version: 0,
        })
    }

    pub fn id_typed(&self) -> BookingId {
        self.id
    }

    pub fn reference(&self) -> &BookingReference {
        &self.reference
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn organizer_id(&self) -> OrganizerId {
        self.organizer_id
    }

    pub fn quantity(&self) -> u32 {
        self.quantity
    }

    pub fn unit_price(&self) -> u64 {
        self.unit_price
    }

    pub fn total_amount(&self) -> u64 {
        self.total_amount
    }

    pub fn ticket_type(&self) -> Option<&TicketTypeSnapshot> {
        self.ticket_type.as_ref()
    }

    pub fn ticket_type_name(&self) -> Option<&str> {
        self.ticket_type.as_ref().map(|t| t.name.as_str())
    }

    pub fn seats(&self) -> &[u32] {
        &self.seats
    }

    pub fn ticket_codes(&self) -> &[TicketCode] {
        &self.ticket_codes
    }

    pub fn status(&self) -> BookingStatus {
        self.status
    }

    pub fn commission(&self) -> &CommissionSnapshot {
        &self.commission
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn confirmed_event(&self) -> BookingEvent {
        BookingEvent::BookingConfirmed(BookingConfirmed {
            booking_id: self.id,
            reference: self.reference.clone(),
            event_id: self.event_id,
            user_id: self.user_id,
            quantity: self.quantity,
            ticket_type: self.ticket_type_name().map(str::to_string),
            seats: self.seats.clone(),
            total_amount: self.total_amount,
            occurred_at: self.created_at,
        })
    }

    /// `confirmed → cancelled`.
    pub fn cancel(&mut self, at: DateTime<Utc>) -> DomainResult<BookingEvent> {
        self.close(BookingStatus::Cancelled, at)?;
        Ok(BookingEvent::BookingCancelled(self.closed(at)))
    }

    /// `confirmed → refunded`.
    pub fn refund(&mut self, at: DateTime<Utc>) -> DomainResult<BookingEvent> {
        self.close(BookingStatus::Refunded, at)?;
        Ok(BookingEvent::BookingRefunded(self.closed(at)))
    }

    /// Event emitted when an administrator removes the record outright.
    pub fn deleted_event(&self, at: DateTime<Utc>) -> BookingEvent {
        BookingEvent::BookingDeleted(self.closed(at))
    }

    fn close(&mut self, to: BookingStatus, at: DateTime<Utc>) -> DomainResult<()> {
        if self.status != BookingStatus::Confirmed {
            return Err(DomainError::invalid_transition(format!(
                "booking {} is {:?}; only confirmed bookings can become {:?}",
                self.reference, self.status, to
            )));
        }
        self.status = to;
        self.updated_at = at;
        self.version += 1;
        Ok(())
    }

    fn closed(&self, at: DateTime<Utc>) -> BookingClosed {
        BookingClosed {
            booking_id: self.id,
            event_id: self.event_id,
            quantity: self.quantity,
            ticket_type: self.ticket_type_name().map(str::to_string),
            occurred_at: at,
        }
    }
}

impl AggregateRoot for Booking {
    type Id = BookingId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Event: BookingConfirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingConfirmed {
    pub booking_id: BookingId,
    pub reference: BookingReference,
    pub event_id: EventId,
    pub user_id: UserId,
    pub quantity: u32,
    pub ticket_type: Option<String>,
    pub seats: Vec<u32>,
    pub total_amount: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Payload shared by cancellation, refund and deletion: what went back to inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingClosed {
    pub booking_id: BookingId,
    pub event_id: EventId,
    pub quantity: u32,
    pub ticket_type: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingEvent {
    BookingConfirmed(BookingConfirmed),
    BookingCancelled(BookingClosed),
    BookingRefunded(BookingClosed),
    BookingDeleted(BookingClosed),
}

impl Event for BookingEvent {
    fn event_type(&self) -> &'static str {
        match self {
            BookingEvent::BookingConfirmed(_) => "booking.confirmed",
            BookingEvent::BookingCancelled(_) => "booking.cancelled",
            BookingEvent::BookingRefunded(_) => "booking.refunded",
            BookingEvent::BookingDeleted(_) => "booking.deleted",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            BookingEvent::BookingConfirmed(e) => e.occurred_at,
            BookingEvent::BookingCancelled(e)
            | BookingEvent::BookingRefunded(e)
            | BookingEvent::BookingDeleted(e) => e.occurred_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codes::{CodeGenerator, RandomCodeGenerator};
    use crate::commission::CommissionCalculator;

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn new_booking(quantity: u32, seats: Vec<u32>) -> NewBooking {
        let g = RandomCodeGenerator;
        let price = 4_500;
        NewBooking {
            id: BookingId::new(),
            reference: g.booking_reference(),
            user_id: UserId::new(),
            event_id: EventId::new(),
            organizer_id: OrganizerId::new(),
            quantity,
            unit_price: price,
            ticket_type: Some(TicketTypeSnapshot {
                name: "GA".to_string(),
                price,
            }),
            seats,
            ticket_codes: (0..quantity).map(|_| g.ticket_code()).collect(),
            commission: CommissionCalculator::compute(
                price * u64::from(quantity),
                CommissionRate::DEFAULT,
            ),
            created_at: test_time(),
        }
    }

    #[test]
    fn confirm_computes_total_and_embeds_commission() {
        let b = Booking::confirm(new_booking(2, vec![3, 4])).unwrap();
        assert_eq!(b.status(), BookingStatus::Confirmed);
        assert_eq!(b.total_amount(), 9_000);
        assert_eq!(b.commission().commission_amount, 2_700);
        assert_eq!(b.commission().organizer_amount, 6_300);
        assert_eq!(b.ticket_type_name(), Some("GA"));
        assert_eq!(b.version(), 0);
    }

    #[test]
    fn confirm_rejects_wrong_number_of_ticket_codes() {
        let mut nb = new_booking(2, vec![]);
        nb.ticket_codes.pop();
        let err = Booking::confirm(nb).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn confirm_rejects_duplicate_ticket_codes() {
        let mut nb = new_booking(2, vec![]);
        nb.ticket_codes[1] = nb.ticket_codes[0].clone();
        match Booking::confirm(nb).unwrap_err() {
            DomainError::Validation(msg) if msg.contains("unique") => {}
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn snapshot_price_must_match_unit_price() {
        let mut nb = new_booking(1, vec![]);
        nb.unit_price += 1;
        assert!(Booking::confirm(nb).is_err());
    }

    #[test]
    fn cancel_is_terminal() {
        let mut b = Booking::confirm(new_booking(2, vec![])).unwrap();
        let event = b.cancel(test_time()).unwrap();
        assert_eq!(event.event_type(), "booking.cancelled");
        assert_eq!(b.status(), BookingStatus::Cancelled);
        assert_eq!(b.version(), 1);
        assert!(!b.is_active());

        let err = b.cancel(test_time()).unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition(_)));
        let err = b.refund(test_time()).unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition(_)));
        assert_eq!(b.version(), 1);
    }

    #[test]
    fn refund_carries_release_details() {
        let mut b = Booking::confirm(new_booking(3, vec![])).unwrap();
        match b.refund(test_time()).unwrap() {
            BookingEvent::BookingRefunded(e) => {
                assert_eq!(e.quantity, 3);
                assert_eq!(e.ticket_type.as_deref(), Some("GA"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(b.status(), BookingStatus::Refunded);
    }

    #[test]
    fn booking_round_trips_through_json() {
        let b = Booking::confirm(new_booking(1, vec![9])).unwrap();
        let json = serde_json::to_string(&b).unwrap();
        assert!(json.contains("\"status\":\"confirmed\""));
        let back: Booking = serde_json::from_str(&json).unwrap();
        assert_eq!(back, b);
    }
}
