//! Booking write path: reserve, validate seats, persist, then side effects.
//!
//! A reservation is taken first and given back if any later step of the
//! request fails. Commission, statistics, emails and QR codes happen only
//! after the booking row is committed and can never undo it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use boxoffice_booking::{
    Booking, BookingEvent, BookingReference, CodeGenerator, Commission, CommissionCalculator,
    CommissionRate, CommissionSplit, NewBooking, TicketCode, TicketTypeSnapshot,
};
use boxoffice_core::{
    AggregateRoot, BookingId, CommissionId, DomainError, DomainResult, ErrorKind, EventId,
    ExpectedVersion, OrganizerId, TicketTypeId, UserId,
};
use boxoffice_inventory::{
    EventInventory, InventoryEvent, Reservation, SeatAllocator, TicketsReleased, TicketsReserved,
};

use crate::collaborators::{FeatureFlags, SystemSettings, TicketDocument};
use crate::engine::{EngineContext, publish_inventory_event};
use crate::error::{EngineResult, StoreError};
use crate::side_effects::SideEffect;
use crate::waitlist_queue::WaitlistQueue;

/// Request to buy tickets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateBooking {
    pub user_id: UserId,
    pub event_id: EventId,
    pub quantity: u32,
    /// Required for events sold by ticket type.
    pub ticket_type_id: Option<TicketTypeId>,
    /// Seat numbers, one per ticket. Ignored for events without seat capacity.
    pub seats: Vec<u32>,
}

#[derive(Clone)]
pub struct BookingFactory {
    ctx: Arc<EngineContext>,
    waitlist: WaitlistQueue,
}

impl core::fmt::Debug for BookingFactory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BookingFactory").finish_non_exhaustive()
    }
}

impl BookingFactory {
    pub fn new(ctx: Arc<EngineContext>, waitlist: WaitlistQueue) -> Self {
        Self { ctx, waitlist }
    }

    pub fn create_booking(&self, req: CreateBooking) -> EngineResult<Booking> {
        if req.quantity == 0 {
            return Err(DomainError::validation("quantity must be positive").into());
        }

        let settings = self.ctx.collaborators.system.get()?;
        if let Some(max) = settings.max_tickets_per_booking {
            if req.quantity > max {
                return Err(DomainError::validation(format!(
                    "at most {max} tickets per booking, requested {}",
                    req.quantity
                ))
                .into());
            }
        }

        let flags = self.ctx.collaborators.toggles.get(req.event_id)?;
        if !flags.ticketing {
            return Err(DomainError::feature_disabled("ticketing").into());
        }

        let inventory = self
            .ctx
            .stores
            .inventory
            .get(req.event_id)?
            .ok_or_else(|| DomainError::not_found(format!("event {}", req.event_id)))?;

        let now = self.ctx.collaborators.clock.now();
        let reservation = self
            .ctx
            .stores
            .inventory
            .reserve(req.event_id, req.ticket_type_id, req.quantity)?;
        debug!(
            event_id = %req.event_id,
            ticket_type = ?reservation.ticket_type_name,
            quantity = req.quantity,
            remaining = reservation.remaining,
            "tickets reserved"
        );
        publish_inventory_event(
            &self.ctx,
            &InventoryEvent::TicketsReserved(TicketsReserved {
                event_id: req.event_id,
                ticket_type: reservation.ticket_type_name.clone(),
                quantity: reservation.quantity,
                remaining: reservation.remaining,
                occurred_at: now,
            }),
        );

        let booking = match self.persist(&req, &inventory, &reservation, now) {
            Ok(booking) => booking,
            Err(err) => {
                self.roll_back(&reservation, now);
                return Err(err);
            }
        };
        info!(
            booking_id = %booking.id_typed(),
            reference = %booking.reference(),
            event_id = %booking.event_id(),
            quantity = booking.quantity(),
            total = booking.total_amount(),
            "booking confirmed"
        );

        self.after_commit(&booking, flags, settings);
        Ok(booking)
    }

    /// `confirmed → cancelled`, returning the tickets to inventory.
    pub fn cancel_booking(&self, id: BookingId) -> EngineResult<Booking> {
        self.close(id, |booking, at| booking.cancel(at))
    }

    /// `confirmed → refunded`, returning the tickets to inventory.
    pub fn refund_booking(&self, id: BookingId) -> EngineResult<Booking> {
        self.close(id, |booking, at| booking.refund(at))
    }

    /// Remove the record outright. An active booking's tickets go back to
    /// inventory after the removal commits; if that release fails the record
    /// is put back.
    pub fn delete_booking(&self, id: BookingId) -> EngineResult<Booking> {
        let now = self.ctx.collaborators.clock.now();
        let booking = self.get_booking(id)?;
        let removed = self
            .ctx
            .stores
            .bookings
            .remove(id, ExpectedVersion::Exact(booking.version()))?;

        if removed.is_active() {
            if let Err(e) = self.release_tickets(&removed, now) {
                match self.ctx.stores.bookings.insert_guarded(removed.clone()) {
                    Ok(()) => warn!(booking_id = %id, "booking restored after failed release"),
                    Err(restore) => error!(
                        booking_id = %id,
                        error = %restore,
                        "deleted booking could not be restored; its tickets were not released"
                    ),
                }
                return Err(e);
            }
        }
        info!(booking_id = %id, reference = %removed.reference(), "booking deleted");
        self.publish(&removed.deleted_event(now));

        if removed.is_active() {
            self.offer_to_waitlist(&removed);
        }
        Ok(removed)
    }

    /// Seats held by active bookings of the event, ascending.
    pub fn get_booked_seats(&self, event_id: EventId) -> Result<Vec<u32>, StoreError> {
        Ok(self.ctx.stores.bookings.held_seats(event_id)?.into_iter().collect())
    }

    pub fn get_booking(&self, id: BookingId) -> EngineResult<Booking> {
        self.ctx
            .stores
            .bookings
            .get(id)?
            .ok_or_else(|| DomainError::not_found(format!("booking {id}")).into())
    }

    /// The user's bookings, newest first.
    pub fn get_user_bookings(&self, user_id: UserId) -> Result<Vec<Booking>, StoreError> {
        let mut bookings = self.ctx.stores.bookings.by_user(user_id)?;
        bookings.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
        Ok(bookings)
    }

    /// Everything between a successful reservation and a committed booking.
    fn persist(
        &self,
        req: &CreateBooking,
        inventory: &EventInventory,
        reservation: &Reservation,
        now: DateTime<Utc>,
    ) -> EngineResult<Booking> {
        let capacity = inventory.seat_capacity();
        let seats = if SeatAllocator::applies(capacity, &req.seats) {
            let held = self.ctx.stores.bookings.held_seats(req.event_id)?;
            SeatAllocator::validate(capacity, &req.seats, req.quantity, &held)?;
            req.seats.clone()
        } else {
            if !req.seats.is_empty() {
                debug!(event_id = %req.event_id, "event has no seat capacity; seats ignored");
            }
            Vec::new()
        };

        let subtotal = reservation
            .unit_price
            .checked_mul(u64::from(req.quantity))
            .ok_or_else(|| DomainError::validation("booking total overflows"))?;
        let split = CommissionCalculator::compute(subtotal, self.commission_rate(inventory.organizer_id()));
        let ticket_type = reservation.ticket_type_name.clone().map(|name| TicketTypeSnapshot {
            name,
            price: reservation.unit_price,
        });

        // Candidate codes are checked against the store, and the insert
        // rejects any that a concurrent booking claimed in between.
        let attempts = self.ctx.config.max_id_attempts;
        for attempt in 1..=attempts {
            let Some((reference, ticket_codes)) = self.draw_codes(req.quantity)? else {
                debug!(attempt, "generated code already in use; drawing again");
                continue;
            };
            let booking = Booking::confirm(NewBooking {
                id: BookingId::new(),
                reference,
                user_id: req.user_id,
                event_id: req.event_id,
                organizer_id: inventory.organizer_id(),
                quantity: req.quantity,
                unit_price: reservation.unit_price,
                ticket_type: ticket_type.clone(),
                seats: seats.clone(),
                ticket_codes,
                commission: split,
                created_at: now,
            })?;
            match self.ctx.stores.bookings.insert_guarded(booking.clone()) {
                Ok(()) => return Ok(booking),
                Err(e) if e.kind() == ErrorKind::Conflict => {
                    debug!(attempt, error = %e, "booking codes claimed concurrently; drawing again");
                }
                Err(e) => return Err(e),
            }
        }
        error!(event_id = %req.event_id, attempts, "could not generate unique booking codes");
        Err(DomainError::IdGenerationExhausted { attempts }.into())
    }

    /// One reference plus `quantity` ticket codes, or `None` on any collision.
    fn draw_codes(&self, quantity: u32) -> EngineResult<Option<(BookingReference, Vec<TicketCode>)>> {
        let codes = &self.ctx.collaborators.codes;
        let bookings = &self.ctx.stores.bookings;

        let reference = codes.booking_reference();
        if bookings.reference_exists(&reference)? {
            return Ok(None);
        }
        let mut ticket_codes: Vec<TicketCode> = Vec::with_capacity(quantity as usize);
        for _ in 0..quantity {
            let code = codes.ticket_code();
            if ticket_codes.contains(&code) || bookings.ticket_code_exists(&code)? {
                return Ok(None);
            }
            ticket_codes.push(code);
        }
        Ok(Some((reference, ticket_codes)))
    }

    /// Subscription rate, or the configured default. A failed lookup falls
    /// back to the default rather than failing the booking.
    fn commission_rate(&self, organizer: OrganizerId) -> CommissionRate {
        match self.ctx.collaborators.subscriptions.commission_rate(organizer) {
            Ok(Some(rate)) => rate,
            Ok(None) => self.ctx.config.default_commission_rate,
            Err(e) => {
                warn!(%organizer, error = %e, "subscription lookup failed; using default commission rate");
                self.ctx.config.default_commission_rate
            }
        }
    }

    fn roll_back(&self, reservation: &Reservation, now: DateTime<Utc>) {
        let event_id = reservation.event_id;
        match self.ctx.stores.inventory.release(
            event_id,
            reservation.ticket_type_name.as_deref(),
            reservation.quantity,
        ) {
            Ok(release) => {
                debug!(%event_id, released = release.released, "reservation rolled back");
                publish_inventory_event(
                    &self.ctx,
                    &InventoryEvent::TicketsReleased(TicketsReleased {
                        event_id,
                        ticket_type: reservation.ticket_type_name.clone(),
                        released: release.released,
                        available: release.available,
                        occurred_at: now,
                    }),
                );
            }
            Err(e) => {
                error!(%event_id, quantity = reservation.quantity, error = %e, "failed to roll back reservation");
            }
        }
    }

    /// Best-effort work once the booking is committed.
    fn after_commit(&self, booking: &Booking, flags: FeatureFlags, settings: SystemSettings) {
        let snapshot = booking.commission();
        let commission = Commission::new(
            CommissionId::new(),
            booking.id_typed(),
            booking.event_id(),
            booking.organizer_id(),
            booking.unit_price(),
            booking.quantity(),
            CommissionSplit {
                rate: snapshot.rate,
                subtotal: booking.total_amount(),
                commission_amount: snapshot.commission_amount,
                organizer_amount: snapshot.organizer_amount,
                platform_amount: snapshot.platform_amount,
            },
            booking.created_at(),
        );
        match self.ctx.stores.commissions.insert(commission.clone()) {
            Ok(()) => {
                debug!(
                    booking_id = %booking.id_typed(),
                    rate = %commission.rate,
                    commission = commission.commission_amount,
                    "commission recorded"
                );
                self.ctx.outbox.enqueue(SideEffect::OrganizerStats {
                    delta: commission.stats_delta(),
                });
            }
            Err(e) => {
                warn!(booking_id = %booking.id_typed(), error = %e, "failed to record commission");
            }
        }

        if flags.email_sms {
            let ticket_type = booking.ticket_type_name().map(str::to_string);
            let tickets = booking
                .ticket_codes()
                .iter()
                .enumerate()
                .map(|(i, code)| TicketDocument {
                    booking_reference: booking.reference().to_string(),
                    ticket_code: code.to_string(),
                    ticket_type: ticket_type.clone(),
                    seat: booking.seats().get(i).copied(),
                })
                .collect();
            self.ctx.outbox.enqueue(SideEffect::BookingConfirmation {
                booking_id: booking.id_typed(),
                user_id: booking.user_id(),
                event_id: booking.event_id(),
                booking_reference: booking.reference().to_string(),
                quantity: booking.quantity(),
                total_amount: booking.total_amount(),
                tickets,
            });
        }
        if flags.qr_check_in && settings.qr_code_enabled {
            self.ctx.outbox.enqueue(SideEffect::TicketQrCodes {
                booking_reference: booking.reference().to_string(),
                ticket_codes: booking.ticket_codes().iter().map(ToString::to_string).collect(),
            });
        }

        self.publish(&booking.confirmed_event());

        match self
            .waitlist
            .convert(booking.user_id(), booking.event_id(), booking.ticket_type_name())
        {
            Ok(Some(entry)) => {
                debug!(booking_id = %booking.id_typed(), entry_id = %entry.id_typed(), "waitlist notification redeemed");
            }
            Ok(None) => {}
            Err(e) => {
                warn!(booking_id = %booking.id_typed(), error = %e, "failed to convert waitlist entry");
            }
        }
    }

    /// Status change and release form one unit: if the release fails the
    /// booking is reopened at its previous version.
    fn close(
        &self,
        id: BookingId,
        transition: impl FnOnce(&mut Booking, DateTime<Utc>) -> DomainResult<BookingEvent>,
    ) -> EngineResult<Booking> {
        let now = self.ctx.collaborators.clock.now();
        let original = self.get_booking(id)?;
        let mut booking = original.clone();
        let event = transition(&mut booking, now)?;
        self.ctx
            .stores
            .bookings
            .update(&booking, ExpectedVersion::Exact(original.version()))?;

        if let Err(e) = self.release_tickets(&booking, now) {
            match self
                .ctx
                .stores
                .bookings
                .update(&original, ExpectedVersion::Exact(booking.version()))
            {
                Ok(()) => warn!(booking_id = %id, "booking reopened after failed release"),
                Err(restore) => error!(
                    booking_id = %id,
                    error = %restore,
                    "closed booking could not be reopened; its tickets were not released"
                ),
            }
            return Err(e);
        }
        info!(booking_id = %id, status = ?booking.status(), "booking closed");
        self.publish(&event);

        self.offer_to_waitlist(&booking);
        Ok(booking)
    }

    /// Return a closing booking's tickets to inventory.
    fn release_tickets(&self, booking: &Booking, now: DateTime<Utc>) -> EngineResult<()> {
        let event_id = booking.event_id();
        let ticket_type = booking.ticket_type_name();
        let release = self
            .ctx
            .stores
            .inventory
            .release(event_id, ticket_type, booking.quantity())
            .inspect_err(|e| {
                error!(
                    booking_id = %booking.id_typed(),
                    %event_id,
                    quantity = booking.quantity(),
                    error = %e,
                    "failed to release tickets of a closing booking"
                );
            })?;
        info!(%event_id, ?ticket_type, released = release.released, available = release.available, "tickets released");
        publish_inventory_event(
            &self.ctx,
            &InventoryEvent::TicketsReleased(TicketsReleased {
                event_id,
                ticket_type: ticket_type.map(str::to_string),
                released: release.released,
                available: release.available,
                occurred_at: now,
            }),
        );
        Ok(())
    }

    /// Best effort: a failure here never undoes the release.
    fn offer_to_waitlist(&self, booking: &Booking) {
        let event_id = booking.event_id();
        match self
            .waitlist
            .notify_next_in_line(event_id, booking.ticket_type_name(), booking.quantity())
        {
            Ok(outcome) if outcome.notified_count > 0 => {
                debug!(%event_id, notified = outcome.notified_count, "waitlist notified of released tickets");
            }
            Ok(_) => {}
            Err(e) => warn!(%event_id, error = %e, "waitlist notification failed"),
        }
    }

    fn publish(&self, event: &BookingEvent) {
        let (event_id, booking_id) = match event {
            BookingEvent::BookingConfirmed(e) => (e.event_id, e.booking_id),
            BookingEvent::BookingCancelled(e)
            | BookingEvent::BookingRefunded(e)
            | BookingEvent::BookingDeleted(e) => (e.event_id, e.booking_id),
        };
        self.ctx
            .publisher
            .publish(event_id, "booking", *booking_id.as_uuid(), event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{FeatureToggles, SubscriptionDirectory, SystemConfig};
    use crate::engine::Stores;
    use crate::error::ExternalServiceError;
    use crate::store::{InMemoryInventoryLedger, InventoryLedger};
    use boxoffice_inventory::Release;
    use std::sync::atomic::{AtomicU32, Ordering};
    use crate::testing::Fixture;
    use crate::waitlist_queue::JoinWaitlist;
    use boxoffice_booking::{BookingStatus, RandomCodeGenerator};
    use boxoffice_waitlist::WaitlistStatus;

    fn request(f: &Fixture, event_id: EventId, name: &str, quantity: u32, seats: Vec<u32>) -> CreateBooking {
        CreateBooking {
            user_id: UserId::new(),
            event_id,
            quantity,
            ticket_type_id: Some(f.ticket_type_id(event_id, name)),
            seats,
        }
    }

    #[test]
    fn sold_out_ticket_type_rejects_further_bookings() {
        let f = Fixture::new();
        let event_id = f.publish_typed(&[("VIP", 10_000, 10)], None);
        let bookings = f.engine.bookings();

        let booking = bookings.create_booking(request(&f, event_id, "VIP", 10, vec![])).unwrap();
        assert_eq!(booking.status(), BookingStatus::Confirmed);
        assert_eq!(booking.total_amount(), 100_000);
        assert_eq!(f.available(event_id, Some("VIP")), 0);

        let err = bookings.create_booking(request(&f, event_id, "VIP", 1, vec![])).unwrap_err();
        assert_eq!(
            err.as_domain(),
            Some(&DomainError::InsufficientInventory { requested: 1, available: 0 })
        );
        assert_eq!(f.available(event_id, Some("VIP")), 0);
    }

    #[test]
    fn seat_failures_give_the_reservation_back() {
        let f = Fixture::new();
        let event_id = f.publish_typed(&[("GA", 2_000, 10)], Some(50));
        let bookings = f.engine.bookings();
        bookings.create_booking(request(&f, event_id, "GA", 2, vec![3, 4])).unwrap();
        assert_eq!(f.available(event_id, Some("GA")), 8);

        let cases = [
            (vec![4, 5], ErrorKind::SeatAlreadyBooked),
            (vec![5], ErrorKind::SeatCountMismatch),
            (vec![6, 6], ErrorKind::DuplicateSeat),
            (vec![6, 51], ErrorKind::SeatOutOfRange),
        ];
        for (seats, kind) in cases {
            let err = bookings.create_booking(request(&f, event_id, "GA", 2, seats)).unwrap_err();
            assert_eq!(err.kind(), kind);
            assert_eq!(f.available(event_id, Some("GA")), 8);
        }
        assert_eq!(bookings.get_booked_seats(event_id).unwrap(), vec![3, 4]);
    }

    #[test]
    fn seats_are_ignored_without_seat_capacity() {
        let f = Fixture::new();
        let event_id = f.publish_untyped(10, 1_500, None);
        let booking = f
            .engine
            .bookings()
            .create_booking(CreateBooking {
                user_id: UserId::new(),
                event_id,
                quantity: 2,
                ticket_type_id: None,
                seats: vec![1, 1],
            })
            .unwrap();
        assert!(booking.seats().is_empty());
        assert_eq!(booking.ticket_type(), None);
        assert_eq!(booking.unit_price(), 1_500);
    }

    #[test]
    fn request_checks_run_before_reserving() {
        let f = Fixture::new();
        let event_id = f.publish_typed(&[("GA", 2_000, 10)], None);
        let bookings = f.engine.bookings();

        let err = bookings.create_booking(request(&f, event_id, "GA", 0, vec![])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        f.system.set(SystemSettings {
            max_tickets_per_booking: Some(4),
            qr_code_enabled: true,
        });
        let err = bookings.create_booking(request(&f, event_id, "GA", 5, vec![])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        f.toggles.set(
            event_id,
            FeatureFlags {
                ticketing: false,
                ..FeatureFlags::default()
            },
        );
        let err = bookings.create_booking(request(&f, event_id, "GA", 1, vec![])).unwrap_err();
        assert_eq!(err.as_domain(), Some(&DomainError::FeatureDisabled("ticketing".to_string())));

        let err = bookings
            .create_booking(CreateBooking {
                user_id: UserId::new(),
                event_id: EventId::new(),
                quantity: 1,
                ticket_type_id: None,
                seats: vec![],
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(f.available(event_id, Some("GA")), 10);
    }

    struct BrokenToggles;

    impl FeatureToggles for BrokenToggles {
        fn get(&self, _event_id: EventId) -> Result<FeatureFlags, ExternalServiceError> {
            Err(ExternalServiceError::new("feature_toggles", "connection refused"))
        }
    }

    struct BrokenSystemConfig;

    impl SystemConfig for BrokenSystemConfig {
        fn get(&self) -> Result<SystemSettings, ExternalServiceError> {
            Err(ExternalServiceError::new("system_config", "timeout"))
        }
    }

    #[test]
    fn failed_config_lookups_reject_the_request() {
        let f = Fixture::customized(Default::default(), |c| c.toggles = Arc::new(BrokenToggles));
        let event_id = f.publish_typed(&[("GA", 2_000, 10)], None);
        let err = f.engine.bookings().create_booking(request(&f, event_id, "GA", 1, vec![])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExternalService);
        assert_eq!(f.available(event_id, Some("GA")), 10);

        let f = Fixture::customized(Default::default(), |c| c.system = Arc::new(BrokenSystemConfig));
        let event_id = f.publish_typed(&[("GA", 2_000, 10)], None);
        let err = f.engine.bookings().create_booking(request(&f, event_id, "GA", 1, vec![])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExternalService);
    }

    /// Always proposes the same booking reference.
    struct StuckReferences;

    impl CodeGenerator for StuckReferences {
        fn booking_reference(&self) -> BookingReference {
            "BK-AAAAAAAA".parse().unwrap()
        }

        fn ticket_code(&self) -> TicketCode {
            RandomCodeGenerator.ticket_code()
        }
    }

    #[test]
    fn exhausted_code_generation_is_fatal_and_rolls_back() {
        let f = Fixture::customized(Default::default(), |c| c.codes = Arc::new(StuckReferences));
        let event_id = f.publish_typed(&[("GA", 2_000, 10)], None);
        let bookings = f.engine.bookings();

        let first = bookings.create_booking(request(&f, event_id, "GA", 1, vec![])).unwrap();
        assert_eq!(first.reference().as_str(), "BK-AAAAAAAA");

        let err = bookings.create_booking(request(&f, event_id, "GA", 1, vec![])).unwrap_err();
        assert_eq!(err.as_domain(), Some(&DomainError::IdGenerationExhausted { attempts: 5 }));
        assert!(err.is_fatal());
        assert_eq!(f.available(event_id, Some("GA")), 9);
    }

    #[test]
    fn cancelling_releases_once_and_notifies_the_waitlist() {
        let f = Fixture::new();
        let event_id = f.publish_typed(&[("GA", 2_000, 2)], None);
        let bookings = f.engine.bookings();
        let booking = bookings.create_booking(request(&f, event_id, "GA", 2, vec![])).unwrap();

        let waiting = UserId::new();
        f.engine
            .waitlist()
            .join(JoinWaitlist {
                user_id: waiting,
                event_id,
                ticket_type: Some("GA".to_string()),
                quantity: 2,
                priority: 0,
            })
            .unwrap();

        let cancelled = bookings.cancel_booking(booking.id_typed()).unwrap();
        assert_eq!(cancelled.status(), BookingStatus::Cancelled);
        assert_eq!(f.available(event_id, Some("GA")), 2);
        let queue = f.engine.waitlist().get_event_waitlist(event_id, Some("GA")).unwrap();
        assert_eq!(queue[0].status(), WaitlistStatus::Notified);

        let err = bookings.cancel_booking(booking.id_typed()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
        let err = bookings.refund_booking(booking.id_typed()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
        assert_eq!(f.available(event_id, Some("GA")), 2);
    }

    #[test]
    fn refund_and_delete_return_tickets() {
        let f = Fixture::new();
        let event_id = f.publish_typed(&[("GA", 2_000, 10)], Some(20));
        let bookings = f.engine.bookings();

        let refunded = bookings.create_booking(request(&f, event_id, "GA", 3, vec![1, 2, 3])).unwrap();
        let deleted = bookings.create_booking(request(&f, event_id, "GA", 2, vec![4, 5])).unwrap();
        assert_eq!(f.available(event_id, Some("GA")), 5);

        let r = bookings.refund_booking(refunded.id_typed()).unwrap();
        assert_eq!(r.status(), BookingStatus::Refunded);
        assert_eq!(f.available(event_id, Some("GA")), 8);
        assert_eq!(bookings.get_booked_seats(event_id).unwrap(), vec![4, 5]);

        bookings.delete_booking(deleted.id_typed()).unwrap();
        assert_eq!(f.available(event_id, Some("GA")), 10);
        assert!(bookings.get_booked_seats(event_id).unwrap().is_empty());
        assert_eq!(
            bookings.get_booking(deleted.id_typed()).unwrap_err().kind(),
            ErrorKind::NotFound
        );

        // A closed booking's tickets were already returned.
        bookings.delete_booking(refunded.id_typed()).unwrap();
        assert_eq!(f.available(event_id, Some("GA")), 10);
    }

    /// Ledger whose next `failures` releases report the backend as down.
    #[derive(Default)]
    struct FlakyReleases {
        inner: InMemoryInventoryLedger,
        failures: AtomicU32,
    }

    impl InventoryLedger for FlakyReleases {
        fn publish(&self, inventory: EventInventory) -> EngineResult<()> {
            self.inner.publish(inventory)
        }

        fn get(&self, event_id: EventId) -> Result<Option<EventInventory>, StoreError> {
            self.inner.get(event_id)
        }

        fn reserve(&self, event_id: EventId, ticket_type: Option<TicketTypeId>, quantity: u32) -> EngineResult<Reservation> {
            self.inner.reserve(event_id, ticket_type, quantity)
        }

        fn release(&self, event_id: EventId, ticket_type_name: Option<&str>, quantity: u32) -> EngineResult<Release> {
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(StoreError::Unavailable("inventory backend down".to_string()).into());
            }
            self.inner.release(event_id, ticket_type_name, quantity)
        }

        fn reprice(&self, event_id: EventId, ticket_type: TicketTypeId, price: u64) -> EngineResult<()> {
            self.inner.reprice(event_id, ticket_type, price)
        }
    }

    #[test]
    fn failed_release_keeps_the_booking_open_for_a_retry() {
        let ledger = Arc::new(FlakyReleases::default());
        let f = Fixture::with_stores(Stores::in_memory().with_inventory(ledger.clone()));
        let event_id = f.publish_typed(&[("GA", 2_000, 10)], Some(20));
        let bookings = f.engine.bookings();
        let booking = bookings.create_booking(request(&f, event_id, "GA", 2, vec![3, 4])).unwrap();
        f.engine
            .waitlist()
            .join(JoinWaitlist {
                user_id: UserId::new(),
                event_id,
                ticket_type: Some("GA".to_string()),
                quantity: 1,
                priority: 0,
            })
            .unwrap();

        ledger.failures.store(1, Ordering::SeqCst);
        let err = bookings.cancel_booking(booking.id_typed()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StorageUnavailable);

        let stored = bookings.get_booking(booking.id_typed()).unwrap();
        assert_eq!(stored.status(), BookingStatus::Confirmed);
        assert_eq!(stored.version(), booking.version());
        assert_eq!(bookings.get_booked_seats(event_id).unwrap(), vec![3, 4]);
        assert_eq!(f.available(event_id, Some("GA")), 8);
        let queue = f.engine.waitlist().get_event_waitlist(event_id, Some("GA")).unwrap();
        assert_eq!(queue[0].status(), WaitlistStatus::Waiting);

        let cancelled = bookings.cancel_booking(booking.id_typed()).unwrap();
        assert_eq!(cancelled.status(), BookingStatus::Cancelled);
        assert_eq!(f.available(event_id, Some("GA")), 10);
        let queue = f.engine.waitlist().get_event_waitlist(event_id, Some("GA")).unwrap();
        assert_eq!(queue[0].status(), WaitlistStatus::Notified);
    }

    #[test]
    fn failed_release_on_refund_or_delete_restores_the_booking() {
        let ledger = Arc::new(FlakyReleases::default());
        let f = Fixture::with_stores(Stores::in_memory().with_inventory(ledger.clone()));
        let event_id = f.publish_typed(&[("GA", 2_000, 10)], None);
        let bookings = f.engine.bookings();
        let refunded = bookings.create_booking(request(&f, event_id, "GA", 3, vec![])).unwrap();
        let deleted = bookings.create_booking(request(&f, event_id, "GA", 2, vec![])).unwrap();

        ledger.failures.store(2, Ordering::SeqCst);
        assert_eq!(
            bookings.refund_booking(refunded.id_typed()).unwrap_err().kind(),
            ErrorKind::StorageUnavailable
        );
        assert_eq!(
            bookings.delete_booking(deleted.id_typed()).unwrap_err().kind(),
            ErrorKind::StorageUnavailable
        );
        assert_eq!(bookings.get_booking(refunded.id_typed()).unwrap().status(), BookingStatus::Confirmed);
        assert_eq!(bookings.get_booking(deleted.id_typed()).unwrap(), deleted);
        assert_eq!(f.available(event_id, Some("GA")), 5);

        bookings.refund_booking(refunded.id_typed()).unwrap();
        bookings.delete_booking(deleted.id_typed()).unwrap();
        assert_eq!(f.available(event_id, Some("GA")), 10);
    }

    #[test]
    fn repricing_a_tier_leaves_sold_bookings_untouched() {
        let f = Fixture::new();
        let event_id = f.publish_typed(&[("GA", 2_000, 10)], None);
        let ga = f.ticket_type_id(event_id, "GA");
        let bookings = f.engine.bookings();
        let sold = bookings.create_booking(request(&f, event_id, "GA", 2, vec![])).unwrap();

        f.engine.reprice_ticket_type(event_id, ga, 3_500).unwrap();
        assert_eq!(f.engine.inventory(event_id).unwrap().unwrap().ticket_type(ga).unwrap().price, 3_500);

        let stored = bookings.get_booking(sold.id_typed()).unwrap();
        assert_eq!(stored.ticket_type().unwrap().price, 2_000);
        assert_eq!(stored.total_amount(), 4_000);
        assert_eq!(stored.commission(), sold.commission());
        let commission = f.stores.commissions.by_booking(sold.id_typed()).unwrap().unwrap();
        assert_eq!((commission.ticket_price, commission.subtotal), (2_000, 4_000));

        let later = bookings.create_booking(request(&f, event_id, "GA", 1, vec![])).unwrap();
        assert_eq!(later.ticket_type().unwrap().price, 3_500);
        assert_eq!(later.total_amount(), 3_500);

        let err = f.engine.reprice_ticket_type(event_id, TicketTypeId::new(), 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn commission_uses_the_subscription_rate_and_feeds_statistics() {
        let f = Fixture::new();
        f.subscriptions
            .subscribe(f.organizer, CommissionRate::from_basis_points(1_000).unwrap());
        let event_id = f.publish_typed(&[("GA", 2_500, 10)], None);

        let booking = f
            .engine
            .bookings()
            .create_booking(request(&f, event_id, "GA", 4, vec![]))
            .unwrap();
        assert_eq!(booking.commission().commission_amount, 1_000);
        assert_eq!(booking.commission().organizer_amount, 9_000);

        let commission = f.stores.commissions.by_booking(booking.id_typed()).unwrap().unwrap();
        assert_eq!(commission.commission_amount + commission.organizer_amount, commission.subtotal);

        f.engine.run_side_effects(10);
        let stats = f.subscriptions.stats(f.organizer).unwrap().unwrap();
        assert_eq!(stats.tickets_sold, 4);
        assert_eq!(stats.total_revenue, 10_000);
        assert_eq!(stats.net_payout, 9_000);
    }

    #[test]
    fn side_effects_follow_their_toggles() {
        let f = Fixture::new();
        let event_id = f.publish_typed(&[("GA", 2_000, 10)], None);
        let bookings = f.engine.bookings();

        bookings.create_booking(request(&f, event_id, "GA", 2, vec![])).unwrap();
        f.engine.run_side_effects(10);
        assert_eq!(f.notifier.sent_of_kind("booking_confirmation").len(), 1);
        assert_eq!(f.qr.generated().len(), 2);

        f.toggles.set(
            event_id,
            FeatureFlags {
                email_sms: false,
                ..FeatureFlags::default()
            },
        );
        f.system.set(SystemSettings {
            max_tickets_per_booking: None,
            qr_code_enabled: false,
        });
        bookings.create_booking(request(&f, event_id, "GA", 2, vec![])).unwrap();
        f.engine.run_side_effects(10);
        assert_eq!(f.notifier.sent_of_kind("booking_confirmation").len(), 1);
        assert_eq!(f.qr.generated().len(), 2);
    }

    #[test]
    fn booking_redeems_an_open_waitlist_notification() {
        let f = Fixture::new();
        let event_id = f.publish_typed(&[("GA", 2_000, 1)], None);
        let bookings = f.engine.bookings();
        let first = bookings.create_booking(request(&f, event_id, "GA", 1, vec![])).unwrap();

        let user = UserId::new();
        f.engine
            .waitlist()
            .join(JoinWaitlist {
                user_id: user,
                event_id,
                ticket_type: Some("GA".to_string()),
                quantity: 1,
                priority: 0,
            })
            .unwrap();
        bookings.cancel_booking(first.id_typed()).unwrap();

        let mut req = request(&f, event_id, "GA", 1, vec![]);
        req.user_id = user;
        bookings.create_booking(req).unwrap();

        let mine = f.engine.waitlist().get_my_waitlist(user).unwrap();
        assert_eq!(mine[0].entry.status(), WaitlistStatus::Converted);
    }

    #[test]
    fn user_bookings_are_newest_first() {
        let f = Fixture::new();
        let event_id = f.publish_typed(&[("GA", 2_000, 10)], None);
        let user = UserId::new();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let mut req = request(&f, event_id, "GA", 1, vec![]);
            req.user_id = user;
            ids.push(f.engine.bookings().create_booking(req).unwrap().id_typed());
            f.clock.advance(chrono::Duration::minutes(1));
        }
        let listed: Vec<BookingId> = f
            .engine
            .bookings()
            .get_user_bookings(user)
            .unwrap()
            .iter()
            .map(Booking::id_typed)
            .collect();
        ids.reverse();
        assert_eq!(listed, ids);
    }
}
