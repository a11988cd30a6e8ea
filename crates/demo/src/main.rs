//! Scripted walk through the engine: sell an event out, queue buyers on the
//! waitlist, cancel a booking and let the freed tickets reach the queue.
//!
//! Uses in-memory stores. With `DATABASE_URL` set, inventory lives in
//! Postgres instead.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tracing::{info, warn};

use boxoffice_core::{ErrorKind, EventId, OrganizerId, TicketTypeId, UserId};
use boxoffice_infra::collaborators::RecordingNotifier;
use boxoffice_infra::store::PostgresInventoryLedger;
use boxoffice_infra::{Collaborators, CreateBooking, Engine, EngineConfig, JoinWaitlist, Stores};
use boxoffice_inventory::{NewTicketType, PublishInventory};

fn main() -> anyhow::Result<()> {
    boxoffice_observability::init();

    let config = EngineConfig::from_env();
    let notifier = Arc::new(RecordingNotifier::new());
    let collaborators = Collaborators {
        notifier: notifier.clone(),
        ..Collaborators::in_process()
    };

    let mut stores = Stores::in_memory();
    if let Ok(url) = std::env::var("DATABASE_URL") {
        let ledger = PostgresInventoryLedger::connect(&url, 4).context("connecting to Postgres")?;
        ledger.migrate().context("applying inventory schema")?;
        info!("inventory ledger backed by Postgres");
        stores = stores.with_inventory(Arc::new(ledger));
    }

    let engine = Engine::new(config, stores, collaborators);
    let background = engine.start_background().context("starting background workers")?;

    let event_id = EventId::new();
    let ga = TicketTypeId::new();
    let vip = TicketTypeId::new();
    engine.publish_inventory(PublishInventory {
        event_id,
        organizer_id: OrganizerId::new(),
        starts_at: Utc::now() + chrono::Duration::days(14),
        base_price: 0,
        total_tickets: 0,
        ticket_types: vec![
            NewTicketType {
                id: ga,
                name: "GA".to_string(),
                price: 4_500,
                quantity: 4,
            },
            NewTicketType {
                id: vip,
                name: "VIP".to_string(),
                price: 12_000,
                quantity: 2,
            },
        ],
        seat_capacity: Some(6),
    })?;

    // Sell GA out: two buyers of two seats each.
    let mut sold = Vec::new();
    for seats in [vec![1, 2], vec![3, 4]] {
        let booking = engine.bookings().create_booking(CreateBooking {
            user_id: UserId::new(),
            event_id,
            quantity: 2,
            ticket_type_id: Some(ga),
            seats,
        })?;
        info!(reference = %booking.reference(), seats = ?booking.seats(), "sold");
        sold.push(booking);
    }

    match engine.bookings().create_booking(CreateBooking {
        user_id: UserId::new(),
        event_id,
        quantity: 1,
        ticket_type_id: Some(ga),
        seats: vec![5],
    }) {
        Err(e) if e.kind() == ErrorKind::InsufficientInventory => info!(error = %e, "GA is sold out"),
        Err(e) => return Err(e.into()),
        Ok(b) => anyhow::bail!("GA should be sold out, but {} was booked", b.reference()),
    }

    let waiting: Vec<UserId> = (0..3).map(|_| UserId::new()).collect();
    for user in &waiting {
        engine.waitlist().join(JoinWaitlist {
            user_id: *user,
            event_id,
            ticket_type: Some("GA".to_string()),
            quantity: 1,
            priority: 0,
        })?;
    }
    for user in &waiting {
        let position = engine.waitlist().get_user_position(*user, event_id, Some("GA"))?;
        info!(%user, position, "waiting");
    }

    let cancelled = engine.bookings().cancel_booking(sold[0].id_typed())?;
    info!(reference = %cancelled.reference(), "cancelled; two GA tickets back on sale");

    for entry in engine.waitlist().get_event_waitlist(event_id, Some("GA"))? {
        info!(user = %entry.user_id(), status = ?entry.status(), expires_at = ?entry.expires_at(), "waitlist");
    }

    // First notified buyer redeems the offer.
    let redeemed = engine.bookings().create_booking(CreateBooking {
        user_id: waiting[0],
        event_id,
        quantity: 1,
        ticket_type_id: Some(ga),
        seats: vec![1],
    })?;
    info!(reference = %redeemed.reference(), "waitlisted buyer booked");

    // Give the outbox a moment to deliver.
    std::thread::sleep(Duration::from_millis(300));
    let inventory = engine
        .inventory(event_id)?
        .context("inventory disappeared")?;
    let summary = serde_json::json!({
        "available": inventory.available_tickets(),
        "booked_seats": engine.bookings().get_booked_seats(event_id)?,
        "notifications": notifier.sent().iter().map(|n| n.kind()).collect::<Vec<_>>(),
        "jobs": engine.job_stats()?,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    let dead = engine.dead_letters(10)?;
    if !dead.is_empty() {
        warn!(count = dead.len(), "side effects dead-lettered; requeueing");
        for entry in dead {
            engine.retry_dead_letter(entry.job.id)?;
        }
    }

    background.shutdown();
    Ok(())
}
