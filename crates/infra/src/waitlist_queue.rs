//! Waitlist service: joins, departures, notifications and expiry.
//!
//! Positions handed out here are always recomputed from the queue ordering;
//! the stored position only seeds the order of equal-priority entries.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use boxoffice_core::{
    AggregateRoot, DomainError, ErrorKind, EventId, ExpectedVersion, UserId, WaitlistEntryId,
};
use boxoffice_inventory::EventInventory;
use boxoffice_waitlist::{
    NewWaitlistEntry, WaitlistEntry, WaitlistEvent, WaitlistStatus, next_in_line, position_of,
    queue_cmp,
};

use crate::engine::EngineContext;
use crate::error::{EngineError, EngineResult, StoreError};
use crate::side_effects::SideEffect;

/// Request to join a waitlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinWaitlist {
    pub user_id: UserId,
    pub event_id: EventId,
    /// Required for events sold by ticket type; must be `None` otherwise.
    pub ticket_type: Option<String>,
    pub quantity: u32,
    pub priority: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct NotifyOutcome {
    pub notified_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CleanupOutcome {
    pub expired_count: usize,
}

/// An entry together with its live position (waiting entries only).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitlistView {
    pub entry: WaitlistEntry,
    pub position: Option<u32>,
}

#[derive(Clone)]
pub struct WaitlistQueue {
    ctx: Arc<EngineContext>,
}

impl core::fmt::Debug for WaitlistQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WaitlistQueue").finish_non_exhaustive()
    }
}

impl WaitlistQueue {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Add a `waiting` entry for a future event.
    pub fn join(&self, req: JoinWaitlist) -> EngineResult<WaitlistEntry> {
        if req.quantity == 0 {
            return Err(DomainError::validation("quantity must be positive").into());
        }
        let now = self.ctx.collaborators.clock.now();
        let inventory = self
            .ctx
            .stores
            .inventory
            .get(req.event_id)?
            .ok_or_else(|| DomainError::not_found(format!("event {}", req.event_id)))?;
        if inventory.has_started(now) {
            return Err(DomainError::validation(format!(
                "event {} has already started",
                req.event_id
            ))
            .into());
        }
        let ticket_type = queue_name(&inventory, req.ticket_type.as_deref())?;

        let entry = self.ctx.stores.waitlist.join(NewWaitlistEntry {
            id: WaitlistEntryId::new(),
            user_id: req.user_id,
            event_id: req.event_id,
            ticket_type,
            quantity: req.quantity,
            priority: req.priority,
            position: 0,
            created_at: now,
        })?;
        let position = self
            .live_position(&entry)
            .ok()
            .flatten()
            .unwrap_or(entry.stored_position());
        info!(
            entry_id = %entry.id_typed(),
            event_id = %entry.event_id(),
            ticket_type = ?entry.ticket_type(),
            position,
            "joined waitlist"
        );
        self.publish(&entry.joined_event());

        if self.ctx.side_effect_flags(entry.event_id()).is_some_and(|f| f.email_sms) {
            self.ctx.outbox.enqueue(SideEffect::WaitlistJoined {
                user_id: entry.user_id(),
                event_id: entry.event_id(),
                ticket_type: entry.ticket_type().map(str::to_string),
                position,
            });
        }
        Ok(entry)
    }

    /// Remove the caller's own `waiting` or `notified` entry.
    pub fn leave(&self, entry_id: WaitlistEntryId, user_id: UserId) -> EngineResult<()> {
        let now = self.ctx.collaborators.clock.now();
        let entry = self
            .ctx
            .stores
            .waitlist
            .get(entry_id)?
            .ok_or_else(|| DomainError::not_found(format!("waitlist entry {entry_id}")))?;
        let event = entry.leave(user_id, now)?;
        self.ctx
            .stores
            .waitlist
            .remove(entry_id, ExpectedVersion::Exact(entry.version()))?;
        info!(%entry_id, event_id = %entry.event_id(), "left waitlist");
        self.publish(&event);
        Ok(())
    }

    /// Up to `limit` waiting entries of one queue, in queue order.
    pub fn get_next_in_line(
        &self,
        event_id: EventId,
        ticket_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<WaitlistEntry>, StoreError> {
        let queue = self.ctx.stores.waitlist.queue(event_id, ticket_type)?;
        Ok(next_in_line(&queue, limit).into_iter().cloned().collect())
    }

    /// Offer `available` freed tickets to the head of the queue.
    ///
    /// Overdue notifications are expired first. Entries picked by the
    /// configured [`boxoffice_waitlist::NotifyPolicy`] move to `notified` with a
    /// window of `notification_expiry_hours`. An entry changed concurrently is
    /// skipped.
    pub fn notify_next_in_line(
        &self,
        event_id: EventId,
        ticket_type: Option<&str>,
        available: u32,
    ) -> EngineResult<NotifyOutcome> {
        self.cleanup_expired()?;
        if available == 0 {
            return Ok(NotifyOutcome::default());
        }

        let now = self.ctx.collaborators.clock.now();
        let window = self.ctx.config.notification_window();
        let queue = self.ctx.stores.waitlist.queue(event_id, ticket_type)?;
        let selected: Vec<WaitlistEntry> = self
            .ctx
            .config
            .notify_policy
            .select(&queue, available)
            .into_iter()
            .cloned()
            .collect();
        let email = self.ctx.side_effect_flags(event_id).is_some_and(|f| f.email_sms);

        let mut outcome = NotifyOutcome::default();
        for mut entry in selected {
            let expected = ExpectedVersion::Exact(entry.version());
            let event = entry.notify(now, window)?;
            if !self.write_if_unchanged(&entry, expected)? {
                continue;
            }
            outcome.notified_count += 1;
            info!(
                entry_id = %entry.id_typed(),
                %event_id,
                ticket_type = ?entry.ticket_type(),
                expires_at = ?entry.expires_at(),
                "waitlist entry notified"
            );
            self.publish(&event);

            if email {
                if let Some(expires_at) = entry.expires_at() {
                    self.ctx.outbox.enqueue(SideEffect::WaitlistAvailable {
                        user_id: entry.user_id(),
                        event_id,
                        ticket_type: entry.ticket_type().map(str::to_string),
                        quantity: entry.quantity(),
                        expires_at,
                    });
                }
            }
        }
        Ok(outcome)
    }

    /// Live position of the user's waiting entry in one queue.
    pub fn get_user_position(
        &self,
        user_id: UserId,
        event_id: EventId,
        ticket_type: Option<&str>,
    ) -> EngineResult<u32> {
        let queue = self.ctx.stores.waitlist.queue(event_id, ticket_type)?;
        let not_waiting = || DomainError::not_found(format!("waiting entry for user {user_id}"));
        let entry = queue
            .iter()
            .find(|e| e.user_id() == user_id && e.status() == WaitlistStatus::Waiting)
            .ok_or_else(not_waiting)?;
        position_of(&queue, entry).ok_or_else(|| not_waiting().into())
    }

    /// Expire every notified entry whose window has closed.
    pub fn cleanup_expired(&self) -> EngineResult<CleanupOutcome> {
        let now = self.ctx.collaborators.clock.now();
        let overdue = self.ctx.stores.waitlist.overdue(now)?;

        let mut outcome = CleanupOutcome::default();
        for mut entry in overdue {
            let expected = ExpectedVersion::Exact(entry.version());
            let Ok(event) = entry.expire(now) else {
                continue;
            };
            if !self.write_if_unchanged(&entry, expected)? {
                continue;
            }
            outcome.expired_count += 1;
            debug!(entry_id = %entry.id_typed(), event_id = %entry.event_id(), "waitlist entry expired");
            self.publish(&event);
        }
        if outcome.expired_count > 0 {
            info!(expired = outcome.expired_count, "expired overdue waitlist notifications");
        }
        Ok(outcome)
    }

    /// Every entry of the user, with live positions for waiting ones.
    pub fn get_my_waitlist(&self, user_id: UserId) -> EngineResult<Vec<WaitlistView>> {
        let mut entries = self.ctx.stores.waitlist.by_user(user_id)?;
        entries.sort_by(|a, b| a.created_at().cmp(&b.created_at()));

        let mut views = Vec::with_capacity(entries.len());
        for entry in entries {
            let position = self.live_position(&entry)?;
            views.push(WaitlistView { entry, position });
        }
        Ok(views)
    }

    /// Entries of one queue in queue order. With `ticket_type == None`, every
    /// queue of the event, grouped by ticket type.
    pub fn get_event_waitlist(
        &self,
        event_id: EventId,
        ticket_type: Option<&str>,
    ) -> Result<Vec<WaitlistEntry>, StoreError> {
        let entries = match ticket_type {
            Some(name) => self.ctx.stores.waitlist.queue(event_id, Some(name))?,
            None => self.ctx.stores.waitlist.by_event(event_id)?,
        };
        let mut ordered = entries;
        ordered.sort_by(|a, b| a.ticket_type().cmp(&b.ticket_type()).then_with(|| queue_cmp(a, b)));
        Ok(ordered)
    }

    /// `notified → converted` for the user's entry in this queue, if any.
    ///
    /// Returns `None` when the user has no open notification (never notified,
    /// or the window has already closed).
    pub fn convert(
        &self,
        user_id: UserId,
        event_id: EventId,
        ticket_type: Option<&str>,
    ) -> EngineResult<Option<WaitlistEntry>> {
        let now = self.ctx.collaborators.clock.now();
        let queue = self.ctx.stores.waitlist.queue(event_id, ticket_type)?;
        let Some(mut entry) = queue
            .into_iter()
            .find(|e| e.user_id() == user_id && e.status() == WaitlistStatus::Notified)
        else {
            return Ok(None);
        };
        if entry.is_overdue(now) {
            return Ok(None);
        }

        let expected = ExpectedVersion::Exact(entry.version());
        let event = entry.convert(now)?;
        self.ctx.stores.waitlist.update(&entry, expected)?;
        info!(entry_id = %entry.id_typed(), %event_id, "waitlist entry converted");
        self.publish(&event);
        Ok(Some(entry))
    }

    fn live_position(&self, entry: &WaitlistEntry) -> Result<Option<u32>, StoreError> {
        if entry.status() != WaitlistStatus::Waiting {
            return Ok(None);
        }
        let queue = self
            .ctx
            .stores
            .waitlist
            .queue(entry.event_id(), entry.ticket_type())?;
        Ok(position_of(&queue, entry))
    }

    /// Version-guarded write. `false` when another writer got there first.
    fn write_if_unchanged(&self, entry: &WaitlistEntry, expected: ExpectedVersion) -> EngineResult<bool> {
        match self.ctx.stores.waitlist.update(entry, expected) {
            Ok(()) => Ok(true),
            Err(e) if is_lost_race(&e) => {
                debug!(entry_id = %entry.id_typed(), error = %e, "waitlist entry changed concurrently; skipped");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn publish(&self, event: &WaitlistEvent) {
        let entry = event.entry();
        self.ctx
            .publisher
            .publish(entry.event_id, "waitlist", *entry.entry_id.as_uuid(), event);
    }
}

fn is_lost_race(err: &EngineError) -> bool {
    matches!(err.kind(), ErrorKind::Conflict | ErrorKind::NotFound)
}

/// Resolve the queue a request targets against the event's ticket types.
fn queue_name(inventory: &EventInventory, requested: Option<&str>) -> EngineResult<Option<String>> {
    match requested.map(str::trim) {
        Some(name) if inventory.uses_ticket_types() => inventory
            .ticket_type_by_name(name)
            .map(|tt| Some(tt.name.clone()))
            .ok_or_else(|| DomainError::not_found(format!("ticket type '{name}'")).into()),
        None if inventory.uses_ticket_types() => Err(DomainError::validation(
            "this event sells ticket types; one must be selected",
        )
        .into()),
        Some(name) => Err(DomainError::not_found(format!("ticket type '{name}'")).into()),
        None => Ok(None),
    }
}
