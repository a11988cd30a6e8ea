use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use boxoffice_core::{AggregateRoot, DomainError, DomainResult, EventId, UserId, WaitlistEntryId};
use boxoffice_events::Event;

/// Waitlist entry lifecycle: `waiting → notified → {converted, expired}`.
/// Leaving removes a `waiting` or `notified` entry entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitlistStatus {
    Waiting,
    Notified,
    Expired,
    Converted,
}

impl WaitlistStatus {
    /// Active entries block a second join by the same user.
    pub fn is_active(self) -> bool {
        matches!(self, WaitlistStatus::Waiting | WaitlistStatus::Notified)
    }
}

/// Input for a new `waiting` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewWaitlistEntry {
    pub id: WaitlistEntryId,
    pub user_id: UserId,
    pub event_id: EventId,
    /// `None` for events sold from a single aggregate counter.
    pub ticket_type: Option<String>,
    pub quantity: u32,
    pub priority: i32,
    /// Advisory insert position; see [`crate::ordering::insert_position`].
    pub position: u32,
    pub created_at: DateTime<Utc>,
}

/// Aggregate root: WaitlistEntry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistEntry {
    id: WaitlistEntryId,
    user_id: UserId,
    event_id: EventId,
    ticket_type: Option<String>,
    quantity: u32,
    priority: i32,
    position: u32,
    status: WaitlistStatus,
    notified_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    version: u64,
}

impl WaitlistEntry {
    pub fn join(new: NewWaitlistEntry) -> DomainResult<Self> {
        if new.quantity == 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }
        if new.ticket_type.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(DomainError::validation("ticket type name cannot be empty"));
        }
        Ok(Self {
            id: new.id,
            user_id: new.user_id,
            event_id: new.event_id,
            ticket_type: new.ticket_type,
            quantity: new.quantity,
            priority: new.priority,
            position: new.position.max(1),
            status: WaitlistStatus::Waiting,
            notified_at: None,
            expires_at: None,
            created_at: new.created_at,
            version: 0,
        })
    }

    pub fn id_typed(&self) -> WaitlistEntryId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn ticket_type(&self) -> Option<&str> {
        self.ticket_type.as_deref()
    }

    pub fn quantity(&self) -> u32 {
        self.quantity
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Position recorded at insert time. Advisory only; compute the live
    /// value with [`crate::ordering::position_of`].
    pub fn stored_position(&self) -> u32 {
        self.position
    }

    pub fn status(&self) -> WaitlistStatus {
        self.status
    }

    pub fn notified_at(&self) -> Option<DateTime<Utc>> {
        self.notified_at
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Same event and ticket type.
    pub fn in_queue(&self, event_id: EventId, ticket_type: Option<&str>) -> bool {
        self.event_id == event_id && self.ticket_type.as_deref() == ticket_type
    }

    /// A notified entry whose window has closed.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == WaitlistStatus::Notified && self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn joined_event(&self) -> WaitlistEvent {
        WaitlistEvent::Joined(self.change(self.created_at))
    }

    /// `waiting → notified`, opening a window of `window` from `now`.
    pub fn notify(&mut self, now: DateTime<Utc>, window: Duration) -> DomainResult<WaitlistEvent> {
        if self.status != WaitlistStatus::Waiting {
            return Err(self.refuse("notified"));
        }
        let expires_at = now + window;
        self.status = WaitlistStatus::Notified;
        self.notified_at = Some(now);
        self.expires_at = Some(expires_at);
        self.version += 1;
        Ok(WaitlistEvent::Notified(EntryNotified {
            entry: self.change(now),
            expires_at,
        }))
    }

    /// `notified → expired`, only once the window has closed.
    pub fn expire(&mut self, now: DateTime<Utc>) -> DomainResult<WaitlistEvent> {
        if !self.is_overdue(now) {
            return Err(self.refuse("expired"));
        }
        self.status = WaitlistStatus::Expired;
        self.version += 1;
        Ok(WaitlistEvent::Expired(self.change(now)))
    }

    /// `notified → converted`. An overdue notification can only expire.
    pub fn convert(&mut self, now: DateTime<Utc>) -> DomainResult<WaitlistEvent> {
        if self.status != WaitlistStatus::Notified || self.is_overdue(now) {
            return Err(self.refuse("converted"));
        }
        self.status = WaitlistStatus::Converted;
        self.version += 1;
        Ok(WaitlistEvent::Converted(self.change(now)))
    }

    /// Check that `user_id` may remove this entry now.
    ///
    /// Another user's entry is reported as missing rather than forbidden.
    pub fn leave(&self, user_id: UserId, now: DateTime<Utc>) -> DomainResult<WaitlistEvent> {
        if self.user_id != user_id {
            return Err(DomainError::not_found(format!("waitlist entry {}", self.id)));
        }
        if !self.is_active() {
            return Err(DomainError::invalid_transition(format!(
                "cannot leave a waitlist entry that is {:?}",
                self.status
            )));
        }
        Ok(WaitlistEvent::Left(self.change(now)))
    }

    fn refuse(&self, to: &str) -> DomainError {
        DomainError::invalid_transition(format!(
            "waitlist entry {} is {:?} and cannot be {to}",
            self.id, self.status
        ))
    }

    fn change(&self, at: DateTime<Utc>) -> EntryChanged {
        EntryChanged {
            entry_id: self.id,
            event_id: self.event_id,
            user_id: self.user_id,
            ticket_type: self.ticket_type.clone(),
            quantity: self.quantity,
            occurred_at: at,
        }
    }
}

impl AggregateRoot for WaitlistEntry {
    type Id = WaitlistEntryId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryChanged {
    pub entry_id: WaitlistEntryId,
    pub event_id: EventId,
    pub user_id: UserId,
    pub ticket_type: Option<String>,
    pub quantity: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Event: EntryNotified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryNotified {
    pub entry: EntryChanged,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitlistEvent {
    Joined(EntryChanged),
    Notified(EntryNotified),
    Expired(EntryChanged),
    Converted(EntryChanged),
    Left(EntryChanged),
}

impl WaitlistEvent {
    pub fn entry(&self) -> &EntryChanged {
        match self {
            WaitlistEvent::Notified(e) => &e.entry,
            WaitlistEvent::Joined(e)
            | WaitlistEvent::Expired(e)
            | WaitlistEvent::Converted(e)
            | WaitlistEvent::Left(e) => e,
        }
    }
}

impl Event for WaitlistEvent {
    fn event_type(&self) -> &'static str {
        match self {
            WaitlistEvent::Joined(_) => "waitlist.joined",
            WaitlistEvent::Notified(_) => "waitlist.notified",
            WaitlistEvent::Expired(_) => "waitlist.expired",
            WaitlistEvent::Converted(_) => "waitlist.converted",
            WaitlistEvent::Left(_) => "waitlist.left",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.entry().occurred_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn waiting(user_id: UserId) -> WaitlistEntry {
        WaitlistEntry::join(NewWaitlistEntry {
            id: WaitlistEntryId::new(),
            user_id,
            event_id: EventId::new(),
            ticket_type: Some("GA".to_string()),
            quantity: 2,
            priority: 0,
            position: 1,
            created_at: test_time(),
        })
        .unwrap()
    }

    #[test]
    fn join_rejects_zero_quantity() {
        let err = WaitlistEntry::join(NewWaitlistEntry {
            id: WaitlistEntryId::new(),
            user_id: UserId::new(),
            event_id: EventId::new(),
            ticket_type: None,
            quantity: 0,
            priority: 0,
            position: 1,
            created_at: test_time(),
        })
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn notify_sets_the_window() {
        let mut e = waiting(UserId::new());
        let now = test_time();
        let event = e.notify(now, Duration::hours(48)).unwrap();

        assert_eq!(e.status(), WaitlistStatus::Notified);
        assert_eq!(e.notified_at(), Some(now));
        assert_eq!(e.expires_at(), Some(now + Duration::hours(48)));
        assert_eq!(event.event_type(), "waitlist.notified");

        // Only waiting entries can be notified.
        assert!(e.notify(now, Duration::hours(48)).is_err());
    }

    #[test]
    fn expire_requires_a_closed_window() {
        let mut e = waiting(UserId::new());
        let now = test_time();
        assert!(e.expire(now).is_err());

        e.notify(now, Duration::hours(1)).unwrap();
        assert!(e.expire(now + Duration::minutes(59)).is_err());
        e.expire(now + Duration::hours(1)).unwrap();
        assert_eq!(e.status(), WaitlistStatus::Expired);
    }

    #[test]
    fn overdue_notification_cannot_convert() {
        let mut e = waiting(UserId::new());
        let now = test_time();
        e.notify(now, Duration::hours(1)).unwrap();

        let err = e.convert(now + Duration::hours(2)).unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition(_)));
        assert_eq!(e.status(), WaitlistStatus::Notified);

        e.convert(now + Duration::minutes(30)).unwrap();
        assert_eq!(e.status(), WaitlistStatus::Converted);
    }

    #[test]
    fn waiting_entry_cannot_convert() {
        let mut e = waiting(UserId::new());
        assert!(e.convert(test_time()).is_err());
    }

    #[test]
    fn leave_checks_owner_then_status() {
        let owner = UserId::new();
        let mut e = waiting(owner);

        match e.leave(UserId::new(), test_time()).unwrap_err() {
            DomainError::NotFound(_) => {}
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(e.leave(owner, test_time()).is_ok());

        let now = test_time();
        e.notify(now, Duration::hours(48)).unwrap();
        assert!(e.leave(owner, now).is_ok());

        e.convert(now).unwrap();
        match e.leave(owner, now).unwrap_err() {
            DomainError::InvalidTransition(_) => {}
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
