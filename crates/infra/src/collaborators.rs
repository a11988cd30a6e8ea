//! External collaborators consumed by the engine, plus in-process
//! implementations for tests, the demo and single-node deployments.
//!
//! Configuration lookups (`FeatureToggles`, `SystemConfig`) are read on the
//! request path. Delivery collaborators (`Notifier`, `QrGenerator`,
//! `TicketPdfRenderer`) are only ever called from outbox jobs.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use boxoffice_booking::{CommissionRate, OrganizerStats, OrganizerStatsDelta};
use boxoffice_core::{EventId, OrganizerId};

use crate::error::ExternalServiceError;

/// Per-event feature switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    pub ticketing: bool,
    pub payments: bool,
    pub qr_check_in: bool,
    pub email_sms: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            ticketing: true,
            payments: true,
            qr_check_in: true,
            email_sms: true,
        }
    }
}

pub trait FeatureToggles: Send + Sync {
    fn get(&self, event_id: EventId) -> Result<FeatureFlags, ExternalServiceError>;
}

/// Platform-wide settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemSettings {
    pub max_tickets_per_booking: Option<u32>,
    pub qr_code_enabled: bool,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            max_tickets_per_booking: None,
            qr_code_enabled: true,
        }
    }
}

pub trait SystemConfig: Send + Sync {
    fn get(&self) -> Result<SystemSettings, ExternalServiceError>;
}

/// Organizer subscriptions: commission rate and running statistics.
pub trait SubscriptionDirectory: Send + Sync {
    /// `None` when the organizer has no active subscription.
    fn commission_rate(&self, organizer: OrganizerId) -> Result<Option<CommissionRate>, ExternalServiceError>;

    /// Fold in a delta. Returns `false` if this commission was already applied.
    fn apply_stats(&self, delta: &OrganizerStatsDelta) -> Result<bool, ExternalServiceError>;

    fn replace_stats(&self, organizer: OrganizerId, stats: OrganizerStats) -> Result<(), ExternalServiceError>;

    fn stats(&self, organizer: OrganizerId) -> Result<Option<OrganizerStats>, ExternalServiceError>;
}

pub trait QrGenerator: Send + Sync {
    fn generate(&self, payload: &str) -> Result<Vec<u8>, ExternalServiceError>;
}

/// One printable ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketDocument {
    pub booking_reference: String,
    pub ticket_code: String,
    pub ticket_type: Option<String>,
    pub seat: Option<u32>,
}

pub trait TicketPdfRenderer: Send + Sync {
    fn render(&self, ticket: &TicketDocument) -> Result<Vec<u8>, ExternalServiceError>;
}

/// Message handed to the notifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    BookingConfirmation {
        user_id: boxoffice_core::UserId,
        event_id: EventId,
        booking_reference: String,
        quantity: u32,
        total_amount: u64,
        /// Rendered ticket PDFs, in ticket order.
        attachments: Vec<Vec<u8>>,
    },
    WaitlistJoined {
        user_id: boxoffice_core::UserId,
        event_id: EventId,
        ticket_type: Option<String>,
        position: u32,
    },
    WaitlistAvailable {
        user_id: boxoffice_core::UserId,
        event_id: EventId,
        ticket_type: Option<String>,
        quantity: u32,
        expires_at: DateTime<Utc>,
    },
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::BookingConfirmation { .. } => "booking_confirmation",
            Notification::WaitlistJoined { .. } => "waitlist_joined",
            Notification::WaitlistAvailable { .. } => "waitlist_available",
        }
    }
}

pub trait Notifier: Send + Sync {
    fn send(&self, notification: &Notification) -> Result<(), ExternalServiceError>;
}

/// Source of "now", injectable so expiry logic can be tested.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Feature toggles held in memory: a default plus per-event overrides.
#[derive(Debug, Default)]
pub struct StaticFeatureToggles {
    default: FeatureFlags,
    overrides: RwLock<HashMap<EventId, FeatureFlags>>,
}

impl StaticFeatureToggles {
    pub fn new(default: FeatureFlags) -> Self {
        Self {
            default,
            overrides: RwLock::new(HashMap::new()),
        }
    }

    pub fn set(&self, event_id: EventId, flags: FeatureFlags) {
        self.overrides
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(event_id, flags);
    }
}

impl FeatureToggles for StaticFeatureToggles {
    fn get(&self, event_id: EventId) -> Result<FeatureFlags, ExternalServiceError> {
        let overrides = self
            .overrides
            .read()
            .map_err(|_| ExternalServiceError::new("feature_toggles", "lock poisoned"))?;
        Ok(overrides.get(&event_id).copied().unwrap_or(self.default))
    }
}

#[derive(Debug, Default)]
pub struct StaticSystemConfig {
    settings: RwLock<SystemSettings>,
}

impl StaticSystemConfig {
    pub fn new(settings: SystemSettings) -> Self {
        Self {
            settings: RwLock::new(settings),
        }
    }

    pub fn set(&self, settings: SystemSettings) {
        *self.settings.write().unwrap_or_else(|p| p.into_inner()) = settings;
    }
}

impl SystemConfig for StaticSystemConfig {
    fn get(&self) -> Result<SystemSettings, ExternalServiceError> {
        self.settings
            .read()
            .map(|s| *s)
            .map_err(|_| ExternalServiceError::new("system_config", "lock poisoned"))
    }
}

#[derive(Debug, Clone, Default)]
struct Subscription {
    rate: Option<CommissionRate>,
    stats: OrganizerStats,
}

#[derive(Debug, Default)]
pub struct InMemorySubscriptionDirectory {
    subscriptions: RwLock<HashMap<OrganizerId, Subscription>>,
}

impl InMemorySubscriptionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an active subscription with its commission rate.
    pub fn subscribe(&self, organizer: OrganizerId, rate: CommissionRate) {
        let mut subs = self.subscriptions.write().unwrap_or_else(|p| p.into_inner());
        subs.entry(organizer).or_default().rate = Some(rate);
    }
}

impl SubscriptionDirectory for InMemorySubscriptionDirectory {
    fn commission_rate(&self, organizer: OrganizerId) -> Result<Option<CommissionRate>, ExternalServiceError> {
        let subs = self
            .subscriptions
            .read()
            .map_err(|_| ExternalServiceError::new("subscriptions", "lock poisoned"))?;
        Ok(subs.get(&organizer).and_then(|s| s.rate))
    }

    fn apply_stats(&self, delta: &OrganizerStatsDelta) -> Result<bool, ExternalServiceError> {
        let mut subs = self
            .subscriptions
            .write()
            .map_err(|_| ExternalServiceError::new("subscriptions", "lock poisoned"))?;
        Ok(subs.entry(delta.organizer_id).or_default().stats.apply(delta))
    }

    fn replace_stats(&self, organizer: OrganizerId, stats: OrganizerStats) -> Result<(), ExternalServiceError> {
        let mut subs = self
            .subscriptions
            .write()
            .map_err(|_| ExternalServiceError::new("subscriptions", "lock poisoned"))?;
        subs.entry(organizer).or_default().stats = stats;
        Ok(())
    }

    fn stats(&self, organizer: OrganizerId) -> Result<Option<OrganizerStats>, ExternalServiceError> {
        let subs = self
            .subscriptions
            .read()
            .map_err(|_| ExternalServiceError::new("subscriptions", "lock poisoned"))?;
        Ok(subs.get(&organizer).map(|s| s.stats.clone()))
    }
}

/// Notifier that records what it was asked to send.
///
/// `fail_next(n)` makes the next `n` sends fail, to exercise outbox retries.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    failures_left: Mutex<u32>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: u32) {
        *self.failures_left.lock().unwrap_or_else(|p| p.into_inner()) = n;
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn sent_of_kind(&self, kind: &str) -> Vec<Notification> {
        self.sent().into_iter().filter(|n| n.kind() == kind).collect()
    }
}

impl Notifier for RecordingNotifier {
    fn send(&self, notification: &Notification) -> Result<(), ExternalServiceError> {
        let mut left = self.failures_left.lock().unwrap_or_else(|p| p.into_inner());
        if *left > 0 {
            *left -= 1;
            return Err(ExternalServiceError::new("notifier", "simulated delivery failure"));
        }
        self.sent
            .lock()
            .map_err(|_| ExternalServiceError::new("notifier", "lock poisoned"))?
            .push(notification.clone());
        Ok(())
    }
}

/// QR "generator" that encodes the payload bytes and counts calls.
#[derive(Debug, Default)]
pub struct PlainQrGenerator {
    generated: Mutex<Vec<String>>,
}

impl PlainQrGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generated(&self) -> Vec<String> {
        self.generated.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl QrGenerator for PlainQrGenerator {
    fn generate(&self, payload: &str) -> Result<Vec<u8>, ExternalServiceError> {
        self.generated
            .lock()
            .map_err(|_| ExternalServiceError::new("qr", "lock poisoned"))?
            .push(payload.to_string());
        Ok(payload.as_bytes().to_vec())
    }
}

/// Renders a ticket as its JSON bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonTicketRenderer;

impl TicketPdfRenderer for JsonTicketRenderer {
    fn render(&self, ticket: &TicketDocument) -> Result<Vec<u8>, ExternalServiceError> {
        serde_json::to_vec(ticket).map_err(|e| ExternalServiceError::new("pdf", e.to_string()))
    }
}
