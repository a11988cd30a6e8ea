//! Shared fixture for the engine's unit and integration tests.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};

use boxoffice_booking::RandomCodeGenerator;
use boxoffice_core::{EventId, OrganizerId, TicketTypeId};
use boxoffice_inventory::{NewTicketType, PublishInventory};

use crate::collaborators::{
    Clock, FeatureFlags, InMemorySubscriptionDirectory, JsonTicketRenderer, ManualClock,
    PlainQrGenerator, RecordingNotifier, StaticFeatureToggles, StaticSystemConfig, SystemSettings,
};
use crate::config::EngineConfig;
use crate::engine::{Collaborators, Engine, Stores};

pub(crate) struct Fixture {
    pub engine: Engine,
    pub stores: Stores,
    pub clock: Arc<ManualClock>,
    pub notifier: Arc<RecordingNotifier>,
    pub qr: Arc<PlainQrGenerator>,
    pub toggles: Arc<StaticFeatureToggles>,
    pub system: Arc<StaticSystemConfig>,
    pub subscriptions: Arc<InMemorySubscriptionDirectory>,
    pub organizer: OrganizerId,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::customized(config, |_| {})
    }

    /// Build with the recording collaborators, then let `customize` swap any
    /// of them before the engine is wired.
    pub fn customized(config: EngineConfig, customize: impl FnOnce(&mut Collaborators)) -> Self {
        Self::build(config, Stores::in_memory(), customize)
    }

    /// Default collaborators over caller-supplied stores.
    pub fn with_stores(stores: Stores) -> Self {
        Self::build(EngineConfig::default(), stores, |_| {})
    }

    fn build(config: EngineConfig, stores: Stores, customize: impl FnOnce(&mut Collaborators)) -> Self {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2030, 3, 1, 12, 0, 0).unwrap()));
        let notifier = Arc::new(RecordingNotifier::new());
        let qr = Arc::new(PlainQrGenerator::new());
        let toggles = Arc::new(StaticFeatureToggles::new(FeatureFlags::default()));
        let system = Arc::new(StaticSystemConfig::new(SystemSettings::default()));
        let subscriptions = Arc::new(InMemorySubscriptionDirectory::new());

        let mut collaborators = Collaborators {
            toggles: toggles.clone(),
            system: system.clone(),
            subscriptions: subscriptions.clone(),
            notifier: notifier.clone(),
            qr: qr.clone(),
            pdf: Arc::new(JsonTicketRenderer),
            codes: Arc::new(RandomCodeGenerator),
            clock: clock.clone(),
        };
        customize(&mut collaborators);
        let engine = Engine::new(config, stores.clone(), collaborators);

        Self {
            engine,
            stores,
            clock,
            notifier,
            qr,
            toggles,
            system,
            subscriptions,
            organizer: OrganizerId::new(),
        }
    }

    /// Publish an event a week out, sold by ticket type.
    pub fn publish_typed(&self, tiers: &[(&str, u64, u32)], seat_capacity: Option<u32>) -> EventId {
        let event_id = EventId::new();
        self.engine
            .publish_inventory(PublishInventory {
                event_id,
                organizer_id: self.organizer,
                starts_at: self.clock.now() + Duration::days(7),
                base_price: 0,
                total_tickets: 0,
                ticket_types: tiers
                    .iter()
                    .map(|(name, price, quantity)| NewTicketType {
                        id: TicketTypeId::new(),
                        name: (*name).to_string(),
                        price: *price,
                        quantity: *quantity,
                    })
                    .collect(),
                seat_capacity,
            })
            .unwrap();
        event_id
    }

    /// Publish an event a week out, sold from one aggregate counter.
    pub fn publish_untyped(&self, total: u32, price: u64, seat_capacity: Option<u32>) -> EventId {
        let event_id = EventId::new();
        self.engine
            .publish_inventory(PublishInventory {
                event_id,
                organizer_id: self.organizer,
                starts_at: self.clock.now() + Duration::days(7),
                base_price: price,
                total_tickets: total,
                ticket_types: Vec::new(),
                seat_capacity,
            })
            .unwrap();
        event_id
    }

    pub fn ticket_type_id(&self, event_id: EventId, name: &str) -> TicketTypeId {
        self.engine
            .inventory(event_id)
            .unwrap()
            .unwrap()
            .ticket_type_by_name(name)
            .unwrap()
            .id
    }

    pub fn available(&self, event_id: EventId, name: Option<&str>) -> u32 {
        let inventory = self.engine.inventory(event_id).unwrap().unwrap();
        match name {
            Some(name) => inventory.ticket_type_by_name(name).unwrap().available,
            None => inventory.available_tickets(),
        }
    }
}
