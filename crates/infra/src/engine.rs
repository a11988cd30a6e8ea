//! Engine wiring: stores, collaborators, outbox and the two write-path services.

use std::io;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::{info, warn};

use boxoffice_booking::{CodeGenerator, RandomCodeGenerator};
use boxoffice_core::{EventId, TicketTypeId};
use boxoffice_events::{EventBus, EventEnvelope, InMemoryEventBus, Subscription};
use boxoffice_inventory::{EventInventory, InventoryEvent, PublishInventory};

use crate::booking_factory::BookingFactory;
use crate::collaborators::{
    Clock, FeatureFlags, FeatureToggles, InMemorySubscriptionDirectory, JsonTicketRenderer,
    Notifier, PlainQrGenerator, QrGenerator, RecordingNotifier, StaticFeatureToggles,
    StaticSystemConfig, SubscriptionDirectory, SystemClock, SystemConfig, SystemSettings,
    TicketPdfRenderer,
};
use crate::config::EngineConfig;
use crate::error::{EngineResult, StoreError};
use crate::jobs::{
    DeadLetterEntry, ExecutorStats, InMemoryJobStore, JobExecutor, JobExecutorConfig,
    JobExecutorHandle, JobId, JobStats, JobStore, JobStoreError, RetryPolicy,
};
use crate::publisher::EventPublisher;
use crate::side_effects::{self, Deliveries, Outbox};
use crate::statistics::StatisticsReconciler;
use crate::store::{
    BookingStore, CommissionStore, InMemoryBookingStore, InMemoryCommissionStore,
    InMemoryInventoryLedger, InMemoryWaitlistStore, InventoryLedger, WaitlistStore,
};
use crate::sweeper::{ExpirySweeper, ExpirySweeperHandle};
use crate::waitlist_queue::WaitlistQueue;

/// Storage backends used by the engine.
#[derive(Clone)]
pub struct Stores {
    pub inventory: Arc<dyn InventoryLedger>,
    pub bookings: Arc<dyn BookingStore>,
    pub commissions: Arc<dyn CommissionStore>,
    pub waitlist: Arc<dyn WaitlistStore>,
    pub jobs: Arc<dyn JobStore>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            inventory: Arc::new(InMemoryInventoryLedger::new()),
            bookings: Arc::new(InMemoryBookingStore::new()),
            commissions: Arc::new(InMemoryCommissionStore::new()),
            waitlist: Arc::new(InMemoryWaitlistStore::new()),
            jobs: Arc::new(InMemoryJobStore::new()),
        }
    }

    /// Swap the inventory ledger (e.g. for [`crate::store::PostgresInventoryLedger`]).
    pub fn with_inventory(mut self, inventory: Arc<dyn InventoryLedger>) -> Self {
        self.inventory = inventory;
        self
    }
}

/// External collaborators the engine consults or delivers through.
#[derive(Clone)]
pub struct Collaborators {
    pub toggles: Arc<dyn FeatureToggles>,
    pub system: Arc<dyn SystemConfig>,
    pub subscriptions: Arc<dyn SubscriptionDirectory>,
    pub notifier: Arc<dyn Notifier>,
    pub qr: Arc<dyn QrGenerator>,
    pub pdf: Arc<dyn TicketPdfRenderer>,
    pub codes: Arc<dyn CodeGenerator>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// In-process stand-ins: everything enabled, no booking limit, recorded
    /// notifications, system clock.
    pub fn in_process() -> Self {
        Self {
            toggles: Arc::new(StaticFeatureToggles::new(FeatureFlags::default())),
            system: Arc::new(StaticSystemConfig::new(SystemSettings::default())),
            subscriptions: Arc::new(InMemorySubscriptionDirectory::new()),
            notifier: Arc::new(RecordingNotifier::new()),
            qr: Arc::new(PlainQrGenerator::new()),
            pdf: Arc::new(JsonTicketRenderer),
            codes: Arc::new(RandomCodeGenerator),
            clock: Arc::new(SystemClock),
        }
    }
}

/// Everything the services share.
pub struct EngineContext {
    pub config: EngineConfig,
    pub stores: Stores,
    pub collaborators: Collaborators,
    pub outbox: Outbox,
    pub publisher: EventPublisher,
}

impl EngineContext {
    /// Feature flags for gating side effects. A failed lookup disables them
    /// for this request rather than failing the write.
    pub(crate) fn side_effect_flags(&self, event_id: EventId) -> Option<FeatureFlags> {
        match self.collaborators.toggles.get(event_id) {
            Ok(flags) => Some(flags),
            Err(e) => {
                warn!(%event_id, error = %e, "feature toggle lookup failed; skipping side effects");
                None
            }
        }
    }
}

type EngineBus = InMemoryEventBus<EventEnvelope<JsonValue>>;

/// The allocation engine: booking write path, waitlist, statistics and the
/// side-effect executor.
pub struct Engine {
    ctx: Arc<EngineContext>,
    bus: Arc<EngineBus>,
    bookings: BookingFactory,
    waitlist: WaitlistQueue,
    statistics: StatisticsReconciler,
    executor: Arc<JobExecutor<Arc<dyn JobStore>>>,
}

/// Background threads started by [`Engine::start_background`].
#[derive(Debug)]
pub struct BackgroundHandles {
    pub executor: JobExecutorHandle,
    pub sweeper: ExpirySweeperHandle,
}

impl BackgroundHandles {
    pub fn shutdown(self) {
        self.sweeper.shutdown();
        self.executor.shutdown();
    }
}

impl Engine {
    pub fn new(config: EngineConfig, stores: Stores, collaborators: Collaborators) -> Self {
        let bus: Arc<EngineBus> = Arc::new(InMemoryEventBus::new());
        let outbox = Outbox::new(stores.jobs.clone(), RetryPolicy::default());

        let mut executor = JobExecutor::new(stores.jobs.clone());
        side_effects::register_handlers(
            &mut executor,
            &Deliveries {
                notifier: collaborators.notifier.clone(),
                qr: collaborators.qr.clone(),
                pdf: collaborators.pdf.clone(),
                subscriptions: collaborators.subscriptions.clone(),
            },
        );

        let statistics =
            StatisticsReconciler::new(stores.commissions.clone(), collaborators.subscriptions.clone());
        let ctx = Arc::new(EngineContext {
            config,
            stores,
            collaborators,
            outbox,
            publisher: EventPublisher::new(bus.clone()),
        });
        let waitlist = WaitlistQueue::new(ctx.clone());
        let bookings = BookingFactory::new(ctx.clone(), waitlist.clone());

        info!(
            notify_policy = ctx.config.notify_policy.as_str(),
            default_commission = %ctx.config.default_commission_rate,
            "engine initialised"
        );

        Self {
            ctx,
            bus,
            bookings,
            waitlist,
            statistics,
            executor: Arc::new(executor),
        }
    }

    pub fn in_memory(config: EngineConfig, collaborators: Collaborators) -> Self {
        Self::new(config, Stores::in_memory(), collaborators)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    pub fn bookings(&self) -> &BookingFactory {
        &self.bookings
    }

    pub fn waitlist(&self) -> &WaitlistQueue {
        &self.waitlist
    }

    pub fn statistics(&self) -> &StatisticsReconciler {
        &self.statistics
    }

    /// Store the inventory of a newly published event.
    pub fn publish_inventory(&self, input: PublishInventory) -> EngineResult<EventInventory> {
        let inventory = EventInventory::publish(input)?;
        self.ctx.stores.inventory.publish(inventory.clone())?;
        info!(
            event_id = %inventory.event_id(),
            total = inventory.total_tickets(),
            ticket_types = inventory.ticket_types().len(),
            "inventory published"
        );
        Ok(inventory)
    }

    pub fn inventory(&self, event_id: EventId) -> Result<Option<EventInventory>, StoreError> {
        self.ctx.stores.inventory.get(event_id)
    }

    /// Change a tier's live price. Existing bookings keep the price they
    /// were sold at.
    pub fn reprice_ticket_type(&self, event_id: EventId, ticket_type: TicketTypeId, price: u64) -> EngineResult<()> {
        self.ctx.stores.inventory.reprice(event_id, ticket_type, price)?;
        info!(%event_id, %ticket_type, price, "ticket type repriced");
        Ok(())
    }

    /// Domain events published after each committed write.
    pub fn subscribe_events(&self) -> Subscription<EventEnvelope<JsonValue>> {
        self.bus.subscribe()
    }

    /// Run up to `max_jobs` queued side effects on the calling thread.
    pub fn run_side_effects(&self, max_jobs: usize) -> ExecutorStats {
        self.executor.run_pending(max_jobs)
    }

    pub fn job_stats(&self) -> Result<JobStats, JobStoreError> {
        self.ctx.stores.jobs.stats()
    }

    pub fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        self.ctx.stores.jobs.list_dead_letters(limit)
    }

    /// Put a dead-lettered side effect back in the queue with a fresh attempt count.
    pub fn retry_dead_letter(&self, job_id: JobId) -> Result<(), JobStoreError> {
        let job = self.ctx.stores.jobs.retry_dead_letter(job_id)?;
        info!(job_id = %job.id, kind = job.kind.type_name(), "dead-lettered job requeued");
        Ok(())
    }

    /// Start the side-effect executor and the waitlist expiry sweeper.
    pub fn start_background(&self) -> io::Result<BackgroundHandles> {
        let executor = self.executor.clone().spawn(JobExecutorConfig::default())?;
        let sweeper = match ExpirySweeper::new(self.waitlist.clone(), self.ctx.config.expiry_sweep_interval).spawn() {
            Ok(h) => h,
            Err(e) => {
                executor.shutdown();
                return Err(e);
            }
        };
        Ok(BackgroundHandles { executor, sweeper })
    }
}

/// Publish an inventory event for `event_id` on the engine bus.
pub(crate) fn publish_inventory_event(ctx: &EngineContext, event: &InventoryEvent) {
    let event_id = match event {
        InventoryEvent::TicketsReserved(e) => e.event_id,
        InventoryEvent::TicketsReleased(e) => e.event_id,
    };
    ctx.publisher.publish(event_id, "inventory", *event_id.as_uuid(), event);
}
