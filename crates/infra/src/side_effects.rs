//! Outbox for write-path side effects.
//!
//! The booking and waitlist services enqueue a [`SideEffect`] once their
//! primary write has committed. Handlers registered on the [`JobExecutor`]
//! perform the delivery with retry/backoff, so collaborator failures delay a
//! side effect instead of losing it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use boxoffice_booking::OrganizerStatsDelta;
use boxoffice_core::{BookingId, EventId, UserId};

use crate::collaborators::{
    Notification, Notifier, QrGenerator, SubscriptionDirectory, TicketDocument, TicketPdfRenderer,
};
use crate::jobs::{Job, JobExecutor, JobId, JobKind, JobResult, JobStore, RetryPolicy};

/// A deferred side effect, serialized as the job payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum SideEffect {
    BookingConfirmation {
        booking_id: BookingId,
        user_id: UserId,
        event_id: EventId,
        booking_reference: String,
        quantity: u32,
        total_amount: u64,
        tickets: Vec<TicketDocument>,
    },
    TicketQrCodes {
        booking_reference: String,
        ticket_codes: Vec<String>,
    },
    OrganizerStats {
        delta: OrganizerStatsDelta,
    },
    WaitlistJoined {
        user_id: UserId,
        event_id: EventId,
        ticket_type: Option<String>,
        position: u32,
    },
    WaitlistAvailable {
        user_id: UserId,
        event_id: EventId,
        ticket_type: Option<String>,
        quantity: u32,
        expires_at: DateTime<Utc>,
    },
}

impl SideEffect {
    pub fn job_kind(&self) -> JobKind {
        match self {
            SideEffect::BookingConfirmation { .. } => JobKind::notification("booking_confirmation"),
            SideEffect::TicketQrCodes { .. } => JobKind::artifact("ticket_qr"),
            SideEffect::OrganizerStats { .. } => JobKind::statistics("organizer"),
            SideEffect::WaitlistJoined { .. } => JobKind::notification("waitlist_joined"),
            SideEffect::WaitlistAvailable { .. } => JobKind::notification("waitlist_available"),
        }
    }
}

/// Enqueue side of the outbox.
#[derive(Clone)]
pub struct Outbox {
    store: Arc<dyn JobStore>,
    retry: RetryPolicy,
}

impl core::fmt::Debug for Outbox {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Outbox").field("retry", &self.retry).finish_non_exhaustive()
    }
}

impl Outbox {
    pub fn new(store: Arc<dyn JobStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Queue `effect`. Never fails the caller: an enqueue error is logged and
    /// `None` returned.
    pub fn enqueue(&self, effect: SideEffect) -> Option<JobId> {
        let kind = effect.job_kind();
        let payload = match serde_json::to_value(&effect) {
            Ok(v) => v,
            Err(e) => {
                warn!(kind = kind.type_name(), error = %e, "failed to encode side effect");
                return None;
            }
        };
        let job = Job::new(kind, payload).with_retry_policy(self.retry.clone());
        match self.store.enqueue(job) {
            Ok(id) => {
                debug!(job_id = %id, "side effect queued");
                Some(id)
            }
            Err(e) => {
                warn!(error = %e, "failed to queue side effect");
                None
            }
        }
    }
}

/// Collaborators the outbox handlers deliver through.
#[derive(Clone)]
pub struct Deliveries {
    pub notifier: Arc<dyn Notifier>,
    pub qr: Arc<dyn QrGenerator>,
    pub pdf: Arc<dyn TicketPdfRenderer>,
    pub subscriptions: Arc<dyn SubscriptionDirectory>,
}

/// Register one handler per job category on `executor`.
pub fn register_handlers<S>(executor: &mut JobExecutor<S>, deliveries: &Deliveries)
where
    S: JobStore + 'static,
{
    let d = deliveries.clone();
    executor.register_handler("notification.*", move |job| {
        with_effect(job, |effect| deliver_notification(&d, effect))
    });

    let qr = deliveries.qr.clone();
    executor.register_handler("artifact.ticket_qr", move |job| {
        with_effect(job, |effect| match effect {
            SideEffect::TicketQrCodes { booking_reference, ticket_codes } => {
                for code in &ticket_codes {
                    if let Err(e) = qr.generate(&format!("{booking_reference}:{code}")) {
                        return JobResult::Failure(e.to_string());
                    }
                }
                JobResult::Success
            }
            other => unexpected(job, &other),
        })
    });

    let subscriptions = deliveries.subscriptions.clone();
    executor.register_handler("statistics.organizer", move |job| {
        with_effect(job, |effect| match effect {
            SideEffect::OrganizerStats { delta } => match subscriptions.apply_stats(&delta) {
                Ok(applied) => {
                    if !applied {
                        debug!(commission_id = %delta.commission_id, "statistics delta already applied");
                    }
                    JobResult::Success
                }
                Err(e) => JobResult::Failure(e.to_string()),
            },
            other => unexpected(job, &other),
        })
    });
}

fn with_effect(job: &Job, f: impl FnOnce(SideEffect) -> JobResult) -> JobResult {
    match serde_json::from_value::<SideEffect>(job.payload.clone()) {
        Ok(effect) => f(effect),
        Err(e) => JobResult::Abandon(format!("undecodable side effect: {e}")),
    }
}

fn unexpected(job: &Job, effect: &SideEffect) -> JobResult {
    JobResult::Abandon(format!(
        "job {} routed to {} but carries {}",
        job.id,
        job.kind.type_name(),
        effect.job_kind().type_name()
    ))
}

fn deliver_notification(d: &Deliveries, effect: SideEffect) -> JobResult {
    let notification = match effect {
        SideEffect::BookingConfirmation {
            user_id,
            event_id,
            booking_reference,
            quantity,
            total_amount,
            tickets,
            ..
        } => {
            let mut attachments = Vec::with_capacity(tickets.len());
            for ticket in &tickets {
                match d.pdf.render(ticket) {
                    Ok(bytes) => attachments.push(bytes),
                    Err(e) => return JobResult::Failure(e.to_string()),
                }
            }
            Notification::BookingConfirmation {
                user_id,
                event_id,
                booking_reference,
                quantity,
                total_amount,
                attachments,
            }
        }
        SideEffect::WaitlistJoined {
            user_id,
            event_id,
            ticket_type,
            position,
        } => Notification::WaitlistJoined {
            user_id,
            event_id,
            ticket_type,
            position,
        },
        SideEffect::WaitlistAvailable {
            user_id,
            event_id,
            ticket_type,
            quantity,
            expires_at,
        } => Notification::WaitlistAvailable {
            user_id,
            event_id,
            ticket_type,
            quantity,
            expires_at,
        },
        other => {
            return JobResult::Abandon(format!(
                "{} is not a notification",
                other.job_kind().type_name()
            ));
        }
    };

    match d.notifier.send(&notification) {
        Ok(()) => JobResult::Success,
        Err(e) => JobResult::Failure(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{
        InMemorySubscriptionDirectory, JsonTicketRenderer, PlainQrGenerator, RecordingNotifier,
    };
    use crate::jobs::InMemoryJobStore;
    use boxoffice_booking::CommissionRate;
    use boxoffice_core::{CommissionId, OrganizerId};
    use std::time::Duration;

    struct Harness {
        store: Arc<InMemoryJobStore>,
        outbox: Outbox,
        executor: JobExecutor<Arc<dyn JobStore>>,
        notifier: Arc<RecordingNotifier>,
        qr: Arc<PlainQrGenerator>,
        subscriptions: Arc<InMemorySubscriptionDirectory>,
    }

    fn harness() -> Harness {
        let store = InMemoryJobStore::arc();
        let dyn_store: Arc<dyn JobStore> = store.clone();
        let notifier = Arc::new(RecordingNotifier::new());
        let qr = Arc::new(PlainQrGenerator::new());
        let subscriptions = Arc::new(InMemorySubscriptionDirectory::new());
        let mut executor = JobExecutor::new(dyn_store.clone());
        register_handlers(
            &mut executor,
            &Deliveries {
                notifier: notifier.clone(),
                qr: qr.clone(),
                pdf: Arc::new(JsonTicketRenderer),
                subscriptions: subscriptions.clone(),
            },
        );
        Harness {
            store,
            outbox: Outbox::new(dyn_store, RetryPolicy::fixed(3, Duration::ZERO)),
            executor,
            notifier,
            qr,
            subscriptions,
        }
    }

    fn joined() -> SideEffect {
        SideEffect::WaitlistJoined {
            user_id: UserId::new(),
            event_id: EventId::new(),
            ticket_type: Some("GA".to_string()),
            position: 3,
        }
    }

    #[test]
    fn notification_survives_transient_failures() {
        let h = harness();
        h.notifier.fail_next(2);
        h.outbox.enqueue(joined()).unwrap();

        let mut delivered = 0;
        for _ in 0..3 {
            delivered += h.executor.run_pending(10).jobs_succeeded;
        }
        assert_eq!(delivered, 1);
        assert_eq!(h.notifier.sent_of_kind("waitlist_joined").len(), 1);
    }

    #[test]
    fn persistent_failure_ends_in_dead_letter_queue() {
        let h = harness();
        h.notifier.fail_next(10);
        h.outbox.enqueue(joined()).unwrap();

        for _ in 0..3 {
            h.executor.run_pending(10);
        }
        assert!(h.notifier.sent().is_empty());
        assert_eq!(h.store.list_dead_letters(10).unwrap().len(), 1);
    }

    #[test]
    fn confirmation_attaches_one_rendered_ticket_per_code() {
        let h = harness();
        let tickets = vec![
            TicketDocument {
                booking_reference: "BK-AAAA2222".to_string(),
                ticket_code: "TKT-AAAAAAAAAA".to_string(),
                ticket_type: None,
                seat: Some(4),
            },
            TicketDocument {
                booking_reference: "BK-AAAA2222".to_string(),
                ticket_code: "TKT-BBBBBBBBBB".to_string(),
                ticket_type: None,
                seat: Some(5),
            },
        ];
        h.outbox.enqueue(SideEffect::BookingConfirmation {
            booking_id: BookingId::new(),
            user_id: UserId::new(),
            event_id: EventId::new(),
            booking_reference: "BK-AAAA2222".to_string(),
            quantity: 2,
            total_amount: 5_000,
            tickets,
        });
        h.outbox.enqueue(SideEffect::TicketQrCodes {
            booking_reference: "BK-AAAA2222".to_string(),
            ticket_codes: vec!["TKT-AAAAAAAAAA".to_string(), "TKT-BBBBBBBBBB".to_string()],
        });

        assert_eq!(h.executor.run_pending(10).jobs_succeeded, 2);
        match &h.notifier.sent()[0] {
            Notification::BookingConfirmation { attachments, .. } => assert_eq!(attachments.len(), 2),
            other => panic!("unexpected notification {other:?}"),
        }
        assert_eq!(h.qr.generated().len(), 2);
    }

    #[test]
    fn redelivered_stats_delta_is_counted_once() {
        let h = harness();
        let organizer = OrganizerId::new();
        h.subscriptions.subscribe(organizer, CommissionRate::DEFAULT);
        let delta = OrganizerStatsDelta {
            commission_id: CommissionId::new(),
            organizer_id: organizer,
            tickets_sold: 2,
            revenue: 10_000,
            commission_deducted: 3_000,
            net_payout: 7_000,
        };

        h.outbox.enqueue(SideEffect::OrganizerStats { delta });
        h.outbox.enqueue(SideEffect::OrganizerStats { delta });
        assert_eq!(h.executor.run_pending(10).jobs_succeeded, 2);

        let stats = h.subscriptions.stats(organizer).unwrap().unwrap();
        assert_eq!(stats.tickets_sold, 2);
        assert_eq!(stats.net_payout, 7_000);
    }
}
