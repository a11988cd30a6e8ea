//! Organizer statistics reconciliation.
//!
//! The running totals on a subscription are fed by outbox deltas. This job
//! rebuilds them from the commission records, which are authoritative.

use std::sync::Arc;

use tracing::info;

use boxoffice_booking::OrganizerStats;
use boxoffice_core::OrganizerId;

use crate::collaborators::SubscriptionDirectory;
use crate::error::EngineResult;
use crate::store::CommissionStore;

#[derive(Clone)]
pub struct StatisticsReconciler {
    commissions: Arc<dyn CommissionStore>,
    subscriptions: Arc<dyn SubscriptionDirectory>,
}

impl core::fmt::Debug for StatisticsReconciler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StatisticsReconciler").finish_non_exhaustive()
    }
}

impl StatisticsReconciler {
    pub fn new(commissions: Arc<dyn CommissionStore>, subscriptions: Arc<dyn SubscriptionDirectory>) -> Self {
        Self {
            commissions,
            subscriptions,
        }
    }

    /// Recompute the organizer's totals and replace the stored ones.
    pub fn reconcile(&self, organizer: OrganizerId) -> EngineResult<OrganizerStats> {
        let commissions = self.commissions.by_organizer(organizer)?;
        let stats = OrganizerStats::from_commissions(&commissions);
        self.subscriptions.replace_stats(organizer, stats.clone())?;
        info!(
            %organizer,
            commissions = commissions.len(),
            tickets_sold = stats.tickets_sold,
            revenue = stats.total_revenue,
            "organizer statistics reconciled"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use crate::collaborators::SubscriptionDirectory;
    use crate::booking_factory::CreateBooking;
    use crate::testing::Fixture;
    use boxoffice_booking::OrganizerStatsDelta;
    use boxoffice_core::{CommissionId, UserId};

    #[test]
    fn reconcile_repairs_drifted_statistics() {
        let f = Fixture::new();
        let event_id = f.publish_typed(&[("GA", 1_000, 10)], None);
        let ticket_type_id = f.ticket_type_id(event_id, "GA");
        for quantity in [1, 2] {
            f.engine
                .bookings()
                .create_booking(CreateBooking {
                    user_id: UserId::new(),
                    event_id,
                    quantity,
                    ticket_type_id: Some(ticket_type_id),
                    seats: vec![],
                })
                .unwrap();
        }

        // Statistics jobs never ran, and a stray delta was applied.
        f.subscriptions
            .apply_stats(&OrganizerStatsDelta {
                commission_id: CommissionId::new(),
                organizer_id: f.organizer,
                tickets_sold: 99,
                revenue: 99_000,
                commission_deducted: 0,
                net_payout: 99_000,
            })
            .unwrap();

        let stats = f.engine.statistics().reconcile(f.organizer).unwrap();
        assert_eq!(stats.tickets_sold, 3);
        assert_eq!(stats.total_revenue, 3_000);
        assert_eq!(stats.commission_deducted, 900);
        assert_eq!(stats.net_payout, 2_100);
        assert_eq!(f.subscriptions.stats(f.organizer).unwrap(), Some(stats));

        // Re-delivered deltas are no-ops against the reconciled totals.
        f.engine.run_side_effects(20);
        assert_eq!(f.subscriptions.stats(f.organizer).unwrap().unwrap().tickets_sold, 3);
    }
}
