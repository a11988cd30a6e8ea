//! Queue ordering for a single (event, ticket type) waitlist.
//!
//! One relation is used everywhere: `priority` descending, then stored
//! `position` ascending, then `created_at` ascending. The entry id breaks any
//! remaining tie so the order is total.

use core::cmp::Ordering;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use boxoffice_core::{AggregateRoot, DomainError};

use crate::entry::{WaitlistEntry, WaitlistStatus};

pub fn queue_cmp(a: &WaitlistEntry, b: &WaitlistEntry) -> Ordering {
    b.priority()
        .cmp(&a.priority())
        .then_with(|| a.stored_position().cmp(&b.stored_position()))
        .then_with(|| a.created_at().cmp(&b.created_at()))
        .then_with(|| a.id().cmp(b.id()))
}

/// Sort entries into queue order.
pub fn in_queue_order<'a, I>(entries: I) -> Vec<&'a WaitlistEntry>
where
    I: IntoIterator<Item = &'a WaitlistEntry>,
{
    let mut out: Vec<&WaitlistEntry> = entries.into_iter().collect();
    out.sort_by(|a, b| queue_cmp(a, b));
    out
}

/// Advisory position for a new entry: waiting entries in its queue, plus one.
pub fn insert_position<'a, I>(queue: I) -> u32
where
    I: IntoIterator<Item = &'a WaitlistEntry>,
{
    let waiting = queue
        .into_iter()
        .filter(|e| e.status() == WaitlistStatus::Waiting)
        .count();
    u32::try_from(waiting).unwrap_or(u32::MAX - 1) + 1
}

/// Live position of `target`: one plus the waiting entries of the same queue
/// ordered before it. `None` unless `target` is itself waiting.
pub fn position_of<'a, I>(queue: I, target: &WaitlistEntry) -> Option<u32>
where
    I: IntoIterator<Item = &'a WaitlistEntry>,
{
    if target.status() != WaitlistStatus::Waiting {
        return None;
    }
    let ahead = queue
        .into_iter()
        .filter(|e| e.status() == WaitlistStatus::Waiting)
        .filter(|e| e.in_queue(target.event_id(), target.ticket_type()))
        .filter(|e| e.id() != target.id())
        .filter(|e| queue_cmp(e, target) == Ordering::Less)
        .count();
    Some(u32::try_from(ahead).unwrap_or(u32::MAX - 1) + 1)
}

/// Up to `limit` waiting entries in queue order.
pub fn next_in_line<'a, I>(queue: I, limit: usize) -> Vec<&'a WaitlistEntry>
where
    I: IntoIterator<Item = &'a WaitlistEntry>,
{
    let mut waiting = in_queue_order(
        queue
            .into_iter()
            .filter(|e| e.status() == WaitlistStatus::Waiting),
    );
    waiting.truncate(limit);
    waiting
}

/// How freed tickets translate into notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyPolicy {
    /// Freed quantity caps the number of entries notified.
    #[default]
    EntryCount,
    /// Freed quantity caps the summed requested quantity. Walks the queue in
    /// order and stops at the first entry that does not fit.
    TicketQuantity,
}

impl NotifyPolicy {
    /// Pick the entries to notify from a waiting queue for `available` tickets.
    pub fn select<'a, I>(self, queue: I, available: u32) -> Vec<&'a WaitlistEntry>
    where
        I: IntoIterator<Item = &'a WaitlistEntry>,
    {
        match self {
            NotifyPolicy::EntryCount => {
                next_in_line(queue, usize::try_from(available).unwrap_or(usize::MAX))
            }
            NotifyPolicy::TicketQuantity => {
                let mut remaining = available;
                next_in_line(queue, usize::MAX)
                    .into_iter()
                    .take_while(|e| {
                        let fits = e.quantity() <= remaining;
                        if fits {
                            remaining -= e.quantity();
                        }
                        fits
                    })
                    .collect()
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NotifyPolicy::EntryCount => "entries",
            NotifyPolicy::TicketQuantity => "tickets",
        }
    }
}

impl FromStr for NotifyPolicy {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "entries" | "entry_count" => Ok(NotifyPolicy::EntryCount),
            "tickets" | "ticket_quantity" => Ok(NotifyPolicy::TicketQuantity),
            other => Err(DomainError::validation(format!(
                "unknown waitlist notify policy '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::NewWaitlistEntry;
    use boxoffice_core::{EventId, UserId, WaitlistEntryId};
    use chrono::{DateTime, Duration, Utc};
    use proptest::prelude::*;

    fn entry(event_id: EventId, priority: i32, position: u32, quantity: u32, at: DateTime<Utc>) -> WaitlistEntry {
        WaitlistEntry::join(NewWaitlistEntry {
            id: WaitlistEntryId::new(),
            user_id: UserId::new(),
            event_id,
            ticket_type: Some("GA".to_string()),
            quantity,
            priority,
            position,
            created_at: at,
        })
        .unwrap()
    }

    #[test]
    fn priority_beats_position_beats_age() {
        let ev = EventId::new();
        let t0 = Utc::now();
        let early = entry(ev, 0, 1, 1, t0);
        let vip = entry(ev, 5, 9, 1, t0 + Duration::seconds(30));
        let same_pos_later = entry(ev, 0, 1, 1, t0 + Duration::seconds(1));
        let second = entry(ev, 0, 2, 1, t0 - Duration::seconds(10));

        let order: Vec<_> = in_queue_order([&second, &same_pos_later, &early, &vip])
            .into_iter()
            .map(|e| e.id_typed())
            .collect();
        assert_eq!(
            order,
            vec![vip.id_typed(), early.id_typed(), same_pos_later.id_typed(), second.id_typed()]
        );
    }

    #[test]
    fn positions_close_up_after_a_leave() {
        let ev = EventId::new();
        let t0 = Utc::now();
        let mut queue = Vec::new();
        for i in 0..3 {
            let pos = insert_position(&queue);
            queue.push(entry(ev, 0, pos, 1, t0 + Duration::seconds(i)));
        }
        let positions: Vec<_> = queue.iter().map(|e| position_of(&queue, e).unwrap()).collect();
        assert_eq!(positions, vec![1, 2, 3]);

        queue.remove(1);
        let positions: Vec<_> = queue.iter().map(|e| position_of(&queue, e).unwrap()).collect();
        assert_eq!(positions, vec![1, 2]);
    }

    #[test]
    fn notified_entries_have_no_position_and_do_not_count() {
        let ev = EventId::new();
        let t0 = Utc::now();
        let mut first = entry(ev, 0, 1, 1, t0);
        let second = entry(ev, 0, 2, 1, t0 + Duration::seconds(1));
        first.notify(t0, Duration::hours(48)).unwrap();

        let queue = vec![first.clone(), second.clone()];
        assert_eq!(position_of(&queue, &first), None);
        assert_eq!(position_of(&queue, &second), Some(1));
        assert_eq!(next_in_line(&queue, 5).len(), 1);
    }

    #[test]
    fn entry_count_policy_caps_entries() {
        let ev = EventId::new();
        let t0 = Utc::now();
        let queue: Vec<_> = (0..3)
            .map(|i| entry(ev, 0, i + 1, 3, t0 + Duration::seconds(i64::from(i))))
            .collect();
        assert_eq!(NotifyPolicy::EntryCount.select(&queue, 2).len(), 2);
    }

    #[test]
    fn ticket_quantity_policy_stops_at_first_misfit() {
        let ev = EventId::new();
        let t0 = Utc::now();
        let a = entry(ev, 0, 1, 3, t0);
        let b = entry(ev, 0, 2, 4, t0 + Duration::seconds(1));
        let c = entry(ev, 0, 3, 1, t0 + Duration::seconds(2));
        let queue = vec![a.clone(), b, c];

        // 5 freed: a (3) fits, b (4) does not, c is not considered.
        let picked = NotifyPolicy::TicketQuantity.select(&queue, 5);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].id_typed(), a.id_typed());
    }

    #[test]
    fn policy_parsing() {
        assert_eq!("entries".parse::<NotifyPolicy>().unwrap(), NotifyPolicy::EntryCount);
        assert_eq!(" Tickets ".parse::<NotifyPolicy>().unwrap(), NotifyPolicy::TicketQuantity);
        assert!("fifo".parse::<NotifyPolicy>().is_err());
        assert_eq!(NotifyPolicy::default().as_str(), "entries");
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: live position == 1 + waiting predecessors, and positions
        /// of the waiting entries are exactly 1..=n in queue order.
        #[test]
        fn positions_are_dense_and_follow_queue_order(
            specs in prop::collection::vec((-2i32..3, 1u32..6, 0i64..50), 1..25)
        ) {
            let ev = EventId::new();
            let t0 = Utc::now();
            let queue: Vec<WaitlistEntry> = specs
                .iter()
                .map(|(prio, pos, secs)| entry(ev, *prio, *pos, 1, t0 + Duration::seconds(*secs)))
                .collect();

            let ordered = in_queue_order(&queue);
            for (idx, e) in ordered.iter().enumerate() {
                let expected = u32::try_from(idx).unwrap() + 1;
                prop_assert_eq!(position_of(&queue, e), Some(expected));
            }
        }
    }
}
