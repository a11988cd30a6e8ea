//! Waitlist domain module.
//!
//! Entry status machine and the queue ordering relation. Positions are always
//! computed from the ordering, never trusted from storage.

pub mod entry;
pub mod ordering;

pub use entry::{
    EntryChanged, EntryNotified, NewWaitlistEntry, WaitlistEntry, WaitlistEvent, WaitlistStatus,
};
pub use ordering::{
    NotifyPolicy, in_queue_order, insert_position, next_in_line, position_of, queue_cmp,
};
