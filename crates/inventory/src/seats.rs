use std::collections::BTreeSet;

use boxoffice_core::{DomainError, DomainResult};

/// Numbered-seat rules for events with a finite seat capacity.
///
/// Rules run in a fixed order and the first failing rule wins:
/// count, duplicates, range, then conflicts with seats already held.
#[derive(Debug, Clone, Copy, Default)]
pub struct SeatAllocator;

impl SeatAllocator {
    /// Whether seat rules apply at all to this request.
    pub fn applies(capacity: Option<u32>, seats: &[u32]) -> bool {
        capacity.is_some() && !seats.is_empty()
    }

    /// Validate a seat request against the venue and the seats already held by
    /// non-cancelled bookings. No-op without a capacity or without seats.
    pub fn validate(
        capacity: Option<u32>,
        seats: &[u32],
        quantity: u32,
        held: &BTreeSet<u32>,
    ) -> DomainResult<()> {
        let Some(capacity) = capacity else {
            return Ok(());
        };
        if seats.is_empty() {
            return Ok(());
        }
        Self::validate_shape(capacity, seats, quantity)?;

        let taken = Self::conflicts(seats, held);
        if !taken.is_empty() {
            return Err(DomainError::SeatAlreadyBooked(taken));
        }
        Ok(())
    }

    /// Rules that need nothing but the request: count, duplicates, range.
    pub fn validate_shape(capacity: u32, seats: &[u32], quantity: u32) -> DomainResult<()> {
        let actual = u32::try_from(seats.len()).unwrap_or(u32::MAX);
        if actual != quantity {
            return Err(DomainError::SeatCountMismatch {
                expected: quantity,
                actual,
            });
        }

        let mut seen = BTreeSet::new();
        let duplicates: BTreeSet<u32> = seats.iter().copied().filter(|s| !seen.insert(*s)).collect();
        if !duplicates.is_empty() {
            return Err(DomainError::DuplicateSeat(duplicates.into_iter().collect()));
        }

        let out_of_range: Vec<u32> = seats
            .iter()
            .copied()
            .filter(|s| *s == 0 || *s > capacity)
            .collect();
        if !out_of_range.is_empty() {
            return Err(DomainError::SeatOutOfRange {
                seats: out_of_range,
                capacity,
            });
        }
        Ok(())
    }

    /// Requested seats that are already held, in ascending order.
    pub fn conflicts(seats: &[u32], held: &BTreeSet<u32>) -> Vec<u32> {
        let requested: BTreeSet<u32> = seats.iter().copied().collect();
        requested.intersection(held).copied().collect()
    }
}
