use core::str::FromStr;
use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use boxoffice_core::{BookingId, CommissionId, DomainError, DomainResult, EventId, OrganizerId};

const FULL_RATE_BP: u32 = 10_000;

/// Platform commission rate in basis points (1% = 100 bp).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommissionRate(u32);

impl CommissionRate {
    /// Used when the organizer has no active subscription.
    pub const DEFAULT: CommissionRate = CommissionRate(3_000);

    pub fn from_basis_points(bp: u32) -> DomainResult<Self> {
        if bp > FULL_RATE_BP {
            return Err(DomainError::validation(format!(
                "commission rate {bp} bp exceeds 100%"
            )));
        }
        Ok(Self(bp))
    }

    pub fn basis_points(self) -> u32 {
        self.0
    }
}

impl Default for CommissionRate {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl core::fmt::Display for CommissionRate {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{:02}%", self.0 / 100, self.0 % 100)
    }
}

/// Parses a percentage such as `"30"` or `"12.5"` (at most two decimals).
impl FromStr for CommissionRate {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DomainError::validation(format!("invalid commission percentage: '{s}'"));
        let s = s.trim().trim_end_matches('%');
        let (whole, frac) = s.split_once('.').unwrap_or((s, ""));
        if whole.is_empty() || frac.len() > 2 {
            return Err(invalid());
        }
        let whole: u32 = whole.parse().map_err(|_| invalid())?;
        let frac: u32 = if frac.is_empty() {
            0
        } else {
            let digits: u32 = frac.parse().map_err(|_| invalid())?;
            if frac.len() == 1 { digits * 10 } else { digits }
        };
        let bp = whole
            .checked_mul(100)
            .and_then(|w| w.checked_add(frac))
            .ok_or_else(invalid)?;
        Self::from_basis_points(bp)
    }
}

/// Result of splitting a subtotal between organizer and platform.
///
/// `commission_amount + organizer_amount == subtotal` always holds.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionSplit {
    pub rate: CommissionRate,
    pub subtotal: u64,
    pub commission_amount: u64,
    pub organizer_amount: u64,
    pub platform_amount: u64,
}

#[derive(Debug, Copy, Clone, Default)]
pub struct CommissionCalculator;

impl CommissionCalculator {
    /// Split `subtotal` (minor units) at `rate`, rounding the commission half up.
    pub fn compute(subtotal: u64, rate: CommissionRate) -> CommissionSplit {
        let bp = u128::from(rate.basis_points());
        let raw = (u128::from(subtotal) * bp + u128::from(FULL_RATE_BP / 2)) / u128::from(FULL_RATE_BP);
        // rate <= 100%, so raw <= subtotal and fits back into u64.
        let commission_amount = u64::try_from(raw).unwrap_or(subtotal).min(subtotal);
        CommissionSplit {
            rate,
            subtotal,
            commission_amount,
            organizer_amount: subtotal - commission_amount,
            platform_amount: commission_amount,
        }
    }
}

/// Payout lifecycle, advanced by the payout process one step at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommissionStatus {
    Pending,
    Allocated,
    Processed,
    Paid,
}

impl CommissionStatus {
    pub fn next(self) -> Option<Self> {
        match self {
            CommissionStatus::Pending => Some(CommissionStatus::Allocated),
            CommissionStatus::Allocated => Some(CommissionStatus::Processed),
            CommissionStatus::Processed => Some(CommissionStatus::Paid),
            CommissionStatus::Paid => None,
        }
    }
}

/// Commission record, one per booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commission {
    pub id: CommissionId,
    pub booking_id: BookingId,
    pub event_id: EventId,
    pub organizer_id: OrganizerId,
    pub ticket_price: u64,
    pub quantity: u32,
    pub subtotal: u64,
    pub rate: CommissionRate,
    pub commission_amount: u64,
    pub organizer_amount: u64,
    pub platform_amount: u64,
    pub status: CommissionStatus,
    pub created_at: DateTime<Utc>,
}

impl Commission {
    pub fn new(
        id: CommissionId,
        booking_id: BookingId,
        event_id: EventId,
        organizer_id: OrganizerId,
        ticket_price: u64,
        quantity: u32,
        split: CommissionSplit,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            booking_id,
            event_id,
            organizer_id,
            ticket_price,
            quantity,
            subtotal: split.subtotal,
            rate: split.rate,
            commission_amount: split.commission_amount,
            organizer_amount: split.organizer_amount,
            platform_amount: split.platform_amount,
            status: CommissionStatus::Pending,
            created_at,
        }
    }

    /// Move to `to`, which must be the immediate successor of the current status.
    pub fn advance(&mut self, to: CommissionStatus) -> DomainResult<()> {
        if self.status.next() != Some(to) {
            return Err(DomainError::invalid_transition(format!(
                "commission cannot move from {:?} to {:?}",
                self.status, to
            )));
        }
        self.status = to;
        Ok(())
    }

    pub fn stats_delta(&self) -> OrganizerStatsDelta {
        OrganizerStatsDelta {
            commission_id: self.id,
            organizer_id: self.organizer_id,
            tickets_sold: u64::from(self.quantity),
            revenue: self.subtotal,
            commission_deducted: self.commission_amount,
            net_payout: self.organizer_amount,
        }
    }
}

/// Contribution of one commission to the organizer's running totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizerStatsDelta {
    pub commission_id: CommissionId,
    pub organizer_id: OrganizerId,
    pub tickets_sold: u64,
    pub revenue: u64,
    pub commission_deducted: u64,
    pub net_payout: u64,
}

/// Running statistics kept on an organizer's subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizerStats {
    pub tickets_sold: u64,
    pub total_revenue: u64,
    pub commission_deducted: u64,
    pub net_payout: u64,
    pub pending_payout: u64,
    applied: BTreeSet<CommissionId>,
}

impl OrganizerStats {
    /// Fold a delta in. Returns `false` (and changes nothing) if this
    /// commission was already counted.
    pub fn apply(&mut self, delta: &OrganizerStatsDelta) -> bool {
        if !self.applied.insert(delta.commission_id) {
            return false;
        }
        self.tickets_sold += delta.tickets_sold;
        self.total_revenue += delta.revenue;
        self.commission_deducted += delta.commission_deducted;
        self.net_payout += delta.net_payout;
        self.pending_payout += delta.net_payout;
        true
    }

    /// Rebuild totals from the authoritative commission records.
    pub fn from_commissions<'a>(commissions: impl IntoIterator<Item = &'a Commission>) -> Self {
        let mut stats = Self::default();
        for c in commissions {
            if stats.apply(&c.stats_delta()) && c.status == CommissionStatus::Paid {
                stats.pending_payout -= c.organizer_amount;
            }
        }
        stats
    }

    pub fn has_applied(&self, id: CommissionId) -> bool {
        self.applied.contains(&id)
    }
}
