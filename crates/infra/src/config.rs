//! Engine configuration, read from `BOXOFFICE_*` environment variables.

use std::time::Duration;

use tracing::warn;

use boxoffice_booking::CommissionRate;
use boxoffice_waitlist::NotifyPolicy;

pub const ENV_NOTIFICATION_EXPIRY_HOURS: &str = "BOXOFFICE_NOTIFICATION_EXPIRY_HOURS";
pub const ENV_DEFAULT_COMMISSION_PERCENT: &str = "BOXOFFICE_DEFAULT_COMMISSION_PERCENT";
pub const ENV_MAX_ID_ATTEMPTS: &str = "BOXOFFICE_MAX_ID_ATTEMPTS";
pub const ENV_WAITLIST_NOTIFY_POLICY: &str = "BOXOFFICE_WAITLIST_NOTIFY_POLICY";
pub const ENV_EXPIRY_SWEEP_SECS: &str = "BOXOFFICE_EXPIRY_SWEEP_SECS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// How long a notified waitlist entry has to book before it expires.
    pub notification_expiry_hours: u32,
    /// Used when the organizer has no active subscription.
    pub default_commission_rate: CommissionRate,
    /// Bound on candidate draws per generated code before giving up.
    pub max_id_attempts: u32,
    pub notify_policy: NotifyPolicy,
    pub expiry_sweep_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            notification_expiry_hours: 48,
            default_commission_rate: CommissionRate::DEFAULT,
            max_id_attempts: 5,
            notify_policy: NotifyPolicy::EntryCount,
            expiry_sweep_interval: Duration::from_secs(300),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset keys take the default;
    /// malformed values log a warning and take the default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let notification_expiry_hours = parse_or(
            &lookup,
            ENV_NOTIFICATION_EXPIRY_HOURS,
            defaults.notification_expiry_hours,
            |v| v.parse::<u32>().ok().filter(|h| *h > 0),
        );
        let default_commission_rate = parse_or(
            &lookup,
            ENV_DEFAULT_COMMISSION_PERCENT,
            defaults.default_commission_rate,
            |v| v.parse::<CommissionRate>().ok(),
        );
        let max_id_attempts = parse_or(&lookup, ENV_MAX_ID_ATTEMPTS, defaults.max_id_attempts, |v| {
            v.parse::<u32>().ok().filter(|n| *n > 0)
        });
        let notify_policy = parse_or(
            &lookup,
            ENV_WAITLIST_NOTIFY_POLICY,
            defaults.notify_policy,
            |v| v.parse::<NotifyPolicy>().ok(),
        );
        let expiry_sweep_interval = parse_or(
            &lookup,
            ENV_EXPIRY_SWEEP_SECS,
            defaults.expiry_sweep_interval,
            |v| v.parse::<u64>().ok().filter(|s| *s > 0).map(Duration::from_secs),
        );

        Self {
            notification_expiry_hours,
            default_commission_rate,
            max_id_attempts,
            notify_policy,
            expiry_sweep_interval,
        }
    }

    pub fn notification_window(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.notification_expiry_hours))
    }
}

fn parse_or<T, L, P>(lookup: &L, key: &str, default: T, parse: P) -> T
where
    T: core::fmt::Debug,
    L: Fn(&str) -> Option<String>,
    P: Fn(&str) -> Option<T>,
{
    match lookup(key) {
        None => default,
        Some(raw) => match parse(raw.trim()) {
            Some(v) => v,
            None => {
                warn!(key, value = %raw, fallback = ?default, "invalid configuration value; using default");
                default
            }
        },
    }
}
