//! Subscriber status buckets and expiry date arithmetic.
//!
//! Status is derived on every read from the expire date and balance; it is
//! never written to storage.

use chrono::{DateTime, Days, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{text_enum, Subscriber, SubscriberView, Tenant, TenantSubscriptionStatus};

text_enum!(
    /// Bucket a subscriber falls into on a given day
    SubscriberStatus, "subscriber status", {
        Active => "active",
        Expiring => "expiring",
        Expired => "expired",
        Stopped => "stopped",
        Indebted => "indebted",
    }
);

impl SubscriberStatus {
    /// Whether the subscriber should show up in the dashboard alert list
    pub fn needs_attention(self) -> bool {
        matches!(self, SubscriberStatus::Expiring | SubscriberStatus::Expired)
    }
}

/// Day counts that separate the buckets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusThresholds {
    /// A subscriber with at most this many days left is `expiring`
    pub expiring_within_days: i64,
    /// A subscriber expired for more than this many days is `stopped`
    pub stopped_after_days: i64,
}

impl Default for StatusThresholds {
    fn default() -> Self {
        Self {
            expiring_within_days: 3,
            stopped_after_days: 30,
        }
    }
}

/// Whole days from `today` until `expire`. A missing expire date counts as 0.
pub fn days_left(expire: Option<NaiveDate>, today: NaiveDate) -> i64 {
    match expire {
        Some(date) => (date - today).num_days(),
        None => 0,
    }
}

pub fn classify(
    expire: Option<NaiveDate>,
    balance: f64,
    today: NaiveDate,
    thresholds: &StatusThresholds,
) -> SubscriberStatus {
    let days = days_left(expire, today);
    if days < -thresholds.stopped_after_days {
        SubscriberStatus::Stopped
    } else if days < 0 {
        SubscriberStatus::Expired
    } else if balance < 0.0 {
        SubscriberStatus::Indebted
    } else if days <= thresholds.expiring_within_days {
        SubscriberStatus::Expiring
    } else {
        SubscriberStatus::Active
    }
}

pub fn view(subscriber: Subscriber, today: NaiveDate, thresholds: &StatusThresholds) -> SubscriberView {
    let days = days_left(subscriber.expire_date, today);
    let status = classify(subscriber.expire_date, subscriber.balance, today, thresholds);
    SubscriberView {
        subscriber,
        days_left: days,
        status,
    }
}

/// New expire date after extending by `months` and `days`, or `None` when
/// the result falls outside the calendar chrono can represent.
///
/// Extension counts from the later of today and the current expire date, so
/// time left on an active line is kept and a lapsed line restarts today.
pub fn extend_expiry(current: Option<NaiveDate>, today: NaiveDate, months: u32, days: u32) -> Option<NaiveDate> {
    let base = match current {
        Some(date) if date > today => date,
        _ => today,
    };
    base.checked_add_months(Months::new(months))?
        .checked_add_days(Days::new(u64::from(days)))
}

/// Banner shown to a tenant nearing the end of its trial
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrialAlert {
    None,
    Warning,
    Urgent,
    Expired,
}

/// Days left in a tenant's trial, rounded up. `None` when the tenant is not on trial.
pub fn trial_days_left(tenant: &Tenant, now: DateTime<Utc>) -> Option<i64> {
    if tenant.subscription_status != TenantSubscriptionStatus::Trial {
        return None;
    }
    let ends = tenant.subscription_ends_at?;
    let secs = (ends - now).num_seconds();
    Some(secs.div_euclid(86_400) + i64::from(secs.rem_euclid(86_400) > 0))
}

pub fn trial_alert(tenant: &Tenant, now: DateTime<Utc>) -> TrialAlert {
    match trial_days_left(tenant, now) {
        None => TrialAlert::None,
        Some(d) if d <= 0 => TrialAlert::Expired,
        Some(d) if d <= 3 => TrialAlert::Urgent,
        Some(d) if d <= 7 => TrialAlert::Warning,
        Some(_) => TrialAlert::None,
    }
}

/// Whether a tenant's own subscription still allows its staff to sign in
pub fn tenant_in_good_standing(tenant: &Tenant, now: DateTime<Utc>) -> bool {
    if !tenant.is_active {
        return false;
    }
    match tenant.subscription_status {
        TenantSubscriptionStatus::Expired | TenantSubscriptionStatus::Suspended => false,
        TenantSubscriptionStatus::Trial | TenantSubscriptionStatus::Active => {
            tenant.subscription_ends_at.map_or(true, |ends| ends > now)
        }
    }
}
