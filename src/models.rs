//! Data models for the Wasla server.
//!
//! These structs are shared between the storage backends and the REST API.
//! Every tenant-owned record carries `tenant_id`; JSON field names are camelCase
//! so the dashboard front end can consume them directly.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::status::SubscriberStatus;

/// Date format used for subscriber, sale and payment dates.
pub const DATE_FMT: &str = "%Y-%m-%d";

/// Error returned when a stored or submitted enum value is not recognised.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {kind}: '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Declares a closed string enum that is stored as lowercase text and
/// serialized the same way over the API.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ::serde::Serialize, ::serde::Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl ::std::str::FromStr for $name {
            type Err = $crate::models::ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim() {
                    $($text => Ok($name::$variant),)+
                    other => Err($crate::models::ParseEnumError { kind: $kind, value: other.to_string() }),
                }
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

pub(crate) use text_enum;

text_enum!(
    /// Billing state of a tenant's own Wasla subscription
    TenantSubscriptionStatus, "tenant subscription status", {
        Trial => "trial",
        Active => "active",
        Expired => "expired",
        Suspended => "suspended",
    }
);

text_enum!(
    /// How a subscriber is billed
    SubscriptionType, "subscription type", {
        Monthly => "monthly",
        User => "user",
    }
);

text_enum!(
    /// Manually maintained router state (there is no live telemetry)
    RouterStatus, "router status", {
        Online => "online",
        Offline => "offline",
    }
);

text_enum!(
    /// Card sale channel
    SaleType, "sale type", {
        Wholesale => "wholesale",
        Retail => "retail",
    }
);

text_enum!(
    /// Reason a payment was taken
    PaymentType, "payment type", {
        Subscription => "subscription",
        Extension => "extension",
    }
);

text_enum!(
    /// Staff role; gates which sections of the dashboard a member may change
    StaffRole, "staff role", {
        Admin => "admin",
        Subs => "subs",
        Sales => "sales",
        Routers => "routers",
    }
);

text_enum!(
    ActivityAction, "activity action", {
        Add => "add",
        Edit => "edit",
        Delete => "delete",
        Payment => "payment",
        Extend => "extend",
        Login => "login",
        Logout => "logout",
        Restore => "restore",
    }
);

text_enum!(
    EntityType, "entity type", {
        Subscriber => "subscriber",
        Router => "router",
        Sale => "sale",
        Payment => "payment",
        Package => "package",
        Staff => "staff",
        Tenant => "tenant",
        System => "system",
    }
);

/// An ISP operator's isolated workspace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub is_active: bool,
    pub subscription_status: TenantSubscriptionStatus,
    pub subscription_ends_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Internet subscriber as stored. Status is never persisted; see [`SubscriberView`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscriber {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub subscription_type: SubscriptionType,
    /// Line speed in Mbps
    pub speed: u32,
    pub start_date: Option<NaiveDate>,
    pub expire_date: Option<NaiveDate>,
    pub max_devices: u32,
    /// Account balance; negative means the subscriber owes money
    pub balance: f64,
    pub router_id: Option<String>,
    pub package_id: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Subscriber enriched with the values derived from its dates
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriberView {
    #[serde(flatten)]
    pub subscriber: Subscriber,
    pub days_left: i64,
    pub status: SubscriberStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Router {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub model: Option<String>,
    pub ip: Option<String>,
    pub location: Option<String>,
    pub status: RouterStatus,
    pub total_ports: u32,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Router with the number of subscribers attached to it
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterView {
    #[serde(flatten)]
    pub router: Router,
    pub subscriber_count: usize,
}

/// One line of the card-sales ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sale {
    pub id: String,
    pub tenant_id: String,
    #[serde(rename = "type")]
    pub sale_type: SaleType,
    /// Number of cards sold
    pub count: u32,
    /// Total price of the line
    pub price: f64,
    pub date: NaiveDate,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: String,
    pub tenant_id: String,
    pub subscriber_id: String,
    pub amount: f64,
    pub date: NaiveDate,
    #[serde(rename = "type")]
    pub payment_type: PaymentType,
    pub method: String,
    pub notes: Option<String>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A speed/price plan offered by a tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Package {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub speed: u32,
    pub price: f64,
    pub duration_days: u32,
    pub description: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Staff account as stored, including the password hash.
///
/// Never return this from the API directly; use [`StaffView`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Staff {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub username: String,
    pub password_hash: String,
    pub role: StaffRole,
    pub created_at: DateTime<Utc>,
}

/// Staff account without credentials
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaffView {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub username: String,
    pub role: StaffRole,
    pub created_at: DateTime<Utc>,
}

impl From<&Staff> for StaffView {
    fn from(s: &Staff) -> Self {
        Self {
            id: s.id.clone(),
            tenant_id: s.tenant_id.clone(),
            name: s.name.clone(),
            username: s.username.clone(),
            role: s.role,
            created_at: s.created_at,
        }
    }
}

/// Platform operator that manages tenants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuperAdmin {
    pub username: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Audit trail entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityLogEntry {
    pub id: String,
    pub tenant_id: String,
    pub action: ActivityAction,
    pub entity_type: EntityType,
    pub entity_id: Option<String>,
    pub entity_name: String,
    /// Display name of whoever performed the action
    pub actor: String,
    pub timestamp: DateTime<Utc>,
    pub details: Option<String>,
}

/// Every table, as held by the JSON backend and carried inside backups
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Dataset {
    pub tenants: Vec<Tenant>,
    pub super_admins: Vec<SuperAdmin>,
    pub staff: Vec<Staff>,
    pub subscribers: Vec<Subscriber>,
    pub routers: Vec<Router>,
    pub sales: Vec<Sale>,
    pub payments: Vec<Payment>,
    pub packages: Vec<Package>,
    pub activity_log: Vec<ActivityLogEntry>,
}

impl Dataset {
    /// Keep only rows owned by `tenant_id`. Platform-level rows (tenants other
    /// than this one, super admins) are dropped.
    pub fn retain_tenant(&mut self, tenant_id: &str) {
        self.tenants.retain(|t| t.id == tenant_id);
        self.super_admins.clear();
        self.staff.retain(|r| r.tenant_id == tenant_id);
        self.subscribers.retain(|r| r.tenant_id == tenant_id);
        self.routers.retain(|r| r.tenant_id == tenant_id);
        self.sales.retain(|r| r.tenant_id == tenant_id);
        self.payments.retain(|r| r.tenant_id == tenant_id);
        self.packages.retain(|r| r.tenant_id == tenant_id);
        self.activity_log.retain(|r| r.tenant_id == tenant_id);
    }

    pub fn row_count(&self) -> usize {
        self.tenants.len()
            + self.super_admins.len()
            + self.staff.len()
            + self.subscribers.len()
            + self.routers.len()
            + self.sales.len()
            + self.payments.len()
            + self.packages.len()
            + self.activity_log.len()
    }
}

/// Versioned export wrapper written into backup archives
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub format_version: u32,
    pub exported_at: DateTime<Utc>,
    pub data: Dataset,
}

/// Row counts written by a snapshot import
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub tenants: usize,
    pub staff: usize,
    pub subscribers: usize,
    pub routers: usize,
    pub sales: usize,
    pub payments: usize,
    pub packages: usize,
    pub activity: usize,
}

impl ImportSummary {
    pub fn total(&self) -> usize {
        self.tenants
            + self.staff
            + self.subscribers
            + self.routers
            + self.sales
            + self.payments
            + self.packages
            + self.activity
    }
}

/// Build a new record id of the form `<prefix>-<uuid>`
pub fn new_id(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4().simple())
}

/// Current time truncated to milliseconds, the precision every backend keeps
pub fn now_utc() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}
