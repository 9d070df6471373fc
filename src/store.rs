//! Storage abstraction shared by the DuckDB and JSON-file backends.
//!
//! Every tenant-owned operation takes the tenant id explicitly; a record that
//! exists under another tenant is reported as [`StoreError::NotFound`], so a
//! handler can never reach across the tenancy boundary by guessing ids.

use std::path::Path;
use std::sync::Arc;

use chrono::NaiveDate;
use thiserror::Error;

use crate::config::{BackendKind, ServerConfig};
use crate::models::{
    ActivityLogEntry, Dataset, ImportSummary, Package, ParseEnumError, Payment, Router, Sale, Staff,
    Subscriber, SuperAdmin, Tenant,
};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("DuckDB error: {0}")]
    DuckDb(#[from] duckdb::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("{0}")]
    Conflict(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("{0}")]
    Invalid(String),
}

impl From<ParseEnumError> for StoreError {
    fn from(e: ParseEnumError) -> Self {
        StoreError::Corrupt(e.to_string())
    }
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: &str) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn unknown_tenant(entity: &str, id: &str, tenant_id: &str) -> Self {
        StoreError::Corrupt(format!("{} '{}' belongs to unknown tenant '{}'", entity, id, tenant_id))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A subscription extension applied by [`Store::extend_subscription`].
///
/// The new expire date is computed from the stored one while the write lock
/// is held, so two extensions of the same line both count.
#[derive(Debug, Clone, Copy)]
pub struct Extension<'a> {
    pub months: u32,
    pub days: u32,
    pub today: NaiveDate,
    /// Debited from the balance
    pub charge: f64,
    /// Recorded and credited to the balance
    pub payment: Option<&'a Payment>,
}

impl Extension<'_> {
    /// New expire date, or `Invalid` when it falls off the calendar
    pub fn new_expiry(&self, current: Option<NaiveDate>) -> StoreResult<NaiveDate> {
        crate::status::extend_expiry(current, self.today, self.months, self.days).ok_or_else(|| {
            StoreError::Invalid(format!(
                "Extending by {} months and {} days is out of range",
                self.months, self.days
            ))
        })
    }
}

/// Persistence operations needed by the API.
///
/// Listing order is part of the contract: subscribers, routers, staff and
/// tenants newest first; sales and payments by date, newest first; packages
/// by speed ascending; activity newest first.
pub trait Store: Send + Sync {
    fn backend_name(&self) -> &'static str;

    // Tenants
    fn list_tenants(&self) -> StoreResult<Vec<Tenant>>;
    fn get_tenant(&self, id: &str) -> StoreResult<Tenant>;
    fn find_tenant_by_slug(&self, slug: &str) -> StoreResult<Option<Tenant>>;
    fn insert_tenant(&self, tenant: &Tenant) -> StoreResult<()>;
    /// Insert a tenant together with its first staff member; neither row is
    /// written when either conflicts
    fn register_tenant(&self, tenant: &Tenant, admin: &Staff) -> StoreResult<()>;
    fn update_tenant(&self, tenant: &Tenant) -> StoreResult<()>;

    // Platform operators
    fn find_super_admin(&self, username: &str) -> StoreResult<Option<SuperAdmin>>;
    fn upsert_super_admin(&self, admin: &SuperAdmin) -> StoreResult<()>;

    // Staff
    fn count_staff(&self) -> StoreResult<usize>;
    fn list_staff(&self, tenant_id: &str) -> StoreResult<Vec<Staff>>;
    fn get_staff(&self, tenant_id: &str, id: &str) -> StoreResult<Staff>;
    /// Usernames are unique across all tenants so login needs no tenant hint
    fn find_staff_by_username(&self, username: &str) -> StoreResult<Option<Staff>>;
    fn insert_staff(&self, staff: &Staff) -> StoreResult<()>;
    fn update_staff(&self, staff: &Staff) -> StoreResult<()>;
    fn delete_staff(&self, tenant_id: &str, id: &str) -> StoreResult<()>;

    // Subscribers
    fn list_subscribers(&self, tenant_id: &str) -> StoreResult<Vec<Subscriber>>;
    fn count_subscribers(&self, tenant_id: &str) -> StoreResult<usize>;
    fn get_subscriber(&self, tenant_id: &str, id: &str) -> StoreResult<Subscriber>;
    fn insert_subscriber(&self, subscriber: &Subscriber) -> StoreResult<()>;
    fn update_subscriber(&self, subscriber: &Subscriber) -> StoreResult<()>;
    /// Also removes the subscriber's payments
    fn delete_subscriber(&self, tenant_id: &str, id: &str) -> StoreResult<()>;

    // Routers
    fn list_routers(&self, tenant_id: &str) -> StoreResult<Vec<Router>>;
    fn get_router(&self, tenant_id: &str, id: &str) -> StoreResult<Router>;
    fn insert_router(&self, router: &Router) -> StoreResult<()>;
    fn update_router(&self, router: &Router) -> StoreResult<()>;
    /// Subscribers attached to the router are detached, not deleted
    fn delete_router(&self, tenant_id: &str, id: &str) -> StoreResult<()>;

    // Sales
    fn list_sales(&self, tenant_id: &str) -> StoreResult<Vec<Sale>>;
    fn get_sale(&self, tenant_id: &str, id: &str) -> StoreResult<Sale>;
    fn insert_sale(&self, sale: &Sale) -> StoreResult<()>;
    fn update_sale(&self, sale: &Sale) -> StoreResult<()>;
    fn delete_sale(&self, tenant_id: &str, id: &str) -> StoreResult<()>;

    // Payments
    fn list_payments(&self, tenant_id: &str) -> StoreResult<Vec<Payment>>;
    fn list_payments_for_subscriber(&self, tenant_id: &str, subscriber_id: &str) -> StoreResult<Vec<Payment>>;
    /// Insert a payment and credit its amount to the subscriber's balance in
    /// one step. Returns the subscriber as stored afterwards.
    fn record_payment(&self, payment: &Payment) -> StoreResult<Subscriber>;
    /// Returns the previous expire date and the subscriber as stored afterwards
    fn extend_subscription(
        &self,
        tenant_id: &str,
        id: &str,
        extension: &Extension<'_>,
    ) -> StoreResult<(Option<NaiveDate>, Subscriber)>;

    // Packages
    fn list_packages(&self, tenant_id: &str, include_inactive: bool) -> StoreResult<Vec<Package>>;
    fn get_package(&self, tenant_id: &str, id: &str) -> StoreResult<Package>;
    fn insert_package(&self, package: &Package) -> StoreResult<()>;
    fn update_package(&self, package: &Package) -> StoreResult<()>;

    // Activity log
    /// Append and trim the tenant's log to its newest `cap` entries
    fn append_activity(&self, entry: &ActivityLogEntry, cap: usize) -> StoreResult<()>;
    fn list_activity(&self, tenant_id: &str, limit: usize) -> StoreResult<Vec<ActivityLogEntry>>;

    // Backups
    /// Dump every table, or only one tenant's rows
    fn export_dataset(&self, tenant_id: Option<&str>) -> StoreResult<Dataset>;
    /// Upsert every row by id, all or nothing. Tenant-owned rows must belong to
    /// a tenant in `data` or already in the store. Afterwards each tenant's
    /// activity log is trimmed to its newest `activity_cap` entries.
    fn import_dataset(&self, data: &Dataset, activity_cap: usize) -> StoreResult<ImportSummary>;
}

/// Open the backend selected by the configuration
pub fn open_store(config: &ServerConfig) -> StoreResult<Arc<dyn Store>> {
    open_backend(config.backend, &config.data_dir)
}

pub fn open_backend(kind: BackendKind, data_dir: &Path) -> StoreResult<Arc<dyn Store>> {
    let store: Arc<dyn Store> = match kind {
        BackendKind::DuckDb => Arc::new(crate::database::Database::new(data_dir.to_path_buf())?),
        BackendKind::Json => Arc::new(crate::json_store::JsonStore::open(data_dir.to_path_buf())?),
    };
    log::info!("Using {} storage backend in {:?}", store.backend_name(), data_dir);
    Ok(store)
}

/// Shared behaviour checks run against every backend.
#[cfg(test)]
pub(crate) mod contract {
    use chrono::{Duration, NaiveDate};

    use super::*;
    use crate::models::*;

    pub fn tenant(id: &str, slug: &str) -> Tenant {
        Tenant {
            id: id.into(),
            name: format!("Net {}", id),
            slug: slug.into(),
            phone: Some("0590000000".into()),
            address: None,
            is_active: true,
            subscription_status: TenantSubscriptionStatus::Trial,
            subscription_ends_at: Some(now_utc() + Duration::days(14)),
            created_at: now_utc(),
        }
    }

    pub fn subscriber(tenant_id: &str, id: &str, name: &str) -> Subscriber {
        Subscriber {
            id: id.into(),
            tenant_id: tenant_id.into(),
            name: name.into(),
            phone: Some("0591234567".into()),
            address: None,
            subscription_type: SubscriptionType::Monthly,
            speed: 20,
            start_date: NaiveDate::from_ymd_opt(2025, 12, 1),
            expire_date: NaiveDate::from_ymd_opt(2025, 12, 31),
            max_devices: 2,
            balance: 0.0,
            router_id: None,
            package_id: None,
            notes: None,
            created_at: now_utc(),
        }
    }

    pub fn staff(tenant_id: &str, id: &str, username: &str, role: StaffRole) -> Staff {
        Staff {
            id: id.into(),
            tenant_id: tenant_id.into(),
            name: username.into(),
            username: username.into(),
            password_hash: "sha256:x".into(),
            role,
            created_at: now_utc(),
        }
    }

    pub fn router(tenant_id: &str, id: &str) -> Router {
        Router {
            id: id.into(),
            tenant_id: tenant_id.into(),
            name: "Main".into(),
            model: Some("Mikrotik".into()),
            ip: Some("192.168.1.1".into()),
            location: Some("Center".into()),
            status: RouterStatus::Online,
            total_ports: 24,
            notes: None,
            created_at: now_utc(),
        }
    }

    pub fn payment(tenant_id: &str, subscriber_id: &str, amount: f64, day: u32) -> Payment {
        Payment {
            id: new_id("payment"),
            tenant_id: tenant_id.into(),
            subscriber_id: subscriber_id.into(),
            amount,
            date: NaiveDate::from_ymd_opt(2025, 12, day).unwrap_or_default(),
            payment_type: PaymentType::Subscription,
            method: "cash".into(),
            notes: None,
            created_by: Some("admin".into()),
            created_at: now_utc(),
        }
    }

    pub fn activity(tenant_id: &str, n: usize) -> ActivityLogEntry {
        ActivityLogEntry {
            id: new_id("log"),
            tenant_id: tenant_id.into(),
            action: ActivityAction::Add,
            entity_type: EntityType::Subscriber,
            entity_id: None,
            entity_name: format!("entry {}", n),
            actor: "admin".into(),
            timestamp: now_utc(),
            details: None,
        }
    }

    pub fn tenant_isolation(store: &dyn Store) {
        store.insert_tenant(&tenant("t1", "one")).unwrap();
        store.insert_tenant(&tenant("t2", "two")).unwrap();
        store.insert_subscriber(&subscriber("t1", "s1", "Ahmad")).unwrap();
        store.insert_subscriber(&subscriber("t2", "s2", "Saeed")).unwrap();

        assert_eq!(store.list_subscribers("t1").unwrap().len(), 1);
        assert_eq!(store.count_subscribers("t2").unwrap(), 1);
        assert!(matches!(store.get_subscriber("t1", "s2"), Err(StoreError::NotFound { .. })));
        assert!(matches!(store.delete_subscriber("t1", "s2"), Err(StoreError::NotFound { .. })));

        let mut foreign = store.get_subscriber("t2", "s2").unwrap();
        foreign.tenant_id = "t1".into();
        assert!(matches!(store.update_subscriber(&foreign), Err(StoreError::NotFound { .. })));
        assert_eq!(store.get_subscriber("t2", "s2").unwrap().name, "Saeed");
    }

    pub fn subscriber_round_trip(store: &dyn Store) {
        store.insert_tenant(&tenant("t1", "one")).unwrap();
        let mut sub = subscriber("t1", "s1", "Ahmad");
        sub.notes = Some("corner house".into());
        sub.balance = -12.5;
        store.insert_subscriber(&sub).unwrap();
        assert_eq!(store.get_subscriber("t1", "s1").unwrap(), sub);

        sub.name = "Ahmad M.".into();
        sub.expire_date = None;
        sub.phone = None;
        store.update_subscriber(&sub).unwrap();
        assert_eq!(store.get_subscriber("t1", "s1").unwrap(), sub);

        assert!(matches!(store.insert_subscriber(&sub), Err(StoreError::Conflict(_))));
    }

    pub fn cascades(store: &dyn Store) {
        store.insert_tenant(&tenant("t1", "one")).unwrap();
        store.insert_router(&router("t1", "r1")).unwrap();
        let mut sub = subscriber("t1", "s1", "Ahmad");
        sub.router_id = Some("r1".into());
        store.insert_subscriber(&sub).unwrap();
        store.insert_subscriber(&subscriber("t1", "s2", "Saeed")).unwrap();
        store.record_payment(&payment("t1", "s1", 100.0, 1)).unwrap();
        store.record_payment(&payment("t1", "s1", 50.0, 5)).unwrap();
        store.record_payment(&payment("t1", "s2", 70.0, 3)).unwrap();

        let for_s1 = store.list_payments_for_subscriber("t1", "s1").unwrap();
        assert_eq!(for_s1.len(), 2);
        assert_eq!(for_s1[0].amount, 50.0, "newest payment first");

        store.delete_router("t1", "r1").unwrap();
        assert_eq!(store.get_subscriber("t1", "s1").unwrap().router_id, None);

        store.delete_subscriber("t1", "s1").unwrap();
        let remaining = store.list_payments("t1").unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].subscriber_id, "s2");
    }

    pub fn staff_usernames_are_unique(store: &dyn Store) {
        store.insert_tenant(&tenant("t1", "one")).unwrap();
        store.insert_tenant(&tenant("t2", "two")).unwrap();
        store.insert_staff(&staff("t1", "st1", "admin", StaffRole::Admin)).unwrap();
        let dup = staff("t2", "st2", "admin", StaffRole::Admin);
        assert!(matches!(store.insert_staff(&dup), Err(StoreError::Conflict(_))));
        assert_eq!(store.count_staff().unwrap(), 1);

        let found = store.find_staff_by_username("admin").unwrap().unwrap();
        assert_eq!(found.tenant_id, "t1");
        assert!(store.find_staff_by_username("nobody").unwrap().is_none());

        let mut updated = found.clone();
        updated.password_hash = "$2b$new".into();
        store.update_staff(&updated).unwrap();
        assert_eq!(store.get_staff("t1", "st1").unwrap().password_hash, "$2b$new");

        store.delete_staff("t1", "st1").unwrap();
        assert_eq!(store.count_staff().unwrap(), 0);
    }

    pub fn tenant_slugs_are_unique(store: &dyn Store) {
        store.insert_tenant(&tenant("t1", "one")).unwrap();
        assert!(matches!(store.insert_tenant(&tenant("t2", "one")), Err(StoreError::Conflict(_))));
        assert_eq!(store.find_tenant_by_slug("one").unwrap().unwrap().id, "t1");

        let mut t = store.get_tenant("t1").unwrap();
        t.is_active = false;
        t.subscription_status = TenantSubscriptionStatus::Suspended;
        store.update_tenant(&t).unwrap();
        assert_eq!(store.get_tenant("t1").unwrap(), t);
    }

    pub fn packages_sorted_and_filtered(store: &dyn Store) {
        store.insert_tenant(&tenant("t1", "one")).unwrap();
        for (id, speed, active) in [("p1", 30, true), ("p2", 10, true), ("p3", 20, false)] {
            store
                .insert_package(&Package {
                    id: id.into(),
                    tenant_id: "t1".into(),
                    name: format!("{} Mbps", speed),
                    speed,
                    price: f64::from(speed) * 2.0,
                    duration_days: 30,
                    description: None,
                    is_active: active,
                    created_at: now_utc(),
                })
                .unwrap();
        }
        let active: Vec<String> = store.list_packages("t1", false).unwrap().into_iter().map(|p| p.id).collect();
        assert_eq!(active, vec!["p2", "p1"]);
        assert_eq!(store.list_packages("t1", true).unwrap().len(), 3);
    }

    pub fn activity_is_capped(store: &dyn Store) {
        store.insert_tenant(&tenant("t1", "one")).unwrap();
        store.insert_tenant(&tenant("t2", "two")).unwrap();
        for n in 0..8 {
            store.append_activity(&activity("t1", n), 5).unwrap();
        }
        store.append_activity(&activity("t2", 0), 5).unwrap();

        let log = store.list_activity("t1", 100).unwrap();
        assert_eq!(log.len(), 5);
        assert_eq!(log[0].entity_name, "entry 7", "newest entry first");
        assert_eq!(log[4].entity_name, "entry 3");
        assert_eq!(store.list_activity("t1", 2).unwrap().len(), 2);
        assert_eq!(store.list_activity("t2", 100).unwrap().len(), 1);
    }

    pub fn dataset_round_trip(source: &dyn Store, target: &dyn Store) {
        source.insert_tenant(&tenant("t1", "one")).unwrap();
        source.insert_tenant(&tenant("t2", "two")).unwrap();
        source.insert_staff(&staff("t1", "st1", "admin", StaffRole::Admin)).unwrap();
        source.insert_subscriber(&subscriber("t1", "s1", "Ahmad")).unwrap();
        source.insert_subscriber(&subscriber("t2", "s2", "Saeed")).unwrap();
        source.insert_router(&router("t1", "r1")).unwrap();
        source.record_payment(&payment("t1", "s1", 100.0, 2)).unwrap();
        source.append_activity(&activity("t1", 0), 10).unwrap();

        let only_t1 = source.export_dataset(Some("t1")).unwrap();
        assert_eq!(only_t1.tenants.len(), 1);
        assert_eq!(only_t1.subscribers.len(), 1);

        let all = source.export_dataset(None).unwrap();
        let summary = target.import_dataset(&all, 100).unwrap();
        assert_eq!(summary.tenants, 2);
        assert_eq!(summary.subscribers, 2);
        assert_eq!(summary.payments, 1);
        assert_eq!(target.get_subscriber("t1", "s1").unwrap(), source.get_subscriber("t1", "s1").unwrap());

        // importing the same data twice overwrites instead of duplicating
        target.import_dataset(&all, 100).unwrap();
        assert_eq!(target.list_subscribers("t1").unwrap().len(), 1);
        assert_eq!(target.list_activity("t1", 100).unwrap().len(), 1);
    }

    pub fn failed_import_changes_nothing(store: &dyn Store) {
        store.insert_tenant(&tenant("t1", "one")).unwrap();
        store.insert_subscriber(&subscriber("t1", "s1", "Ahmad")).unwrap();
        let before = store.export_dataset(None).unwrap();

        let mut renamed = subscriber("t1", "s1", "Renamed");
        renamed.balance = 99.0;
        let mut data = Dataset {
            tenants: vec![tenant("t2", "two")],
            staff: vec![staff("t2", "st2", "owner", StaffRole::Admin)],
            subscribers: vec![renamed, subscriber("t2", "s2", "Saeed")],
            ..Dataset::default()
        };
        // the last row points at a tenant that exists nowhere
        data.payments.push(payment("t9", "s2", 10.0, 1));

        let err = store.import_dataset(&data, 100).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)), "unexpected error: {}", err);
        assert_eq!(store.export_dataset(None).unwrap(), before);
        assert!(matches!(store.get_tenant("t2"), Err(StoreError::NotFound { .. })));
        assert!(store.find_staff_by_username("owner").unwrap().is_none());
        assert_eq!(store.get_subscriber("t1", "s1").unwrap().name, "Ahmad");
    }

    pub fn imported_activity_is_ordered_and_capped(store: &dyn Store) {
        store.insert_tenant(&tenant("t1", "one")).unwrap();
        let base = now_utc();
        store
            .append_activity(
                &ActivityLogEntry {
                    timestamp: base + Duration::seconds(150),
                    ..activity("t1", 100)
                },
                10,
            )
            .unwrap();

        // written newest first, with more entries than the cap allows
        let data = Dataset {
            activity_log: (0..6)
                .rev()
                .map(|n| ActivityLogEntry {
                    timestamp: base + Duration::minutes(n as i64),
                    ..activity("t1", n)
                })
                .collect(),
            ..Dataset::default()
        };
        let summary = store.import_dataset(&data, 4).unwrap();
        assert_eq!(summary.activity, 6);

        let names: Vec<String> = store
            .list_activity("t1", 100)
            .unwrap()
            .into_iter()
            .map(|a| a.entity_name)
            .collect();
        assert_eq!(names, vec!["entry 5", "entry 4", "entry 3", "entry 100"]);
    }

    pub fn payments_credit_the_balance(store: &dyn Store) {
        store.insert_tenant(&tenant("t1", "one")).unwrap();
        let mut sub = subscriber("t1", "s1", "Ahmad");
        sub.balance = -30.0;
        store.insert_subscriber(&sub).unwrap();

        let after = store.record_payment(&payment("t1", "s1", 50.0, 4)).unwrap();
        assert_eq!(after.balance, 20.0);
        assert_eq!(store.get_subscriber("t1", "s1").unwrap().balance, 20.0);
        assert_eq!(store.list_payments_for_subscriber("t1", "s1").unwrap().len(), 1);

        // a payment for a missing or foreign subscriber is not stored
        store.insert_tenant(&tenant("t2", "two")).unwrap();
        let foreign = payment("t2", "s1", 10.0, 5);
        assert!(matches!(store.record_payment(&foreign), Err(StoreError::NotFound { .. })));
        assert!(store.list_payments("t2").unwrap().is_empty());
        assert_eq!(store.get_subscriber("t1", "s1").unwrap().balance, 20.0);
    }

    pub fn extension_moves_expiry_and_balance(store: &dyn Store) {
        store.insert_tenant(&tenant("t1", "one")).unwrap();
        let today = NaiveDate::from_ymd_opt(2025, 12, 15).unwrap();
        let mut sub = subscriber("t1", "s1", "Ahmad");
        sub.expire_date = NaiveDate::from_ymd_opt(2025, 12, 20);
        store.insert_subscriber(&sub).unwrap();

        let paid = payment("t1", "s1", 60.0, 15);
        let extension = Extension {
            months: 1,
            days: 0,
            today,
            charge: 100.0,
            payment: Some(&paid),
        };
        let (previous, after) = store.extend_subscription("t1", "s1", &extension).unwrap();
        assert_eq!(previous, NaiveDate::from_ymd_opt(2025, 12, 20));
        assert_eq!(after.expire_date, NaiveDate::from_ymd_opt(2026, 1, 20));
        assert_eq!(after.balance, -40.0);
        assert_eq!(store.get_subscriber("t1", "s1").unwrap(), after);
        assert_eq!(store.list_payments_for_subscriber("t1", "s1").unwrap().len(), 1);

        let too_far = Extension {
            months: 4_000_000_000,
            days: 0,
            today,
            charge: 5.0,
            payment: None,
        };
        let err = store.extend_subscription("t1", "s1", &too_far).unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
        assert_eq!(store.get_subscriber("t1", "s1").unwrap(), after);

        let missing = Extension { payment: None, ..extension };
        assert!(matches!(
            store.extend_subscription("t1", "nope", &missing),
            Err(StoreError::NotFound { .. })
        ));
    }

    pub fn register_tenant_is_all_or_nothing(store: &dyn Store) {
        store.insert_tenant(&tenant("t1", "one")).unwrap();
        store.insert_staff(&staff("t1", "st1", "admin", StaffRole::Admin)).unwrap();

        let taken = staff("t2", "st2", "ADMIN", StaffRole::Admin);
        assert!(matches!(store.register_tenant(&tenant("t2", "two"), &taken), Err(StoreError::Conflict(_))));
        assert!(matches!(store.get_tenant("t2"), Err(StoreError::NotFound { .. })));
        assert!(store.find_tenant_by_slug("two").unwrap().is_none());

        let owner = staff("t2", "st2", "owner", StaffRole::Admin);
        store.register_tenant(&tenant("t2", "two"), &owner).unwrap();
        assert_eq!(store.get_staff("t2", "st2").unwrap().username, "owner");
        assert_eq!(store.list_tenants().unwrap().len(), 2);
    }

    pub fn concurrent_payments_all_count(store: Arc<dyn Store>) {
        store.insert_tenant(&tenant("t1", "one")).unwrap();
        store.insert_subscriber(&subscriber("t1", "s1", "Ahmad")).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..5 {
                        store.record_payment(&payment("t1", "s1", 1.0, 2)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.list_payments("t1").unwrap().len(), 40);
        assert_eq!(store.get_subscriber("t1", "s1").unwrap().balance, 40.0);
    }
}
