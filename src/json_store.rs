//! Single-file JSON storage backend.
//!
//! The whole dataset lives in memory behind one mutex and is written to
//! `wasla.json` after every change. A write goes to a temp file that is then
//! renamed over the original, and the in-memory copy is only replaced once the
//! file is on disk. Concurrent requests therefore serialize instead of
//! overwriting each other's changes.

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{NaiveDate, Utc};

use crate::models::{
    ActivityLogEntry, Dataset, ImportSummary, Package, Payment, Router, Sale, Staff, Subscriber, SuperAdmin,
    Tenant,
};
use crate::store::{Extension, Store, StoreError, StoreResult};

pub struct JsonStore {
    path: PathBuf,
    data: Mutex<Dataset>,
}

impl JsonStore {
    pub fn open(data_dir: PathBuf) -> StoreResult<Self> {
        fs::create_dir_all(&data_dir)?;
        let path = data_dir.join("wasla.json");
        log::info!("Opening JSON store at: {:?}", path);

        let data = if path.exists() {
            let raw = fs::read(&path)?;
            match serde_json::from_slice::<Dataset>(&raw) {
                Ok(data) => data,
                Err(e) => {
                    let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
                    let backup = path.with_extension(format!("json.bak.{}", timestamp));
                    log::warn!("Unreadable JSON store ({}). Moving it to {:?} and starting empty", e, backup);
                    fs::rename(&path, &backup)?;
                    Dataset::default()
                }
            }
        } else {
            Dataset::default()
        };

        let store = Self {
            path,
            data: Mutex::new(data),
        };
        {
            let guard = store.lock();
            store.persist(&guard)?;
            log::info!("JSON store loaded with {} rows", guard.row_count());
        }
        Ok(store)
    }

    fn lock(&self) -> MutexGuard<'_, Dataset> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, data: &Dataset) -> StoreResult<()> {
        let tmp = self.path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(data)?;
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&Dataset) -> StoreResult<T>) -> StoreResult<T> {
        let guard = self.lock();
        f(&guard)
    }

    /// Apply `f` to a copy of the data, persist it, then swap it in
    fn mutate<T>(&self, f: impl FnOnce(&mut Dataset) -> StoreResult<T>) -> StoreResult<T> {
        let mut guard = self.lock();
        let mut next = guard.clone();
        let out = f(&mut next)?;
        self.persist(&next)?;
        *guard = next;
        Ok(out)
    }
}

fn same_username(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}

fn owned_by<'a, T>(
    rows: &'a [T],
    tenant_id: &str,
    id: &str,
    key: impl Fn(&T) -> (&str, &str),
) -> Option<&'a T> {
    rows.iter().find(|r| key(*r) == (tenant_id, id))
}

/// Replace the row `key` matches, or report NotFound
fn replace_owned<T>(
    rows: &mut [T],
    row: &T,
    entity: &'static str,
    key: impl Fn(&T) -> (&str, &str),
) -> StoreResult<()>
where
    T: Clone,
{
    let (tenant_id, id) = key(row);
    let pos = rows
        .iter()
        .position(|r| key(r) == (tenant_id, id))
        .ok_or_else(|| StoreError::not_found(entity, id))?;
    rows[pos] = row.clone();
    Ok(())
}

fn reject_duplicate_id<T>(rows: &[T], id: &str, entity: &str, row_id: impl Fn(&T) -> &str) -> StoreResult<()> {
    if rows.iter().any(|r| row_id(r) == id) {
        return Err(StoreError::Conflict(format!("{} '{}' already exists", entity, id)));
    }
    Ok(())
}

/// Overwrite the first row that `matches` in place (dropping any further
/// matches), or append when nothing matches
fn upsert<T>(rows: &mut Vec<T>, row: T, matches: impl Fn(&T) -> bool) {
    match rows.iter().position(&matches) {
        Some(pos) => {
            let mut idx = 0;
            rows.retain(|r| {
                let keep = idx == pos || !matches(r);
                idx += 1;
                keep
            });
            // nothing before `pos` matched, so it still indexes the kept row
            rows[pos] = row;
        }
        None => rows.push(row),
    }
}

fn subscriber_mut<'a>(d: &'a mut Dataset, tenant_id: &str, id: &str) -> StoreResult<&'a mut Subscriber> {
    d.subscribers
        .iter_mut()
        .find(|s| s.tenant_id == tenant_id && s.id == id)
        .ok_or_else(|| StoreError::not_found("Subscriber", id))
}

/// Insert a payment and add its amount to the subscriber's balance
fn credit_payment(d: &mut Dataset, payment: &Payment) -> StoreResult<Subscriber> {
    reject_duplicate_id(&d.payments, &payment.id, "Payment", |p| p.id.as_str())?;
    let sub = subscriber_mut(d, &payment.tenant_id, &payment.subscriber_id)?;
    sub.balance += payment.amount;
    let updated = sub.clone();
    d.payments.push(payment.clone());
    Ok(updated)
}

/// Drop the tenant's oldest entries beyond `cap`. The log is kept oldest first.
fn trim_activity(log: &mut Vec<ActivityLogEntry>, tenant_id: &str, cap: usize) -> usize {
    let owned = log.iter().filter(|a| a.tenant_id == tenant_id).count();
    let excess = owned.saturating_sub(cap);
    let mut left = excess;
    if left > 0 {
        log.retain(|a| {
            if left > 0 && a.tenant_id == tenant_id {
                left -= 1;
                false
            } else {
                true
            }
        });
    }
    excess
}

fn newest_first<T>(mut rows: Vec<T>, key: impl Fn(&T, &T) -> std::cmp::Ordering) -> Vec<T> {
    rows.sort_by(|a, b| key(b, a));
    rows
}

impl Store for JsonStore {
    fn backend_name(&self) -> &'static str {
        "json"
    }

    fn list_tenants(&self) -> StoreResult<Vec<Tenant>> {
        self.read(|d| Ok(newest_first(d.tenants.clone(), |a, b| a.created_at.cmp(&b.created_at))))
    }

    fn get_tenant(&self, id: &str) -> StoreResult<Tenant> {
        self.read(|d| {
            d.tenants
                .iter()
                .find(|t| t.id == id)
                .cloned()
                .ok_or_else(|| StoreError::not_found("Tenant", id))
        })
    }

    fn find_tenant_by_slug(&self, slug: &str) -> StoreResult<Option<Tenant>> {
        self.read(|d| Ok(d.tenants.iter().find(|t| t.slug == slug).cloned()))
    }

    fn insert_tenant(&self, tenant: &Tenant) -> StoreResult<()> {
        self.mutate(|d| {
            reject_duplicate_id(&d.tenants, &tenant.id, "Tenant", |t| t.id.as_str())?;
            if d.tenants.iter().any(|t| t.slug == tenant.slug) {
                return Err(StoreError::Conflict(format!("Slug '{}' is already in use", tenant.slug)));
            }
            d.tenants.push(tenant.clone());
            Ok(())
        })
    }

    fn register_tenant(&self, tenant: &Tenant, admin: &Staff) -> StoreResult<()> {
        self.mutate(|d| {
            reject_duplicate_id(&d.tenants, &tenant.id, "Tenant", |t| t.id.as_str())?;
            if d.tenants.iter().any(|t| t.slug == tenant.slug) {
                return Err(StoreError::Conflict(format!("Slug '{}' is already in use", tenant.slug)));
            }
            reject_duplicate_id(&d.staff, &admin.id, "Staff", |s| s.id.as_str())?;
            if d.staff.iter().any(|s| same_username(&s.username, &admin.username)) {
                return Err(StoreError::Conflict(format!(
                    "Username '{}' is already taken",
                    admin.username
                )));
            }
            d.tenants.push(tenant.clone());
            d.staff.push(admin.clone());
            Ok(())
        })
    }

    fn update_tenant(&self, tenant: &Tenant) -> StoreResult<()> {
        self.mutate(|d| {
            if d.tenants.iter().any(|t| t.slug == tenant.slug && t.id != tenant.id) {
                return Err(StoreError::Conflict(format!("Slug '{}' is already in use", tenant.slug)));
            }
            let slot = d
                .tenants
                .iter_mut()
                .find(|t| t.id == tenant.id)
                .ok_or_else(|| StoreError::not_found("Tenant", &tenant.id))?;
            *slot = Tenant {
                created_at: slot.created_at,
                ..tenant.clone()
            };
            Ok(())
        })
    }

    fn find_super_admin(&self, username: &str) -> StoreResult<Option<SuperAdmin>> {
        self.read(|d| Ok(d.super_admins.iter().find(|a| a.username == username).cloned()))
    }

    fn upsert_super_admin(&self, admin: &SuperAdmin) -> StoreResult<()> {
        self.mutate(|d| {
            upsert(&mut d.super_admins, admin.clone(), |a| a.username == admin.username);
            Ok(())
        })
    }

    fn count_staff(&self) -> StoreResult<usize> {
        self.read(|d| Ok(d.staff.len()))
    }

    fn list_staff(&self, tenant_id: &str) -> StoreResult<Vec<Staff>> {
        self.read(|d| {
            let rows: Vec<Staff> = d.staff.iter().filter(|s| s.tenant_id == tenant_id).cloned().collect();
            Ok(newest_first(rows, |a, b| a.created_at.cmp(&b.created_at)))
        })
    }

    fn get_staff(&self, tenant_id: &str, id: &str) -> StoreResult<Staff> {
        self.read(|d| {
            owned_by(&d.staff, tenant_id, id, |s| (s.tenant_id.as_str(), s.id.as_str()))
                .cloned()
                .ok_or_else(|| StoreError::not_found("Staff", id))
        })
    }

    fn find_staff_by_username(&self, username: &str) -> StoreResult<Option<Staff>> {
        self.read(|d| Ok(d.staff.iter().find(|s| same_username(&s.username, username)).cloned()))
    }

    fn insert_staff(&self, staff: &Staff) -> StoreResult<()> {
        self.mutate(|d| {
            reject_duplicate_id(&d.staff, &staff.id, "Staff", |s| s.id.as_str())?;
            if d.staff.iter().any(|s| same_username(&s.username, &staff.username)) {
                return Err(StoreError::Conflict(format!(
                    "Username '{}' is already taken",
                    staff.username
                )));
            }
            d.staff.push(staff.clone());
            Ok(())
        })
    }

    fn update_staff(&self, staff: &Staff) -> StoreResult<()> {
        self.mutate(|d| {
            if d
                .staff
                .iter()
                .any(|s| s.id != staff.id && same_username(&s.username, &staff.username))
            {
                return Err(StoreError::Conflict(format!(
                    "Username '{}' is already taken",
                    staff.username
                )));
            }
            replace_owned(&mut d.staff, staff, "Staff", |s| (s.tenant_id.as_str(), s.id.as_str()))
        })
    }

    fn delete_staff(&self, tenant_id: &str, id: &str) -> StoreResult<()> {
        self.mutate(|d| {
            let before = d.staff.len();
            d.staff.retain(|s| !(s.tenant_id == tenant_id && s.id == id));
            if d.staff.len() == before {
                return Err(StoreError::not_found("Staff", id));
            }
            Ok(())
        })
    }

    fn list_subscribers(&self, tenant_id: &str) -> StoreResult<Vec<Subscriber>> {
        self.read(|d| {
            let rows: Vec<Subscriber> = d.subscribers.iter().filter(|s| s.tenant_id == tenant_id).cloned().collect();
            Ok(newest_first(rows, |a, b| a.created_at.cmp(&b.created_at)))
        })
    }

    fn count_subscribers(&self, tenant_id: &str) -> StoreResult<usize> {
        self.read(|d| Ok(d.subscribers.iter().filter(|s| s.tenant_id == tenant_id).count()))
    }

    fn get_subscriber(&self, tenant_id: &str, id: &str) -> StoreResult<Subscriber> {
        self.read(|d| {
            owned_by(&d.subscribers, tenant_id, id, |s| (s.tenant_id.as_str(), s.id.as_str()))
                .cloned()
                .ok_or_else(|| StoreError::not_found("Subscriber", id))
        })
    }

    fn insert_subscriber(&self, subscriber: &Subscriber) -> StoreResult<()> {
        self.mutate(|d| {
            reject_duplicate_id(&d.subscribers, &subscriber.id, "Subscriber", |s| s.id.as_str())?;
            d.subscribers.push(subscriber.clone());
            Ok(())
        })
    }

    fn update_subscriber(&self, subscriber: &Subscriber) -> StoreResult<()> {
        self.mutate(|d| replace_owned(&mut d.subscribers, subscriber, "Subscriber", |s| (s.tenant_id.as_str(), s.id.as_str())))
    }

    fn delete_subscriber(&self, tenant_id: &str, id: &str) -> StoreResult<()> {
        self.mutate(|d| {
            let before = d.subscribers.len();
            d.subscribers.retain(|s| !(s.tenant_id == tenant_id && s.id == id));
            if d.subscribers.len() == before {
                return Err(StoreError::not_found("Subscriber", id));
            }
            d.payments.retain(|p| !(p.tenant_id == tenant_id && p.subscriber_id == id));
            Ok(())
        })
    }

    fn list_routers(&self, tenant_id: &str) -> StoreResult<Vec<Router>> {
        self.read(|d| {
            let rows: Vec<Router> = d.routers.iter().filter(|r| r.tenant_id == tenant_id).cloned().collect();
            Ok(newest_first(rows, |a, b| a.created_at.cmp(&b.created_at)))
        })
    }

    fn get_router(&self, tenant_id: &str, id: &str) -> StoreResult<Router> {
        self.read(|d| {
            owned_by(&d.routers, tenant_id, id, |r| (r.tenant_id.as_str(), r.id.as_str()))
                .cloned()
                .ok_or_else(|| StoreError::not_found("Router", id))
        })
    }

    fn insert_router(&self, router: &Router) -> StoreResult<()> {
        self.mutate(|d| {
            reject_duplicate_id(&d.routers, &router.id, "Router", |r| r.id.as_str())?;
            d.routers.push(router.clone());
            Ok(())
        })
    }

    fn update_router(&self, router: &Router) -> StoreResult<()> {
        self.mutate(|d| replace_owned(&mut d.routers, router, "Router", |r| (r.tenant_id.as_str(), r.id.as_str())))
    }

    fn delete_router(&self, tenant_id: &str, id: &str) -> StoreResult<()> {
        self.mutate(|d| {
            let before = d.routers.len();
            d.routers.retain(|r| !(r.tenant_id == tenant_id && r.id == id));
            if d.routers.len() == before {
                return Err(StoreError::not_found("Router", id));
            }
            for sub in d
                .subscribers
                .iter_mut()
                .filter(|s| s.tenant_id == tenant_id && s.router_id.as_deref() == Some(id))
            {
                sub.router_id = None;
            }
            Ok(())
        })
    }

    fn list_sales(&self, tenant_id: &str) -> StoreResult<Vec<Sale>> {
        self.read(|d| {
            let rows: Vec<Sale> = d.sales.iter().filter(|s| s.tenant_id == tenant_id).cloned().collect();
            Ok(newest_first(rows, |a, b| (a.date, a.created_at).cmp(&(b.date, b.created_at))))
        })
    }

    fn get_sale(&self, tenant_id: &str, id: &str) -> StoreResult<Sale> {
        self.read(|d| {
            owned_by(&d.sales, tenant_id, id, |s| (s.tenant_id.as_str(), s.id.as_str()))
                .cloned()
                .ok_or_else(|| StoreError::not_found("Sale", id))
        })
    }

    fn insert_sale(&self, sale: &Sale) -> StoreResult<()> {
        self.mutate(|d| {
            reject_duplicate_id(&d.sales, &sale.id, "Sale", |s| s.id.as_str())?;
            d.sales.push(sale.clone());
            Ok(())
        })
    }

    fn update_sale(&self, sale: &Sale) -> StoreResult<()> {
        self.mutate(|d| replace_owned(&mut d.sales, sale, "Sale", |s| (s.tenant_id.as_str(), s.id.as_str())))
    }

    fn delete_sale(&self, tenant_id: &str, id: &str) -> StoreResult<()> {
        self.mutate(|d| {
            let before = d.sales.len();
            d.sales.retain(|s| !(s.tenant_id == tenant_id && s.id == id));
            if d.sales.len() == before {
                return Err(StoreError::not_found("Sale", id));
            }
            Ok(())
        })
    }

    fn list_payments(&self, tenant_id: &str) -> StoreResult<Vec<Payment>> {
        self.read(|d| {
            let rows: Vec<Payment> = d.payments.iter().filter(|p| p.tenant_id == tenant_id).cloned().collect();
            Ok(newest_first(rows, |a, b| (a.date, a.created_at).cmp(&(b.date, b.created_at))))
        })
    }

    fn list_payments_for_subscriber(&self, tenant_id: &str, subscriber_id: &str) -> StoreResult<Vec<Payment>> {
        self.read(|d| {
            let rows: Vec<Payment> = d
                .payments
                .iter()
                .filter(|p| p.tenant_id == tenant_id && p.subscriber_id == subscriber_id)
                .cloned()
                .collect();
            Ok(newest_first(rows, |a, b| (a.date, a.created_at).cmp(&(b.date, b.created_at))))
        })
    }

    fn record_payment(&self, payment: &Payment) -> StoreResult<Subscriber> {
        self.mutate(|d| credit_payment(d, payment))
    }

    fn extend_subscription(
        &self,
        tenant_id: &str,
        id: &str,
        extension: &Extension<'_>,
    ) -> StoreResult<(Option<NaiveDate>, Subscriber)> {
        self.mutate(|d| {
            let sub = subscriber_mut(d, tenant_id, id)?;
            let previous = sub.expire_date;
            sub.expire_date = Some(extension.new_expiry(previous)?);
            sub.balance -= extension.charge;
            let mut updated = sub.clone();
            if let Some(payment) = extension.payment {
                updated = credit_payment(d, payment)?;
            }
            Ok((previous, updated))
        })
    }

    fn list_packages(&self, tenant_id: &str, include_inactive: bool) -> StoreResult<Vec<Package>> {
        self.read(|d| {
            let mut rows: Vec<Package> = d
                .packages
                .iter()
                .filter(|p| p.tenant_id == tenant_id && (include_inactive || p.is_active))
                .cloned()
                .collect();
            rows.sort_by(|a, b| a.speed.cmp(&b.speed).then(a.price.total_cmp(&b.price)));
            Ok(rows)
        })
    }

    fn get_package(&self, tenant_id: &str, id: &str) -> StoreResult<Package> {
        self.read(|d| {
            owned_by(&d.packages, tenant_id, id, |p| (p.tenant_id.as_str(), p.id.as_str()))
                .cloned()
                .ok_or_else(|| StoreError::not_found("Package", id))
        })
    }

    fn insert_package(&self, package: &Package) -> StoreResult<()> {
        self.mutate(|d| {
            reject_duplicate_id(&d.packages, &package.id, "Package", |p| p.id.as_str())?;
            d.packages.push(package.clone());
            Ok(())
        })
    }

    fn update_package(&self, package: &Package) -> StoreResult<()> {
        self.mutate(|d| replace_owned(&mut d.packages, package, "Package", |p| (p.tenant_id.as_str(), p.id.as_str())))
    }

    fn append_activity(&self, entry: &ActivityLogEntry, cap: usize) -> StoreResult<()> {
        self.mutate(|d| {
            d.activity_log.push(entry.clone());
            trim_activity(&mut d.activity_log, &entry.tenant_id, cap);
            Ok(())
        })
    }

    fn list_activity(&self, tenant_id: &str, limit: usize) -> StoreResult<Vec<ActivityLogEntry>> {
        self.read(|d| {
            Ok(d.activity_log
                .iter()
                .rev()
                .filter(|a| a.tenant_id == tenant_id)
                .take(limit)
                .cloned()
                .collect())
        })
    }

    fn export_dataset(&self, tenant_id: Option<&str>) -> StoreResult<Dataset> {
        self.read(|d| {
            let mut data = d.clone();
            if let Some(tenant_id) = tenant_id {
                data.retain_tenant(tenant_id);
            }
            Ok(data)
        })
    }

    fn import_dataset(&self, data: &Dataset, activity_cap: usize) -> StoreResult<ImportSummary> {
        let start = std::time::Instant::now();
        let summary = self.mutate(|d| {
            for t in &data.tenants {
                upsert(&mut d.tenants, t.clone(), |r| r.id == t.id || r.slug == t.slug);
            }
            let known: HashSet<&str> = d.tenants.iter().map(|t| t.id.as_str()).collect();
            let owned = data
                .staff
                .iter()
                .map(|s| ("Staff", &s.tenant_id, &s.id))
                .chain(data.subscribers.iter().map(|s| ("Subscriber", &s.tenant_id, &s.id)))
                .chain(data.routers.iter().map(|r| ("Router", &r.tenant_id, &r.id)))
                .chain(data.sales.iter().map(|s| ("Sale", &s.tenant_id, &s.id)))
                .chain(data.payments.iter().map(|p| ("Payment", &p.tenant_id, &p.id)))
                .chain(data.packages.iter().map(|p| ("Package", &p.tenant_id, &p.id)))
                .chain(data.activity_log.iter().map(|a| ("Activity entry", &a.tenant_id, &a.id)));
            for (entity, tenant_id, id) in owned {
                if !known.contains(tenant_id.as_str()) {
                    return Err(StoreError::unknown_tenant(entity, id, tenant_id));
                }
            }

            for a in &data.super_admins {
                upsert(&mut d.super_admins, a.clone(), |r| r.username == a.username);
            }
            for s in &data.staff {
                upsert(&mut d.staff, s.clone(), |r| r.id == s.id || same_username(&r.username, &s.username));
            }
            for s in &data.subscribers {
                upsert(&mut d.subscribers, s.clone(), |r| r.id == s.id);
            }
            for r in &data.routers {
                upsert(&mut d.routers, r.clone(), |x| x.id == r.id);
            }
            for s in &data.sales {
                upsert(&mut d.sales, s.clone(), |r| r.id == s.id);
            }
            for p in &data.payments {
                upsert(&mut d.payments, p.clone(), |r| r.id == p.id);
            }
            for p in &data.packages {
                upsert(&mut d.packages, p.clone(), |r| r.id == p.id);
            }
            // a re-imported entry moves to the end, like a fresh insert
            for a in &data.activity_log {
                d.activity_log.retain(|r| r.id != a.id);
                d.activity_log.push(a.clone());
            }
            d.activity_log.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
            let logged: HashSet<&str> = data.activity_log.iter().map(|a| a.tenant_id.as_str()).collect();
            for tenant_id in logged {
                trim_activity(&mut d.activity_log, tenant_id, activity_cap);
            }
            Ok(ImportSummary {
                tenants: data.tenants.len(),
                staff: data.staff.len(),
                subscribers: data.subscribers.len(),
                routers: data.routers.len(),
                sales: data.sales.len(),
                payments: data.payments.len(),
                packages: data.packages.len(),
                activity: data.activity_log.len(),
            })
        })?;
        log::info!(
            "Imported {} rows in {:.1}ms",
            summary.total(),
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn open() -> (tempfile::TempDir, JsonStore) {
        let dir = tempdir().unwrap();
        let store = JsonStore::open(dir.path().to_path_buf()).unwrap();
        (dir, store)
    }

    #[test]
    fn creates_file_on_open() {
        let (dir, store) = open();
        assert!(dir.path().join("wasla.json").exists());
        assert!(store.list_tenants().unwrap().is_empty());
        assert_eq!(store.backend_name(), "json");
    }

    #[test]
    fn rows_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = JsonStore::open(dir.path().to_path_buf()).unwrap();
            store.insert_tenant(&contract::tenant("t1", "one")).unwrap();
            store.insert_subscriber(&contract::subscriber("t1", "s1", "Ahmad")).unwrap();
        }
        let store = JsonStore::open(dir.path().to_path_buf()).unwrap();
        assert_eq!(store.get_subscriber("t1", "s1").unwrap().name, "Ahmad");
        assert!(!dir.path().join("wasla.json.tmp").exists());
    }

    #[test]
    fn corrupt_file_is_moved_aside() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("wasla.json"), b"{ not json").unwrap();
        let store = JsonStore::open(dir.path().to_path_buf()).unwrap();
        assert!(store.list_tenants().unwrap().is_empty());
        let backups = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with("wasla.json.bak."))
            .count();
        assert_eq!(backups, 1);
    }

    #[test]
    fn failed_mutation_leaves_data_untouched() {
        let (_dir, store) = open();
        store.insert_tenant(&contract::tenant("t1", "one")).unwrap();
        store.insert_subscriber(&contract::subscriber("t1", "s1", "Ahmad")).unwrap();
        let err = store.insert_subscriber(&contract::subscriber("t1", "s1", "Again"));
        assert!(matches!(err, Err(StoreError::Conflict(_))));
        assert_eq!(store.list_subscribers("t1").unwrap().len(), 1);
    }

    #[test]
    fn concurrent_writers_do_not_lose_rows() {
        let dir = tempdir().unwrap();
        let store = Arc::new(JsonStore::open(dir.path().to_path_buf()).unwrap());
        store.insert_tenant(&contract::tenant("t1", "one")).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|n| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..5 {
                        let id = format!("s{}-{}", n, i);
                        store.insert_subscriber(&contract::subscriber("t1", &id, "Sub")).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        drop(store);

        let reopened = JsonStore::open(dir.path().to_path_buf()).unwrap();
        assert_eq!(reopened.count_subscribers("t1").unwrap(), 40);
    }

    #[test]
    fn upsert_replaces_in_place() {
        let mut rows = vec![(1, "a"), (2, "b"), (3, "c")];
        upsert(&mut rows, (2, "B"), |r| r.0 == 2);
        assert_eq!(rows, vec![(1, "a"), (2, "B"), (3, "c")]);
        upsert(&mut rows, (4, "d"), |r| r.0 == 4);
        assert_eq!(rows.len(), 4);
        // two rows match: the first is replaced and the second dropped
        upsert(&mut rows, (1, "x"), |r| r.0 == 1 || r.1 == "c");
        assert_eq!(rows, vec![(1, "x"), (2, "B"), (4, "d")]);
    }

    #[test]
    fn tenant_isolation() {
        let (_dir, store) = open();
        contract::tenant_isolation(&store);
    }

    #[test]
    fn subscriber_round_trip() {
        let (_dir, store) = open();
        contract::subscriber_round_trip(&store);
    }

    #[test]
    fn cascades() {
        let (_dir, store) = open();
        contract::cascades(&store);
    }

    #[test]
    fn staff_usernames_are_unique() {
        let (_dir, store) = open();
        contract::staff_usernames_are_unique(&store);
    }

    #[test]
    fn tenant_slugs_are_unique() {
        let (_dir, store) = open();
        contract::tenant_slugs_are_unique(&store);
    }

    #[test]
    fn packages_sorted_and_filtered() {
        let (_dir, store) = open();
        contract::packages_sorted_and_filtered(&store);
    }

    #[test]
    fn activity_is_capped() {
        let (_dir, store) = open();
        contract::activity_is_capped(&store);
    }

    #[test]
    fn dataset_round_trip() {
        let (_a, source) = open();
        let (_b, target) = open();
        contract::dataset_round_trip(&source, &target);
    }

    #[test]
    fn failed_import_changes_nothing() {
        let (_dir, store) = open();
        contract::failed_import_changes_nothing(&store);
    }

    #[test]
    fn imported_activity_is_ordered_and_capped() {
        let (_dir, store) = open();
        contract::imported_activity_is_ordered_and_capped(&store);
    }

    #[test]
    fn payments_credit_the_balance() {
        let (_dir, store) = open();
        contract::payments_credit_the_balance(&store);
    }

    #[test]
    fn extension_moves_expiry_and_balance() {
        let (_dir, store) = open();
        contract::extension_moves_expiry_and_balance(&store);
    }

    #[test]
    fn register_tenant_is_all_or_nothing() {
        let (_dir, store) = open();
        contract::register_tenant_is_all_or_nothing(&store);
    }

    #[test]
    fn concurrent_payments_all_count() {
        let (_dir, store) = open();
        contract::concurrent_payments_all_count(Arc::new(store));
    }
}
