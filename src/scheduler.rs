//! Periodic expiry sweep.
//!
//! Tenants whose own subscription has run out are moved to `expired` and
//! signed out, per-tenant subscriber expiry counts are logged, and stale
//! sessions are dropped. With the `scheduler` feature the sweep runs on a cron
//! schedule taken from `EXPIRY_SWEEP_CRON`.

use std::sync::Arc;

use chrono::{DateTime, Local, Utc};
use serde::Serialize;

use crate::auth::SessionStore;
use crate::models::TenantSubscriptionStatus;
use crate::status::{classify, StatusThresholds, SubscriberStatus};
use crate::store::{Store, StoreResult};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub tenants_checked: usize,
    pub tenants_expired: usize,
    pub expiring_subscribers: usize,
    pub expired_subscribers: usize,
    pub sessions_purged: usize,
}

pub fn run_expiry_sweep(
    store: &dyn Store,
    sessions: &SessionStore,
    thresholds: &StatusThresholds,
    now: DateTime<Utc>,
) -> StoreResult<SweepReport> {
    let start = std::time::Instant::now();
    let today = now.with_timezone(&Local).date_naive();
    let mut report = SweepReport::default();

    for mut tenant in store.list_tenants()? {
        report.tenants_checked += 1;

        let lapsed = matches!(
            tenant.subscription_status,
            TenantSubscriptionStatus::Trial | TenantSubscriptionStatus::Active
        ) && tenant.subscription_ends_at.is_some_and(|ends| ends <= now);
        if lapsed {
            log::info!(
                "Tenant '{}' subscription ended ({}); marking expired",
                tenant.slug,
                tenant.subscription_status
            );
            tenant.subscription_status = TenantSubscriptionStatus::Expired;
            store.update_tenant(&tenant)?;
            let revoked = sessions.revoke_tenant(&tenant.id);
            if revoked > 0 {
                log::info!("Signed out {} sessions of tenant '{}'", revoked, tenant.slug);
            }
            report.tenants_expired += 1;
        }

        let mut expiring = 0usize;
        let mut expired = 0usize;
        for sub in store.list_subscribers(&tenant.id)? {
            match classify(sub.expire_date, sub.balance, today, thresholds) {
                SubscriberStatus::Expiring => expiring += 1,
                SubscriberStatus::Expired => expired += 1,
                _ => {}
            }
        }
        if expiring > 0 || expired > 0 {
            log::info!(
                "Tenant '{}': {} subscribers expiring soon, {} expired",
                tenant.slug,
                expiring,
                expired
            );
        }
        report.expiring_subscribers += expiring;
        report.expired_subscribers += expired;
    }

    report.sessions_purged = sessions.purge_expired(now);

    log::info!(
        "Expiry sweep finished in {:.1}ms: {} tenants checked, {} expired, {} sessions purged",
        start.elapsed().as_secs_f64() * 1000.0,
        report.tenants_checked,
        report.tenants_expired,
        report.sessions_purged
    );
    Ok(report)
}

/// Start the cron scheduler for the expiry sweep. Runs until the process exits.
#[cfg(feature = "scheduler")]
pub async fn start_expiry_scheduler(
    store: Arc<dyn Store>,
    sessions: Arc<SessionStore>,
    thresholds: StatusThresholds,
    cron_expr: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use tokio_cron_scheduler::{Job, JobScheduler};

    let sched = JobScheduler::new().await?;

    let cron_schedule = cron_expr
        .parse::<cron::Schedule>()
        .map_err(|e| format!("Invalid cron expression '{}': {}", cron_expr, e))?;

    let upcoming: Vec<_> = cron_schedule.upcoming(Utc).take(3).collect();
    log::info!("Next scheduled expiry sweeps: {:?}", upcoming);

    let job = Job::new_async(cron_expr, move |_uuid, _lock| {
        let store = Arc::clone(&store);
        let sessions = Arc::clone(&sessions);
        Box::pin(async move {
            log::info!("Starting scheduled expiry sweep...");
            let result = tokio::task::spawn_blocking(move || {
                run_expiry_sweep(store.as_ref(), sessions.as_ref(), &thresholds, Utc::now())
            })
            .await;
            match result {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => log::error!("Scheduled expiry sweep failed: {}", e),
                Err(e) => log::error!("Scheduled expiry sweep panicked: {}", e),
            }
        })
    })?;

    sched.add(job).await?;
    sched.start().await?;

    log::info!("Expiry scheduler started with cron expression: {}", cron_expr);

    // Keep the scheduler running
    loop {
        tokio::time::sleep(tokio::time::Duration::from_secs(60)).await;
    }
}

/// Without the `scheduler` feature a configured cron expression is ignored.
#[cfg(not(feature = "scheduler"))]
pub async fn start_expiry_scheduler(
    _store: Arc<dyn Store>,
    _sessions: Arc<SessionStore>,
    _thresholds: StatusThresholds,
    cron_expr: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    log::warn!(
        "EXPIRY_SWEEP_CRON is set to '{}' but this build has no scheduler support",
        cron_expr
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Principal;
    use crate::json_store::JsonStore;
    use crate::models::StaffRole;
    use crate::store::contract;
    use chrono::Duration;
    use tempfile::tempdir;

    fn staff_principal(tenant: &str) -> Principal {
        Principal::Staff {
            staff_id: format!("staff-{}", tenant),
            tenant_id: tenant.into(),
            name: "Admin".into(),
            role: StaffRole::Admin,
        }
    }

    #[test]
    fn lapsed_tenants_are_expired_and_signed_out() {
        let dir = tempdir().unwrap();
        let store = JsonStore::open(dir.path().to_path_buf()).unwrap();
        let now = Utc::now();

        let mut lapsed = contract::tenant("t1", "lapsed");
        lapsed.subscription_ends_at = Some(now - Duration::days(1));
        store.insert_tenant(&lapsed).unwrap();
        store.insert_tenant(&contract::tenant("t2", "fine")).unwrap();
        let mut suspended = contract::tenant("t3", "suspended");
        suspended.subscription_status = TenantSubscriptionStatus::Suspended;
        suspended.subscription_ends_at = Some(now - Duration::days(30));
        store.insert_tenant(&suspended).unwrap();

        let sessions = SessionStore::new(Duration::hours(1));
        sessions.create(staff_principal("t1"));
        sessions.create(staff_principal("t2"));

        let report = run_expiry_sweep(&store, &sessions, &StatusThresholds::default(), now).unwrap();
        assert_eq!(report.tenants_checked, 3);
        assert_eq!(report.tenants_expired, 1);
        assert_eq!(
            store.get_tenant("t1").unwrap().subscription_status,
            TenantSubscriptionStatus::Expired
        );
        assert_eq!(
            store.get_tenant("t3").unwrap().subscription_status,
            TenantSubscriptionStatus::Suspended
        );
        assert_eq!(sessions.len(), 1);

        // a second pass finds nothing left to do
        let again = run_expiry_sweep(&store, &sessions, &StatusThresholds::default(), now).unwrap();
        assert_eq!(again.tenants_expired, 0);
    }

    #[test]
    fn counts_expiring_and_expired_subscribers() {
        let dir = tempdir().unwrap();
        let store = JsonStore::open(dir.path().to_path_buf()).unwrap();
        let now = Utc::now();
        let today = now.with_timezone(&Local).date_naive();
        store.insert_tenant(&contract::tenant("t1", "one")).unwrap();

        let expiry_offsets = [("s1", 2), ("s2", -5), ("s3", -60), ("s4", 20)];
        for (id, offset) in expiry_offsets {
            let mut sub = contract::subscriber("t1", id, id);
            sub.expire_date = Some(today + Duration::days(offset));
            store.insert_subscriber(&sub).unwrap();
        }

        let sessions = SessionStore::new(Duration::seconds(-1));
        sessions.create(staff_principal("t1"));

        let report = run_expiry_sweep(&store, &sessions, &StatusThresholds::default(), now).unwrap();
        assert_eq!(report.expiring_subscribers, 1);
        assert_eq!(report.expired_subscribers, 1);
        assert_eq!(report.sessions_purged, 1);
        assert!(sessions.is_empty());
    }
}
