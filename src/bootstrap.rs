//! First-start defaults.
//!
//! On startup:
//! 1. If no staff account exists anywhere, create a `default` tenant on a
//!    trial and an `admin` / `admin123` administrator for it.
//! 2. If a super admin password is configured, make sure that account exists
//!    and carries the configured password.

use chrono::Duration;
use thiserror::Error;

use crate::auth::{hash_password, verify_password, AuthError};
use crate::config::ServerConfig;
use crate::models::{new_id, now_utc, Staff, StaffRole, SuperAdmin, Tenant, TenantSubscriptionStatus};
use crate::store::{Store, StoreError};

pub const DEFAULT_TENANT_SLUG: &str = "default";
pub const DEFAULT_ADMIN_USERNAME: &str = "admin";
pub const DEFAULT_ADMIN_PASSWORD: &str = "admin123";

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

pub fn ensure_defaults(store: &dyn Store, config: &ServerConfig) -> Result<(), BootstrapError> {
    ensure_default_admin(store, config)?;
    ensure_super_admin(store, config)?;
    Ok(())
}

fn ensure_default_admin(store: &dyn Store, config: &ServerConfig) -> Result<(), BootstrapError> {
    if store.count_staff()? > 0 {
        return Ok(());
    }

    let now = now_utc();
    let existing = store.find_tenant_by_slug(DEFAULT_TENANT_SLUG)?;
    let tenant = match &existing {
        Some(tenant) => tenant.clone(),
        None => Tenant {
            id: new_id("tenant"),
            name: "Default".to_string(),
            slug: DEFAULT_TENANT_SLUG.to_string(),
            phone: None,
            address: None,
            is_active: true,
            subscription_status: TenantSubscriptionStatus::Trial,
            subscription_ends_at: Some(now + Duration::days(config.trial_days)),
            created_at: now,
        },
    };

    let admin = Staff {
        id: new_id("staff"),
        tenant_id: tenant.id.clone(),
        name: "Administrator".to_string(),
        username: DEFAULT_ADMIN_USERNAME.to_string(),
        password_hash: hash_password(DEFAULT_ADMIN_PASSWORD, config.bcrypt_cost)?,
        role: StaffRole::Admin,
        created_at: now,
    };
    if existing.is_some() {
        store.insert_staff(&admin)?;
    } else {
        store.register_tenant(&tenant, &admin)?;
    }

    log::info!(
        "Created default admin account '{}' / '{}' in tenant '{}'. Change this password after signing in.",
        DEFAULT_ADMIN_USERNAME,
        DEFAULT_ADMIN_PASSWORD,
        tenant.slug
    );
    Ok(())
}

fn ensure_super_admin(store: &dyn Store, config: &ServerConfig) -> Result<(), BootstrapError> {
    let Some(password) = config.superadmin_password.as_deref() else {
        log::debug!("No super admin password configured; skipping super admin setup");
        return Ok(());
    };

    let existing = store.find_super_admin(&config.superadmin_username)?;
    if let Some(admin) = &existing {
        if verify_password(password, &admin.password_hash) {
            log::info!("Super admin '{}' already exists", admin.username);
            return Ok(());
        }
    }

    let admin = SuperAdmin {
        username: config.superadmin_username.clone(),
        password_hash: hash_password(password, config.bcrypt_cost)?,
        created_at: existing.map(|a| a.created_at).unwrap_or_else(now_utc),
    };
    store.upsert_super_admin(&admin)?;
    log::info!("Super admin '{}' password set from configuration", admin.username);
    Ok(())
}
