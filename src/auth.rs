//! Passwords, bearer-token sessions and role checks.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::models::{now_utc, StaffRole};

pub const MIN_PASSWORD_LEN: usize = 6;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Missing authorization token")]
    MissingToken,

    #[error("Session expired or invalid")]
    InvalidToken,

    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("This account has been deactivated")]
    TenantInactive,

    #[error("Subscription has ended; contact support to renew")]
    SubscriptionLapsed,

    #[error("Permission denied: {0}")]
    Forbidden(String),

    #[error("Password must be at least {} characters", MIN_PASSWORD_LEN)]
    WeakPassword,

    #[error("Password hashing failed: {0}")]
    Hash(#[from] bcrypt::BcryptError),
}

// ============================================================================
// PASSWORDS
// ============================================================================

/// Hash a password with bcrypt at the given cost
pub fn hash_password(password: &str, cost: u32) -> Result<String, AuthError> {
    Ok(bcrypt::hash(password, cost)?)
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Verify a password against a stored hash.
///
/// Accepts bcrypt hashes, `sha256:<hex>` or bare 64-character sha256 digests,
/// and plaintext left over from older data files.
pub fn verify_password(password: &str, stored: &str) -> bool {
    if stored.starts_with("$2") {
        return bcrypt::verify(password, stored).unwrap_or(false);
    }
    if let Some(hex) = stored.strip_prefix("sha256:") {
        return sha256_hex(password) == hex.to_ascii_lowercase();
    }
    if stored.len() == 64 && stored.chars().all(|c| c.is_ascii_hexdigit()) {
        return sha256_hex(password) == stored.to_ascii_lowercase();
    }
    !stored.is_empty() && password == stored
}

/// Whether a stored hash should be replaced with bcrypt after a successful login
pub fn needs_rehash(stored: &str) -> bool {
    !stored.starts_with("$2")
}

pub fn validate_password(password: &str) -> Result<(), AuthError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AuthError::WeakPassword);
    }
    Ok(())
}

// ============================================================================
// ROLES
// ============================================================================

/// Dashboard sections whose data a role may change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Subscribers,
    Payments,
    Sales,
    Routers,
    Packages,
    Staff,
    Backups,
}

impl Permission {
    pub fn as_str(self) -> &'static str {
        match self {
            Permission::Subscribers => "subscribers",
            Permission::Payments => "payments",
            Permission::Sales => "sales",
            Permission::Routers => "routers",
            Permission::Packages => "packages",
            Permission::Staff => "staff",
            Permission::Backups => "backups",
        }
    }

    pub fn granted_to(self, role: StaffRole) -> bool {
        match role {
            StaffRole::Admin => true,
            StaffRole::Subs => matches!(self, Permission::Subscribers | Permission::Payments),
            StaffRole::Sales => self == Permission::Sales,
            StaffRole::Routers => self == Permission::Routers,
        }
    }
}

// ============================================================================
// SESSIONS
// ============================================================================

/// Who a session belongs to
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Principal {
    #[serde(rename_all = "camelCase")]
    Staff {
        staff_id: String,
        tenant_id: String,
        name: String,
        role: StaffRole,
    },
    SuperAdmin { username: String },
}

impl Principal {
    pub fn display_name(&self) -> &str {
        match self {
            Principal::Staff { name, .. } => name,
            Principal::SuperAdmin { username } => username,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub principal: Principal,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// In-memory token map. Sessions do not survive a restart.
pub struct SessionStore {
    ttl: Duration,
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn create(&self, principal: Principal) -> Session {
        let now = now_utc();
        let session = Session {
            token: uuid::Uuid::new_v4().simple().to_string(),
            principal,
            created_at: now,
            expires_at: now + self.ttl,
        };
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.token.clone(), session.clone());
        session
    }

    /// Look up a live session; an expired one is dropped
    pub fn get(&self, token: &str) -> Option<Session> {
        let now = Utc::now();
        {
            let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
            match sessions.get(token) {
                Some(s) if s.expires_at > now => return Some(s.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        self.revoke(token);
        None
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token)
            .is_some()
    }

    fn revoke_where(&self, pred: impl Fn(&Principal) -> bool) -> usize {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let before = sessions.len();
        sessions.retain(|_, s| !pred(&s.principal));
        before - sessions.len()
    }

    /// Sign out every session of one staff member
    pub fn revoke_all_for(&self, staff: &str) -> usize {
        self.revoke_where(|p| matches!(p, Principal::Staff { staff_id, .. } if staff_id == staff))
    }

    /// Sign out all staff of a tenant
    pub fn revoke_tenant(&self, tenant: &str) -> usize {
        self.revoke_where(|p| matches!(p, Principal::Staff { tenant_id, .. } if tenant_id == tenant))
    }

    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let before = sessions.len();
        sessions.retain(|_, s| s.expires_at > now);
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staff(id: &str, tenant: &str) -> Principal {
        Principal::Staff {
            staff_id: id.into(),
            tenant_id: tenant.into(),
            name: id.into(),
            role: StaffRole::Admin,
        }
    }

    #[test]
    fn bcrypt_hash_and_verify() {
        let hash = hash_password("secret1", 4).unwrap();
        assert!(hash.starts_with("$2"));
        assert!(verify_password("secret1", &hash));
        assert!(!verify_password("secret2", &hash));
        assert!(!needs_rehash(&hash));
    }

    #[test]
    fn legacy_hashes_still_verify() {
        let digest = sha256_hex("admin123");
        assert!(verify_password("admin123", &digest));
        assert!(verify_password("admin123", &format!("sha256:{}", digest)));
        assert!(verify_password("admin123", &digest.to_uppercase()));
        assert!(!verify_password("admin124", &digest));
        assert!(verify_password("admin123", "admin123"));
        assert!(!verify_password("", ""));
        assert!(needs_rehash(&digest));
        assert!(needs_rehash("admin123"));
    }

    #[test]
    fn password_policy() {
        assert!(validate_password("12345").is_err());
        assert!(validate_password("123456").is_ok());
        // counted in characters, not bytes
        assert!(validate_password("كلمةس").is_err());
    }

    #[test]
    fn role_permissions() {
        assert!(Permission::Staff.granted_to(StaffRole::Admin));
        assert!(Permission::Payments.granted_to(StaffRole::Subs));
        assert!(!Permission::Packages.granted_to(StaffRole::Subs));
        assert!(!Permission::Subscribers.granted_to(StaffRole::Sales));
        assert!(Permission::Routers.granted_to(StaffRole::Routers));
        assert!(!Permission::Backups.granted_to(StaffRole::Routers));
    }

    #[test]
    fn sessions_create_get_revoke() {
        let store = SessionStore::new(Duration::hours(1));
        let session = store.create(staff("st1", "t1"));
        assert_eq!(session.token.len(), 32);
        assert_eq!(store.get(&session.token).unwrap().principal, staff("st1", "t1"));
        assert!(store.revoke(&session.token));
        assert!(store.get(&session.token).is_none());
        assert!(!store.revoke(&session.token));
    }

    #[test]
    fn expired_sessions_are_rejected_and_purged() {
        let store = SessionStore::new(Duration::seconds(-1));
        let session = store.create(staff("st1", "t1"));
        assert!(store.get(&session.token).is_none());
        assert!(store.is_empty());

        store.create(staff("st2", "t1"));
        assert_eq!(store.purge_expired(Utc::now()), 1);
    }

    #[test]
    fn bulk_revocation() {
        let store = SessionStore::new(Duration::hours(1));
        store.create(staff("st1", "t1"));
        store.create(staff("st1", "t1"));
        store.create(staff("st2", "t1"));
        store.create(staff("st3", "t2"));
        store.create(Principal::SuperAdmin { username: "root".into() });

        assert_eq!(store.revoke_all_for("st1"), 2);
        assert_eq!(store.revoke_tenant("t1"), 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn principal_serializes_with_kind_tag() {
        let json = serde_json::to_value(staff("st1", "t1")).unwrap();
        assert_eq!(json["kind"], "staff");
        assert_eq!(json["tenantId"], "t1");
        let json = serde_json::to_value(Principal::SuperAdmin { username: "root".into() }).unwrap();
        assert_eq!(json["kind"], "superAdmin");
    }
}
