//! Axum REST API server.
//!
//! Every route lives under `/api` and speaks JSON; failures come back as
//! `{ "error": "..." }`. Staff routes are scoped to the tenant of the bearer
//! token's session, so a handler never takes a tenant id from the request.

use std::sync::Arc;

use axum::{
    async_trait,
    extract::{DefaultBodyLimit, FromRequestParts, Multipart, Path, Query, State as AxumState},
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Days, Duration, Local, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};

use crate::auth::{
    hash_password, needs_rehash, validate_password, verify_password, AuthError, Permission, Principal,
    SessionStore,
};
use crate::backup::{self, BackupError};
use crate::bootstrap;
use crate::config::ServerConfig;
use crate::models::{
    self, new_id, now_utc, ActivityAction, ActivityLogEntry, EntityType, Package, Payment, PaymentType,
    RouterStatus, RouterView, Sale, SaleType, Staff, StaffRole, StaffView, Subscriber, SubscriberView,
    SubscriptionType, Tenant, TenantSubscriptionStatus, DATE_FMT,
};
use crate::scheduler::start_expiry_scheduler;
use crate::stats::{self, DashboardStats, MonthlyReport, YearMonth};
use crate::status::{self, SubscriberStatus, TrialAlert};
use crate::store::{open_store, Extension, Store, StoreError};

/// Shared application state for Axum handlers
#[derive(Clone)]
pub struct WebAppState {
    pub store: Arc<dyn Store>,
    pub sessions: Arc<SessionStore>,
    pub config: Arc<ServerConfig>,
}

/// Standard error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct SuccessResponse {
    success: bool,
}

fn success() -> Json<SuccessResponse> {
    Json(SuccessResponse { success: true })
}

/// Error returned by every handler
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

fn err_response(status: StatusCode, msg: impl Into<String>) -> ApiError {
    ApiError {
        status,
        message: msg.into(),
    }
}

fn bad_request(msg: impl Into<String>) -> ApiError {
    err_response(StatusCode::BAD_REQUEST, msg)
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse { error: self.message })).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            e @ StoreError::NotFound { .. } => err_response(StatusCode::NOT_FOUND, e.to_string()),
            StoreError::Conflict(msg) => err_response(StatusCode::CONFLICT, msg),
            StoreError::Invalid(msg) => bad_request(msg),
            other => {
                log::error!("Storage failure: {}", other);
                err_response(StatusCode::INTERNAL_SERVER_ERROR, format!("Storage error: {}", other))
            }
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        let status = match &e {
            AuthError::MissingToken | AuthError::InvalidToken | AuthError::InvalidCredentials => {
                StatusCode::UNAUTHORIZED
            }
            AuthError::TenantInactive | AuthError::SubscriptionLapsed | AuthError::Forbidden(_) => {
                StatusCode::FORBIDDEN
            }
            AuthError::WeakPassword => StatusCode::BAD_REQUEST,
            AuthError::Hash(_) => {
                log::error!("Password hashing failed: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        err_response(status, e.to_string())
    }
}

impl From<BackupError> for ApiError {
    fn from(e: BackupError) -> Self {
        match e {
            BackupError::Store(inner) => inner.into(),
            e @ (BackupError::Invalid(_) | BackupError::Json(_)) => bad_request(format!("Restore failed: {}", e)),
            e @ BackupError::Io(_) => {
                log::error!("Backup I/O failure: {}", e);
                err_response(StatusCode::INTERNAL_SERVER_ERROR, format!("Backup failed: {}", e))
            }
        }
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ============================================================================
// AUTH EXTRACTORS
// ============================================================================

fn bearer_token(parts: &Parts) -> Result<&str, AuthError> {
    parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(AuthError::MissingToken)
}

/// A signed-in staff member
#[derive(Debug, Clone)]
pub struct StaffAuth {
    pub token: String,
    pub staff_id: String,
    pub tenant_id: String,
    pub name: String,
    pub role: StaffRole,
}

impl StaffAuth {
    fn require(&self, permission: Permission) -> Result<(), ApiError> {
        if permission.granted_to(self.role) {
            return Ok(());
        }
        Err(AuthError::Forbidden(format!(
            "the {} role cannot change {}",
            self.role,
            permission.as_str()
        ))
        .into())
    }

    fn record(
        &self,
        state: &WebAppState,
        action: ActivityAction,
        entity_type: EntityType,
        entity_id: Option<&str>,
        entity_name: &str,
        details: Option<String>,
    ) {
        record_activity(
            state,
            ActivityLogEntry {
                id: new_id("log"),
                tenant_id: self.tenant_id.clone(),
                action,
                entity_type,
                entity_id: entity_id.map(str::to_string),
                entity_name: entity_name.to_string(),
                actor: self.name.clone(),
                timestamp: now_utc(),
                details,
            },
        );
    }
}

#[async_trait]
impl FromRequestParts<WebAppState> for StaffAuth {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &WebAppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)?;
        let session = state.sessions.get(token).ok_or(AuthError::InvalidToken)?;
        match session.principal {
            Principal::Staff {
                staff_id, tenant_id, ..
            } => {
                // name and role are read back so edits apply to live sessions
                let staff = match state.store.get_staff(&tenant_id, &staff_id) {
                    Ok(staff) => staff,
                    Err(StoreError::NotFound { .. }) => {
                        state.sessions.revoke(&session.token);
                        return Err(AuthError::InvalidToken.into());
                    }
                    Err(e) => return Err(e.into()),
                };
                Ok(StaffAuth {
                    token: session.token,
                    staff_id: staff.id,
                    tenant_id: staff.tenant_id,
                    name: staff.name,
                    role: staff.role,
                })
            }
            Principal::SuperAdmin { .. } => {
                Err(AuthError::Forbidden("this route needs a staff account".to_string()).into())
            }
        }
    }
}

/// A signed-in platform operator
#[derive(Debug, Clone)]
pub struct SuperAdminAuth {
    pub token: String,
    pub username: String,
}

#[async_trait]
impl FromRequestParts<WebAppState> for SuperAdminAuth {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &WebAppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)?;
        let session = state.sessions.get(token).ok_or(AuthError::InvalidToken)?;
        match session.principal {
            Principal::SuperAdmin { username } => Ok(SuperAdminAuth {
                token: session.token,
                username,
            }),
            Principal::Staff { .. } => {
                Err(AuthError::Forbidden("this route needs a super admin account".to_string()).into())
            }
        }
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn today() -> NaiveDate {
    Local::now().date_naive()
}

/// Append to the activity log. A failed append never fails the request.
fn record_activity(state: &WebAppState, entry: ActivityLogEntry) {
    if let Err(e) = state.store.append_activity(&entry, state.config.activity_log_cap) {
        log::warn!(
            "Failed to record {} {} activity for tenant {}: {}",
            entry.action,
            entry.entity_type,
            entry.tenant_id,
            e
        );
    }
}

fn required(value: &str, field: &str) -> Result<String, ApiError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(bad_request(format!("{} is required", field)));
    }
    Ok(value.to_string())
}

/// Trim; an empty string becomes `None`
fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Apply an optional text update. Absent leaves the field alone, an empty string clears it.
fn patch_text(target: &mut Option<String>, value: Option<String>) {
    if value.is_some() {
        *target = clean(value);
    }
}

fn parse_date(value: &str, field: &str) -> Result<NaiveDate, ApiError> {
    NaiveDate::parse_from_str(value.trim(), DATE_FMT)
        .map_err(|_| bad_request(format!("Invalid {} '{}', expected YYYY-MM-DD", field, value)))
}

fn opt_date(value: Option<String>, field: &str) -> Result<Option<NaiveDate>, ApiError> {
    match clean(value) {
        Some(v) => parse_date(&v, field).map(Some),
        None => Ok(None),
    }
}

fn patch_date(target: &mut Option<NaiveDate>, value: Option<String>, field: &str) -> Result<(), ApiError> {
    if value.is_some() {
        *target = opt_date(value, field)?;
    }
    Ok(())
}

fn amount(value: f64, field: &str) -> Result<f64, ApiError> {
    if !value.is_finite() || value < 0.0 {
        return Err(bad_request(format!("{} must be a non-negative number", field)));
    }
    Ok(value)
}

fn pick_id(id: Option<String>, prefix: &str) -> String {
    clean(id).unwrap_or_else(|| new_id(prefix))
}

/// Lowercase the company name and join its words with `-`
fn slugify(name: &str) -> String {
    let slug = name
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
        .to_lowercase();
    if slug.is_empty() {
        "tenant".to_string()
    } else {
        slug
    }
}

fn unique_slug(store: &dyn Store, name: &str) -> Result<String, StoreError> {
    let base = slugify(name);
    let mut slug = base.clone();
    let mut n = 2;
    while store.find_tenant_by_slug(&slug)?.is_some() {
        slug = format!("{}-{}", base, n);
        n += 1;
    }
    Ok(slug)
}

fn subscriber_views(state: &WebAppState, tenant_id: &str) -> Result<Vec<SubscriberView>, StoreError> {
    let today = today();
    Ok(state
        .store
        .list_subscribers(tenant_id)?
        .into_iter()
        .map(|s| status::view(s, today, &state.config.thresholds))
        .collect())
}

fn subscriber_view(state: &WebAppState, subscriber: Subscriber) -> SubscriberView {
    status::view(subscriber, today(), &state.config.thresholds)
}

/// Make sure an optional reference points at a record of the same tenant
fn check_router(state: &WebAppState, tenant_id: &str, router_id: Option<&str>) -> Result<(), ApiError> {
    if let Some(id) = router_id {
        state.store.get_router(tenant_id, id)?;
    }
    Ok(())
}

// ============================================================================
// PUBLIC ROUTES
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    backend: &'static str,
}

/// GET /api/health — Liveness probe
async fn health(AxumState(state): AxumState<WebAppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        backend: state.store.backend_name(),
    })
}

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    token: String,
    expires_at: DateTime<Utc>,
    user: StaffView,
    tenant: Tenant,
}

/// POST /api/login — Staff sign in
async fn login(
    AxumState(state): AxumState<WebAppState>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<LoginResponse> {
    let mut staff = state
        .store
        .find_staff_by_username(req.username.trim())?
        .ok_or(AuthError::InvalidCredentials)?;
    if !verify_password(&req.password, &staff.password_hash) {
        log::info!("Failed login for '{}'", staff.username);
        return Err(AuthError::InvalidCredentials.into());
    }

    let tenant = state.store.get_tenant(&staff.tenant_id)?;
    if !tenant.is_active {
        return Err(AuthError::TenantInactive.into());
    }
    if !status::tenant_in_good_standing(&tenant, now_utc()) {
        return Err(AuthError::SubscriptionLapsed.into());
    }

    if needs_rehash(&staff.password_hash) {
        match hash_password(&req.password, state.config.bcrypt_cost) {
            Ok(hash) => {
                staff.password_hash = hash;
                match state.store.update_staff(&staff) {
                    Ok(()) => log::info!("Upgraded legacy password hash for '{}'", staff.username),
                    Err(e) => log::warn!("Failed to store upgraded hash for '{}': {}", staff.username, e),
                }
            }
            Err(e) => log::warn!("Failed to rehash password for '{}': {}", staff.username, e),
        }
    }

    let session = state.sessions.create(Principal::Staff {
        staff_id: staff.id.clone(),
        tenant_id: staff.tenant_id.clone(),
        name: staff.name.clone(),
        role: staff.role,
    });
    log::info!("'{}' signed in to tenant '{}'", staff.username, tenant.slug);

    let response = LoginResponse {
        token: session.token.clone(),
        expires_at: session.expires_at,
        user: StaffView::from(&staff),
        tenant,
    };
    staff_session(&session.token, &staff).record(
        &state,
        ActivityAction::Login,
        EntityType::Staff,
        Some(&staff.id),
        &staff.username,
        None,
    );
    Ok(Json(response))
}

fn staff_session(token: &str, staff: &Staff) -> StaffAuth {
    StaffAuth {
        token: token.to_string(),
        staff_id: staff.id.clone(),
        tenant_id: staff.tenant_id.clone(),
        name: staff.name.clone(),
        role: staff.role,
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignupRequest {
    company_name: String,
    full_name: String,
    username: String,
    password: String,
    phone: Option<String>,
}

/// POST /api/signup — Register a new tenant with its first admin
async fn signup(
    AxumState(state): AxumState<WebAppState>,
    Json(req): Json<SignupRequest>,
) -> ApiResult<LoginResponse> {
    let company_name = required(&req.company_name, "companyName")?;
    let full_name = required(&req.full_name, "fullName")?;
    let username = required(&req.username, "username")?;
    validate_password(&req.password)?;
    if state.store.find_staff_by_username(&username)?.is_some() {
        return Err(err_response(StatusCode::CONFLICT, format!("Username '{}' is already taken", username)));
    }

    let now = now_utc();
    let tenant = Tenant {
        id: new_id("tenant"),
        slug: unique_slug(state.store.as_ref(), &company_name)?,
        name: company_name,
        phone: clean(req.phone),
        address: None,
        is_active: true,
        subscription_status: TenantSubscriptionStatus::Trial,
        subscription_ends_at: Some(now + Duration::days(state.config.trial_days)),
        created_at: now,
    };
    let admin = Staff {
        id: new_id("staff"),
        tenant_id: tenant.id.clone(),
        name: full_name,
        username,
        password_hash: hash_password(&req.password, state.config.bcrypt_cost)?,
        role: StaffRole::Admin,
        created_at: now,
    };
    state.store.register_tenant(&tenant, &admin)?;
    log::info!(
        "New tenant '{}' signed up with admin '{}' ({} day trial)",
        tenant.slug,
        admin.username,
        state.config.trial_days
    );

    let session = state.sessions.create(Principal::Staff {
        staff_id: admin.id.clone(),
        tenant_id: tenant.id.clone(),
        name: admin.name.clone(),
        role: admin.role,
    });
    staff_session(&session.token, &admin).record(
        &state,
        ActivityAction::Add,
        EntityType::Tenant,
        Some(&tenant.id),
        &tenant.name,
        None,
    );
    Ok(Json(LoginResponse {
        token: session.token,
        expires_at: session.expires_at,
        user: StaffView::from(&admin),
        tenant,
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SuperAdminLoginResponse {
    token: String,
    expires_at: DateTime<Utc>,
    username: String,
}

/// POST /api/superadmin/login — Platform operator sign in
async fn superadmin_login(
    AxumState(state): AxumState<WebAppState>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<SuperAdminLoginResponse> {
    let admin = state
        .store
        .find_super_admin(req.username.trim())?
        .ok_or(AuthError::InvalidCredentials)?;
    if !verify_password(&req.password, &admin.password_hash) {
        log::info!("Failed super admin login for '{}'", admin.username);
        return Err(AuthError::InvalidCredentials.into());
    }
    let session = state.sessions.create(Principal::SuperAdmin {
        username: admin.username.clone(),
    });
    log::info!("Super admin '{}' signed in", admin.username);
    Ok(Json(SuperAdminLoginResponse {
        token: session.token,
        expires_at: session.expires_at,
        username: admin.username,
    }))
}

// ============================================================================
// SESSION ROUTES
// ============================================================================

/// POST /api/logout — End the current staff session
async fn logout(AxumState(state): AxumState<WebAppState>, auth: StaffAuth) -> Json<SuccessResponse> {
    state.sessions.revoke(&auth.token);
    auth.record(
        &state,
        ActivityAction::Logout,
        EntityType::Staff,
        Some(&auth.staff_id),
        &auth.name,
        None,
    );
    success()
}

/// POST /api/superadmin/logout — End the current super admin session
async fn superadmin_logout(
    AxumState(state): AxumState<WebAppState>,
    auth: SuperAdminAuth,
) -> Json<SuccessResponse> {
    state.sessions.revoke(&auth.token);
    log::info!("Super admin '{}' signed out", auth.username);
    success()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MeResponse {
    user: StaffView,
    tenant: Tenant,
    trial_alert: TrialAlert,
    trial_days_left: Option<i64>,
    /// Sections this role may change
    permissions: Vec<&'static str>,
}

/// GET /api/me — Current user, tenant and trial banner
async fn me(AxumState(state): AxumState<WebAppState>, auth: StaffAuth) -> ApiResult<MeResponse> {
    let staff = state.store.get_staff(&auth.tenant_id, &auth.staff_id)?;
    let tenant = state.store.get_tenant(&auth.tenant_id)?;
    let now = now_utc();
    let permissions = [
        Permission::Subscribers,
        Permission::Payments,
        Permission::Sales,
        Permission::Routers,
        Permission::Packages,
        Permission::Staff,
        Permission::Backups,
    ]
    .into_iter()
    .filter(|p| p.granted_to(staff.role))
    .map(Permission::as_str)
    .collect();

    Ok(Json(MeResponse {
        user: StaffView::from(&staff),
        trial_alert: status::trial_alert(&tenant, now),
        trial_days_left: status::trial_days_left(&tenant, now),
        tenant,
        permissions,
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangePasswordRequest {
    old_password: String,
    new_password: String,
}

/// PUT /api/change-password — Change the signed-in staff member's password
async fn change_password(
    AxumState(state): AxumState<WebAppState>,
    auth: StaffAuth,
    Json(req): Json<ChangePasswordRequest>,
) -> ApiResult<SuccessResponse> {
    let mut staff = state.store.get_staff(&auth.tenant_id, &auth.staff_id)?;
    if !verify_password(&req.old_password, &staff.password_hash) {
        return Err(bad_request("Current password is incorrect"));
    }
    validate_password(&req.new_password)?;
    staff.password_hash = hash_password(&req.new_password, state.config.bcrypt_cost)?;
    state.store.update_staff(&staff)?;

    auth.record(
        &state,
        ActivityAction::Edit,
        EntityType::Staff,
        Some(&staff.id),
        &staff.username,
        Some("password changed".to_string()),
    );
    Ok(success())
}

// ============================================================================
// SUBSCRIBERS
// ============================================================================

#[derive(Deserialize, Default)]
struct SubscriberQuery {
    status: Option<String>,
    q: Option<String>,
}

/// GET /api/subscribers — List subscribers with derived status, optionally filtered
async fn list_subscribers(
    AxumState(state): AxumState<WebAppState>,
    auth: StaffAuth,
    Query(query): Query<SubscriberQuery>,
) -> ApiResult<Vec<SubscriberView>> {
    let wanted = match clean(query.status) {
        Some(s) => Some(
            s.parse::<SubscriberStatus>()
                .map_err(|_| bad_request(format!("Unknown status '{}'", s)))?,
        ),
        None => None,
    };
    let needle = clean(query.q).map(|q| q.to_lowercase());

    let views = subscriber_views(&state, &auth.tenant_id)?
        .into_iter()
        .filter(|v| wanted.map_or(true, |s| v.status == s))
        .filter(|v| match &needle {
            Some(q) => {
                let s = &v.subscriber;
                s.name.to_lowercase().contains(q)
                    || s.phone.as_deref().is_some_and(|p| p.contains(q.as_str()))
                    || s.address.as_deref().is_some_and(|a| a.to_lowercase().contains(q))
            }
            None => true,
        })
        .collect();
    Ok(Json(views))
}

/// GET /api/subscribers/:id — One subscriber
async fn get_subscriber(
    AxumState(state): AxumState<WebAppState>,
    auth: StaffAuth,
    Path(id): Path<String>,
) -> ApiResult<SubscriberView> {
    let subscriber = state.store.get_subscriber(&auth.tenant_id, &id)?;
    Ok(Json(subscriber_view(&state, subscriber)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSubscriberRequest {
    id: Option<String>,
    name: String,
    phone: Option<String>,
    address: Option<String>,
    subscription_type: Option<SubscriptionType>,
    speed: Option<u32>,
    start_date: Option<String>,
    expire_date: Option<String>,
    max_devices: Option<u32>,
    balance: Option<f64>,
    router_id: Option<String>,
    package_id: Option<String>,
    notes: Option<String>,
    /// Price of the first period; defaults to the package price
    charge: Option<f64>,
    /// Paid up front; recorded as a subscription payment
    paid: Option<f64>,
    method: Option<String>,
}

/// POST /api/subscribers — Add a subscriber
async fn create_subscriber(
    AxumState(state): AxumState<WebAppState>,
    auth: StaffAuth,
    Json(req): Json<CreateSubscriberRequest>,
) -> ApiResult<SubscriberView> {
    auth.require(Permission::Subscribers)?;
    let name = required(&req.name, "name")?;
    let router_id = clean(req.router_id);
    check_router(&state, &auth.tenant_id, router_id.as_deref())?;

    let package = match clean(req.package_id) {
        Some(id) => {
            let package = state.store.get_package(&auth.tenant_id, &id)?;
            if !package.is_active {
                return Err(bad_request(format!("Package '{}' is no longer offered", package.name)));
            }
            Some(package)
        }
        None => None,
    };

    let start = opt_date(req.start_date, "startDate")?.unwrap_or_else(today);
    let expire = match opt_date(req.expire_date, "expireDate")? {
        Some(date) => date,
        None => match &package {
            Some(p) => start.checked_add_days(Days::new(u64::from(p.duration_days))),
            None => start.checked_add_months(Months::new(1)),
        }
        .ok_or_else(|| bad_request("startDate is out of range"))?,
    };
    let charge = amount(req.charge.or(package.as_ref().map(|p| p.price)).unwrap_or(0.0), "charge")?;
    let paid = amount(req.paid.unwrap_or(0.0), "paid")?;
    let opening = req.balance.unwrap_or(0.0);
    if !opening.is_finite() {
        return Err(bad_request("balance must be a number"));
    }

    let mut subscriber = Subscriber {
        id: pick_id(req.id, "sub"),
        tenant_id: auth.tenant_id.clone(),
        name,
        phone: clean(req.phone),
        address: clean(req.address),
        subscription_type: req.subscription_type.unwrap_or(SubscriptionType::Monthly),
        speed: req.speed.or(package.as_ref().map(|p| p.speed)).unwrap_or(0),
        start_date: Some(start),
        expire_date: Some(expire),
        max_devices: req.max_devices.unwrap_or(1).max(1),
        balance: opening - charge,
        router_id,
        package_id: package.as_ref().map(|p| p.id.clone()),
        notes: clean(req.notes),
        created_at: now_utc(),
    };
    state.store.insert_subscriber(&subscriber)?;

    if paid > 0.0 {
        let payment = Payment {
            id: new_id("payment"),
            tenant_id: auth.tenant_id.clone(),
            subscriber_id: subscriber.id.clone(),
            amount: paid,
            date: today(),
            payment_type: PaymentType::Subscription,
            method: clean(req.method).unwrap_or_else(|| "cash".to_string()),
            notes: None,
            created_by: Some(auth.name.clone()),
            created_at: now_utc(),
        };
        subscriber = state.store.record_payment(&payment)?;
    }

    log::info!("Added subscriber '{}' ({})", subscriber.name, subscriber.id);
    auth.record(
        &state,
        ActivityAction::Add,
        EntityType::Subscriber,
        Some(&subscriber.id),
        &subscriber.name,
        package.map(|p| format!("package {}", p.name)),
    );
    Ok(Json(subscriber_view(&state, subscriber)))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct UpdateSubscriberRequest {
    name: Option<String>,
    phone: Option<String>,
    address: Option<String>,
    subscription_type: Option<SubscriptionType>,
    speed: Option<u32>,
    start_date: Option<String>,
    expire_date: Option<String>,
    max_devices: Option<u32>,
    balance: Option<f64>,
    router_id: Option<String>,
    package_id: Option<String>,
    notes: Option<String>,
}

/// PUT /api/subscribers/:id — Update a subscriber; absent fields are kept
async fn update_subscriber(
    AxumState(state): AxumState<WebAppState>,
    auth: StaffAuth,
    Path(id): Path<String>,
    Json(req): Json<UpdateSubscriberRequest>,
) -> ApiResult<SubscriberView> {
    auth.require(Permission::Subscribers)?;
    let mut sub = state.store.get_subscriber(&auth.tenant_id, &id)?;

    if let Some(name) = req.name {
        sub.name = required(&name, "name")?;
    }
    patch_text(&mut sub.phone, req.phone);
    patch_text(&mut sub.address, req.address);
    patch_text(&mut sub.notes, req.notes);
    if let Some(t) = req.subscription_type {
        sub.subscription_type = t;
    }
    if let Some(speed) = req.speed {
        sub.speed = speed;
    }
    if let Some(max) = req.max_devices {
        sub.max_devices = max.max(1);
    }
    if let Some(balance) = req.balance {
        if !balance.is_finite() {
            return Err(bad_request("balance must be a number"));
        }
        sub.balance = balance;
    }
    patch_date(&mut sub.start_date, req.start_date, "startDate")?;
    patch_date(&mut sub.expire_date, req.expire_date, "expireDate")?;
    if req.router_id.is_some() {
        sub.router_id = clean(req.router_id);
        check_router(&state, &auth.tenant_id, sub.router_id.as_deref())?;
    }
    if req.package_id.is_some() {
        sub.package_id = clean(req.package_id);
        if let Some(package_id) = &sub.package_id {
            state.store.get_package(&auth.tenant_id, package_id)?;
        }
    }

    state.store.update_subscriber(&sub)?;
    auth.record(
        &state,
        ActivityAction::Edit,
        EntityType::Subscriber,
        Some(&sub.id),
        &sub.name,
        None,
    );
    Ok(Json(subscriber_view(&state, sub)))
}

/// DELETE /api/subscribers/:id — Remove a subscriber and their payments
async fn delete_subscriber(
    AxumState(state): AxumState<WebAppState>,
    auth: StaffAuth,
    Path(id): Path<String>,
) -> ApiResult<SuccessResponse> {
    auth.require(Permission::Subscribers)?;
    let sub = state.store.get_subscriber(&auth.tenant_id, &id)?;
    state.store.delete_subscriber(&auth.tenant_id, &id)?;
    log::info!("Deleted subscriber '{}' ({})", sub.name, sub.id);
    auth.record(
        &state,
        ActivityAction::Delete,
        EntityType::Subscriber,
        Some(&sub.id),
        &sub.name,
        None,
    );
    Ok(success())
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ExtendRequest {
    months: Option<u32>,
    days: Option<u32>,
    /// Price of the extension, debited from the balance
    charge: Option<f64>,
    /// Amount paid now, recorded as an extension payment
    amount: Option<f64>,
    method: Option<String>,
    notes: Option<String>,
}

/// POST /api/subscribers/:id/extend — Extend a subscription
async fn extend_subscriber(
    AxumState(state): AxumState<WebAppState>,
    auth: StaffAuth,
    Path(id): Path<String>,
    Json(req): Json<ExtendRequest>,
) -> ApiResult<SubscriberView> {
    auth.require(Permission::Subscribers)?;

    let mut months = req.months.unwrap_or(0);
    let days = req.days.unwrap_or(0);
    if months == 0 && days == 0 {
        months = 1;
    }
    let charge = amount(req.charge.unwrap_or(0.0), "charge")?;
    let paid = amount(req.amount.unwrap_or(0.0), "amount")?;

    let today = today();
    let payment = (paid > 0.0).then(|| Payment {
        id: new_id("payment"),
        tenant_id: auth.tenant_id.clone(),
        subscriber_id: id.clone(),
        amount: paid,
        date: today,
        payment_type: PaymentType::Extension,
        method: clean(req.method).unwrap_or_else(|| "cash".to_string()),
        notes: clean(req.notes),
        created_by: Some(auth.name.clone()),
        created_at: now_utc(),
    });
    let extension = Extension {
        months,
        days,
        today,
        charge,
        payment: payment.as_ref(),
    };
    let (previous, sub) = state.store.extend_subscription(&auth.tenant_id, &id, &extension)?;
    let new_expiry = sub.expire_date.unwrap_or(today);

    log::info!(
        "Extended '{}' from {:?} to {} ({} months, {} days)",
        sub.name,
        previous,
        new_expiry,
        months,
        days
    );
    auth.record(
        &state,
        ActivityAction::Extend,
        EntityType::Subscriber,
        Some(&sub.id),
        &sub.name,
        Some(format!("expires {}", new_expiry.format(DATE_FMT))),
    );
    Ok(Json(subscriber_view(&state, sub)))
}

// ============================================================================
// ROUTERS
// ============================================================================

/// GET /api/routers — List routers with their subscriber counts
async fn list_routers(AxumState(state): AxumState<WebAppState>, auth: StaffAuth) -> ApiResult<Vec<RouterView>> {
    let subscribers = state.store.list_subscribers(&auth.tenant_id)?;
    let views = state
        .store
        .list_routers(&auth.tenant_id)?
        .into_iter()
        .map(|router| {
            let subscriber_count = subscribers
                .iter()
                .filter(|s| s.router_id.as_deref() == Some(router.id.as_str()))
                .count();
            RouterView {
                router,
                subscriber_count,
            }
        })
        .collect();
    Ok(Json(views))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRouterRequest {
    id: Option<String>,
    name: String,
    model: Option<String>,
    ip: Option<String>,
    location: Option<String>,
    status: Option<RouterStatus>,
    total_ports: Option<u32>,
    notes: Option<String>,
}

/// POST /api/routers — Add a router
async fn create_router(
    AxumState(state): AxumState<WebAppState>,
    auth: StaffAuth,
    Json(req): Json<CreateRouterRequest>,
) -> ApiResult<RouterView> {
    auth.require(Permission::Routers)?;
    let router = models::Router {
        id: pick_id(req.id, "router"),
        tenant_id: auth.tenant_id.clone(),
        name: required(&req.name, "name")?,
        model: clean(req.model),
        ip: clean(req.ip),
        location: clean(req.location),
        status: req.status.unwrap_or(RouterStatus::Online),
        total_ports: req.total_ports.unwrap_or(0),
        notes: clean(req.notes),
        created_at: now_utc(),
    };
    state.store.insert_router(&router)?;
    auth.record(
        &state,
        ActivityAction::Add,
        EntityType::Router,
        Some(&router.id),
        &router.name,
        None,
    );
    Ok(Json(RouterView {
        router,
        subscriber_count: 0,
    }))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct UpdateRouterRequest {
    name: Option<String>,
    model: Option<String>,
    ip: Option<String>,
    location: Option<String>,
    status: Option<RouterStatus>,
    total_ports: Option<u32>,
    notes: Option<String>,
}

/// PUT /api/routers/:id — Update a router
async fn update_router(
    AxumState(state): AxumState<WebAppState>,
    auth: StaffAuth,
    Path(id): Path<String>,
    Json(req): Json<UpdateRouterRequest>,
) -> ApiResult<RouterView> {
    auth.require(Permission::Routers)?;
    let mut router = state.store.get_router(&auth.tenant_id, &id)?;
    if let Some(name) = req.name {
        router.name = required(&name, "name")?;
    }
    patch_text(&mut router.model, req.model);
    patch_text(&mut router.ip, req.ip);
    patch_text(&mut router.location, req.location);
    patch_text(&mut router.notes, req.notes);
    if let Some(status) = req.status {
        router.status = status;
    }
    if let Some(ports) = req.total_ports {
        router.total_ports = ports;
    }
    state.store.update_router(&router)?;

    let subscriber_count = state
        .store
        .list_subscribers(&auth.tenant_id)?
        .iter()
        .filter(|s| s.router_id.as_deref() == Some(router.id.as_str()))
        .count();
    auth.record(
        &state,
        ActivityAction::Edit,
        EntityType::Router,
        Some(&router.id),
        &router.name,
        None,
    );
    Ok(Json(RouterView {
        router,
        subscriber_count,
    }))
}

/// DELETE /api/routers/:id — Remove a router; its subscribers are detached
async fn delete_router(
    AxumState(state): AxumState<WebAppState>,
    auth: StaffAuth,
    Path(id): Path<String>,
) -> ApiResult<SuccessResponse> {
    auth.require(Permission::Routers)?;
    let router = state.store.get_router(&auth.tenant_id, &id)?;
    state.store.delete_router(&auth.tenant_id, &id)?;
    auth.record(
        &state,
        ActivityAction::Delete,
        EntityType::Router,
        Some(&router.id),
        &router.name,
        None,
    );
    Ok(success())
}

// ============================================================================
// SALES
// ============================================================================

/// GET /api/sales — Card sales ledger
async fn list_sales(AxumState(state): AxumState<WebAppState>, auth: StaffAuth) -> ApiResult<Vec<Sale>> {
    Ok(Json(state.store.list_sales(&auth.tenant_id)?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSaleRequest {
    id: Option<String>,
    #[serde(rename = "type")]
    sale_type: SaleType,
    count: u32,
    price: f64,
    date: Option<String>,
    notes: Option<String>,
}

/// POST /api/sales — Record a card sale
async fn create_sale(
    AxumState(state): AxumState<WebAppState>,
    auth: StaffAuth,
    Json(req): Json<CreateSaleRequest>,
) -> ApiResult<Sale> {
    auth.require(Permission::Sales)?;
    let sale = Sale {
        id: pick_id(req.id, "sale"),
        tenant_id: auth.tenant_id.clone(),
        sale_type: req.sale_type,
        count: req.count,
        price: amount(req.price, "price")?,
        date: opt_date(req.date, "date")?.unwrap_or_else(today),
        notes: clean(req.notes),
        created_at: now_utc(),
    };
    state.store.insert_sale(&sale)?;
    auth.record(
        &state,
        ActivityAction::Add,
        EntityType::Sale,
        Some(&sale.id),
        &format!("{} {} cards", sale.count, sale.sale_type),
        Some(format!("{:.2}", sale.price)),
    );
    Ok(Json(sale))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct UpdateSaleRequest {
    #[serde(rename = "type")]
    sale_type: Option<SaleType>,
    count: Option<u32>,
    price: Option<f64>,
    date: Option<String>,
    notes: Option<String>,
}

/// PUT /api/sales/:id — Correct a sale
async fn update_sale(
    AxumState(state): AxumState<WebAppState>,
    auth: StaffAuth,
    Path(id): Path<String>,
    Json(req): Json<UpdateSaleRequest>,
) -> ApiResult<Sale> {
    auth.require(Permission::Sales)?;
    let mut sale = state.store.get_sale(&auth.tenant_id, &id)?;
    if let Some(t) = req.sale_type {
        sale.sale_type = t;
    }
    if let Some(count) = req.count {
        sale.count = count;
    }
    if let Some(price) = req.price {
        sale.price = amount(price, "price")?;
    }
    if let Some(date) = clean(req.date) {
        sale.date = parse_date(&date, "date")?;
    }
    patch_text(&mut sale.notes, req.notes);
    state.store.update_sale(&sale)?;
    auth.record(
        &state,
        ActivityAction::Edit,
        EntityType::Sale,
        Some(&sale.id),
        &format!("{} {} cards", sale.count, sale.sale_type),
        None,
    );
    Ok(Json(sale))
}

/// DELETE /api/sales/:id — Remove a sale
async fn delete_sale(
    AxumState(state): AxumState<WebAppState>,
    auth: StaffAuth,
    Path(id): Path<String>,
) -> ApiResult<SuccessResponse> {
    auth.require(Permission::Sales)?;
    let sale = state.store.get_sale(&auth.tenant_id, &id)?;
    state.store.delete_sale(&auth.tenant_id, &id)?;
    auth.record(
        &state,
        ActivityAction::Delete,
        EntityType::Sale,
        Some(&sale.id),
        &format!("{} {} cards", sale.count, sale.sale_type),
        None,
    );
    Ok(success())
}

// ============================================================================
// PAYMENTS
// ============================================================================

/// GET /api/payments — All payments of the tenant
async fn list_payments(AxumState(state): AxumState<WebAppState>, auth: StaffAuth) -> ApiResult<Vec<Payment>> {
    Ok(Json(state.store.list_payments(&auth.tenant_id)?))
}

/// GET /api/payments/:subscriber_id — Payment history of one subscriber
async fn list_subscriber_payments(
    AxumState(state): AxumState<WebAppState>,
    auth: StaffAuth,
    Path(subscriber_id): Path<String>,
) -> ApiResult<Vec<Payment>> {
    state.store.get_subscriber(&auth.tenant_id, &subscriber_id)?;
    Ok(Json(
        state
            .store
            .list_payments_for_subscriber(&auth.tenant_id, &subscriber_id)?,
    ))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatePaymentRequest {
    subscriber_id: String,
    amount: f64,
    date: Option<String>,
    #[serde(rename = "type")]
    payment_type: Option<PaymentType>,
    method: Option<String>,
    notes: Option<String>,
}

/// POST /api/payments — Take a payment and credit it to the subscriber's balance
async fn create_payment(
    AxumState(state): AxumState<WebAppState>,
    auth: StaffAuth,
    Json(req): Json<CreatePaymentRequest>,
) -> ApiResult<Payment> {
    auth.require(Permission::Payments)?;
    let paid = amount(req.amount, "amount")?;
    if paid == 0.0 {
        return Err(bad_request("amount must be greater than zero"));
    }
    let sub = state.store.get_subscriber(&auth.tenant_id, req.subscriber_id.trim())?;

    let payment = Payment {
        id: new_id("payment"),
        tenant_id: auth.tenant_id.clone(),
        subscriber_id: sub.id.clone(),
        amount: paid,
        date: opt_date(req.date, "date")?.unwrap_or_else(today),
        payment_type: req.payment_type.unwrap_or(PaymentType::Subscription),
        method: clean(req.method).unwrap_or_else(|| "cash".to_string()),
        notes: clean(req.notes),
        created_by: Some(auth.name.clone()),
        created_at: now_utc(),
    };
    let sub = state.store.record_payment(&payment)?;

    log::info!("Payment of {:.2} from '{}'; balance now {:.2}", paid, sub.name, sub.balance);
    auth.record(
        &state,
        ActivityAction::Payment,
        EntityType::Payment,
        Some(&payment.id),
        &sub.name,
        Some(format!("{:.2}", paid)),
    );
    Ok(Json(payment))
}

// ============================================================================
// PACKAGES
// ============================================================================

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct PackageQuery {
    #[serde(default)]
    include_inactive: bool,
}

/// GET /api/packages — Offered packages by speed
async fn list_packages(
    AxumState(state): AxumState<WebAppState>,
    auth: StaffAuth,
    Query(query): Query<PackageQuery>,
) -> ApiResult<Vec<Package>> {
    Ok(Json(
        state
            .store
            .list_packages(&auth.tenant_id, query.include_inactive)?,
    ))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatePackageRequest {
    id: Option<String>,
    name: String,
    speed: u32,
    price: f64,
    duration_days: Option<u32>,
    description: Option<String>,
}

/// POST /api/packages — Add a package
async fn create_package(
    AxumState(state): AxumState<WebAppState>,
    auth: StaffAuth,
    Json(req): Json<CreatePackageRequest>,
) -> ApiResult<Package> {
    auth.require(Permission::Packages)?;
    let duration_days = req.duration_days.unwrap_or(30);
    if duration_days == 0 {
        return Err(bad_request("durationDays must be at least 1"));
    }
    let package = Package {
        id: pick_id(req.id, "pkg"),
        tenant_id: auth.tenant_id.clone(),
        name: required(&req.name, "name")?,
        speed: req.speed,
        price: amount(req.price, "price")?,
        duration_days,
        description: clean(req.description),
        is_active: true,
        created_at: now_utc(),
    };
    state.store.insert_package(&package)?;
    auth.record(
        &state,
        ActivityAction::Add,
        EntityType::Package,
        Some(&package.id),
        &package.name,
        None,
    );
    Ok(Json(package))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct UpdatePackageRequest {
    name: Option<String>,
    speed: Option<u32>,
    price: Option<f64>,
    duration_days: Option<u32>,
    description: Option<String>,
    is_active: Option<bool>,
}

/// PUT /api/packages/:id — Update a package
async fn update_package(
    AxumState(state): AxumState<WebAppState>,
    auth: StaffAuth,
    Path(id): Path<String>,
    Json(req): Json<UpdatePackageRequest>,
) -> ApiResult<Package> {
    auth.require(Permission::Packages)?;
    let mut package = state.store.get_package(&auth.tenant_id, &id)?;
    if let Some(name) = req.name {
        package.name = required(&name, "name")?;
    }
    if let Some(speed) = req.speed {
        package.speed = speed;
    }
    if let Some(price) = req.price {
        package.price = amount(price, "price")?;
    }
    if let Some(days) = req.duration_days {
        if days == 0 {
            return Err(bad_request("durationDays must be at least 1"));
        }
        package.duration_days = days;
    }
    patch_text(&mut package.description, req.description);
    if let Some(active) = req.is_active {
        package.is_active = active;
    }
    state.store.update_package(&package)?;
    auth.record(
        &state,
        ActivityAction::Edit,
        EntityType::Package,
        Some(&package.id),
        &package.name,
        None,
    );
    Ok(Json(package))
}

/// DELETE /api/packages/:id — Stop offering a package. Subscribers keep their reference.
async fn delete_package(
    AxumState(state): AxumState<WebAppState>,
    auth: StaffAuth,
    Path(id): Path<String>,
) -> ApiResult<SuccessResponse> {
    auth.require(Permission::Packages)?;
    let mut package = state.store.get_package(&auth.tenant_id, &id)?;
    package.is_active = false;
    state.store.update_package(&package)?;
    auth.record(
        &state,
        ActivityAction::Delete,
        EntityType::Package,
        Some(&package.id),
        &package.name,
        None,
    );
    Ok(success())
}

// ============================================================================
// STAFF
// ============================================================================

/// GET /api/staff — Staff accounts of the tenant
async fn list_staff(AxumState(state): AxumState<WebAppState>, auth: StaffAuth) -> ApiResult<Vec<StaffView>> {
    auth.require(Permission::Staff)?;
    let staff = state.store.list_staff(&auth.tenant_id)?;
    Ok(Json(staff.iter().map(StaffView::from).collect()))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateStaffRequest {
    name: String,
    username: String,
    password: String,
    role: StaffRole,
}

/// POST /api/staff — Add a staff account
async fn create_staff(
    AxumState(state): AxumState<WebAppState>,
    auth: StaffAuth,
    Json(req): Json<CreateStaffRequest>,
) -> ApiResult<StaffView> {
    auth.require(Permission::Staff)?;
    let username = required(&req.username, "username")?;
    validate_password(&req.password)?;
    let staff = Staff {
        id: new_id("staff"),
        tenant_id: auth.tenant_id.clone(),
        name: required(&req.name, "name")?,
        username,
        password_hash: hash_password(&req.password, state.config.bcrypt_cost)?,
        role: req.role,
        created_at: now_utc(),
    };
    state.store.insert_staff(&staff)?;
    log::info!("Added {} account '{}'", staff.role, staff.username);
    auth.record(
        &state,
        ActivityAction::Add,
        EntityType::Staff,
        Some(&staff.id),
        &staff.username,
        Some(staff.role.to_string()),
    );
    Ok(Json(StaffView::from(&staff)))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct UpdateStaffRequest {
    name: Option<String>,
    role: Option<StaffRole>,
    password: Option<String>,
}

fn admin_count(staff: &[Staff]) -> usize {
    staff.iter().filter(|s| s.role == StaffRole::Admin).count()
}

/// PUT /api/staff/:id — Rename, change role or reset password
async fn update_staff(
    AxumState(state): AxumState<WebAppState>,
    auth: StaffAuth,
    Path(id): Path<String>,
    Json(req): Json<UpdateStaffRequest>,
) -> ApiResult<StaffView> {
    auth.require(Permission::Staff)?;
    let all = state.store.list_staff(&auth.tenant_id)?;
    let mut staff = all
        .iter()
        .find(|s| s.id == id)
        .cloned()
        .ok_or_else(|| StoreError::not_found("staff", &id))?;

    if let Some(name) = req.name {
        staff.name = required(&name, "name")?;
    }
    let mut signed_out = false;
    if let Some(role) = req.role {
        if staff.role == StaffRole::Admin && role != StaffRole::Admin && admin_count(&all) == 1 {
            return Err(bad_request("The last admin cannot be demoted"));
        }
        signed_out |= role != staff.role;
        staff.role = role;
    }
    if let Some(password) = req.password {
        validate_password(&password)?;
        staff.password_hash = hash_password(&password, state.config.bcrypt_cost)?;
        signed_out = true;
    }
    state.store.update_staff(&staff)?;
    if signed_out && staff.id != auth.staff_id {
        state.sessions.revoke_all_for(&staff.id);
    }

    auth.record(
        &state,
        ActivityAction::Edit,
        EntityType::Staff,
        Some(&staff.id),
        &staff.username,
        None,
    );
    Ok(Json(StaffView::from(&staff)))
}

/// DELETE /api/staff/:id — Remove a staff account and sign it out
async fn delete_staff(
    AxumState(state): AxumState<WebAppState>,
    auth: StaffAuth,
    Path(id): Path<String>,
) -> ApiResult<SuccessResponse> {
    auth.require(Permission::Staff)?;
    if id == auth.staff_id {
        return Err(bad_request("You cannot delete your own account"));
    }
    let all = state.store.list_staff(&auth.tenant_id)?;
    let staff = all
        .iter()
        .find(|s| s.id == id)
        .ok_or_else(|| StoreError::not_found("staff", &id))?;
    if staff.role == StaffRole::Admin && admin_count(&all) == 1 {
        return Err(bad_request("The last admin cannot be deleted"));
    }

    state.store.delete_staff(&auth.tenant_id, &id)?;
    let revoked = state.sessions.revoke_all_for(&id);
    log::info!("Deleted staff '{}' and revoked {} sessions", staff.username, revoked);
    auth.record(
        &state,
        ActivityAction::Delete,
        EntityType::Staff,
        Some(&staff.id),
        &staff.username,
        None,
    );
    Ok(success())
}

// ============================================================================
// ACTIVITY LOG
// ============================================================================

const DEFAULT_ACTIVITY_LIMIT: usize = 100;

#[derive(Deserialize, Default)]
struct ActivityQuery {
    limit: Option<usize>,
}

/// GET /api/activity-log — Newest entries first
async fn list_activity(
    AxumState(state): AxumState<WebAppState>,
    auth: StaffAuth,
    Query(query): Query<ActivityQuery>,
) -> ApiResult<Vec<ActivityLogEntry>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_ACTIVITY_LIMIT)
        .clamp(1, state.config.activity_log_cap);
    Ok(Json(state.store.list_activity(&auth.tenant_id, limit)?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateActivityRequest {
    action: ActivityAction,
    entity_type: EntityType,
    entity_id: Option<String>,
    entity_name: String,
    details: Option<String>,
}

/// POST /api/activity-log — Record a manual entry
async fn create_activity(
    AxumState(state): AxumState<WebAppState>,
    auth: StaffAuth,
    Json(req): Json<CreateActivityRequest>,
) -> ApiResult<ActivityLogEntry> {
    let entry = ActivityLogEntry {
        id: new_id("log"),
        tenant_id: auth.tenant_id.clone(),
        action: req.action,
        entity_type: req.entity_type,
        entity_id: clean(req.entity_id),
        entity_name: required(&req.entity_name, "entityName")?,
        actor: auth.name.clone(),
        timestamp: now_utc(),
        details: clean(req.details),
    };
    state
        .store
        .append_activity(&entry, state.config.activity_log_cap)?;
    Ok(Json(entry))
}

// ============================================================================
// DASHBOARD & REPORTS
// ============================================================================

/// GET /api/dashboard — Tiles for the landing page
async fn dashboard(AxumState(state): AxumState<WebAppState>, auth: StaffAuth) -> ApiResult<DashboardStats> {
    let start = std::time::Instant::now();
    let views = subscriber_views(&state, &auth.tenant_id)?;
    let routers = state.store.list_routers(&auth.tenant_id)?;
    let sales = state.store.list_sales(&auth.tenant_id)?;
    let payments = state.store.list_payments(&auth.tenant_id)?;
    let stats = stats::dashboard(&views, &routers, &sales, &payments, today());
    log::debug!(
        "Dashboard for {} computed in {:.1}ms",
        auth.tenant_id,
        start.elapsed().as_secs_f64() * 1000.0
    );
    Ok(Json(stats))
}

/// GET /api/alerts — Subscribers about to lapse or already lapsed
async fn alerts(AxumState(state): AxumState<WebAppState>, auth: StaffAuth) -> ApiResult<Vec<SubscriberView>> {
    let views = subscriber_views(&state, &auth.tenant_id)?;
    Ok(Json(stats::alerts(&views)))
}

#[derive(Deserialize, Default)]
struct MonthQuery {
    month: Option<String>,
}

/// GET /api/reports/monthly — Income and churn for a month (defaults to the current one)
async fn monthly_report(
    AxumState(state): AxumState<WebAppState>,
    auth: StaffAuth,
    Query(query): Query<MonthQuery>,
) -> ApiResult<MonthlyReport> {
    let month = match clean(query.month) {
        Some(m) => YearMonth::parse(&m).ok_or_else(|| bad_request(format!("Invalid month '{}', expected YYYY-MM", m)))?,
        None => YearMonth::of(today()),
    };
    let views = subscriber_views(&state, &auth.tenant_id)?;
    let sales = state.store.list_sales(&auth.tenant_id)?;
    let payments = state.store.list_payments(&auth.tenant_id)?;
    Ok(Json(stats::monthly_report(&views, &sales, &payments, month)))
}

// ============================================================================
// BACKUP
// ============================================================================

/// GET /api/backup — Download the tenant's data as a tar.gz archive
async fn export_backup(AxumState(state): AxumState<WebAppState>, auth: StaffAuth) -> Result<Response, ApiError> {
    auth.require(Permission::Backups)?;
    let tenant = state.store.get_tenant(&auth.tenant_id)?;

    let start = std::time::Instant::now();
    let mut archive = Vec::new();
    let rows = backup::write_backup(state.store.as_ref(), Some(&auth.tenant_id), &mut archive)?;
    log::info!(
        "Backup of {} rows for '{}' built in {:.1}ms",
        rows,
        tenant.slug,
        start.elapsed().as_secs_f64() * 1000.0
    );

    let filename = format!(
        "wasla-{}-{}.tar.gz",
        tenant.slug,
        Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    Ok((
        [
            (header::CONTENT_TYPE, "application/gzip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        archive,
    )
        .into_response())
}

/// POST /api/backup/restore — Upload and restore a backup archive into this tenant
async fn import_backup(
    AxumState(state): AxumState<WebAppState>,
    auth: StaffAuth,
    mut multipart: Multipart,
) -> ApiResult<String> {
    auth.require(Permission::Backups)?;
    let field = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("Multipart error: {}", e)))?
        .ok_or_else(|| bad_request("No file uploaded"))?;
    let data = field
        .bytes()
        .await
        .map_err(|e| bad_request(format!("Failed to read file: {}", e)))?;

    let mut snapshot = backup::read_backup(&data[..])?;
    snapshot.data.retain_tenant(&auth.tenant_id);
    // Billing state belongs to the platform, not to the archive
    snapshot.data.tenants = vec![state.store.get_tenant(&auth.tenant_id)?];
    let mut staff = Vec::with_capacity(snapshot.data.staff.len());
    for s in std::mem::take(&mut snapshot.data.staff) {
        match state.store.find_staff_by_username(&s.username)? {
            Some(existing) if existing.tenant_id != auth.tenant_id => {
                log::warn!("Skipping restored staff '{}': username belongs to another tenant", s.username);
            }
            _ => staff.push(s),
        }
    }
    snapshot.data.staff = staff;

    let msg = backup::restore_snapshot(
        state.store.as_ref(),
        snapshot,
        Some(&auth.tenant_id),
        state.config.activity_log_cap,
    )?;
    auth.record(
        &state,
        ActivityAction::Restore,
        EntityType::System,
        None,
        "backup",
        Some(msg.clone()),
    );
    Ok(Json(msg))
}

// ============================================================================
// SUPER ADMIN
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TenantSummary {
    #[serde(flatten)]
    tenant: Tenant,
    owner_name: Option<String>,
    subscriber_count: usize,
    staff_count: usize,
    trial_days_left: Option<i64>,
}

/// GET /api/superadmin/tenants — Every tenant with its owner and size
async fn list_tenants(
    AxumState(state): AxumState<WebAppState>,
    _auth: SuperAdminAuth,
) -> ApiResult<Vec<TenantSummary>> {
    let now = now_utc();
    let mut out = Vec::new();
    for tenant in state.store.list_tenants()? {
        let staff = state.store.list_staff(&tenant.id)?;
        // staff is listed newest first; the owner is the oldest admin
        let owner_name = staff
            .iter()
            .rev()
            .find(|s| s.role == StaffRole::Admin)
            .map(|s| s.name.clone());
        out.push(TenantSummary {
            owner_name,
            subscriber_count: state.store.count_subscribers(&tenant.id)?,
            staff_count: staff.len(),
            trial_days_left: status::trial_days_left(&tenant, now),
            tenant,
        });
    }
    Ok(Json(out))
}

fn record_tenant_change(state: &WebAppState, auth: &SuperAdminAuth, tenant: &Tenant, details: String) {
    log::info!("Super admin '{}' updated tenant '{}': {}", auth.username, tenant.slug, details);
    record_activity(
        state,
        ActivityLogEntry {
            id: new_id("log"),
            tenant_id: tenant.id.clone(),
            action: ActivityAction::Edit,
            entity_type: EntityType::Tenant,
            entity_id: Some(tenant.id.clone()),
            entity_name: tenant.name.clone(),
            actor: auth.username.clone(),
            timestamp: now_utc(),
            details: Some(details),
        },
    );
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetActiveRequest {
    is_active: bool,
}

/// PUT /api/superadmin/tenants/:id/active — Enable or disable a tenant
async fn set_tenant_active(
    AxumState(state): AxumState<WebAppState>,
    auth: SuperAdminAuth,
    Path(id): Path<String>,
    Json(req): Json<SetActiveRequest>,
) -> ApiResult<Tenant> {
    let mut tenant = state.store.get_tenant(&id)?;
    tenant.is_active = req.is_active;
    state.store.update_tenant(&tenant)?;
    if !tenant.is_active {
        state.sessions.revoke_tenant(&tenant.id);
    }
    let details = if tenant.is_active { "activated" } else { "deactivated" };
    record_tenant_change(&state, &auth, &tenant, details.to_string());
    Ok(Json(tenant))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetSubscriptionRequest {
    status: TenantSubscriptionStatus,
    ends_at: Option<DateTime<Utc>>,
}

/// PUT /api/superadmin/tenants/:id/subscription — Set a tenant's billing state
async fn set_tenant_subscription(
    AxumState(state): AxumState<WebAppState>,
    auth: SuperAdminAuth,
    Path(id): Path<String>,
    Json(req): Json<SetSubscriptionRequest>,
) -> ApiResult<Tenant> {
    let mut tenant = state.store.get_tenant(&id)?;
    tenant.subscription_status = req.status;
    if req.ends_at.is_some() {
        tenant.subscription_ends_at = req.ends_at;
    }
    state.store.update_tenant(&tenant)?;
    if !status::tenant_in_good_standing(&tenant, now_utc()) {
        state.sessions.revoke_tenant(&tenant.id);
    }
    record_tenant_change(&state, &auth, &tenant, format!("subscription set to {}", tenant.subscription_status));
    Ok(Json(tenant))
}

/// Later of now and the current end, so remaining time is never lost
fn extension_base(tenant: &Tenant, now: DateTime<Utc>) -> DateTime<Utc> {
    match tenant.subscription_ends_at {
        Some(ends) if ends > now => ends,
        _ => now,
    }
}

#[derive(Deserialize)]
struct ExtendTrialRequest {
    days: u32,
}

/// POST /api/superadmin/tenants/:id/extend-trial — Give a tenant more trial days
async fn extend_tenant_trial(
    AxumState(state): AxumState<WebAppState>,
    auth: SuperAdminAuth,
    Path(id): Path<String>,
    Json(req): Json<ExtendTrialRequest>,
) -> ApiResult<Tenant> {
    if req.days == 0 {
        return Err(bad_request("days must be at least 1"));
    }
    let mut tenant = state.store.get_tenant(&id)?;
    let now = now_utc();
    let ends = extension_base(&tenant, now)
        .checked_add_days(Days::new(u64::from(req.days)))
        .ok_or_else(|| bad_request("days is out of range"))?;
    tenant.subscription_ends_at = Some(ends);
    tenant.subscription_status = TenantSubscriptionStatus::Trial;
    state.store.update_tenant(&tenant)?;
    record_tenant_change(&state, &auth, &tenant, format!("trial extended by {} days", req.days));
    Ok(Json(tenant))
}

#[derive(Deserialize)]
struct ActivateRequest {
    months: u32,
}

/// POST /api/superadmin/tenants/:id/activate — Start or extend a paid subscription
async fn activate_tenant(
    AxumState(state): AxumState<WebAppState>,
    auth: SuperAdminAuth,
    Path(id): Path<String>,
    Json(req): Json<ActivateRequest>,
) -> ApiResult<Tenant> {
    if req.months == 0 {
        return Err(bad_request("months must be at least 1"));
    }
    let mut tenant = state.store.get_tenant(&id)?;
    let now = now_utc();
    let base = extension_base(&tenant, now);
    let ends = base
        .checked_add_months(Months::new(req.months))
        .ok_or_else(|| bad_request("months is out of range"))?;
    tenant.subscription_status = TenantSubscriptionStatus::Active;
    tenant.subscription_ends_at = Some(ends);
    tenant.is_active = true;
    state.store.update_tenant(&tenant)?;
    record_tenant_change(&state, &auth, &tenant, format!("activated for {} months", req.months));
    Ok(Json(tenant))
}

#[derive(Serialize, Default)]
#[serde(rename_all = "camelCase")]
struct PlatformStats {
    total_tenants: usize,
    active_tenants: usize,
    inactive_tenants: usize,
    trial: usize,
    paid: usize,
    expired: usize,
    suspended: usize,
    total_subscribers: usize,
}

/// GET /api/superadmin/stats — Tenant counts by billing state
async fn platform_stats(
    AxumState(state): AxumState<WebAppState>,
    _auth: SuperAdminAuth,
) -> ApiResult<PlatformStats> {
    let mut stats = PlatformStats::default();
    for tenant in state.store.list_tenants()? {
        stats.total_tenants += 1;
        if tenant.is_active {
            stats.active_tenants += 1;
        } else {
            stats.inactive_tenants += 1;
        }
        match tenant.subscription_status {
            TenantSubscriptionStatus::Trial => stats.trial += 1,
            TenantSubscriptionStatus::Active => stats.paid += 1,
            TenantSubscriptionStatus::Expired => stats.expired += 1,
            TenantSubscriptionStatus::Suspended => stats.suspended += 1,
        }
        stats.total_subscribers += state.store.count_subscribers(&tenant.id)?;
    }
    Ok(Json(stats))
}

// ============================================================================
// ROUTER & SERVER
// ============================================================================

pub fn build_router(state: WebAppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let static_dir = state.config.static_dir.clone();

    let router = Router::new()
        .route("/api/health", get(health))
        .route("/api/login", post(login))
        .route("/api/signup", post(signup))
        .route("/api/logout", post(logout))
        .route("/api/me", get(me))
        .route("/api/change-password", put(change_password))
        .route("/api/subscribers", get(list_subscribers).post(create_subscriber))
        .route(
            "/api/subscribers/:id",
            get(get_subscriber).put(update_subscriber).delete(delete_subscriber),
        )
        .route("/api/subscribers/:id/extend", post(extend_subscriber))
        .route("/api/routers", get(list_routers).post(create_router))
        .route("/api/routers/:id", put(update_router).delete(delete_router))
        .route("/api/sales", get(list_sales).post(create_sale))
        .route("/api/sales/:id", put(update_sale).delete(delete_sale))
        .route("/api/payments", get(list_payments).post(create_payment))
        .route("/api/payments/:subscriber_id", get(list_subscriber_payments))
        .route("/api/packages", get(list_packages).post(create_package))
        .route("/api/packages/:id", put(update_package).delete(delete_package))
        .route("/api/staff", get(list_staff).post(create_staff))
        .route("/api/staff/:id", put(update_staff).delete(delete_staff))
        .route("/api/activity-log", get(list_activity).post(create_activity))
        .route("/api/dashboard", get(dashboard))
        .route("/api/alerts", get(alerts))
        .route("/api/reports/monthly", get(monthly_report))
        .route("/api/backup", get(export_backup))
        .route("/api/backup/restore", post(import_backup))
        .route("/api/superadmin/login", post(superadmin_login))
        .route("/api/superadmin/logout", post(superadmin_logout))
        .route("/api/superadmin/tenants", get(list_tenants))
        .route("/api/superadmin/tenants/:id/active", put(set_tenant_active))
        .route("/api/superadmin/tenants/:id/subscription", put(set_tenant_subscription))
        .route("/api/superadmin/tenants/:id/extend-trial", post(extend_tenant_trial))
        .route("/api/superadmin/tenants/:id/activate", post(activate_tenant))
        .route("/api/superadmin/stats", get(platform_stats));

    let router = match static_dir {
        Some(dir) => {
            log::info!("Serving front end from {:?}", dir);
            let index = dir.join("index.html");
            router.fallback_service(ServeDir::new(dir).not_found_service(ServeFile::new(index)))
        }
        None => router,
    };

    router
        .layer(cors)
        .layer(DefaultBodyLimit::max(50 * 1024 * 1024)) // 50 MB
        .with_state(state)
}

/// Open storage, seed defaults and serve until the process exits
pub async fn start_server(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(&config)?;
    bootstrap::ensure_defaults(store.as_ref(), &config)?;
    let sessions = Arc::new(SessionStore::new(Duration::hours(config.session_ttl_hours)));

    if let Some(cron_expr) = config.expiry_sweep_cron.clone() {
        log::info!("Scheduled expiry sweep enabled: {}", cron_expr);
        let store = Arc::clone(&store);
        let sessions = Arc::clone(&sessions);
        let thresholds = config.thresholds;
        tokio::spawn(async move {
            if let Err(e) = start_expiry_scheduler(store, sessions, thresholds, &cron_expr).await {
                log::error!("Failed to start expiry scheduler: {}", e);
            }
        });
    }

    let addr = config.bind_addr();
    let state = WebAppState {
        store,
        sessions,
        config: Arc::new(config),
    };
    let router = build_router(state);

    log::info!("Starting Wasla server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugs_are_lowercase_and_dashed() {
        assert_eq!(slugify("  Fast   Net  Gaza "), "fast-net-gaza");
        assert_eq!(slugify("شبكة الوصل"), "شبكة-الوصل");
        assert_eq!(slugify("   "), "tenant");
    }

    #[test]
    fn text_patches_clear_on_empty() {
        let mut field = Some("old".to_string());
        patch_text(&mut field, None);
        assert_eq!(field.as_deref(), Some("old"));
        patch_text(&mut field, Some("  new ".into()));
        assert_eq!(field.as_deref(), Some("new"));
        patch_text(&mut field, Some("".into()));
        assert_eq!(field, None);
    }

    #[test]
    fn date_parsing_reports_bad_input() {
        assert_eq!(
            opt_date(Some("2025-12-01".into()), "startDate").unwrap(),
            NaiveDate::from_ymd_opt(2025, 12, 1)
        );
        assert_eq!(opt_date(Some(" ".into()), "startDate").unwrap(), None);
        let err = opt_date(Some("01/12/2025".into()), "startDate").unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn amounts_must_be_non_negative() {
        assert!(amount(0.0, "x").is_ok());
        assert!(amount(-1.0, "x").is_err());
        assert!(amount(f64::NAN, "x").is_err());
    }

    #[test]
    fn store_errors_map_to_status_codes() {
        let e: ApiError = StoreError::not_found("subscriber", "s1").into();
        assert_eq!(e.status(), StatusCode::NOT_FOUND);
        let e: ApiError = StoreError::Conflict("taken".into()).into();
        assert_eq!(e.status(), StatusCode::CONFLICT);
        let e: ApiError = AuthError::SubscriptionLapsed.into();
        assert_eq!(e.status(), StatusCode::FORBIDDEN);
        let e: ApiError = AuthError::InvalidToken.into();
        assert_eq!(e.status(), StatusCode::UNAUTHORIZED);
        let e: ApiError = BackupError::Invalid("nope".into()).into();
        assert_eq!(e.status(), StatusCode::BAD_REQUEST);
    }
}
