//! DuckDB storage backend.
//!
//! This module handles:
//! - DuckDB connection initialization in the data directory
//! - Schema creation and column migrations for every table
//! - Tenant-scoped reads and writes behind the [`Store`] trait
//! - Row-level snapshot export/import used by backups

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use duckdb::types::Type;
use duckdb::{params, params_from_iter, Connection, OptionalExt, Params, Result as DuckResult, Row};

use crate::models::{
    ActivityLogEntry, Dataset, ImportSummary, Package, ParseEnumError, Payment, Router, Sale, Staff,
    Subscriber, SuperAdmin, Tenant, DATE_FMT,
};
use crate::store::{Extension, Store, StoreError, StoreResult};

const TENANT_COLUMNS: &str =
    "id, name, slug, phone, address, is_active, subscription_status, subscription_ends_at, created_at";
const STAFF_COLUMNS: &str = "id, tenant_id, name, username, password_hash, role, created_at";
const SUBSCRIBER_COLUMNS: &str = "id, tenant_id, name, phone, address, subscription_type, speed, start_date, \
     expire_date, max_devices, balance, router_id, package_id, notes, created_at";
const ROUTER_COLUMNS: &str = "id, tenant_id, name, model, ip, location, status, total_ports, notes, created_at";
const SALE_COLUMNS: &str = "id, tenant_id, sale_type, card_count, price, sale_date, notes, created_at";
const PAYMENT_COLUMNS: &str =
    "id, tenant_id, subscriber_id, amount, payment_date, payment_type, method, notes, created_by, created_at";
const PACKAGE_COLUMNS: &str =
    "id, tenant_id, name, speed, price, duration_days, description, is_active, created_at";
const ACTIVITY_COLUMNS: &str =
    "id, tenant_id, action, entity_type, entity_id, entity_name, actor, logged_at, details";

/// Thread-safe database manager
pub struct Database {
    conn: Mutex<Connection>,
    pub data_dir: PathBuf,
}

impl Drop for Database {
    fn drop(&mut self) {
        log::info!("Closing DuckDB store in {:?}; remaining WAL data is flushed on close", self.data_dir);
    }
}

impl Database {
    /// Initialize the database in the data directory.
    ///
    /// ```text
    /// {data_dir}/
    /// └── wasla.db       # DuckDB database file
    /// ```
    pub fn new(data_dir: PathBuf) -> StoreResult<Self> {
        fs::create_dir_all(&data_dir)?;

        let db_path = data_dir.join("wasla.db");
        log::info!("Initializing DuckDB at: {:?}", db_path);

        let conn = Self::open_with_recovery(&db_path)?;
        Self::configure_connection(&conn)?;

        if let Err(e) = conn.execute_batch("CHECKPOINT;") {
            log::warn!("WAL checkpoint failed (non-fatal): {}", e);
        }

        let db = Self {
            conn: Mutex::new(conn),
            data_dir,
        };
        db.init_schema()?;
        Ok(db)
    }

    fn open_with_recovery(db_path: &PathBuf) -> StoreResult<Connection> {
        match Connection::open(db_path) {
            Ok(conn) => Ok(conn),
            Err(err) => {
                log::warn!("DuckDB open failed: {}. Attempting WAL recovery...", err);

                let wal_path = db_path.with_extension("db.wal");
                if wal_path.exists() {
                    if let Err(wal_err) = fs::remove_file(&wal_path) {
                        log::warn!("Failed to remove WAL file {:?}: {}", wal_path, wal_err);
                    } else {
                        log::info!("Removed WAL file {:?}", wal_path);
                    }
                }

                match Connection::open(db_path) {
                    Ok(conn) => Ok(conn),
                    Err(second_err) => {
                        log::warn!("WAL recovery failed: {}. Backing up DB and recreating...", second_err);

                        let backup_path = Self::backup_db(db_path)?;
                        log::warn!("Database backed up to {:?}", backup_path);

                        Connection::open(db_path).map_err(StoreError::from)
                    }
                }
            }
        }
    }

    /// Move an unreadable database file aside before recreating it
    fn backup_db(db_path: &PathBuf) -> StoreResult<PathBuf> {
        if !db_path.exists() {
            return Ok(db_path.clone());
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let backup_path = db_path.with_extension(format!("db.bak.{}", timestamp));
        fs::rename(db_path, &backup_path)?;

        let wal_path = db_path.with_extension("db.wal");
        if wal_path.exists() {
            let wal_backup = wal_path.with_extension(format!("db.wal.bak.{}", timestamp));
            let _ = fs::rename(&wal_path, wal_backup);
        }

        Ok(backup_path)
    }

    fn configure_connection(conn: &Connection) -> DuckResult<()> {
        conn.execute_batch(
            r#"
            SET memory_limit = '512MB';
            SET threads = 2;
            SET enable_progress_bar = false;
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn();

        // Uniqueness of slugs and usernames is checked before writes rather
        // than with UNIQUE indexes, which DuckDB enforces eagerly on updates.
        conn.execute_batch(
            r#"
            -- ============================================================
            -- TENANTS: one row per ISP operator workspace
            -- ============================================================
            CREATE TABLE IF NOT EXISTS tenants (
                id                   VARCHAR PRIMARY KEY,
                name                 VARCHAR NOT NULL,
                slug                 VARCHAR NOT NULL,
                phone                VARCHAR,
                address              VARCHAR,
                is_active            BOOLEAN NOT NULL DEFAULT true,
                subscription_status  VARCHAR NOT NULL DEFAULT 'trial',
                subscription_ends_at VARCHAR,              -- RFC 3339 UTC
                created_at           VARCHAR NOT NULL
            );

            CREATE TABLE IF NOT EXISTS super_admins (
                username        VARCHAR PRIMARY KEY,
                password_hash   VARCHAR NOT NULL,
                created_at      VARCHAR NOT NULL
            );

            CREATE TABLE IF NOT EXISTS staff (
                id              VARCHAR PRIMARY KEY,
                tenant_id       VARCHAR NOT NULL,
                name            VARCHAR NOT NULL,
                username        VARCHAR NOT NULL,
                password_hash   VARCHAR NOT NULL,
                role            VARCHAR NOT NULL,
                created_at      VARCHAR NOT NULL
            );

            -- ============================================================
            -- SUBSCRIBERS: status and days left are derived on read
            -- ============================================================
            CREATE TABLE IF NOT EXISTS subscribers (
                id                VARCHAR PRIMARY KEY,
                tenant_id         VARCHAR NOT NULL,
                name              VARCHAR NOT NULL,
                phone             VARCHAR,
                address           VARCHAR,
                subscription_type VARCHAR NOT NULL DEFAULT 'monthly',
                speed             BIGINT NOT NULL DEFAULT 0,     -- Mbps
                start_date        VARCHAR,                       -- YYYY-MM-DD
                expire_date       VARCHAR,                       -- YYYY-MM-DD
                max_devices       BIGINT NOT NULL DEFAULT 1,
                balance           DOUBLE NOT NULL DEFAULT 0,     -- negative = owes
                router_id         VARCHAR,
                package_id        VARCHAR,
                notes             VARCHAR,
                created_at        VARCHAR NOT NULL
            );

            CREATE TABLE IF NOT EXISTS routers (
                id              VARCHAR PRIMARY KEY,
                tenant_id       VARCHAR NOT NULL,
                name            VARCHAR NOT NULL,
                model           VARCHAR,
                ip              VARCHAR,
                location        VARCHAR,
                status          VARCHAR NOT NULL DEFAULT 'online',
                total_ports     BIGINT NOT NULL DEFAULT 0,
                notes           VARCHAR,
                created_at      VARCHAR NOT NULL
            );

            -- ============================================================
            -- LEDGERS: card sales and subscriber payments
            -- ============================================================
            CREATE TABLE IF NOT EXISTS sales (
                id              VARCHAR PRIMARY KEY,
                tenant_id       VARCHAR NOT NULL,
                sale_type       VARCHAR NOT NULL,
                card_count      BIGINT NOT NULL,
                price           DOUBLE NOT NULL,
                sale_date       VARCHAR NOT NULL,
                notes           VARCHAR,
                created_at      VARCHAR NOT NULL
            );

            CREATE TABLE IF NOT EXISTS payments (
                id              VARCHAR PRIMARY KEY,
                tenant_id       VARCHAR NOT NULL,
                subscriber_id   VARCHAR NOT NULL,
                amount          DOUBLE NOT NULL,
                payment_date    VARCHAR NOT NULL,
                payment_type    VARCHAR NOT NULL DEFAULT 'subscription',
                method          VARCHAR NOT NULL DEFAULT 'cash',
                notes           VARCHAR,
                created_by      VARCHAR,
                created_at      VARCHAR NOT NULL
            );

            CREATE TABLE IF NOT EXISTS packages (
                id              VARCHAR PRIMARY KEY,
                tenant_id       VARCHAR NOT NULL,
                name            VARCHAR NOT NULL,
                speed           BIGINT NOT NULL,
                price           DOUBLE NOT NULL,
                duration_days   BIGINT NOT NULL DEFAULT 30,
                description     VARCHAR,
                is_active       BOOLEAN NOT NULL DEFAULT true,
                created_at      VARCHAR NOT NULL
            );

            -- ============================================================
            -- ACTIVITY LOG: capped per tenant; seq orders same-millisecond rows
            -- ============================================================
            CREATE SEQUENCE IF NOT EXISTS activity_seq;

            CREATE TABLE IF NOT EXISTS activity_log (
                id              VARCHAR PRIMARY KEY,
                seq             BIGINT DEFAULT nextval('activity_seq'),
                tenant_id       VARCHAR NOT NULL,
                action          VARCHAR NOT NULL,
                entity_type     VARCHAR NOT NULL,
                entity_id       VARCHAR,
                entity_name     VARCHAR NOT NULL,
                actor           VARCHAR NOT NULL,
                logged_at       VARCHAR NOT NULL,
                details         VARCHAR
            );
            "#,
        )?;

        Self::migrate_tenants_table(&conn)?;
        Self::migrate_subscribers_table(&conn)?;

        // Indexes go last; DuckDB refuses ALTER TABLE on indexed tables
        conn.execute_batch(
            r#"
            CREATE INDEX IF NOT EXISTS idx_subscribers_tenant ON subscribers(tenant_id);
            CREATE INDEX IF NOT EXISTS idx_payments_subscriber ON payments(tenant_id, subscriber_id);
            CREATE INDEX IF NOT EXISTS idx_activity_tenant ON activity_log(tenant_id);
            "#,
        )?;

        log::info!("Database schema initialized successfully");
        Ok(())
    }

    /// Get existing column names for a table (single query)
    fn get_table_columns(conn: &Connection, table_name: &str) -> StoreResult<HashSet<String>> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info('{}')", table_name))?;
        let columns: HashSet<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(columns)
    }

    fn apply_column_migrations(conn: &Connection, table: &str, migrations: &[(&str, &str)]) -> StoreResult<()> {
        let columns = Self::get_table_columns(conn, table)?;
        for (col_name, sql) in migrations {
            if !columns.contains(*col_name) {
                log::info!("Migrating {} table: adding {} column", table, col_name);
                conn.execute_batch(sql)?;
            }
        }
        Ok(())
    }

    fn migrate_tenants_table(conn: &Connection) -> StoreResult<()> {
        Self::apply_column_migrations(
            conn,
            "tenants",
            &[
                ("phone", "ALTER TABLE tenants ADD COLUMN phone VARCHAR"),
                ("address", "ALTER TABLE tenants ADD COLUMN address VARCHAR"),
                (
                    "subscription_ends_at",
                    "ALTER TABLE tenants ADD COLUMN subscription_ends_at VARCHAR",
                ),
            ],
        )
    }

    /// Older data directories predate addresses, packages and balances
    fn migrate_subscribers_table(conn: &Connection) -> StoreResult<()> {
        Self::apply_column_migrations(
            conn,
            "subscribers",
            &[
                ("phone", "ALTER TABLE subscribers ADD COLUMN phone VARCHAR"),
                ("address", "ALTER TABLE subscribers ADD COLUMN address VARCHAR"),
                ("speed", "ALTER TABLE subscribers ADD COLUMN speed BIGINT DEFAULT 0"),
                ("max_devices", "ALTER TABLE subscribers ADD COLUMN max_devices BIGINT DEFAULT 1"),
                ("balance", "ALTER TABLE subscribers ADD COLUMN balance DOUBLE DEFAULT 0"),
                ("router_id", "ALTER TABLE subscribers ADD COLUMN router_id VARCHAR"),
                ("package_id", "ALTER TABLE subscribers ADD COLUMN package_id VARCHAR"),
                ("notes", "ALTER TABLE subscribers ADD COLUMN notes VARCHAR"),
            ],
        )
    }

    fn row_exists(conn: &Connection, table: &str, id: &str) -> StoreResult<bool> {
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE id = ?", table),
            params![id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn count_where(conn: &Connection, sql: &str, args: impl Params) -> StoreResult<usize> {
        let count: i64 = conn.query_row(sql, args, |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn query_all<T, P: Params>(
        conn: &Connection,
        sql: &str,
        args: P,
        map: fn(&Row<'_>) -> DuckResult<T>,
    ) -> StoreResult<Vec<T>> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(args, map)?.collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn query_one<T, P: Params>(
        conn: &Connection,
        sql: &str,
        args: P,
        map: fn(&Row<'_>) -> DuckResult<T>,
    ) -> StoreResult<Option<T>> {
        Ok(conn.query_row(sql, args, map).optional()?)
    }

    /// Run a tenant-scoped UPDATE/DELETE and report a miss as NotFound
    fn execute_scoped(conn: &Connection, sql: &str, args: impl Params, entity: &'static str, id: &str) -> StoreResult<()> {
        match conn.execute(sql, args)? {
            0 => Err(StoreError::not_found(entity, id)),
            _ => Ok(()),
        }
    }

    // ================================================================
    // ROW WRITERS (shared by CRUD and snapshot import)
    // ================================================================

    fn write_tenant(conn: &Connection, t: &Tenant) -> StoreResult<()> {
        conn.execute(
            &format!("INSERT INTO tenants ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)", TENANT_COLUMNS),
            params![
                t.id,
                t.name,
                t.slug,
                t.phone,
                t.address,
                t.is_active,
                t.subscription_status.as_str(),
                t.subscription_ends_at.as_ref().map(fmt_ts),
                fmt_ts(&t.created_at),
            ],
        )?;
        Ok(())
    }

    fn write_staff(conn: &Connection, s: &Staff) -> StoreResult<()> {
        conn.execute(
            &format!("INSERT INTO staff ({}) VALUES (?, ?, ?, ?, ?, ?, ?)", STAFF_COLUMNS),
            params![
                s.id,
                s.tenant_id,
                s.name,
                s.username,
                s.password_hash,
                s.role.as_str(),
                fmt_ts(&s.created_at),
            ],
        )?;
        Ok(())
    }

    fn write_subscriber(conn: &Connection, s: &Subscriber) -> StoreResult<()> {
        conn.execute(
            &format!(
                "INSERT INTO subscribers ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                SUBSCRIBER_COLUMNS
            ),
            params![
                s.id,
                s.tenant_id,
                s.name,
                s.phone,
                s.address,
                s.subscription_type.as_str(),
                i64::from(s.speed),
                s.start_date.as_ref().map(fmt_date),
                s.expire_date.as_ref().map(fmt_date),
                i64::from(s.max_devices),
                s.balance,
                s.router_id,
                s.package_id,
                s.notes,
                fmt_ts(&s.created_at),
            ],
        )?;
        Ok(())
    }

    fn write_router(conn: &Connection, r: &Router) -> StoreResult<()> {
        conn.execute(
            &format!("INSERT INTO routers ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)", ROUTER_COLUMNS),
            params![
                r.id,
                r.tenant_id,
                r.name,
                r.model,
                r.ip,
                r.location,
                r.status.as_str(),
                i64::from(r.total_ports),
                r.notes,
                fmt_ts(&r.created_at),
            ],
        )?;
        Ok(())
    }

    fn write_sale(conn: &Connection, s: &Sale) -> StoreResult<()> {
        conn.execute(
            &format!("INSERT INTO sales ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)", SALE_COLUMNS),
            params![
                s.id,
                s.tenant_id,
                s.sale_type.as_str(),
                i64::from(s.count),
                s.price,
                fmt_date(&s.date),
                s.notes,
                fmt_ts(&s.created_at),
            ],
        )?;
        Ok(())
    }

    fn write_payment(conn: &Connection, p: &Payment) -> StoreResult<()> {
        conn.execute(
            &format!("INSERT INTO payments ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)", PAYMENT_COLUMNS),
            params![
                p.id,
                p.tenant_id,
                p.subscriber_id,
                p.amount,
                fmt_date(&p.date),
                p.payment_type.as_str(),
                p.method,
                p.notes,
                p.created_by,
                fmt_ts(&p.created_at),
            ],
        )?;
        Ok(())
    }

    fn write_package(conn: &Connection, p: &Package) -> StoreResult<()> {
        conn.execute(
            &format!("INSERT INTO packages ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)", PACKAGE_COLUMNS),
            params![
                p.id,
                p.tenant_id,
                p.name,
                i64::from(p.speed),
                p.price,
                i64::from(p.duration_days),
                p.description,
                p.is_active,
                fmt_ts(&p.created_at),
            ],
        )?;
        Ok(())
    }

    fn write_activity(conn: &Connection, a: &ActivityLogEntry) -> StoreResult<()> {
        conn.execute(
            &format!("INSERT INTO activity_log ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)", ACTIVITY_COLUMNS),
            params![
                a.id,
                a.tenant_id,
                a.action.as_str(),
                a.entity_type.as_str(),
                a.entity_id,
                a.entity_name,
                a.actor,
                fmt_ts(&a.timestamp),
                a.details,
            ],
        )?;
        Ok(())
    }

    fn ensure_username_free(conn: &Connection, username: &str, own_id: &str) -> StoreResult<()> {
        let taken = Self::count_where(
            conn,
            "SELECT COUNT(*) FROM staff WHERE lower(username) = lower(?) AND id <> ?",
            params![username, own_id],
        )?;
        if taken > 0 {
            return Err(StoreError::Conflict(format!("Username '{}' is already taken", username)));
        }
        Ok(())
    }

    fn ensure_slug_free(conn: &Connection, slug: &str, own_id: &str) -> StoreResult<()> {
        let taken = Self::count_where(
            conn,
            "SELECT COUNT(*) FROM tenants WHERE slug = ? AND id <> ?",
            params![slug, own_id],
        )?;
        if taken > 0 {
            return Err(StoreError::Conflict(format!("Slug '{}' is already in use", slug)));
        }
        Ok(())
    }

    fn ensure_new_id(conn: &Connection, table: &str, entity: &str, id: &str) -> StoreResult<()> {
        if Self::row_exists(conn, table, id)? {
            return Err(StoreError::Conflict(format!("{} '{}' already exists", entity, id)));
        }
        Ok(())
    }

    fn select_subscriber(conn: &Connection, tenant_id: &str, id: &str) -> StoreResult<Subscriber> {
        Self::query_one(
            conn,
            &format!("SELECT {} FROM subscribers WHERE tenant_id = ? AND id = ?", SUBSCRIBER_COLUMNS),
            params![tenant_id, id],
            subscriber_from_row,
        )?
        .ok_or_else(|| StoreError::not_found("Subscriber", id))
    }

    /// Insert a payment and add its amount to the subscriber's balance
    fn credit_payment(conn: &Connection, p: &Payment) -> StoreResult<()> {
        Self::ensure_new_id(conn, "payments", "Payment", &p.id)?;
        Self::execute_scoped(
            conn,
            "UPDATE subscribers SET balance = balance + ? WHERE id = ? AND tenant_id = ?",
            params![p.amount, p.subscriber_id, p.tenant_id],
            "Subscriber",
            &p.subscriber_id,
        )?;
        Self::write_payment(conn, p)
    }

    /// Keep only the tenant's newest `cap` activity entries
    fn trim_activity(conn: &Connection, tenant_id: &str, cap: usize) -> StoreResult<usize> {
        let trimmed = conn.execute(
            "DELETE FROM activity_log WHERE tenant_id = ? AND id NOT IN (
                SELECT id FROM activity_log WHERE tenant_id = ?
                ORDER BY logged_at DESC, seq DESC LIMIT ?
            )",
            params![tenant_id, tenant_id, i64::try_from(cap).unwrap_or(i64::MAX)],
        )?;
        if trimmed > 0 {
            log::debug!("Trimmed {} old activity entries for {}", trimmed, tenant_id);
        }
        Ok(trimmed)
    }
}

impl Store for Database {
    fn backend_name(&self) -> &'static str {
        "duckdb"
    }

    // ================================================================
    // TENANTS
    // ================================================================

    fn list_tenants(&self) -> StoreResult<Vec<Tenant>> {
        let conn = self.conn();
        Self::query_all(
            &conn,
            &format!("SELECT {} FROM tenants ORDER BY created_at DESC", TENANT_COLUMNS),
            [],
            tenant_from_row,
        )
    }

    fn get_tenant(&self, id: &str) -> StoreResult<Tenant> {
        let conn = self.conn();
        Self::query_one(
            &conn,
            &format!("SELECT {} FROM tenants WHERE id = ?", TENANT_COLUMNS),
            params![id],
            tenant_from_row,
        )?
        .ok_or_else(|| StoreError::not_found("Tenant", id))
    }

    fn find_tenant_by_slug(&self, slug: &str) -> StoreResult<Option<Tenant>> {
        let conn = self.conn();
        Self::query_one(
            &conn,
            &format!("SELECT {} FROM tenants WHERE slug = ?", TENANT_COLUMNS),
            params![slug],
            tenant_from_row,
        )
    }

    fn insert_tenant(&self, tenant: &Tenant) -> StoreResult<()> {
        let conn = self.conn();
        Self::ensure_new_id(&conn, "tenants", "Tenant", &tenant.id)?;
        Self::ensure_slug_free(&conn, &tenant.slug, &tenant.id)?;
        Self::write_tenant(&conn, tenant)?;
        log::debug!("Inserted tenant {} ({})", tenant.id, tenant.slug);
        Ok(())
    }

    fn register_tenant(&self, tenant: &Tenant, admin: &Staff) -> StoreResult<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        Self::ensure_new_id(&tx, "tenants", "Tenant", &tenant.id)?;
        Self::ensure_slug_free(&tx, &tenant.slug, &tenant.id)?;
        Self::ensure_new_id(&tx, "staff", "Staff", &admin.id)?;
        Self::ensure_username_free(&tx, &admin.username, &admin.id)?;
        Self::write_tenant(&tx, tenant)?;
        Self::write_staff(&tx, admin)?;
        tx.commit()?;
        log::debug!("Registered tenant {} ({}) with admin {}", tenant.id, tenant.slug, admin.username);
        Ok(())
    }

    fn update_tenant(&self, t: &Tenant) -> StoreResult<()> {
        let conn = self.conn();
        Self::ensure_slug_free(&conn, &t.slug, &t.id)?;
        Self::execute_scoped(
            &conn,
            "UPDATE tenants SET name = ?, slug = ?, phone = ?, address = ?, is_active = ?, \
             subscription_status = ?, subscription_ends_at = ? WHERE id = ?",
            params![
                t.name,
                t.slug,
                t.phone,
                t.address,
                t.is_active,
                t.subscription_status.as_str(),
                t.subscription_ends_at.as_ref().map(fmt_ts),
                t.id,
            ],
            "Tenant",
            &t.id,
        )
    }

    // ================================================================
    // SUPER ADMINS
    // ================================================================

    fn find_super_admin(&self, username: &str) -> StoreResult<Option<SuperAdmin>> {
        let conn = self.conn();
        Self::query_one(
            &conn,
            "SELECT username, password_hash, created_at FROM super_admins WHERE username = ?",
            params![username],
            super_admin_from_row,
        )
    }

    fn upsert_super_admin(&self, admin: &SuperAdmin) -> StoreResult<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR REPLACE INTO super_admins (username, password_hash, created_at) VALUES (?, ?, ?)",
            params![admin.username, admin.password_hash, fmt_ts(&admin.created_at)],
        )?;
        Ok(())
    }

    // ================================================================
    // STAFF
    // ================================================================

    fn count_staff(&self) -> StoreResult<usize> {
        let conn = self.conn();
        Self::count_where(&conn, "SELECT COUNT(*) FROM staff", [])
    }

    fn list_staff(&self, tenant_id: &str) -> StoreResult<Vec<Staff>> {
        let conn = self.conn();
        Self::query_all(
            &conn,
            &format!("SELECT {} FROM staff WHERE tenant_id = ? ORDER BY created_at DESC", STAFF_COLUMNS),
            params![tenant_id],
            staff_from_row,
        )
    }

    fn get_staff(&self, tenant_id: &str, id: &str) -> StoreResult<Staff> {
        let conn = self.conn();
        Self::query_one(
            &conn,
            &format!("SELECT {} FROM staff WHERE tenant_id = ? AND id = ?", STAFF_COLUMNS),
            params![tenant_id, id],
            staff_from_row,
        )?
        .ok_or_else(|| StoreError::not_found("Staff", id))
    }

    fn find_staff_by_username(&self, username: &str) -> StoreResult<Option<Staff>> {
        let conn = self.conn();
        Self::query_one(
            &conn,
            &format!("SELECT {} FROM staff WHERE lower(username) = lower(?)", STAFF_COLUMNS),
            params![username],
            staff_from_row,
        )
    }

    fn insert_staff(&self, staff: &Staff) -> StoreResult<()> {
        let conn = self.conn();
        Self::ensure_new_id(&conn, "staff", "Staff", &staff.id)?;
        Self::ensure_username_free(&conn, &staff.username, &staff.id)?;
        Self::write_staff(&conn, staff)
    }

    fn update_staff(&self, s: &Staff) -> StoreResult<()> {
        let conn = self.conn();
        Self::ensure_username_free(&conn, &s.username, &s.id)?;
        Self::execute_scoped(
            &conn,
            "UPDATE staff SET name = ?, username = ?, password_hash = ?, role = ? WHERE id = ? AND tenant_id = ?",
            params![s.name, s.username, s.password_hash, s.role.as_str(), s.id, s.tenant_id],
            "Staff",
            &s.id,
        )
    }

    fn delete_staff(&self, tenant_id: &str, id: &str) -> StoreResult<()> {
        let conn = self.conn();
        Self::execute_scoped(
            &conn,
            "DELETE FROM staff WHERE id = ? AND tenant_id = ?",
            params![id, tenant_id],
            "Staff",
            id,
        )
    }

    // ================================================================
    // SUBSCRIBERS
    // ================================================================

    fn list_subscribers(&self, tenant_id: &str) -> StoreResult<Vec<Subscriber>> {
        let start = std::time::Instant::now();
        let conn = self.conn();
        let rows = Self::query_all(
            &conn,
            &format!(
                "SELECT {} FROM subscribers WHERE tenant_id = ? ORDER BY created_at DESC",
                SUBSCRIBER_COLUMNS
            ),
            params![tenant_id],
            subscriber_from_row,
        )?;
        log::debug!(
            "Loaded {} subscribers for {} in {:.1}ms",
            rows.len(),
            tenant_id,
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(rows)
    }

    fn count_subscribers(&self, tenant_id: &str) -> StoreResult<usize> {
        let conn = self.conn();
        Self::count_where(&conn, "SELECT COUNT(*) FROM subscribers WHERE tenant_id = ?", params![tenant_id])
    }

    fn get_subscriber(&self, tenant_id: &str, id: &str) -> StoreResult<Subscriber> {
        let conn = self.conn();
        Self::select_subscriber(&conn, tenant_id, id)
    }

    fn insert_subscriber(&self, subscriber: &Subscriber) -> StoreResult<()> {
        let conn = self.conn();
        Self::ensure_new_id(&conn, "subscribers", "Subscriber", &subscriber.id)?;
        Self::write_subscriber(&conn, subscriber)
    }

    fn update_subscriber(&self, s: &Subscriber) -> StoreResult<()> {
        let conn = self.conn();
        Self::execute_scoped(
            &conn,
            "UPDATE subscribers SET name = ?, phone = ?, address = ?, subscription_type = ?, speed = ?, \
             start_date = ?, expire_date = ?, max_devices = ?, balance = ?, router_id = ?, package_id = ?, \
             notes = ? WHERE id = ? AND tenant_id = ?",
            params![
                s.name,
                s.phone,
                s.address,
                s.subscription_type.as_str(),
                i64::from(s.speed),
                s.start_date.as_ref().map(fmt_date),
                s.expire_date.as_ref().map(fmt_date),
                i64::from(s.max_devices),
                s.balance,
                s.router_id,
                s.package_id,
                s.notes,
                s.id,
                s.tenant_id,
            ],
            "Subscriber",
            &s.id,
        )
    }

    fn delete_subscriber(&self, tenant_id: &str, id: &str) -> StoreResult<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM subscribers WHERE id = ? AND tenant_id = ?",
            params![id, tenant_id],
        )?;
        if removed == 0 {
            return Err(StoreError::not_found("Subscriber", id));
        }
        let payments = tx.execute(
            "DELETE FROM payments WHERE subscriber_id = ? AND tenant_id = ?",
            params![id, tenant_id],
        )?;
        tx.commit()?;
        log::debug!("Deleted subscriber {} and {} payments", id, payments);
        Ok(())
    }

    // ================================================================
    // ROUTERS
    // ================================================================

    fn list_routers(&self, tenant_id: &str) -> StoreResult<Vec<Router>> {
        let conn = self.conn();
        Self::query_all(
            &conn,
            &format!("SELECT {} FROM routers WHERE tenant_id = ? ORDER BY created_at DESC", ROUTER_COLUMNS),
            params![tenant_id],
            router_from_row,
        )
    }

    fn get_router(&self, tenant_id: &str, id: &str) -> StoreResult<Router> {
        let conn = self.conn();
        Self::query_one(
            &conn,
            &format!("SELECT {} FROM routers WHERE tenant_id = ? AND id = ?", ROUTER_COLUMNS),
            params![tenant_id, id],
            router_from_row,
        )?
        .ok_or_else(|| StoreError::not_found("Router", id))
    }

    fn insert_router(&self, router: &Router) -> StoreResult<()> {
        let conn = self.conn();
        Self::ensure_new_id(&conn, "routers", "Router", &router.id)?;
        Self::write_router(&conn, router)
    }

    fn update_router(&self, r: &Router) -> StoreResult<()> {
        let conn = self.conn();
        Self::execute_scoped(
            &conn,
            "UPDATE routers SET name = ?, model = ?, ip = ?, location = ?, status = ?, total_ports = ?, \
             notes = ? WHERE id = ? AND tenant_id = ?",
            params![
                r.name,
                r.model,
                r.ip,
                r.location,
                r.status.as_str(),
                i64::from(r.total_ports),
                r.notes,
                r.id,
                r.tenant_id,
            ],
            "Router",
            &r.id,
        )
    }

    fn delete_router(&self, tenant_id: &str, id: &str) -> StoreResult<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let removed = tx.execute("DELETE FROM routers WHERE id = ? AND tenant_id = ?", params![id, tenant_id])?;
        if removed == 0 {
            return Err(StoreError::not_found("Router", id));
        }
        let detached = tx.execute(
            "UPDATE subscribers SET router_id = NULL WHERE router_id = ? AND tenant_id = ?",
            params![id, tenant_id],
        )?;
        tx.commit()?;
        log::debug!("Deleted router {} and detached {} subscribers", id, detached);
        Ok(())
    }

    // ================================================================
    // SALES
    // ================================================================

    fn list_sales(&self, tenant_id: &str) -> StoreResult<Vec<Sale>> {
        let conn = self.conn();
        Self::query_all(
            &conn,
            &format!(
                "SELECT {} FROM sales WHERE tenant_id = ? ORDER BY sale_date DESC, created_at DESC",
                SALE_COLUMNS
            ),
            params![tenant_id],
            sale_from_row,
        )
    }

    fn get_sale(&self, tenant_id: &str, id: &str) -> StoreResult<Sale> {
        let conn = self.conn();
        Self::query_one(
            &conn,
            &format!("SELECT {} FROM sales WHERE tenant_id = ? AND id = ?", SALE_COLUMNS),
            params![tenant_id, id],
            sale_from_row,
        )?
        .ok_or_else(|| StoreError::not_found("Sale", id))
    }

    fn insert_sale(&self, sale: &Sale) -> StoreResult<()> {
        let conn = self.conn();
        Self::ensure_new_id(&conn, "sales", "Sale", &sale.id)?;
        Self::write_sale(&conn, sale)
    }

    fn update_sale(&self, s: &Sale) -> StoreResult<()> {
        let conn = self.conn();
        Self::execute_scoped(
            &conn,
            "UPDATE sales SET sale_type = ?, card_count = ?, price = ?, sale_date = ?, notes = ? \
             WHERE id = ? AND tenant_id = ?",
            params![
                s.sale_type.as_str(),
                i64::from(s.count),
                s.price,
                fmt_date(&s.date),
                s.notes,
                s.id,
                s.tenant_id,
            ],
            "Sale",
            &s.id,
        )
    }

    fn delete_sale(&self, tenant_id: &str, id: &str) -> StoreResult<()> {
        let conn = self.conn();
        Self::execute_scoped(
            &conn,
            "DELETE FROM sales WHERE id = ? AND tenant_id = ?",
            params![id, tenant_id],
            "Sale",
            id,
        )
    }

    // ================================================================
    // PAYMENTS
    // ================================================================

    fn list_payments(&self, tenant_id: &str) -> StoreResult<Vec<Payment>> {
        let conn = self.conn();
        Self::query_all(
            &conn,
            &format!(
                "SELECT {} FROM payments WHERE tenant_id = ? ORDER BY payment_date DESC, created_at DESC",
                PAYMENT_COLUMNS
            ),
            params![tenant_id],
            payment_from_row,
        )
    }

    fn list_payments_for_subscriber(&self, tenant_id: &str, subscriber_id: &str) -> StoreResult<Vec<Payment>> {
        let conn = self.conn();
        Self::query_all(
            &conn,
            &format!(
                "SELECT {} FROM payments WHERE tenant_id = ? AND subscriber_id = ? \
                 ORDER BY payment_date DESC, created_at DESC",
                PAYMENT_COLUMNS
            ),
            params![tenant_id, subscriber_id],
            payment_from_row,
        )
    }

    fn record_payment(&self, payment: &Payment) -> StoreResult<Subscriber> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        Self::credit_payment(&tx, payment)?;
        let subscriber = Self::select_subscriber(&tx, &payment.tenant_id, &payment.subscriber_id)?;
        tx.commit()?;
        Ok(subscriber)
    }

    fn extend_subscription(
        &self,
        tenant_id: &str,
        id: &str,
        extension: &Extension<'_>,
    ) -> StoreResult<(Option<NaiveDate>, Subscriber)> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let previous = Self::select_subscriber(&tx, tenant_id, id)?.expire_date;
        let expiry = extension.new_expiry(previous)?;
        tx.execute(
            "UPDATE subscribers SET expire_date = ?, balance = balance - ? WHERE id = ? AND tenant_id = ?",
            params![fmt_date(&expiry), extension.charge, id, tenant_id],
        )?;
        if let Some(payment) = extension.payment {
            Self::credit_payment(&tx, payment)?;
        }
        let subscriber = Self::select_subscriber(&tx, tenant_id, id)?;
        tx.commit()?;
        Ok((previous, subscriber))
    }

    // ================================================================
    // PACKAGES
    // ================================================================

    fn list_packages(&self, tenant_id: &str, include_inactive: bool) -> StoreResult<Vec<Package>> {
        let conn = self.conn();
        let filter = if include_inactive { "" } else { " AND is_active" };
        Self::query_all(
            &conn,
            &format!(
                "SELECT {} FROM packages WHERE tenant_id = ?{} ORDER BY speed ASC, price ASC",
                PACKAGE_COLUMNS, filter
            ),
            params![tenant_id],
            package_from_row,
        )
    }

    fn get_package(&self, tenant_id: &str, id: &str) -> StoreResult<Package> {
        let conn = self.conn();
        Self::query_one(
            &conn,
            &format!("SELECT {} FROM packages WHERE tenant_id = ? AND id = ?", PACKAGE_COLUMNS),
            params![tenant_id, id],
            package_from_row,
        )?
        .ok_or_else(|| StoreError::not_found("Package", id))
    }

    fn insert_package(&self, package: &Package) -> StoreResult<()> {
        let conn = self.conn();
        Self::ensure_new_id(&conn, "packages", "Package", &package.id)?;
        Self::write_package(&conn, package)
    }

    fn update_package(&self, p: &Package) -> StoreResult<()> {
        let conn = self.conn();
        Self::execute_scoped(
            &conn,
            "UPDATE packages SET name = ?, speed = ?, price = ?, duration_days = ?, description = ?, \
             is_active = ? WHERE id = ? AND tenant_id = ?",
            params![
                p.name,
                i64::from(p.speed),
                p.price,
                i64::from(p.duration_days),
                p.description,
                p.is_active,
                p.id,
                p.tenant_id,
            ],
            "Package",
            &p.id,
        )
    }

    // ================================================================
    // ACTIVITY LOG
    // ================================================================

    fn append_activity(&self, entry: &ActivityLogEntry, cap: usize) -> StoreResult<()> {
        let conn = self.conn();
        Self::write_activity(&conn, entry)?;
        Self::trim_activity(&conn, &entry.tenant_id, cap)?;
        Ok(())
    }

    fn list_activity(&self, tenant_id: &str, limit: usize) -> StoreResult<Vec<ActivityLogEntry>> {
        let conn = self.conn();
        Self::query_all(
            &conn,
            &format!(
                "SELECT {} FROM activity_log WHERE tenant_id = ? ORDER BY logged_at DESC, seq DESC LIMIT ?",
                ACTIVITY_COLUMNS
            ),
            params![tenant_id, i64::try_from(limit).unwrap_or(i64::MAX)],
            activity_from_row,
        )
    }

    // ================================================================
    // SNAPSHOTS
    // ================================================================

    fn export_dataset(&self, tenant_id: Option<&str>) -> StoreResult<Dataset> {
        let start = std::time::Instant::now();
        let conn = self.conn();
        let args: Vec<String> = tenant_id.map(str::to_string).into_iter().collect();
        let scope = if tenant_id.is_some() { " WHERE tenant_id = ?" } else { "" };
        let select = |cols: &str, table: &str, order: &str| {
            format!("SELECT {} FROM {}{} ORDER BY {}", cols, table, scope, order)
        };

        let tenants = Self::query_all(
            &conn,
            &format!(
                "SELECT {} FROM tenants{} ORDER BY created_at",
                TENANT_COLUMNS,
                if tenant_id.is_some() { " WHERE id = ?" } else { "" }
            ),
            params_from_iter(args.iter()),
            tenant_from_row,
        )?;
        let super_admins = match tenant_id {
            Some(_) => Vec::new(),
            None => Self::query_all(
                &conn,
                "SELECT username, password_hash, created_at FROM super_admins ORDER BY username",
                [],
                super_admin_from_row,
            )?,
        };

        let data = Dataset {
            tenants,
            super_admins,
            staff: Self::query_all(
                &conn,
                &select(STAFF_COLUMNS, "staff", "created_at"),
                params_from_iter(args.iter()),
                staff_from_row,
            )?,
            subscribers: Self::query_all(
                &conn,
                &select(SUBSCRIBER_COLUMNS, "subscribers", "created_at"),
                params_from_iter(args.iter()),
                subscriber_from_row,
            )?,
            routers: Self::query_all(
                &conn,
                &select(ROUTER_COLUMNS, "routers", "created_at"),
                params_from_iter(args.iter()),
                router_from_row,
            )?,
            sales: Self::query_all(
                &conn,
                &select(SALE_COLUMNS, "sales", "sale_date, created_at"),
                params_from_iter(args.iter()),
                sale_from_row,
            )?,
            payments: Self::query_all(
                &conn,
                &select(PAYMENT_COLUMNS, "payments", "payment_date, created_at"),
                params_from_iter(args.iter()),
                payment_from_row,
            )?,
            packages: Self::query_all(
                &conn,
                &select(PACKAGE_COLUMNS, "packages", "created_at"),
                params_from_iter(args.iter()),
                package_from_row,
            )?,
            activity_log: Self::query_all(
                &conn,
                &select(ACTIVITY_COLUMNS, "activity_log", "logged_at, seq"),
                params_from_iter(args.iter()),
                activity_from_row,
            )?,
        };

        log::info!(
            "Exported {} rows in {:.1}ms",
            data.row_count(),
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(data)
    }

    fn import_dataset(&self, data: &Dataset, activity_cap: usize) -> StoreResult<ImportSummary> {
        let start = std::time::Instant::now();
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        // Tables carry more than one identifying column (id + slug/username),
        // so INSERT OR REPLACE is not usable. Delete matching rows first, then insert.
        for t in &data.tenants {
            tx.execute("DELETE FROM tenants WHERE id = ? OR slug = ?", params![t.id, t.slug])?;
            Self::write_tenant(&tx, t)?;
        }
        let known: HashSet<String> = Self::query_all(&tx, "SELECT id FROM tenants", [], id_from_row)?
            .into_iter()
            .collect();
        let owned = |entity: &str, tenant_id: &str, id: &str| {
            if known.contains(tenant_id) {
                Ok(())
            } else {
                Err(StoreError::unknown_tenant(entity, id, tenant_id))
            }
        };

        for a in &data.super_admins {
            tx.execute(
                "INSERT OR REPLACE INTO super_admins (username, password_hash, created_at) VALUES (?, ?, ?)",
                params![a.username, a.password_hash, fmt_ts(&a.created_at)],
            )?;
        }
        for s in &data.staff {
            owned("Staff", &s.tenant_id, &s.id)?;
            tx.execute(
                "DELETE FROM staff WHERE id = ? OR lower(username) = lower(?)",
                params![s.id, s.username],
            )?;
            Self::write_staff(&tx, s)?;
        }
        for s in &data.subscribers {
            owned("Subscriber", &s.tenant_id, &s.id)?;
            tx.execute("DELETE FROM subscribers WHERE id = ?", params![s.id])?;
            Self::write_subscriber(&tx, s)?;
        }
        for r in &data.routers {
            owned("Router", &r.tenant_id, &r.id)?;
            tx.execute("DELETE FROM routers WHERE id = ?", params![r.id])?;
            Self::write_router(&tx, r)?;
        }
        for s in &data.sales {
            owned("Sale", &s.tenant_id, &s.id)?;
            tx.execute("DELETE FROM sales WHERE id = ?", params![s.id])?;
            Self::write_sale(&tx, s)?;
        }
        for p in &data.payments {
            owned("Payment", &p.tenant_id, &p.id)?;
            tx.execute("DELETE FROM payments WHERE id = ?", params![p.id])?;
            Self::write_payment(&tx, p)?;
        }
        for p in &data.packages {
            owned("Package", &p.tenant_id, &p.id)?;
            tx.execute("DELETE FROM packages WHERE id = ?", params![p.id])?;
            Self::write_package(&tx, p)?;
        }
        // in log order, so same-millisecond entries keep their sequence
        let mut entries: Vec<&ActivityLogEntry> = data.activity_log.iter().collect();
        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        for a in entries {
            owned("Activity entry", &a.tenant_id, &a.id)?;
            tx.execute("DELETE FROM activity_log WHERE id = ?", params![a.id])?;
            Self::write_activity(&tx, a)?;
        }
        let logged: HashSet<&str> = data.activity_log.iter().map(|a| a.tenant_id.as_str()).collect();
        for tenant_id in logged {
            Self::trim_activity(&tx, tenant_id, activity_cap)?;
        }
        tx.commit()?;

        let summary = ImportSummary {
            tenants: data.tenants.len(),
            staff: data.staff.len(),
            subscribers: data.subscribers.len(),
            routers: data.routers.len(),
            sales: data.sales.len(),
            payments: data.payments.len(),
            packages: data.packages.len(),
            activity: data.activity_log.len(),
        };
        log::info!(
            "Imported {} rows in {:.1}ms",
            summary.total(),
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(summary)
    }
}

// ================================================================
// ROW CONVERSION
// ================================================================

fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn fmt_date(date: &NaiveDate) -> String {
    date.format(DATE_FMT).to_string()
}

fn conversion_error<E>(idx: usize, err: E) -> duckdb::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    duckdb::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn get_ts(row: &Row<'_>, idx: usize) -> DuckResult<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn get_opt_ts(row: &Row<'_>, idx: usize) -> DuckResult<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(_) => get_ts(row, idx).map(Some),
        None => Ok(None),
    }
}

fn get_date(row: &Row<'_>, idx: usize) -> DuckResult<NaiveDate> {
    let raw: String = row.get(idx)?;
    NaiveDate::parse_from_str(&raw, DATE_FMT).map_err(|e| conversion_error(idx, e))
}

fn get_opt_date(row: &Row<'_>, idx: usize) -> DuckResult<Option<NaiveDate>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) if !raw.trim().is_empty() => get_date(row, idx).map(Some),
        _ => Ok(None),
    }
}

fn get_enum<T>(row: &Row<'_>, idx: usize) -> DuckResult<T>
where
    T: FromStr<Err = ParseEnumError>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn get_u32(row: &Row<'_>, idx: usize) -> DuckResult<u32> {
    let raw: i64 = row.get(idx)?;
    u32::try_from(raw).map_err(|e| duckdb::Error::FromSqlConversionFailure(idx, Type::BigInt, Box::new(e)))
}

fn id_from_row(row: &Row<'_>) -> DuckResult<String> {
    row.get(0)
}

fn tenant_from_row(row: &Row<'_>) -> DuckResult<Tenant> {
    Ok(Tenant {
        id: row.get(0)?,
        name: row.get(1)?,
        slug: row.get(2)?,
        phone: row.get(3)?,
        address: row.get(4)?,
        is_active: row.get(5)?,
        subscription_status: get_enum(row, 6)?,
        subscription_ends_at: get_opt_ts(row, 7)?,
        created_at: get_ts(row, 8)?,
    })
}

fn super_admin_from_row(row: &Row<'_>) -> DuckResult<SuperAdmin> {
    Ok(SuperAdmin {
        username: row.get(0)?,
        password_hash: row.get(1)?,
        created_at: get_ts(row, 2)?,
    })
}

fn staff_from_row(row: &Row<'_>) -> DuckResult<Staff> {
    Ok(Staff {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        username: row.get(3)?,
        password_hash: row.get(4)?,
        role: get_enum(row, 5)?,
        created_at: get_ts(row, 6)?,
    })
}

fn subscriber_from_row(row: &Row<'_>) -> DuckResult<Subscriber> {
    Ok(Subscriber {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        phone: row.get(3)?,
        address: row.get(4)?,
        subscription_type: get_enum(row, 5)?,
        speed: get_u32(row, 6)?,
        start_date: get_opt_date(row, 7)?,
        expire_date: get_opt_date(row, 8)?,
        max_devices: get_u32(row, 9)?,
        balance: row.get(10)?,
        router_id: row.get(11)?,
        package_id: row.get(12)?,
        notes: row.get(13)?,
        created_at: get_ts(row, 14)?,
    })
}

fn router_from_row(row: &Row<'_>) -> DuckResult<Router> {
    Ok(Router {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        model: row.get(3)?,
        ip: row.get(4)?,
        location: row.get(5)?,
        status: get_enum(row, 6)?,
        total_ports: get_u32(row, 7)?,
        notes: row.get(8)?,
        created_at: get_ts(row, 9)?,
    })
}

fn sale_from_row(row: &Row<'_>) -> DuckResult<Sale> {
    Ok(Sale {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        sale_type: get_enum(row, 2)?,
        count: get_u32(row, 3)?,
        price: row.get(4)?,
        date: get_date(row, 5)?,
        notes: row.get(6)?,
        created_at: get_ts(row, 7)?,
    })
}

fn payment_from_row(row: &Row<'_>) -> DuckResult<Payment> {
    Ok(Payment {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        subscriber_id: row.get(2)?,
        amount: row.get(3)?,
        date: get_date(row, 4)?,
        payment_type: get_enum(row, 5)?,
        method: row.get(6)?,
        notes: row.get(7)?,
        created_by: row.get(8)?,
        created_at: get_ts(row, 9)?,
    })
}

fn package_from_row(row: &Row<'_>) -> DuckResult<Package> {
    Ok(Package {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        speed: get_u32(row, 3)?,
        price: row.get(4)?,
        duration_days: get_u32(row, 5)?,
        description: row.get(6)?,
        is_active: row.get(7)?,
        created_at: get_ts(row, 8)?,
    })
}

fn activity_from_row(row: &Row<'_>) -> DuckResult<ActivityLogEntry> {
    Ok(ActivityLogEntry {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        action: get_enum(row, 2)?,
        entity_type: get_enum(row, 3)?,
        entity_id: row.get(4)?,
        entity_name: row.get(5)?,
        actor: row.get(6)?,
        timestamp: get_ts(row, 7)?,
        details: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract;
    use tempfile::tempdir;

    fn open() -> (tempfile::TempDir, Database) {
        let temp_dir = tempdir().unwrap();
        let db = Database::new(temp_dir.path().to_path_buf()).unwrap();
        (temp_dir, db)
    }

    #[test]
    fn test_database_initialization() {
        let (temp_dir, db) = open();
        assert!(temp_dir.path().join("wasla.db").exists());
        assert!(db.list_tenants().unwrap().is_empty());
        assert_eq!(db.count_staff().unwrap(), 0);
        assert_eq!(db.backend_name(), "duckdb");
    }

    #[test]
    fn test_rows_survive_reopen() {
        let temp_dir = tempdir().unwrap();
        {
            let db = Database::new(temp_dir.path().to_path_buf()).unwrap();
            db.insert_tenant(&contract::tenant("t1", "one")).unwrap();
            db.insert_subscriber(&contract::subscriber("t1", "s1", "Ahmad")).unwrap();
        }
        let db = Database::new(temp_dir.path().to_path_buf()).unwrap();
        assert_eq!(db.get_subscriber("t1", "s1").unwrap().name, "Ahmad");
    }

    #[test]
    fn test_old_subscribers_table_is_migrated() {
        let temp_dir = tempdir().unwrap();
        {
            let conn = Connection::open(temp_dir.path().join("wasla.db")).unwrap();
            conn.execute_batch(
                "CREATE TABLE subscribers (
                    id VARCHAR PRIMARY KEY,
                    tenant_id VARCHAR NOT NULL,
                    name VARCHAR NOT NULL,
                    subscription_type VARCHAR NOT NULL DEFAULT 'monthly',
                    start_date VARCHAR,
                    expire_date VARCHAR,
                    created_at VARCHAR NOT NULL
                );",
            )
            .unwrap();
        }

        let db = Database::new(temp_dir.path().to_path_buf()).unwrap();
        {
            let conn = db.conn();
            let columns = Database::get_table_columns(&conn, "subscribers").unwrap();
            for col in ["address", "balance", "package_id", "max_devices"] {
                assert!(columns.contains(col), "missing {}", col);
            }
        }

        let mut sub = contract::subscriber("t1", "s1", "Ahmad");
        sub.package_id = Some("pkg-1".into());
        db.insert_subscriber(&sub).unwrap();
        assert_eq!(db.get_subscriber("t1", "s1").unwrap(), sub);
    }

    #[test]
    fn test_tenant_isolation() {
        let (_dir, db) = open();
        contract::tenant_isolation(&db);
    }

    #[test]
    fn test_subscriber_round_trip() {
        let (_dir, db) = open();
        contract::subscriber_round_trip(&db);
    }

    #[test]
    fn test_cascades() {
        let (_dir, db) = open();
        contract::cascades(&db);
    }

    #[test]
    fn test_staff_usernames_are_unique() {
        let (_dir, db) = open();
        contract::staff_usernames_are_unique(&db);
    }

    #[test]
    fn test_tenant_slugs_are_unique() {
        let (_dir, db) = open();
        contract::tenant_slugs_are_unique(&db);
    }

    #[test]
    fn test_packages_sorted_and_filtered() {
        let (_dir, db) = open();
        contract::packages_sorted_and_filtered(&db);
    }

    #[test]
    fn test_activity_is_capped() {
        let (_dir, db) = open();
        contract::activity_is_capped(&db);
    }

    #[test]
    fn test_dataset_round_trip() {
        let (_a, source) = open();
        let (_b, target) = open();
        contract::dataset_round_trip(&source, &target);
    }

    #[test]
    fn test_failed_import_changes_nothing() {
        let (_dir, db) = open();
        contract::failed_import_changes_nothing(&db);
    }

    #[test]
    fn test_imported_activity_is_ordered_and_capped() {
        let (_dir, db) = open();
        contract::imported_activity_is_ordered_and_capped(&db);
    }

    #[test]
    fn test_payments_credit_the_balance() {
        let (_dir, db) = open();
        contract::payments_credit_the_balance(&db);
    }

    #[test]
    fn test_extension_moves_expiry_and_balance() {
        let (_dir, db) = open();
        contract::extension_moves_expiry_and_balance(&db);
    }

    #[test]
    fn test_register_tenant_is_all_or_nothing() {
        let (_dir, db) = open();
        contract::register_tenant_is_all_or_nothing(&db);
    }

    #[test]
    fn test_concurrent_payments_all_count() {
        let (_dir, db) = open();
        contract::concurrent_payments_all_count(std::sync::Arc::new(db));
    }
}
