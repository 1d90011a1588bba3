//! SQLite persistence.
//!
//! The engine plans a mutation as a list of [`Write`]s and the store
//! applies them in one transaction. Reads are limited to the startup
//! snapshot, the audit log, the change feed and local users.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info};

use crate::auth::Principal;
use crate::cidr::{Cidr, HostBits};
use crate::error::{IpamError, Result};

use super::models::{
    AuditEntry, AuditFilter, Change, ChangeAction, EntityKind, Pool as IpPool, Prefix, User, Vrf,
};

type SqliteQuery = Query<'static, Sqlite, SqliteArguments<'static>>;

/// One row-level change. Batches are applied in order.
#[derive(Debug, Clone)]
pub enum Write {
    PutVrf(Vrf),
    DeleteVrf(i64),
    PutPool(IpPool),
    DeletePool(i64),
    PutPrefix(Prefix),
    DeletePrefix(i64),
    Audit(AuditRecord),
    Change(ChangeRecord),
}

/// An audit row before it gets an id and timestamp.
#[derive(Debug, Clone, Default)]
pub struct AuditRecord {
    pub vrf_id: Option<i64>,
    pub vrf_rt: Option<String>,
    pub vrf_name: Option<String>,
    pub prefix_id: Option<i64>,
    pub prefix_prefix: Option<String>,
    pub pool_id: Option<i64>,
    pub pool_name: Option<String>,
    pub username: String,
    pub authenticated_as: String,
    pub full_name: Option<String>,
    pub authoritative_source: String,
    pub description: String,
}

impl AuditRecord {
    pub fn new(principal: &Principal, description: impl Into<String>) -> Self {
        Self {
            username: principal.identity.clone(),
            authenticated_as: principal.authenticated_as.clone(),
            full_name: principal.full_name.clone(),
            authoritative_source: principal.authoritative_source.clone(),
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn vrf(mut self, vrf: &Vrf) -> Self {
        self.vrf_id = Some(vrf.id);
        self.vrf_rt = vrf.rt.clone();
        self.vrf_name = Some(vrf.name.clone());
        self
    }

    pub fn prefix(mut self, prefix: &Prefix) -> Self {
        self.prefix_id = Some(prefix.id);
        self.prefix_prefix = Some(prefix.prefix.to_string());
        self
    }

    pub fn pool(mut self, pool: &IpPool) -> Self {
        self.pool_id = Some(pool.id);
        self.pool_name = Some(pool.name.clone());
        self
    }
}

/// A change-feed row before it gets a sequence number.
#[derive(Debug, Clone)]
pub struct ChangeRecord {
    pub entity: EntityKind,
    pub entity_id: i64,
    pub action: ChangeAction,
    pub username: String,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
}

impl ChangeRecord {
    pub fn new<T: Serialize>(
        principal: &Principal,
        entity: EntityKind,
        entity_id: i64,
        action: ChangeAction,
        before: Option<&T>,
        after: Option<&T>,
    ) -> Result<Self> {
        Ok(Self {
            entity,
            entity_id,
            action,
            username: principal.identity.clone(),
            before: before.map(to_json).transpose()?,
            after: after.map(to_json).transpose()?,
        })
    }
}

fn to_json<T: Serialize>(v: &T) -> Result<serde_json::Value> {
    serde_json::to_value(v).map_err(|e| IpamError::Internal(format!("snapshot: {e}")))
}

fn to_text<T: Serialize>(v: &T) -> Result<String> {
    serde_json::to_string(v).map_err(|e| IpamError::Internal(format!("encode: {e}")))
}

/// Everything needed to rebuild the in-memory state.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub vrfs: Vec<Vrf>,
    pub pools: Vec<IpPool>,
    pub prefixes: Vec<Prefix>,
}

/// Highest id in use per table, for id pre-allocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaxIds {
    pub vrf: i64,
    pub pool: i64,
    pub prefix: i64,
}

/// Durable store handle. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
}

impl Store {
    /// Open (and create if needed) the database at `db_path`.
    pub async fn open(db_path: &Path, max_connections: u32) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                IpamError::Storage(sqlx::Error::Configuration(
                    format!("Failed to create database directory {}: {}", parent.display(), e).into(),
                ))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        info!(path = %db_path.display(), "Opened database");

        Ok(store)
    }

    /// Initialize the database schema.
    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vrf (
                id INTEGER PRIMARY KEY,
                rt TEXT UNIQUE,
                name TEXT UNIQUE NOT NULL,
                description TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                avps TEXT NOT NULL DEFAULT '{}'
            );

            INSERT OR IGNORE INTO vrf (id, rt, name, description)
            VALUES (0, NULL, 'default', 'The default VRF');
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pool (
                id INTEGER PRIMARY KEY,
                name TEXT UNIQUE NOT NULL,
                description TEXT,
                default_type TEXT,
                ipv4_default_prefix_length INTEGER,
                ipv6_default_prefix_length INTEGER,
                tags TEXT NOT NULL DEFAULT '[]',
                avps TEXT NOT NULL DEFAULT '{}'
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS prefix (
                id INTEGER PRIMARY KEY,
                vrf_id INTEGER NOT NULL REFERENCES vrf(id),
                prefix TEXT NOT NULL,
                family INTEGER NOT NULL,
                type TEXT NOT NULL,
                status TEXT NOT NULL,
                description TEXT,
                comment TEXT,
                node TEXT,
                country TEXT,
                order_id TEXT,
                customer_id TEXT,
                external_key TEXT,
                vlan INTEGER,
                monitor BOOLEAN NOT NULL DEFAULT FALSE,
                alarm_priority TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                avps TEXT NOT NULL DEFAULT '{}',
                pool_id INTEGER REFERENCES pool(id),
                expires TEXT,
                added TEXT NOT NULL,
                last_modified TEXT NOT NULL,
                authoritative_source TEXT NOT NULL,
                authenticated_as TEXT NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_prefix_vrf_prefix ON prefix(vrf_id, prefix);
            CREATE INDEX IF NOT EXISTS idx_prefix_pool ON prefix(pool_id);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                vrf_id INTEGER,
                vrf_rt TEXT,
                vrf_name TEXT,
                prefix_id INTEGER,
                prefix_prefix TEXT,
                pool_id INTEGER,
                pool_name TEXT,
                username TEXT NOT NULL,
                authenticated_as TEXT NOT NULL,
                full_name TEXT,
                authoritative_source TEXT NOT NULL,
                description TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_audit_prefix ON audit_log(prefix_id);
            CREATE INDEX IF NOT EXISTS idx_audit_vrf ON audit_log(vrf_id);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS change_log (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                entity TEXT NOT NULL,
                entity_id INTEGER NOT NULL,
                action TEXT NOT NULL,
                username TEXT NOT NULL,
                before TEXT,
                after TEXT
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS users (
                username TEXT PRIMARY KEY,
                full_name TEXT,
                password_hash TEXT NOT NULL,
                trusted BOOLEAN NOT NULL DEFAULT FALSE,
                readonly BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Load every VRF, pool and prefix.
    pub async fn load(&self) -> Result<Snapshot> {
        let vrfs = sqlx::query("SELECT * FROM vrf ORDER BY id")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(row_to_vrf)
            .collect::<Result<Vec<_>>>()?;

        let pools = sqlx::query("SELECT * FROM pool ORDER BY id")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(row_to_pool)
            .collect::<Result<Vec<_>>>()?;

        let prefixes = sqlx::query("SELECT * FROM prefix ORDER BY id")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(row_to_prefix)
            .collect::<Result<Vec<_>>>()?;

        debug!(
            vrfs = vrfs.len(),
            pools = pools.len(),
            prefixes = prefixes.len(),
            "Loaded snapshot"
        );
        Ok(Snapshot { vrfs, pools, prefixes })
    }

    pub async fn max_ids(&self) -> Result<MaxIds> {
        let vrf: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(id), 0) FROM vrf")
            .fetch_one(&self.pool)
            .await?;
        let pool: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(id), 0) FROM pool")
            .fetch_one(&self.pool)
            .await?;
        let prefix: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(id), 0) FROM prefix")
            .fetch_one(&self.pool)
            .await?;
        Ok(MaxIds { vrf, pool, prefix })
    }

    /// Apply a batch in one transaction. Returns the sequence number of the
    /// last change record written, if any.
    pub async fn write(&self, batch: &[Write]) -> Result<Option<i64>> {
        let mut tx = self.pool.begin().await?;
        let mut last_seq = None;
        let now = Utc::now().to_rfc3339();

        for w in batch {
            match w {
                Write::PutVrf(v) => {
                    put_vrf(v)?
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| duplicate_or(e, "VRF", v.label()))?;
                }
                Write::DeleteVrf(id) => {
                    sqlx::query("DELETE FROM vrf WHERE id = ?")
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                }
                Write::PutPool(p) => {
                    put_pool(p)?
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| duplicate_or(e, "pool", &p.name))?;
                }
                Write::DeletePool(id) => {
                    sqlx::query("DELETE FROM pool WHERE id = ?")
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                }
                Write::PutPrefix(p) => {
                    put_prefix(p)?
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| duplicate_or(e, "prefix", p.prefix))?;
                }
                Write::DeletePrefix(id) => {
                    sqlx::query("DELETE FROM prefix WHERE id = ?")
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                }
                Write::Audit(a) => {
                    sqlx::query(
                        r#"
                        INSERT INTO audit_log (
                            timestamp, vrf_id, vrf_rt, vrf_name, prefix_id, prefix_prefix,
                            pool_id, pool_name, username, authenticated_as, full_name,
                            authoritative_source, description
                        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                        "#,
                    )
                    .bind(&now)
                    .bind(a.vrf_id)
                    .bind(&a.vrf_rt)
                    .bind(&a.vrf_name)
                    .bind(a.prefix_id)
                    .bind(&a.prefix_prefix)
                    .bind(a.pool_id)
                    .bind(&a.pool_name)
                    .bind(&a.username)
                    .bind(&a.authenticated_as)
                    .bind(&a.full_name)
                    .bind(&a.authoritative_source)
                    .bind(&a.description)
                    .execute(&mut *tx)
                    .await?;
                }
                Write::Change(c) => {
                    let before = c.before.as_ref().map(to_text).transpose()?;
                    let after = c.after.as_ref().map(to_text).transpose()?;
                    let result = sqlx::query(
                        r#"
                        INSERT INTO change_log (timestamp, entity, entity_id, action, username, before, after)
                        VALUES (?, ?, ?, ?, ?, ?, ?)
                        "#,
                    )
                    .bind(&now)
                    .bind(c.entity.as_str())
                    .bind(c.entity_id)
                    .bind(c.action.as_str())
                    .bind(&c.username)
                    .bind(before)
                    .bind(after)
                    .execute(&mut *tx)
                    .await?;
                    last_seq = Some(result.last_insert_rowid());
                }
            }
        }

        tx.commit().await?;
        Ok(last_seq)
    }

    // Audit log

    pub async fn list_audit(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM audit_log
            WHERE (? IS NULL OR vrf_id = ?)
              AND (? IS NULL OR prefix_id = ?)
              AND (? IS NULL OR pool_id = ?)
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(filter.vrf_id)
        .bind(filter.vrf_id)
        .bind(filter.prefix_id)
        .bind(filter.prefix_id)
        .bind(filter.pool_id)
        .bind(filter.pool_id)
        .bind(i64::from(filter.limit.unwrap_or(100)))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_audit).collect()
    }

    // Change feed

    pub async fn changes_after(&self, seq: i64, limit: u32) -> Result<Vec<Change>> {
        let rows = sqlx::query("SELECT * FROM change_log WHERE seq > ? ORDER BY seq LIMIT ?")
            .bind(seq)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_change).collect()
    }

    pub async fn last_change_seq(&self) -> Result<i64> {
        let seq: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(seq), 0) FROM change_log")
            .fetch_one(&self.pool)
            .await?;
        Ok(seq)
    }

    /// Acknowledged position of a feed consumer.
    pub async fn get_cursor(&self, consumer: &str) -> Result<i64> {
        let key = format!("change_cursor:{consumer}");
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM state WHERE key = ?")
            .bind(&key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    /// Move a consumer's cursor forward. Never moves it back.
    pub async fn set_cursor(&self, consumer: &str, seq: i64) -> Result<()> {
        let key = format!("change_cursor:{consumer}");
        sqlx::query(
            r#"
            INSERT INTO state (key, value, updated_at) VALUES (?, ?, datetime('now'))
            ON CONFLICT(key) DO UPDATE SET
                value = CASE WHEN CAST(excluded.value AS INTEGER) > CAST(value AS INTEGER)
                             THEN excluded.value ELSE value END,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&key)
        .bind(seq.to_string())
        .execute(&self.pool)
        .await?;

        debug!(consumer, seq, "Updated change cursor");
        Ok(())
    }

    // Local users

    pub async fn create_user(&self, user: &User, password_hash: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (username, full_name, password_hash, trusted, readonly, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&user.username)
        .bind(&user.full_name)
        .bind(password_hash)
        .bind(user.trusted)
        .bind(user.readonly)
        .bind(user.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| duplicate_or(e, "user", &user.username))?;

        info!(username = %user.username, "Created user");
        Ok(())
    }

    /// A user and their stored password hash.
    pub async fn get_user(&self, username: &str) -> Result<Option<(User, String)>> {
        let row = sqlx::query("SELECT * FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| -> Result<(User, String)> { Ok((row_to_user(&r)?, r.try_get("password_hash")?)) })
            .transpose()
    }

    pub async fn list_users(&self) -> Result<Vec<User>> {
        let rows = sqlx::query("SELECT * FROM users ORDER BY username")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_user).collect()
    }

    pub async fn remove_user(&self, username: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM users WHERE username = ?")
            .bind(username)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

fn duplicate_or(e: sqlx::Error, entity: &'static str, key: impl ToString) -> IpamError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => IpamError::Duplicate {
            entity,
            key: key.to_string(),
        },
        _ => IpamError::Storage(e),
    }
}

fn put_vrf(v: &Vrf) -> Result<SqliteQuery> {
    Ok(sqlx::query(
        r#"
        INSERT INTO vrf (id, rt, name, description, tags, avps) VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            rt = excluded.rt,
            name = excluded.name,
            description = excluded.description,
            tags = excluded.tags,
            avps = excluded.avps
        "#,
    )
    .bind(v.id)
    .bind(v.rt.clone())
    .bind(v.name.clone())
    .bind(v.description.clone())
    .bind(to_text(&v.tags)?)
    .bind(to_text(&v.avps)?))
}

fn put_pool(p: &IpPool) -> Result<SqliteQuery> {
    Ok(sqlx::query(
        r#"
        INSERT INTO pool (
            id, name, description, default_type,
            ipv4_default_prefix_length, ipv6_default_prefix_length, tags, avps
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            description = excluded.description,
            default_type = excluded.default_type,
            ipv4_default_prefix_length = excluded.ipv4_default_prefix_length,
            ipv6_default_prefix_length = excluded.ipv6_default_prefix_length,
            tags = excluded.tags,
            avps = excluded.avps
        "#,
    )
    .bind(p.id)
    .bind(p.name.clone())
    .bind(p.description.clone())
    .bind(p.default_type.map(|t| t.as_str()))
    .bind(p.ipv4_default_prefix_length.map(i64::from))
    .bind(p.ipv6_default_prefix_length.map(i64::from))
    .bind(to_text(&p.tags)?)
    .bind(to_text(&p.avps)?))
}

fn put_prefix(p: &Prefix) -> Result<SqliteQuery> {
    Ok(sqlx::query(
        r#"
        INSERT INTO prefix (
            id, vrf_id, prefix, family, type, status, description, comment, node,
            country, order_id, customer_id, external_key, vlan, monitor,
            alarm_priority, tags, avps, pool_id, expires, added, last_modified,
            authoritative_source, authenticated_as
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            type = excluded.type,
            status = excluded.status,
            description = excluded.description,
            comment = excluded.comment,
            node = excluded.node,
            country = excluded.country,
            order_id = excluded.order_id,
            customer_id = excluded.customer_id,
            external_key = excluded.external_key,
            vlan = excluded.vlan,
            monitor = excluded.monitor,
            alarm_priority = excluded.alarm_priority,
            tags = excluded.tags,
            avps = excluded.avps,
            pool_id = excluded.pool_id,
            expires = excluded.expires,
            last_modified = excluded.last_modified,
            authoritative_source = excluded.authoritative_source,
            authenticated_as = excluded.authenticated_as
        "#,
    )
    .bind(p.id)
    .bind(p.vrf_id)
    .bind(p.prefix.to_string())
    .bind(i64::from(p.prefix.family().number()))
    .bind(p.prefix_type.as_str())
    .bind(p.status.as_str())
    .bind(p.description.clone())
    .bind(p.comment.clone())
    .bind(p.node.clone())
    .bind(p.country.clone())
    .bind(p.order_id.clone())
    .bind(p.customer_id.clone())
    .bind(p.external_key.clone())
    .bind(p.vlan)
    .bind(p.monitor)
    .bind(p.alarm_priority.map(|a| a.as_str()))
    .bind(to_text(&p.tags)?)
    .bind(to_text(&p.avps)?)
    .bind(p.pool_id)
    .bind(p.expires.map(|e| e.to_rfc3339()))
    .bind(p.added.to_rfc3339())
    .bind(p.last_modified.to_rfc3339())
    .bind(p.authoritative_source.clone())
    .bind(p.authenticated_as.clone()))
}

// Helper functions

fn corrupt(what: &str, e: impl std::fmt::Display) -> IpamError {
    IpamError::Corrupt(format!("{what}: {e}"))
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| corrupt("timestamp", e))
}

fn parse_json<T: serde::de::DeserializeOwned>(s: &str) -> Result<T> {
    serde_json::from_str(s).map_err(|e| corrupt("json column", e))
}

fn parse_enum<T: std::str::FromStr<Err = String>>(s: &str) -> Result<T> {
    s.parse().map_err(|e: String| corrupt("enum column", e))
}

fn parse_len(v: Option<i64>) -> Result<Option<u8>> {
    v.map(|l| u8::try_from(l).map_err(|e| corrupt("prefix length", e)))
        .transpose()
}

fn row_to_vrf(row: &SqliteRow) -> Result<Vrf> {
    let mut vrf = Vrf::new(row.try_get("id")?, row.try_get("name")?);
    vrf.rt = row.try_get("rt")?;
    vrf.description = row.try_get("description")?;
    vrf.tags = parse_json(&row.try_get::<String, _>("tags")?)?;
    vrf.avps = parse_json(&row.try_get::<String, _>("avps")?)?;
    Ok(vrf)
}

fn row_to_pool(row: &SqliteRow) -> Result<IpPool> {
    let mut pool = IpPool::new(row.try_get("id")?, row.try_get("name")?);
    pool.description = row.try_get("description")?;
    pool.default_type = row
        .try_get::<Option<String>, _>("default_type")?
        .map(|t| parse_enum(&t))
        .transpose()?;
    pool.ipv4_default_prefix_length = parse_len(row.try_get("ipv4_default_prefix_length")?)?;
    pool.ipv6_default_prefix_length = parse_len(row.try_get("ipv6_default_prefix_length")?)?;
    pool.tags = parse_json(&row.try_get::<String, _>("tags")?)?;
    pool.avps = parse_json(&row.try_get::<String, _>("avps")?)?;
    Ok(pool)
}

fn row_to_prefix(row: &SqliteRow) -> Result<Prefix> {
    let text: String = row.try_get("prefix")?;
    let cidr = Cidr::parse(&text, HostBits::Reject).map_err(|e| corrupt("prefix", e))?;
    let added = parse_time(&row.try_get::<String, _>("added")?)?;

    let mut p = Prefix::new(
        row.try_get("id")?,
        row.try_get("vrf_id")?,
        cidr,
        parse_enum(&row.try_get::<String, _>("type")?)?,
        added,
    );
    p.status = parse_enum(&row.try_get::<String, _>("status")?)?;
    p.description = row.try_get("description")?;
    p.comment = row.try_get("comment")?;
    p.node = row.try_get("node")?;
    p.country = row.try_get("country")?;
    p.order_id = row.try_get("order_id")?;
    p.customer_id = row.try_get("customer_id")?;
    p.external_key = row.try_get("external_key")?;
    p.vlan = row.try_get("vlan")?;
    p.monitor = row.try_get("monitor")?;
    p.alarm_priority = row
        .try_get::<Option<String>, _>("alarm_priority")?
        .map(|a| parse_enum(&a))
        .transpose()?;
    p.tags = parse_json(&row.try_get::<String, _>("tags")?)?;
    p.avps = parse_json(&row.try_get::<String, _>("avps")?)?;
    p.pool_id = row.try_get("pool_id")?;
    p.expires = row
        .try_get::<Option<String>, _>("expires")?
        .map(|e| parse_time(&e))
        .transpose()?;
    p.last_modified = parse_time(&row.try_get::<String, _>("last_modified")?)?;
    p.authoritative_source = row.try_get("authoritative_source")?;
    p.authenticated_as = row.try_get("authenticated_as")?;
    Ok(p)
}

fn row_to_audit(row: &SqliteRow) -> Result<AuditEntry> {
    Ok(AuditEntry {
        id: row.try_get("id")?,
        timestamp: parse_time(&row.try_get::<String, _>("timestamp")?)?,
        vrf_id: row.try_get("vrf_id")?,
        vrf_rt: row.try_get("vrf_rt")?,
        vrf_name: row.try_get("vrf_name")?,
        prefix_id: row.try_get("prefix_id")?,
        prefix_prefix: row.try_get("prefix_prefix")?,
        pool_id: row.try_get("pool_id")?,
        pool_name: row.try_get("pool_name")?,
        username: row.try_get("username")?,
        authenticated_as: row.try_get("authenticated_as")?,
        full_name: row.try_get("full_name")?,
        authoritative_source: row.try_get("authoritative_source")?,
        description: row.try_get("description")?,
    })
}

fn row_to_change(row: &SqliteRow) -> Result<Change> {
    let before: Option<String> = row.try_get("before")?;
    let after: Option<String> = row.try_get("after")?;
    Ok(Change {
        seq: row.try_get("seq")?,
        timestamp: parse_time(&row.try_get::<String, _>("timestamp")?)?,
        entity: parse_enum(&row.try_get::<String, _>("entity")?)?,
        entity_id: row.try_get("entity_id")?,
        action: parse_enum(&row.try_get::<String, _>("action")?)?,
        username: row.try_get("username")?,
        before: before.map(|b| parse_json(&b)).transpose()?,
        after: after.map(|a| parse_json(&a)).transpose()?,
    })
}

fn row_to_user(row: &SqliteRow) -> Result<User> {
    Ok(User {
        username: row.try_get("username")?,
        full_name: row.try_get("full_name")?,
        trusted: row.try_get("trusted")?,
        readonly: row.try_get("readonly")?,
        created_at: parse_time(&row.try_get::<String, _>("created_at")?)?,
    })
}
