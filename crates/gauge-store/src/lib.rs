//! SQLite-backed platform store.
//!
//! One connection in WAL mode behind an async mutex; schema is created with
//! `IF NOT EXISTS` plus additive column migration via `PRAGMA table_info`.
//! All JSON-valued columns are TEXT holding serialized `serde_json::Value`.

mod error;
mod org;
mod runs;
mod users;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::Value;
use tokio::sync::Mutex;

pub use error::{StoreError, StoreResult};
pub use users::{UserFilter, UserUpdate};

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the platform database at `db_path`.
    pub async fn open(db_path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(db_path)?;
        Self::from_connection(conn).await
    }

    /// In-memory database, used by tests and throwaway environments.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn).await
    }

    async fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.busy_timeout(Duration::from_secs(10))?;
        // PRAGMA journal_mode returns a row; query_row to ignore it.
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute("PRAGMA synchronous = NORMAL", [])?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn.lock().await;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                display_name TEXT NOT NULL DEFAULT '',
                title TEXT NOT NULL DEFAULT '',
                role TEXT NOT NULL DEFAULT 'EMPLOYEE',
                is_active INTEGER NOT NULL DEFAULT 1,
                team_unit_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS org_units (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                unit_type TEXT NOT NULL,
                parent_id TEXT,
                manager_user_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(name, unit_type, parent_id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS org_unit_closure (
                ancestor_id TEXT NOT NULL,
                descendant_id TEXT NOT NULL,
                depth INTEGER NOT NULL,
                UNIQUE(ancestor_id, descendant_id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS platform_settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL DEFAULT '',
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS api_keys (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL DEFAULT '',
                prefix TEXT NOT NULL,
                key_hash BLOB NOT NULL,
                created_at TEXT NOT NULL,
                revoked_at TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS ix_api_keys_prefix ON api_keys(prefix)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                external_run_id TEXT,
                created_by_user_id TEXT NOT NULL,
                owner_user_id TEXT NOT NULL,
                task TEXT NOT NULL,
                dataset TEXT NOT NULL,
                model TEXT,
                metrics TEXT NOT NULL DEFAULT '[]',
                run_metadata TEXT NOT NULL DEFAULT '{}',
                run_config TEXT NOT NULL DEFAULT '{}',
                status TEXT NOT NULL DEFAULT 'DRAFT',
                started_at TEXT,
                ended_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS ix_runs_owner ON runs(owner_user_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS ix_runs_status ON runs(status)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS run_items (
                run_id TEXT NOT NULL,
                item_id TEXT NOT NULL,
                item_index INTEGER NOT NULL DEFAULT 0,
                input TEXT NOT NULL DEFAULT 'null',
                expected TEXT,
                output TEXT,
                error TEXT,
                item_metadata TEXT NOT NULL DEFAULT '{}',
                latency_ms REAL,
                trace_id TEXT,
                trace_url TEXT,
                PRIMARY KEY(run_id, item_id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS ix_run_items_run_index ON run_items(run_id, item_index)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS run_item_scores (
                run_id TEXT NOT NULL,
                item_id TEXT NOT NULL,
                metric_name TEXT NOT NULL,
                score_numeric REAL,
                score_raw TEXT,
                meta TEXT NOT NULL DEFAULT '{}',
                PRIMARY KEY(run_id, item_id, metric_name)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS run_events (
                run_id TEXT NOT NULL,
                event_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                sent_at TEXT NOT NULL,
                payload TEXT NOT NULL DEFAULT '{}',
                PRIMARY KEY(run_id, event_id),
                UNIQUE(run_id, sequence)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS approvals (
                run_id TEXT PRIMARY KEY,
                submitted_by_user_id TEXT NOT NULL,
                submitted_at TEXT NOT NULL,
                decision TEXT,
                decision_by_user_id TEXT,
                decision_at TEXT,
                comment TEXT NOT NULL DEFAULT ''
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                actor_user_id TEXT,
                action TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                before TEXT NOT NULL DEFAULT '{}',
                after TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        // Additive migrations: older databases predate the title column.
        // (SQLite has no IF NOT EXISTS for columns, so inspect table_info.)
        let has_title: bool = {
            let mut stmt = conn.prepare("PRAGMA table_info(users)")?;
            let cols = stmt.query_map([], |row| row.get::<_, String>(1))?;
            let found = cols.filter_map(Result::ok).any(|c| c == "title");
            found
        };
        if !has_title {
            conn.execute("ALTER TABLE users ADD COLUMN title TEXT NOT NULL DEFAULT ''", [])?;
        }

        Ok(())
    }
}

pub(crate) fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

pub(crate) fn ts_to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub(crate) fn sql_to_ts(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| StoreError::Corrupt(format!("bad timestamp {raw:?}: {err}")))
}

pub(crate) fn sql_to_opt_ts(raw: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    raw.map(|s| sql_to_ts(&s)).transpose()
}

pub(crate) fn json_to_sql(value: &Value) -> String {
    value.to_string()
}

pub(crate) fn sql_to_json(raw: Option<String>) -> Value {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or(Value::Null)
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
