//! Durable coordination state shared between the driver and the host.
//!
//! One SQLite file in WAL mode holds requests, results, sessions, logs and
//! host status. Every write is a single statement or a short transaction
//! whose first statement writes, so concurrent writers serialize on the
//! database lock instead of failing a read-to-write upgrade.

mod logs;
mod maintenance;
mod requests;
mod sessions;
pub mod side_channel;
mod status;

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use tracing::debug;

use hostlink_core::error::{HostlinkError, InfraError};

pub use maintenance::{PruneReport, StoreStats};
pub use side_channel::SideChannel;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_CONNECTIONS: u32 = 4;

/// Ordered schema migrations. Each entry is applied once and recorded in
/// `schema_version`.
const MIGRATIONS: &[(i64, &[&str])] = &[(
    1,
    &[
        r#"
        CREATE TABLE IF NOT EXISTS requests (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            correlation_id TEXT NOT NULL UNIQUE,
            kind TEXT NOT NULL,
            payload BLOB NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            result_id INTEGER
        )
        "#,
        r#"
        CREATE INDEX IF NOT EXISTS idx_requests_claim
        ON requests(kind, status, priority DESC, id ASC)
        "#,
        r#"
        CREATE INDEX IF NOT EXISTS idx_requests_status_completed
        ON requests(status, completed_at)
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS request_results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            request_id INTEGER NOT NULL UNIQUE,
            summary TEXT,
            data_json TEXT,
            error_message TEXT,
            stack_trace TEXT,
            created_at TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS request_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            request_id INTEGER NOT NULL,
            from_status TEXT,
            to_status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            detail TEXT
        )
        "#,
        r#"
        CREATE INDEX IF NOT EXISTS idx_request_events_request
        ON request_events(request_id, id)
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            start_reason TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT
        )
        "#,
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_single_active
        ON sessions((end_time IS NULL))
        WHERE end_time IS NULL
        "#,
        r#"
        CREATE INDEX IF NOT EXISTS idx_sessions_start
        ON sessions(start_time DESC)
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            sequence INTEGER NOT NULL,
            timestamp TEXT NOT NULL,
            level TEXT NOT NULL,
            message TEXT NOT NULL,
            stack_trace TEXT,
            truncated_stack TEXT,
            source_file TEXT,
            source_line INTEGER,
            context TEXT,
            request_id INTEGER,
            UNIQUE(session_id, sequence)
        )
        "#,
        r#"
        CREATE INDEX IF NOT EXISTS idx_logs_level
        ON logs(level, session_id)
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS drain_markers (
            session_id TEXT PRIMARY KEY,
            last_sequence INTEGER NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS host_status (
            instance_id TEXT PRIMARY KEY,
            status_json TEXT NOT NULL,
            heartbeat TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS cursors (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    ],
)];

#[derive(Clone)]
pub struct CoordinationStore {
    pool: Arc<SqlitePool>,
}

impl CoordinationStore {
    pub async fn open(path: &Path) -> Result<Self, HostlinkError> {
        let parent = path.parent().ok_or_else(|| {
            HostlinkError::config(format!("invalid coordination db path '{}'", path.display()))
        })?;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| HostlinkError::Infra(InfraError::Io(err)))?;

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(|err| HostlinkError::config(format!("invalid sqlite options: {err}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await
            .map_err(db_err)?;
        let store = Self {
            pool: Arc::new(pool),
        };
        store.migrate().await?;
        debug!(path = %path.display(), "coordination_store_opened");
        Ok(store)
    }

    /// Single-connection in-memory store for tests and embedding.
    pub async fn in_memory() -> Result<Self, HostlinkError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(db_err)?;
        let store = Self {
            pool: Arc::new(pool),
        };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), HostlinkError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await
        .map_err(db_err)?;

        let current: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
            .fetch_one(self.pool.as_ref())
            .await
            .map_err(db_err)?;
        let current = current.unwrap_or(0);

        for (version, statements) in MIGRATIONS {
            if *version <= current {
                continue;
            }
            let mut tx = self.pool.begin().await.map_err(db_err)?;
            for statement in *statements {
                sqlx::query(statement)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
            }
            sqlx::query("INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (?, ?)")
                .bind(*version)
                .bind(timestamp(Utc::now()))
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            tx.commit().await.map_err(db_err)?;
            debug!(version, "schema_migration_applied");
        }
        Ok(())
    }

    pub async fn schema_version(&self) -> Result<i64, HostlinkError> {
        let version: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
            .fetch_one(self.pool.as_ref())
            .await
            .map_err(db_err)?;
        Ok(version.unwrap_or(0))
    }

    /// Cheap liveness check used to decide whether the store is ready.
    pub async fn ping(&self) -> Result<(), HostlinkError> {
        sqlx::query("SELECT 1")
            .execute(self.pool.as_ref())
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub(crate) fn db_err(err: sqlx::Error) -> HostlinkError {
    HostlinkError::Infra(InfraError::Database(err.to_string()))
}

/// Fixed-width RFC 3339 so stored timestamps sort lexicographically.
pub(crate) fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, HostlinkError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| HostlinkError::database(format!("invalid timestamp '{raw}': {err}")))
}

pub(crate) fn parse_optional_timestamp(
    raw: Option<&str>,
) -> Result<Option<DateTime<Utc>>, HostlinkError> {
    raw.map(parse_timestamp).transpose()
}
