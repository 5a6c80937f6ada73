//! SQLite database handle for the Fleetlink relay.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use fleetlink_core::clock::SharedClock;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tracing::info;

/// Deterministic mapping from a tenant id to its storage namespace.
pub type TenantDbName = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Default namespace function: the empty tenant maps to the shared
/// default namespace.
pub fn default_db_name(tenant_id: &str) -> String {
    if tenant_id.is_empty() {
        "fleetlink".to_string()
    } else {
        format!("fleetlink-{tenant_id}")
    }
}

#[derive(Clone)]
pub struct RelayStore {
    pool: Pool<Sqlite>,
    pub(super) clock: SharedClock,
    pub(super) db_name: TenantDbName,
    pub(super) recording_expire_ms: i64,
}

impl RelayStore {
    /// Open or create the relay database at the given path.
    pub async fn open(
        path: &Path,
        clock: SharedClock,
        recording_expire: Duration,
    ) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
        }

        let options =
            SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))
                .map_err(|e| StoreError::Connection(e.to_string()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .foreign_keys(true)
                .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        info!(path = %path.display(), "Relay store opened");

        let store = Self::with_pool(pool, clock, recording_expire);
        store.run_migrations().await?;

        Ok(store)
    }

    /// Open an in-memory database (single instance tests and demos).
    pub async fn open_in_memory(
        clock: SharedClock,
        recording_expire: Duration,
    ) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::Connection(e.to_string()))?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let store = Self::with_pool(pool, clock, recording_expire);
        store.run_migrations().await?;

        Ok(store)
    }

    fn with_pool(pool: Pool<Sqlite>, clock: SharedClock, recording_expire: Duration) -> Self {
        #[allow(clippy::cast_possible_wrap)]
        let recording_expire_ms = recording_expire.as_millis() as i64;
        Self {
            pool,
            clock,
            db_name: Arc::new(default_db_name),
            recording_expire_ms,
        }
    }

    /// Replace the tenant namespace function.
    #[must_use]
    pub fn with_tenant_db_name(mut self, db_name: TenantDbName) -> Self {
        self.db_name = db_name;
        self
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        info!("Relay store migrations complete");
        Ok(())
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub(super) fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub(super) fn namespace(&self, tenant_id: &str) -> String {
        (self.db_name)(tenant_id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Cannot allocate invalid session: {0}")]
    InvalidSession(String),

    #[error("Session not found")]
    SessionNotFound,

    #[error("Conflict: {0}")]
    Conflict(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db) = e {
            if db.is_unique_violation() {
                return StoreError::Conflict(db.to_string());
            }
        }
        StoreError::Query(e.to_string())
    }
}
