//! Durable Stores
//!
//! SQLite is the source of truth for every piece of shared state in the gateway.
//! All mutations are conditional statements or `IMMEDIATE` transactions, so the
//! guarantees hold across handlers and across processes sharing one database
//! file. The in-process mutex only serialises use of a single connection.

pub mod idempotency;
pub mod replay_guard;
pub mod signal_repository;

pub use idempotency::IdempotencyStore;
pub use replay_guard::ReplayGuard;
pub use signal_repository::{SignalRepository, SignalStream};

use crate::error::StoreError;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS signals (
    signal_id TEXT PRIMARY KEY,
    producer_id TEXT NOT NULL,
    cursor INTEGER NOT NULL,
    instrument TEXT NOT NULL,
    side TEXT NOT NULL,
    order_json TEXT NOT NULL,
    payload BLOB NOT NULL,
    request_fingerprint TEXT NOT NULL,
    received_at INTEGER NOT NULL,
    UNIQUE (producer_id, cursor)
);

CREATE TABLE IF NOT EXISTS replay_window (
    signature_hash TEXT PRIMARY KEY,
    timestamp INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_replay_window_expires
    ON replay_window(expires_at);

CREATE TABLE IF NOT EXISTS idempotency_records (
    scope TEXT NOT NULL,
    idempotency_key TEXT NOT NULL,
    request_fingerprint TEXT NOT NULL,
    state TEXT NOT NULL,
    reservation_id TEXT NOT NULL,
    result_json TEXT,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    reserved_until INTEGER NOT NULL,
    PRIMARY KEY (scope, idempotency_key)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_idempotency_expires
    ON idempotency_records(expires_at);

CREATE TABLE IF NOT EXISTS approval_tokens (
    token_id TEXT PRIMARY KEY,
    signal_id TEXT NOT NULL,
    device_hash TEXT NOT NULL,
    issued_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    consumed_at INTEGER
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_approval_tokens_signal
    ON approval_tokens(signal_id);

-- One row per executed signal; the primary key makes execution at-most-once.
CREATE TABLE IF NOT EXISTS signal_redemptions (
    signal_id TEXT PRIMARY KEY,
    token_id TEXT NOT NULL,
    redeemed_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS device_bindings (
    token_id TEXT PRIMARY KEY,
    signal_id TEXT NOT NULL,
    device_hash TEXT NOT NULL,
    bound_at INTEGER NOT NULL
) WITHOUT ROWID;
"#;

/// Shared SQLite connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database file and apply the schema.
    pub fn open(db_path: &str) -> Result<Self, StoreError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // We handle our own locking

        let conn = Connection::open_with_flags(db_path, flags)?;

        let journal_mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        let db = Self::init(conn)?;
        info!("Approval database initialized at: {}", db_path);
        Ok(db)
    }

    /// Private in-memory database, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        // Appends must be durable before they are acknowledged.
        conn.pragma_update(None, "synchronous", "FULL")?;
        // Other processes may hold the write lock briefly.
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA_SQL)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction.
    ///
    /// The write lock is taken up front, so read-then-write sequences inside `f`
    /// cannot interleave with another writer. Commits on `Ok`, rolls back on `Err`.
    pub(crate) fn immediate<T, E>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<rusqlite::Error>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_is_idempotent() {
        let temp = tempfile::NamedTempFile::new().unwrap();
        let path = temp.path().to_str().unwrap();

        Database::open(path).unwrap();
        // Re-opening applies CREATE IF NOT EXISTS again without error.
        let db = Database::open(path).unwrap();

        let tables: i64 = db
            .lock()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 6);
    }

    #[test]
    fn immediate_rolls_back_on_error() {
        let db = Database::open_in_memory().unwrap();

        let result: Result<(), StoreError> = db.immediate(|tx| {
            tx.execute(
                "INSERT INTO replay_window (signature_hash, timestamp, expires_at) VALUES ('h', 1, 2)",
                [],
            )?;
            Err(StoreError::Sqlite(rusqlite::Error::InvalidQuery))
        });
        assert!(result.is_err());

        let count: i64 = db
            .lock()
            .query_row("SELECT COUNT(*) FROM replay_window", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
