//! Replay Guard
//!
//! Time-windowed set of accepted webhook signatures. A delivery whose signature
//! hash is already present and unexpired is a replay of an accepted delivery.

use super::Database;
use crate::clock::SharedClock;
use crate::error::{PipelineError, ReplayError, StoreError};
use chrono::{DateTime, Utc};
use rusqlite::params;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::debug;

pub struct ReplayGuard {
    db: Database,
    clock: SharedClock,
    tolerance: Duration,
}

impl ReplayGuard {
    pub fn new(db: Database, clock: SharedClock, tolerance: Duration) -> Self {
        Self {
            db,
            clock,
            tolerance,
        }
    }

    /// Key for a delivery, derived from its decoded MAC bytes rather than the
    /// header text.
    pub fn signature_hash(mac: &[u8]) -> String {
        hex::encode(Sha256::digest(mac))
    }

    /// Record a delivery, failing if the same signature was accepted inside the window.
    ///
    /// One conditional upsert: a fresh hash inserts, an expired entry is overwritten,
    /// a live entry changes nothing and the delivery is reported as a duplicate.
    pub fn check_and_record(
        &self,
        signature_hash: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        let now = self.clock.now_millis();
        let ts = timestamp.timestamp_millis();
        let expires_at = ts + self.tolerance.as_millis() as i64;

        let changes = {
            let conn = self.db.lock();
            conn.execute(
                "INSERT INTO replay_window (signature_hash, timestamp, expires_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(signature_hash) DO UPDATE
                    SET timestamp = excluded.timestamp, expires_at = excluded.expires_at
                    WHERE replay_window.expires_at < ?4",
                params![signature_hash, ts, expires_at, now],
            )
            .map_err(StoreError::from)?
        };

        if changes == 0 {
            debug!(signature_hash, "Replay guard rejected duplicate delivery");
            return Err(ReplayError::DuplicateDelivery.into());
        }
        Ok(())
    }

    /// Drop entries whose window has closed. Returns the number removed.
    pub fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = self.clock.now_millis();
        let conn = self.db.lock();
        let removed = conn.execute(
            "DELETE FROM replay_window WHERE expires_at < ?1",
            params![now],
        )?;
        Ok(removed)
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        let conn = self.db.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM replay_window", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}
