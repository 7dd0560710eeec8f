//! Device Binding
//! Mission: Tie every approval token to the device it was issued for
//!
//! Only a hash of the device fingerprint is stored. Bindings are written when a
//! token is issued and read during redemption.

use crate::error::{PipelineError, StoreError, TokenError};
use crate::storage::Database;
use rusqlite::{params, OptionalExtension, Transaction};
use sha2::{Digest, Sha256};
use tracing::warn;

#[derive(Clone)]
pub struct DeviceBinding {
    db: Database,
}

impl DeviceBinding {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Hex SHA-256 of a device fingerprint, as stored and as carried in tokens.
    pub fn device_hash(device_fingerprint: &str) -> String {
        hex::encode(Sha256::digest(device_fingerprint.trim().as_bytes()))
    }

    /// Record the binding inside the caller's issuance transaction.
    pub(crate) fn bind(
        &self,
        tx: &Transaction<'_>,
        token_id: &str,
        signal_id: &str,
        device_hash: &str,
        bound_at_ms: i64,
    ) -> Result<(), StoreError> {
        tx.execute(
            "INSERT INTO device_bindings (token_id, signal_id, device_hash, bound_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![token_id, signal_id, device_hash, bound_at_ms],
        )?;
        Ok(())
    }

    /// Check that `device_fingerprint` is the device `token_id` was bound to.
    pub fn check(&self, token_id: &str, device_fingerprint: &str) -> Result<(), PipelineError> {
        let bound: Option<String> = {
            let conn = self.db.lock();
            conn.query_row(
                "SELECT device_hash FROM device_bindings WHERE token_id = ?1",
                params![token_id],
                |row| row.get(0),
            )
            .optional()?
        };

        match bound {
            None => Err(TokenError::UnknownToken.into()),
            Some(hash) if hash == Self::device_hash(device_fingerprint) => Ok(()),
            Some(_) => {
                warn!(token_id, "Token presented from a different device");
                Err(TokenError::DeviceMismatch.into())
            }
        }
    }
}
