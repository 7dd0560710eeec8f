//! Idempotency Store
//!
//! Maps (scope, key) to the result of the first request that used the key.
//! A key moves through `in_progress` to `completed`; concurrent duplicates wait
//! for the owner instead of computing again, and a reservation abandoned by a
//! crashed owner is taken over once `reserved_until` passes.

use super::Database;
use crate::clock::SharedClock;
use crate::error::{IdempotencyError, StoreError};
use rusqlite::{params, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

const STATE_IN_PROGRESS: &str = "in_progress";
const STATE_COMPLETED: &str = "completed";

const BACKOFF_START: Duration = Duration::from_millis(10);
const BACKOFF_CAP: Duration = Duration::from_millis(250);

/// Value returned by [`IdempotencyStore::get_or_compute`].
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved<R> {
    pub value: R,
    /// True when the value came from an earlier request with the same key.
    pub replayed: bool,
}

#[derive(Debug)]
enum Reservation {
    Acquired(String),
    Completed(String),
    InFlight,
    Mismatch,
}

pub struct IdempotencyStore {
    db: Database,
    clock: SharedClock,
    ttl: Duration,
    reservation_ttl: Duration,
    wait_timeout: Duration,
}

impl IdempotencyStore {
    pub fn new(
        db: Database,
        clock: SharedClock,
        ttl: Duration,
        reservation_ttl: Duration,
        wait_timeout: Duration,
    ) -> Self {
        Self {
            db,
            clock,
            ttl,
            reservation_ttl,
            wait_timeout,
        }
    }

    /// Return the stored result for `key`, or run `compute` exactly once and store it.
    ///
    /// * same key, same fingerprint, completed: stored result, `compute` not called
    /// * same key, different fingerprint: `KeyReusedWithDifferentPayload`
    /// * same key, still in flight: wait with backoff, then `ReservationConflict`
    ///
    /// A failed `compute` releases the reservation so a retry can proceed.
    pub async fn get_or_compute<R, E, F>(
        &self,
        scope: &str,
        key: &str,
        fingerprint: &str,
        compute: F,
    ) -> Result<Resolved<R>, E>
    where
        R: Serialize + DeserializeOwned,
        E: From<IdempotencyError> + From<StoreError>,
        F: FnOnce() -> Result<R, E>,
    {
        let deadline = tokio::time::Instant::now() + self.wait_timeout;
        let mut backoff = BACKOFF_START;
        let mut compute = Some(compute);

        loop {
            match self.reserve(scope, key, fingerprint)? {
                Reservation::Completed(json) => {
                    let value = serde_json::from_str(&json).map_err(StoreError::from)?;
                    debug!(scope, key, "Idempotency hit, returning stored result");
                    return Ok(Resolved {
                        value,
                        replayed: true,
                    });
                }
                Reservation::Mismatch => {
                    return Err(IdempotencyError::KeyReusedWithDifferentPayload.into());
                }
                Reservation::Acquired(reservation_id) => {
                    // A reservation is only acquired once per call: after a lost
                    // takeover the loop can only observe the new owner's outcome.
                    let Some(compute) = compute.take() else {
                        return Err(IdempotencyError::ReservationConflict.into());
                    };

                    match compute() {
                        Ok(value) => {
                            let json = serde_json::to_string(&value).map_err(StoreError::from)?;
                            if self.complete(scope, key, &reservation_id, &json)? {
                                return Ok(Resolved {
                                    value,
                                    replayed: false,
                                });
                            }
                            warn!(
                                scope,
                                key, "Reservation was taken over while computing, waiting for new owner"
                            );
                        }
                        Err(err) => {
                            self.release(scope, key, &reservation_id)?;
                            return Err(err);
                        }
                    }
                }
                Reservation::InFlight => {}
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(IdempotencyError::ReservationConflict.into());
            }
            tokio::time::sleep(backoff.min(deadline - now)).await;
            backoff = (backoff * 2).min(BACKOFF_CAP);
        }
    }

    fn reserve(&self, scope: &str, key: &str, fingerprint: &str) -> Result<Reservation, StoreError> {
        let now = self.clock.now_millis();
        let expires_at = now + self.ttl.as_millis() as i64;
        let reserved_until = now + self.reservation_ttl.as_millis() as i64;

        self.db.immediate(|tx| {
            let existing = tx
                .query_row(
                    "SELECT request_fingerprint, state, result_json, expires_at, reserved_until
                     FROM idempotency_records WHERE scope = ?1 AND idempotency_key = ?2",
                    params![scope, key],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, i64>(4)?,
                        ))
                    },
                )
                .optional()?;

            match existing {
                None => {}
                Some((_, _, _, record_expires, _)) if record_expires <= now => {}
                // A live key stays bound to its first payload, abandoned or not.
                Some((stored_fp, _, _, _, _)) if stored_fp != fingerprint => {
                    return Ok(Reservation::Mismatch);
                }
                Some((_, state, _, _, until)) if state == STATE_IN_PROGRESS && until <= now => {
                    warn!(scope, key, "Taking over abandoned idempotency reservation");
                }
                Some((_, state, Some(json), _, _)) if state == STATE_COMPLETED => {
                    return Ok(Reservation::Completed(json));
                }
                Some(_) => return Ok(Reservation::InFlight),
            }

            let reservation_id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT OR REPLACE INTO idempotency_records
                    (scope, idempotency_key, request_fingerprint, state, reservation_id,
                     result_json, created_at, expires_at, reserved_until)
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?7, ?8)",
                params![
                    scope,
                    key,
                    fingerprint,
                    STATE_IN_PROGRESS,
                    reservation_id,
                    now,
                    expires_at,
                    reserved_until
                ],
            )?;
            Ok(Reservation::Acquired(reservation_id))
        })
    }

    /// Store the result. Returns false if the reservation no longer belongs to us.
    fn complete(
        &self,
        scope: &str,
        key: &str,
        reservation_id: &str,
        result_json: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.db.lock();
        let changed = conn.execute(
            "UPDATE idempotency_records
             SET state = ?4, result_json = ?5
             WHERE scope = ?1 AND idempotency_key = ?2 AND reservation_id = ?3
               AND state = 'in_progress'",
            params![scope, key, reservation_id, STATE_COMPLETED, result_json],
        )?;
        Ok(changed == 1)
    }

    fn release(&self, scope: &str, key: &str, reservation_id: &str) -> Result<(), StoreError> {
        let conn = self.db.lock();
        conn.execute(
            "DELETE FROM idempotency_records
             WHERE scope = ?1 AND idempotency_key = ?2 AND reservation_id = ?3
               AND state = 'in_progress'",
            params![scope, key, reservation_id],
        )?;
        Ok(())
    }

    /// Delete records past their TTL. Returns the number removed.
    pub fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = self.clock.now_millis();
        let conn = self.db.lock();
        let removed = conn.execute(
            "DELETE FROM idempotency_records WHERE expires_at <= ?1",
            params![now],
        )?;
        Ok(removed)
    }
}
