//! Signal Repository
//!
//! Append-only log of approved signals, partitioned by producer. Each partition
//! carries a gap-free cursor starting at 0 that consumers use to resume.

use super::Database;
use crate::clock::from_millis;
use crate::error::{PipelineError, RequestError, StoreError};
use crate::models::{OrderSpec, Side, Signal, SignalDraft};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, info};

const SIGNAL_COLUMNS: &str = "signal_id, producer_id, cursor, instrument, side, order_json, \
                              payload, request_fingerprint, received_at";

#[derive(Clone)]
pub struct SignalRepository {
    db: Database,
}

impl SignalRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist a signal and assign the next cursor in its producer partition.
    ///
    /// Appending an id that already exists with the same request fingerprint returns
    /// the stored signal unchanged; a different fingerprint is a `SignalConflict`.
    pub fn append(&self, draft: SignalDraft) -> Result<Signal, PipelineError> {
        let order_json = serde_json::to_string(&draft.order).map_err(StoreError::from)?;

        self.db.immediate(|tx| {
            let existing = tx
                .query_row(
                    &format!("SELECT {} FROM signals WHERE signal_id = ?1", SIGNAL_COLUMNS),
                    params![draft.signal_id],
                    row_to_signal,
                )
                .optional()?;

            if let Some(signal) = existing {
                if signal.producer_id == draft.producer_id
                    && signal.request_fingerprint == draft.request_fingerprint
                {
                    debug!(
                        signal_id = %signal.signal_id,
                        cursor = signal.cursor,
                        "Signal already persisted, returning existing row"
                    );
                    return Ok(signal);
                }
                return Err(RequestError::SignalConflict(draft.signal_id.clone()).into());
            }

            let cursor: i64 = tx.query_row(
                "SELECT COALESCE(MAX(cursor), -1) + 1 FROM signals WHERE producer_id = ?1",
                params![draft.producer_id],
                |row| row.get(0),
            )?;

            tx.execute(
                "INSERT INTO signals
                    (signal_id, producer_id, cursor, instrument, side, order_json,
                     payload, request_fingerprint, received_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    draft.signal_id,
                    draft.producer_id,
                    cursor,
                    draft.instrument,
                    draft.side.as_str(),
                    order_json,
                    draft.payload,
                    draft.request_fingerprint,
                    draft.received_at.timestamp_millis(),
                ],
            )?;

            info!(
                signal_id = %draft.signal_id,
                producer_id = %draft.producer_id,
                cursor,
                "Signal appended"
            );

            Ok(Signal {
                signal_id: draft.signal_id,
                producer_id: draft.producer_id,
                instrument: draft.instrument,
                side: draft.side,
                order: draft.order,
                payload: draft.payload,
                request_fingerprint: draft.request_fingerprint,
                received_at: draft.received_at,
                cursor: cursor as u64,
            })
        })
    }

    /// Up to `limit` signals with `cursor >= from_cursor`, ascending.
    pub fn read_from(
        &self,
        partition: &str,
        from_cursor: u64,
        limit: usize,
    ) -> Result<Vec<Signal>, StoreError> {
        // Cursors are stored as i64; anything above that is past every partition head.
        let Ok(from) = i64::try_from(from_cursor) else {
            return Ok(Vec::new());
        };
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM signals
             WHERE producer_id = ?1 AND cursor >= ?2
             ORDER BY cursor ASC
             LIMIT ?3",
            SIGNAL_COLUMNS
        ))?;

        let signals = stmt
            .query_map(
                params![partition, from, limit],
                row_to_signal,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(signals)
    }

    /// Lazy iterator over a partition, fetching `page_size` rows at a time.
    ///
    /// The stream ends at the partition head observed when the last page came back
    /// short; restart it from the last cursor seen plus one to pick up new signals.
    pub fn stream_from(&self, partition: &str, from_cursor: u64, page_size: usize) -> SignalStream {
        SignalStream {
            repo: self.clone(),
            partition: partition.to_string(),
            next_cursor: from_cursor,
            page_size: page_size.max(1),
            buffer: Vec::new().into_iter(),
            exhausted: false,
        }
    }

    pub fn get(&self, signal_id: &str) -> Result<Option<Signal>, StoreError> {
        let conn = self.db.lock();
        let signal = conn
            .query_row(
                &format!("SELECT {} FROM signals WHERE signal_id = ?1", SIGNAL_COLUMNS),
                params![signal_id],
                row_to_signal,
            )
            .optional()?;
        Ok(signal)
    }

    /// Next cursor to be assigned in a partition (0 when empty).
    pub fn head(&self, partition: &str) -> Result<u64, StoreError> {
        let conn = self.db.lock();
        let next: i64 = conn.query_row(
            "SELECT COALESCE(MAX(cursor), -1) + 1 FROM signals WHERE producer_id = ?1",
            params![partition],
            |row| row.get(0),
        )?;
        Ok(next as u64)
    }
}

fn row_to_signal(row: &Row<'_>) -> rusqlite::Result<Signal> {
    let side_raw: String = row.get(4)?;
    let side = Side::from_str(&side_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            Type::Text,
            format!("unknown side {:?}", side_raw).into(),
        )
    })?;

    let order_json: String = row.get(5)?;
    let order: OrderSpec = serde_json::from_str(&order_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;

    let cursor: i64 = row.get(2)?;
    let received_at: i64 = row.get(8)?;

    Ok(Signal {
        signal_id: row.get(0)?,
        producer_id: row.get(1)?,
        cursor: cursor as u64,
        instrument: row.get(3)?,
        side,
        order,
        payload: row.get(6)?,
        request_fingerprint: row.get(7)?,
        received_at: from_millis(received_at),
    })
}

/// Paged cursor stream over one producer partition.
pub struct SignalStream {
    repo: SignalRepository,
    partition: String,
    next_cursor: u64,
    page_size: usize,
    buffer: std::vec::IntoIter<Signal>,
    exhausted: bool,
}

impl SignalStream {
    /// Cursor the stream will read next.
    pub fn position(&self) -> u64 {
        self.next_cursor
    }
}

impl Iterator for SignalStream {
    type Item = Result<Signal, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(signal) = self.buffer.next() {
            self.next_cursor = signal.cursor + 1;
            return Some(Ok(signal));
        }
        if self.exhausted {
            return None;
        }

        match self
            .repo
            .read_from(&self.partition, self.next_cursor, self.page_size)
        {
            Ok(page) => {
                if page.len() < self.page_size {
                    self.exhausted = true;
                }
                self.buffer = page.into_iter();
                let signal = self.buffer.next()?;
                self.next_cursor = signal.cursor + 1;
                Some(Ok(signal))
            }
            Err(e) => {
                self.exhausted = true;
                Some(Err(e))
            }
        }
    }
}
