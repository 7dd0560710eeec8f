//! Approval Token Issuer
//! Mission: Issue short-lived, device-bound, single-use approval tokens
//!
//! Tokens are HS256 JWTs. The signed claims make a token self-describing, and
//! the `approval_tokens` ledger row makes it single-use: redemption flips
//! `consumed_at` and claims the signal in `signal_redemptions` in one transaction.

use crate::auth::device::DeviceBinding;
use crate::clock::{from_millis, SharedClock};
use crate::error::{PipelineError, StoreError, TokenError};
use crate::models::{ApprovalToken, Signal};
use crate::storage::{Database, SignalRepository};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Claims carried by an approval token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalClaims {
    pub jti: String,
    /// Signal the token approves.
    pub sub: String,
    /// SHA-256 of the bound device fingerprint.
    pub dfp: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug)]
struct LedgerRow {
    signal_id: String,
    expires_at: i64,
}

/// Issues and redeems approval tokens.
pub struct TokenIssuer {
    db: Database,
    signals: SignalRepository,
    devices: DeviceBinding,
    clock: SharedClock,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    ttl: Duration,
}

impl TokenIssuer {
    pub fn new(
        db: Database,
        signals: SignalRepository,
        devices: DeviceBinding,
        clock: SharedClock,
        secret: &str,
        ttl: Duration,
    ) -> Self {
        Self {
            db,
            signals,
            devices,
            clock,
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a token for `signal_id`, bound to `device_fingerprint`.
    pub fn issue(
        &self,
        signal_id: &str,
        device_fingerprint: &str,
    ) -> Result<ApprovalToken, PipelineError> {
        let issued_at = self.clock.now();
        let issued_ms = issued_at.timestamp_millis();
        let expires_ms = issued_ms + self.ttl.as_millis() as i64;
        let expires_at = from_millis(expires_ms);

        let token_id = Uuid::new_v4().to_string();
        let device_hash = DeviceBinding::device_hash(device_fingerprint);

        let claims = ApprovalClaims {
            jti: token_id.clone(),
            sub: signal_id.to_string(),
            dfp: device_hash.clone(),
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
        };
        let signature = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?;

        self.db.immediate(|tx| -> Result<(), PipelineError> {
            tx.execute(
                "INSERT INTO approval_tokens
                    (token_id, signal_id, device_hash, issued_at, expires_at, consumed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL)",
                params![token_id, signal_id, device_hash, issued_ms, expires_ms],
            )?;
            self.devices
                .bind(tx, &token_id, signal_id, &device_hash, issued_ms)?;
            Ok(())
        })?;

        debug!(token_id = %token_id, signal_id, ttl_secs = self.ttl.as_secs(), "Approval token issued");

        Ok(ApprovalToken {
            token_id,
            signal_id: signal_id.to_string(),
            device_fingerprint: device_hash,
            issued_at,
            expires_at,
            signature,
        })
    }

    /// Verify the token's signature and decode its claims. Expiry is not checked here.
    pub fn verify(&self, token: &str) -> Result<ApprovalClaims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is decided against the injected clock in `redeem`.
        validation.validate_exp = false;

        decode::<ApprovalClaims>(token.trim(), &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| {
                match e.kind() {
                    ErrorKind::InvalidSignature => debug!("Approval token signature mismatch"),
                    other => debug!(error = ?other, "Approval token rejected"),
                }
                TokenError::BadSignature
            })
    }

    /// Redeem a token from `device_fingerprint`, returning the approved signal.
    ///
    /// Checks run in order: signature, expiry, device, single-use consume.
    pub fn redeem(&self, token: &str, device_fingerprint: &str) -> Result<Signal, PipelineError> {
        let claims = self.verify(token)?;

        let row = self.ledger_row(&claims.jti)?.ok_or(TokenError::UnknownToken)?;
        if row.signal_id != claims.sub {
            warn!(token_id = %claims.jti, "Token subject does not match ledger");
            return Err(TokenError::BadSignature.into());
        }

        let now = self.clock.now_millis();
        if now >= row.expires_at {
            info!(token_id = %claims.jti, signal_id = %claims.sub, "Approval token expired");
            return Err(TokenError::Expired.into());
        }

        if claims.dfp != DeviceBinding::device_hash(device_fingerprint) {
            warn!(token_id = %claims.jti, "Token device claim does not match presenter");
            return Err(TokenError::DeviceMismatch.into());
        }
        self.devices.check(&claims.jti, device_fingerprint)?;

        self.consume(&claims.jti, &claims.sub, now)?;

        let signal = self
            .signals
            .get(&claims.sub)?
            .ok_or(TokenError::UnknownToken)?;
        info!(
            token_id = %claims.jti,
            signal_id = %signal.signal_id,
            cursor = signal.cursor,
            "Approval token redeemed"
        );
        Ok(signal)
    }

    /// Mark the token consumed and claim its signal, atomically.
    fn consume(&self, token_id: &str, signal_id: &str, now_ms: i64) -> Result<(), PipelineError> {
        self.db.immediate(|tx| {
            let changed = tx.execute(
                "UPDATE approval_tokens SET consumed_at = ?2
                 WHERE token_id = ?1 AND consumed_at IS NULL",
                params![token_id, now_ms],
            )?;
            if changed == 0 {
                return Err(TokenError::AlreadyRedeemed.into());
            }

            let claimed = tx.execute(
                "INSERT OR IGNORE INTO signal_redemptions (signal_id, token_id, redeemed_at)
                 VALUES (?1, ?2, ?3)",
                params![signal_id, token_id, now_ms],
            )?;
            if claimed == 0 {
                warn!(token_id, signal_id, "Signal already executed through another token");
                return Err(TokenError::AlreadyRedeemed.into());
            }
            Ok(())
        })
    }

    fn ledger_row(&self, token_id: &str) -> Result<Option<LedgerRow>, StoreError> {
        let conn = self.db.lock();
        let row = conn
            .query_row(
                "SELECT signal_id, expires_at FROM approval_tokens WHERE token_id = ?1",
                params![token_id],
                |row| {
                    Ok(LedgerRow {
                        signal_id: row.get(0)?,
                        expires_at: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Whether the token has been consumed. Audit helper.
    pub fn is_consumed(&self, token_id: &str) -> Result<bool, StoreError> {
        let conn = self.db.lock();
        let consumed: Option<Option<i64>> = conn
            .query_row(
                "SELECT consumed_at FROM approval_tokens WHERE token_id = ?1",
                params![token_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(matches!(consumed, Some(Some(_))))
    }
}
