//! Error taxonomy for the approval pipeline.
//!
//! Every rejection carries a stable reason code so producers can tell
//! "retry later" (429, 5xx) apart from "do not retry as-is" (401, 403, 409).

use std::time::Duration;

/// Webhook authenticity failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("signature header is missing")]
    MissingSignature,
    #[error("signature header is not a hex encoded HMAC-SHA256")]
    MalformedSignature,
    #[error("signature does not match the request body")]
    BadSignature,
    #[error("timestamp header is missing")]
    MissingTimestamp,
    #[error("timestamp header is not ISO-8601 or Unix seconds")]
    MalformedTimestamp,
    #[error("timestamp is outside the allowed clock skew")]
    ClockSkewExceeded,
    #[error("producer is not registered")]
    UnknownProducer,
}

impl AuthError {
    pub fn reason(&self) -> &'static str {
        match self {
            AuthError::MissingSignature => "missing_signature",
            AuthError::MalformedSignature => "malformed_signature",
            AuthError::BadSignature => "bad_signature",
            AuthError::MissingTimestamp => "missing_timestamp",
            AuthError::MalformedTimestamp => "malformed_timestamp",
            AuthError::ClockSkewExceeded => "clock_skew_exceeded",
            AuthError::UnknownProducer => "unknown_producer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplayError {
    #[error("webhook delivery was already accepted inside the replay window")]
    DuplicateDelivery,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdempotencyError {
    #[error("idempotency key was already used with a different payload")]
    KeyReusedWithDifferentPayload,
    #[error("a request with this idempotency key is still in flight, retry later")]
    ReservationConflict,
}

/// Approval token redemption failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("approval token has expired")]
    Expired,
    #[error("approval token is bound to a different device")]
    DeviceMismatch,
    #[error("approval token was already redeemed")]
    AlreadyRedeemed,
    #[error("approval token signature is invalid")]
    BadSignature,
    #[error("approval token is not known to this gateway")]
    UnknownToken,
}

impl TokenError {
    pub fn reason(&self) -> &'static str {
        match self {
            TokenError::Expired => "token_expired",
            TokenError::DeviceMismatch => "device_mismatch",
            TokenError::AlreadyRedeemed => "already_redeemed",
            TokenError::BadSignature => "bad_token_signature",
            TokenError::UnknownToken => "unknown_token",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("rate limit exceeded for producer, retry after {}s", self.retry_after_secs())]
pub struct RateLimitError {
    pub retry_after: Duration,
}

impl RateLimitError {
    /// Whole seconds to wait, rounded up and never zero.
    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after.as_millis().div_ceil(1000).max(1) as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("producer is not authorized to trade {instrument}")]
    InstrumentNotAllowed { instrument: String },
}

/// Malformed or incomplete requests, detected after authentication.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("required header {0} is missing")]
    MissingHeader(&'static str),
    #[error("payload rejected: {0}")]
    MalformedPayload(String),
    #[error("signal id {0} was already used for a different payload")]
    SignalConflict(String),
}

impl RequestError {
    pub fn reason(&self) -> &'static str {
        match self {
            RequestError::MissingHeader(_) => "missing_header",
            RequestError::MalformedPayload(_) => "malformed_payload",
            RequestError::SignalConflict(_) => "signal_id_conflict",
        }
    }
}

/// Durable store failures. The only class surfaced as 5xx.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("stored record could not be decoded: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Umbrella error flowing through the workflow and out of the HTTP layer.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Replay(#[from] ReplayError),
    #[error(transparent)]
    Idempotency(#[from] IdempotencyError),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    RateLimited(#[from] RateLimitError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("approval token could not be signed: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
}

impl From<rusqlite::Error> for PipelineError {
    fn from(err: rusqlite::Error) -> Self {
        PipelineError::Store(StoreError::Sqlite(err))
    }
}

impl PipelineError {
    /// Stable machine-readable reason code.
    pub fn reason(&self) -> &'static str {
        match self {
            PipelineError::Auth(e) => e.reason(),
            PipelineError::Replay(ReplayError::DuplicateDelivery) => "duplicate_delivery",
            PipelineError::Idempotency(IdempotencyError::KeyReusedWithDifferentPayload) => {
                "idempotency_key_reused"
            }
            PipelineError::Idempotency(IdempotencyError::ReservationConflict) => {
                "reservation_conflict"
            }
            PipelineError::Token(e) => e.reason(),
            PipelineError::RateLimited(_) => "rate_limited",
            PipelineError::Policy(PolicyError::InstrumentNotAllowed { .. }) => {
                "instrument_not_allowed"
            }
            PipelineError::Request(e) => e.reason(),
            PipelineError::Store(_) => "storage_unavailable",
            PipelineError::Signing(_) => "token_signing_failed",
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            PipelineError::Auth(_) => "auth",
            PipelineError::Replay(_) => "replay",
            PipelineError::Idempotency(_) => "idempotency",
            PipelineError::Token(_) => "token",
            PipelineError::RateLimited(_) => "rate_limit",
            PipelineError::Policy(_) => "policy",
            PipelineError::Request(_) => "request",
            PipelineError::Store(_) => "storage",
            PipelineError::Signing(_) => "internal",
        }
    }

    /// Whether resending the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::RateLimited(_)
                | PipelineError::Store(_)
                | PipelineError::Signing(_)
                | PipelineError::Idempotency(IdempotencyError::ReservationConflict)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classes() {
        let limited: PipelineError = RateLimitError {
            retry_after: Duration::from_secs(3),
        }
        .into();
        assert!(limited.is_retryable());
        assert!(PipelineError::from(IdempotencyError::ReservationConflict).is_retryable());

        assert!(!PipelineError::from(AuthError::BadSignature).is_retryable());
        assert!(!PipelineError::from(ReplayError::DuplicateDelivery).is_retryable());
        assert!(
            !PipelineError::from(IdempotencyError::KeyReusedWithDifferentPayload).is_retryable()
        );
    }

    #[test]
    fn reason_codes_are_specific() {
        assert_eq!(
            PipelineError::from(AuthError::ClockSkewExceeded).reason(),
            "clock_skew_exceeded"
        );
        assert_eq!(
            PipelineError::from(TokenError::AlreadyRedeemed).reason(),
            "already_redeemed"
        );
        assert_eq!(
            PipelineError::from(RequestError::MissingHeader("Idempotency-Key")).category(),
            "request"
        );
    }
}
