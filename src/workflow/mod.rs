//! Approval Workflow
//! Mission: Turn a signed webhook delivery into a persisted signal and a
//! device-bound approval token, exactly once per idempotency key
//!
//! Stage order:
//! `Received -> SignatureVerified -> ReplayChecked -> Persisted -> Approved -> TokenIssued`
//!
//! Any failure ends in a [`Rejection`] carrying the last stage reached. The
//! policy hook runs before the append so a denied signal never enters the
//! consumer log; the whole persist/issue step runs under the idempotency key.

pub mod policy;

pub use policy::{ApprovalPolicy, InstrumentAllowList};

use crate::auth::{DeviceBinding, SignatureVerifier, TokenIssuer};
use crate::clock::SharedClock;
use crate::config::{PipelineConfig, ProducerRegistry};
use crate::error::{AuthError, PipelineError, RequestError, StoreError};
use crate::middleware::RateLimiter;
use crate::models::{
    request_fingerprint, ApprovalReceipt, Signal, SignalDraft, SignalEnvelope,
};
use crate::storage::{Database, IdempotencyStore, ReplayGuard, SignalRepository};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const PRODUCER_HEADER: &str = "X-Producer-Id";
pub const SIGNATURE_HEADER: &str = "X-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Timestamp";
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";
pub const DEVICE_HEADER: &str = "X-Device-Fingerprint";
pub const AUTHORIZATION_HEADER: &str = "Authorization";

const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

/// Namespace for server-derived signal ids.
const SIGNAL_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2d0e_8a4b_5c3d_9e7f_1a2b_3c4d_5e6f);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowState {
    Received,
    SignatureVerified,
    ReplayChecked,
    Persisted,
    Approved,
    TokenIssued,
}

impl WorkflowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Received => "received",
            WorkflowState::SignatureVerified => "signature_verified",
            WorkflowState::ReplayChecked => "replay_checked",
            WorkflowState::Persisted => "persisted",
            WorkflowState::Approved => "approved",
            WorkflowState::TokenIssued => "token_issued",
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure of a delivery.
#[derive(Debug, thiserror::Error)]
#[error("rejected after {stage}: {error}")]
pub struct Rejection {
    /// Last stage the delivery reached before failing.
    pub stage: WorkflowState,
    #[source]
    pub error: PipelineError,
}

/// A webhook delivery as received, headers not yet interpreted.
#[derive(Debug, Clone, Default)]
pub struct InboundWebhook {
    pub producer_id: Option<String>,
    pub signature: Option<String>,
    pub timestamp: Option<String>,
    pub idempotency_key: Option<String>,
    pub device_fingerprint: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalOutcome {
    pub receipt: ApprovalReceipt,
    /// True when the receipt was served from the idempotency store.
    pub replayed: bool,
}

/// Rows removed by one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub replay_entries: usize,
    pub idempotency_records: usize,
    pub rate_windows: usize,
}

pub struct ApprovalWorkflow {
    producers: ProducerRegistry,
    verifier: SignatureVerifier,
    rate_limiter: RateLimiter,
    replay: ReplayGuard,
    idempotency: IdempotencyStore,
    signals: SignalRepository,
    tokens: TokenIssuer,
    policy: Arc<dyn ApprovalPolicy>,
    clock: SharedClock,
}

impl ApprovalWorkflow {
    pub fn new(
        db: Database,
        clock: SharedClock,
        config: &PipelineConfig,
        producers: ProducerRegistry,
        rate_limiter: RateLimiter,
    ) -> Self {
        let signals = SignalRepository::new(db.clone());
        let tokens = TokenIssuer::new(
            db.clone(),
            signals.clone(),
            DeviceBinding::new(db.clone()),
            clock.clone(),
            &config.token_secret,
            config.token_ttl,
        );

        Self {
            producers,
            verifier: SignatureVerifier::new(clock.clone(), config.clock_skew_tolerance),
            rate_limiter,
            replay: ReplayGuard::new(db.clone(), clock.clone(), config.clock_skew_tolerance),
            idempotency: IdempotencyStore::new(
                db,
                clock.clone(),
                config.idempotency_ttl,
                config.reservation_ttl,
                config.reservation_wait,
            ),
            signals,
            tokens,
            policy: Arc::new(InstrumentAllowList),
            clock,
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn ApprovalPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn signals(&self) -> &SignalRepository {
        &self.signals
    }

    pub fn tokens(&self) -> &TokenIssuer {
        &self.tokens
    }

    pub fn producers(&self) -> &ProducerRegistry {
        &self.producers
    }

    /// Run a delivery through the pipeline.
    pub async fn process(&self, inbound: InboundWebhook) -> Result<ApprovalOutcome, Rejection> {
        let mut stage = WorkflowState::Received;

        match self.run(&inbound, &mut stage).await {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                let producer = inbound.producer_id.as_deref().unwrap_or("-");
                if error.is_retryable() {
                    warn!(
                        producer_id = producer,
                        stage = %stage,
                        reason = error.reason(),
                        "Delivery rejected (retryable): {}",
                        error
                    );
                } else {
                    info!(
                        producer_id = producer,
                        stage = %stage,
                        reason = error.reason(),
                        "Delivery rejected: {}",
                        error
                    );
                }
                Err(Rejection { stage, error })
            }
        }
    }

    async fn run(
        &self,
        inbound: &InboundWebhook,
        stage: &mut WorkflowState,
    ) -> Result<ApprovalOutcome, PipelineError> {
        let producer_id = non_empty(inbound.producer_id.as_deref())
            .ok_or(RequestError::MissingHeader(PRODUCER_HEADER))?;
        let producer = self
            .producers
            .get(producer_id)
            .ok_or(AuthError::UnknownProducer)?;

        let delivery = self.verifier.verify(
            &inbound.body,
            inbound.signature.as_deref(),
            producer.secret.as_bytes(),
            inbound.timestamp.as_deref(),
        )?;
        advance(stage, WorkflowState::SignatureVerified, producer_id);

        self.rate_limiter.check(producer_id)?;

        self.replay.check_and_record(
            &ReplayGuard::signature_hash(&delivery.mac),
            delivery.timestamp,
        )?;
        advance(stage, WorkflowState::ReplayChecked, producer_id);

        let idempotency_key = non_empty(inbound.idempotency_key.as_deref())
            .ok_or(RequestError::MissingHeader(IDEMPOTENCY_HEADER))?;
        if idempotency_key.len() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(RequestError::MalformedPayload(
                "idempotency key longer than 255 characters".to_string(),
            )
            .into());
        }

        let envelope = SignalEnvelope::decode(&inbound.body)?;
        let device = non_empty(inbound.device_fingerprint.as_deref())
            .or(producer.default_device.as_deref())
            .ok_or(RequestError::MissingHeader(DEVICE_HEADER))?;
        let fingerprint = request_fingerprint(&inbound.body, device)?;

        let signal_id = match envelope.signal_id.as_deref() {
            Some(supplied) => scoped_signal_id(producer_id, supplied),
            None => derive_signal_id(producer_id, idempotency_key, &fingerprint),
        };

        let draft = SignalDraft {
            signal_id,
            producer_id: producer_id.to_string(),
            instrument: envelope.instrument,
            side: envelope.side,
            order: envelope.order,
            payload: inbound.body.clone(),
            request_fingerprint: fingerprint.clone(),
            received_at: self.clock.now(),
        };

        let resolved = self
            .idempotency
            .get_or_compute(producer_id, idempotency_key, &fingerprint, || {
                self.policy.authorize(producer, &draft)?;
                let signal = self.signals.append(draft)?;
                advance(stage, WorkflowState::Persisted, producer_id);
                advance(stage, WorkflowState::Approved, producer_id);

                let token = self.tokens.issue(&signal.signal_id, device)?;
                Ok::<_, PipelineError>(ApprovalReceipt {
                    signal_id: signal.signal_id,
                    cursor: signal.cursor,
                    approval_token: token.signature,
                    expires_at: token.expires_at,
                })
            })
            .await?;
        advance(stage, WorkflowState::TokenIssued, producer_id);

        info!(
            producer_id,
            signal_id = %resolved.value.signal_id,
            cursor = resolved.value.cursor,
            replayed = resolved.replayed,
            "Signal approved"
        );

        Ok(ApprovalOutcome {
            receipt: resolved.value,
            replayed: resolved.replayed,
        })
    }

    /// Consumer path: redeem an approval token from a device.
    pub fn redeem(
        &self,
        token: Option<&str>,
        device_fingerprint: Option<&str>,
    ) -> Result<Signal, PipelineError> {
        let token = non_empty(token).ok_or(RequestError::MissingHeader(AUTHORIZATION_HEADER))?;
        let device =
            non_empty(device_fingerprint).ok_or(RequestError::MissingHeader(DEVICE_HEADER))?;
        self.tokens.redeem(token, device)
    }

    /// Ordered page of a producer's signals starting at `from_cursor`.
    pub fn read_signals(
        &self,
        producer_id: &str,
        from_cursor: u64,
        limit: usize,
    ) -> Result<Vec<Signal>, StoreError> {
        self.signals.read_from(producer_id, from_cursor, limit)
    }

    /// Purge expired replay entries, idempotency records and idle rate windows.
    pub fn sweep(&self) -> Result<SweepReport, StoreError> {
        Ok(SweepReport {
            replay_entries: self.replay.purge_expired()?,
            idempotency_records: self.idempotency.purge_expired()?,
            rate_windows: self.rate_limiter.cleanup(),
        })
    }
}

fn advance(stage: &mut WorkflowState, next: WorkflowState, producer_id: &str) {
    debug!(producer_id, from = %stage, to = %next, "Workflow transition");
    *stage = next;
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Stable id for a signal whose producer did not supply one.
/// Store a producer-assigned id under its producer so two producers may pick the
/// same id. Producer ids never contain `:`.
pub fn scoped_signal_id(producer_id: &str, supplied: &str) -> String {
    format!("{}:{}", producer_id, supplied.trim())
}

pub fn derive_signal_id(producer_id: &str, idempotency_key: &str, fingerprint: &str) -> String {
    let name = format!("{}\n{}\n{}", producer_id, idempotency_key, fingerprint);
    Uuid::new_v5(&SIGNAL_ID_NAMESPACE, name.as_bytes()).to_string()
}
