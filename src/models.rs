//! Domain models for the signal approval gateway.

use crate::error::RequestError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "buy" => Some(Side::Buy),
            "sell" => Some(Side::Sell),
            _ => None,
        }
    }
}

/// Order shape requested by the producer. Internally tagged on `type`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrderSpec {
    #[default]
    Market,
    Limit {
        price: f64,
    },
    Stop {
        price: f64,
    },
}

impl OrderSpec {
    fn validate(&self) -> Result<(), RequestError> {
        match self {
            OrderSpec::Market => Ok(()),
            OrderSpec::Limit { price } | OrderSpec::Stop { price } => {
                if price.is_finite() && *price > 0.0 {
                    Ok(())
                } else {
                    Err(RequestError::MalformedPayload(format!(
                        "order price must be positive, got {}",
                        price
                    )))
                }
            }
        }
    }
}

/// Producer JSON document, decoded only after the raw bytes were authenticated.
///
/// Unknown fields are ignored; the raw body is persisted untouched.
#[derive(Debug, Clone, Deserialize)]
pub struct SignalEnvelope {
    #[serde(default)]
    pub signal_id: Option<String>,
    pub instrument: String,
    pub side: Side,
    #[serde(default)]
    pub order: OrderSpec,
}

const MAX_INSTRUMENT_LEN: usize = 32;
const MAX_SIGNAL_ID_LEN: usize = 128;

impl SignalEnvelope {
    /// Decode and validate an authenticated body.
    pub fn decode(raw_body: &[u8]) -> Result<Self, RequestError> {
        let mut envelope: SignalEnvelope = serde_json::from_slice(raw_body)
            .map_err(|e| RequestError::MalformedPayload(e.to_string()))?;

        let instrument = envelope.instrument.trim();
        if instrument.is_empty()
            || instrument.len() > MAX_INSTRUMENT_LEN
            || !instrument
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(RequestError::MalformedPayload(format!(
                "invalid instrument {:?}",
                envelope.instrument
            )));
        }
        envelope.instrument = instrument.to_ascii_uppercase();

        if let Some(id) = &envelope.signal_id {
            if id.trim().is_empty() || id.len() > MAX_SIGNAL_ID_LEN {
                return Err(RequestError::MalformedPayload(
                    "signal_id must be 1..=128 characters".to_string(),
                ));
            }
        }

        envelope.order.validate()?;
        Ok(envelope)
    }
}

/// Hash of the normalized request, used to tell duplicates from key reuse.
///
/// Object keys are sorted by re-serializing through `serde_json::Value`, so
/// producers that reorder keys between retries still match.
pub fn request_fingerprint(raw_body: &[u8], device_fingerprint: &str) -> Result<String, RequestError> {
    let value: serde_json::Value = serde_json::from_slice(raw_body)
        .map_err(|e| RequestError::MalformedPayload(e.to_string()))?;
    let canonical = serde_json::to_vec(&value)
        .map_err(|e| RequestError::MalformedPayload(e.to_string()))?;

    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    hasher.update([0u8]);
    hasher.update(device_fingerprint.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Signal ready to be appended; the repository assigns the cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalDraft {
    pub signal_id: String,
    pub producer_id: String,
    pub instrument: String,
    pub side: Side,
    pub order: OrderSpec,
    pub payload: Vec<u8>,
    pub request_fingerprint: String,
    pub received_at: DateTime<Utc>,
}

/// A persisted signal. Immutable once appended.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub signal_id: String,
    pub producer_id: String,
    pub instrument: String,
    pub side: Side,
    pub order: OrderSpec,
    pub payload: Vec<u8>,
    pub request_fingerprint: String,
    pub received_at: DateTime<Utc>,
    pub cursor: u64,
}

/// Wire view of a signal for the execution engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalView {
    pub signal_id: String,
    pub producer_id: String,
    pub instrument: String,
    pub side: Side,
    pub order: OrderSpec,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
    pub cursor: u64,
}

impl SignalView {
    pub fn from_signal(signal: &Signal) -> Self {
        // Payload bytes were validated as JSON at ingestion.
        let payload = serde_json::from_slice(&signal.payload).unwrap_or(serde_json::Value::Null);
        Self {
            signal_id: signal.signal_id.clone(),
            producer_id: signal.producer_id.clone(),
            instrument: signal.instrument.clone(),
            side: signal.side,
            order: signal.order.clone(),
            payload,
            received_at: signal.received_at,
            cursor: signal.cursor,
        }
    }
}

/// Short-lived, single-use credential for executing one signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalToken {
    pub token_id: String,
    pub signal_id: String,
    pub device_fingerprint: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Compact signed JWT carrying the fields above.
    pub signature: String,
}

/// Result stored under an idempotency key and returned to the producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalReceipt {
    pub signal_id: String,
    pub cursor: u64,
    pub approval_token: String,
    pub expires_at: DateTime<Utc>,
}
