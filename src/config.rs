//! Gateway Configuration
//!
//! Process settings come from CLI flags / environment (see `main.rs`); producer
//! credentials come from a TOML registry file or the `PRODUCER_SECRETS` env var.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CLOCK_SKEW_SECS: u64 = 300;
pub const DEFAULT_IDEMPOTENCY_TTL_SECS: u64 = 24 * 3600;
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 120;
pub const MIN_TOKEN_TTL_SECS: u64 = 60;
pub const MAX_TOKEN_TTL_SECS: u64 = 300;

/// Tunables for the approval pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Allowed |now - timestamp| for webhook deliveries.
    pub clock_skew_tolerance: Duration,
    /// Lifetime of an idempotency record.
    pub idempotency_ttl: Duration,
    /// Lifetime of an approval token, clamped to 60..=300s.
    pub token_ttl: Duration,
    /// How long an in-flight reservation blocks the key before another
    /// request may take it over.
    pub reservation_ttl: Duration,
    /// How long a duplicate waits for an in-flight request before giving up.
    pub reservation_wait: Duration,
    /// Secret used to sign approval tokens.
    pub token_secret: String,
}

impl PipelineConfig {
    pub fn new(token_secret: impl Into<String>) -> Self {
        Self {
            clock_skew_tolerance: Duration::from_secs(DEFAULT_CLOCK_SKEW_SECS),
            idempotency_ttl: Duration::from_secs(DEFAULT_IDEMPOTENCY_TTL_SECS),
            token_ttl: Duration::from_secs(DEFAULT_TOKEN_TTL_SECS),
            reservation_ttl: Duration::from_secs(30),
            reservation_wait: Duration::from_secs(10),
            token_secret: token_secret.into(),
        }
    }

    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = clamp_token_ttl(ttl);
        self
    }
}

pub fn clamp_token_ttl(ttl: Duration) -> Duration {
    Duration::from_secs(ttl.as_secs().clamp(MIN_TOKEN_TTL_SECS, MAX_TOKEN_TTL_SECS))
}

/// A registered signal producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    pub producer_id: String,
    /// Shared HMAC secret (raw string bytes).
    pub secret: String,
    /// Instruments this producer may send. Empty means unrestricted.
    #[serde(default)]
    pub allowed_instruments: Vec<String>,
    /// Requests per rate-limit window; falls back to the gateway default.
    #[serde(default)]
    pub rate_limit: Option<u32>,
    /// Device used when a delivery carries no `X-Device-Fingerprint`.
    #[serde(default)]
    pub default_device: Option<String>,
}

impl ProducerConfig {
    pub fn new(producer_id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            producer_id: producer_id.into(),
            secret: secret.into(),
            allowed_instruments: Vec::new(),
            rate_limit: None,
            default_device: None,
        }
    }

    pub fn allows_instrument(&self, instrument: &str) -> bool {
        self.allowed_instruments.is_empty()
            || self
                .allowed_instruments
                .iter()
                .any(|i| i.eq_ignore_ascii_case(instrument))
    }
}

#[derive(Debug, Deserialize)]
struct ProducersFile {
    #[serde(default, rename = "producer")]
    producers: Vec<ProducerConfig>,
}

/// Lookup table of producers by id.
#[derive(Debug, Clone, Default)]
pub struct ProducerRegistry {
    producers: HashMap<String, ProducerConfig>,
}

impl ProducerRegistry {
    pub fn new(producers: impl IntoIterator<Item = ProducerConfig>) -> Self {
        Self {
            producers: producers
                .into_iter()
                .map(|p| (p.producer_id.clone(), p))
                .collect(),
        }
    }

    /// Parse a registry of `[[producer]]` tables.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let file: ProducersFile = toml::from_str(raw).context("Invalid producers file")?;
        for p in &file.producers {
            validate_producer(p)?;
        }
        Ok(Self::new(file.producers))
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read producers file {}", path.display()))?;
        Self::from_toml_str(&raw)
    }

    /// Parse `id:secret,id2:secret2`.
    pub fn from_env_spec(spec: &str) -> Result<Self> {
        let mut producers = Vec::new();
        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (id, secret) = entry
                .split_once(':')
                .with_context(|| format!("Invalid producer entry {:?}, expected id:secret", entry))?;
            let producer = ProducerConfig::new(id.trim(), secret.trim());
            validate_producer(&producer)?;
            producers.push(producer);
        }
        Ok(Self::new(producers))
    }

    pub fn get(&self, producer_id: &str) -> Option<&ProducerConfig> {
        self.producers.get(producer_id)
    }

    pub fn len(&self) -> usize {
        self.producers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }

    /// Per-producer rate-limit overrides.
    pub fn rate_limit_overrides(&self) -> HashMap<String, u32> {
        self.producers
            .values()
            .filter_map(|p| p.rate_limit.map(|q| (p.producer_id.clone(), q)))
            .collect()
    }
}

pub const MIN_PRODUCER_SECRET_LEN: usize = 16;

/// Checks shared by every registry source.
///
/// `:` is reserved in producer ids; producer-assigned signal ids are stored as
/// `producer_id:signal_id`.
fn validate_producer(p: &ProducerConfig) -> Result<()> {
    if p.producer_id.trim().is_empty() {
        bail!("producer with empty producer_id");
    }
    if p.producer_id.contains(':') {
        bail!("producer_id {:?} must not contain ':'", p.producer_id);
    }
    if p.secret.len() < MIN_PRODUCER_SECRET_LEN {
        bail!(
            "secret for producer {} is shorter than {} bytes",
            p.producer_id,
            MIN_PRODUCER_SECRET_LEN
        );
    }
    Ok(())
}
