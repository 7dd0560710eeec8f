//! Business-rule hook run before a signal is persisted.

use crate::config::ProducerConfig;
use crate::error::PolicyError;
use crate::models::SignalDraft;

/// Decides whether an authenticated signal may be approved.
pub trait ApprovalPolicy: Send + Sync {
    fn authorize(&self, producer: &ProducerConfig, draft: &SignalDraft) -> Result<(), PolicyError>;
}

/// Allows only the instruments listed in the producer's `allowed_instruments`.
/// An empty list allows every instrument.
#[derive(Debug, Clone, Copy, Default)]
pub struct InstrumentAllowList;

impl ApprovalPolicy for InstrumentAllowList {
    fn authorize(&self, producer: &ProducerConfig, draft: &SignalDraft) -> Result<(), PolicyError> {
        if producer.allows_instrument(&draft.instrument) {
            Ok(())
        } else {
            Err(PolicyError::InstrumentNotAllowed {
                instrument: draft.instrument.clone(),
            })
        }
    }
}
