//! Flow-level error taxonomy.
//!
//! Every fault that crosses a module boundary is folded into one of four
//! categories so that the message flows can map it to a single log line
//! plus one user-visible fallback. Library code propagates these with `?`
//! and never swallows them.

use crate::provider::ProviderError;

/// Errors surfaced by the session store, retrieval pipeline, gateway and
/// feedback aggregator.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    /// Gateway timeout, connection refusal or a non-success remote status.
    #[error("Transient remote failure: {0}")]
    TransientRemote(String),

    /// Database write/read failed or a transaction rolled back.
    #[error("Persistence failure: {0}")]
    Persistence(String),

    /// Malformed inbound payload (empty quoted text, unrecognized reaction).
    #[error("Validation failure: {0}")]
    Validation(String),

    /// A referenced record (alert, analysis, anomaly) no longer exists.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl FlowError {
    /// True for faults worth retrying or re-reporting later.
    pub fn is_transient(&self) -> bool {
        matches!(self, FlowError::TransientRemote(_))
    }
}

impl From<rusqlite::Error> for FlowError {
    fn from(e: rusqlite::Error) -> Self {
        FlowError::Persistence(e.to_string())
    }
}

impl From<reqwest::Error> for FlowError {
    fn from(e: reqwest::Error) -> Self {
        FlowError::TransientRemote(e.to_string())
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(e: serde_json::Error) -> Self {
        FlowError::Validation(e.to_string())
    }
}

impl From<ProviderError> for FlowError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::InvalidRecipient(r) => {
                FlowError::Validation(format!("invalid recipient: {r}"))
            }
            other => FlowError::TransientRemote(other.to_string()),
        }
    }
}
