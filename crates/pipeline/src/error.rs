//! Pipeline errors and processing outcomes.

use annotator_db::StoreError;

/// Result of processing one delivered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Side effects were applied by this call.
    Applied,
    /// The idempotency ledger already held the event; nothing changed.
    AlreadyProcessed,
    /// The iteration is in a terminal state; the event was acknowledged
    /// without applying anything.
    IgnoredTerminal,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("event validation failed: {0}")]
    Validation(String),

    #[error("unknown project iteration: {0}")]
    UnknownIteration(String),
}

impl PipelineError {
    /// Acknowledge policy for the delivery layer.
    ///
    /// Transient store failures (conflict after the retry budget,
    /// identifier collisions) must not be acknowledged so the transport
    /// redelivers; the idempotency guard makes redelivery safe.
    /// Everything else is permanent: acknowledge, and record the failure
    /// on the iteration instead of redelivering forever.
    pub fn should_redeliver(&self) -> bool {
        match self {
            PipelineError::Store(e) => e.is_retryable(),
            PipelineError::Validation(_) | PipelineError::UnknownIteration(_) => false,
        }
    }
}
