//! Idempotency ledger entry.

use annotator_core::types::Timestamp;
use serde::{Deserialize, Serialize};

/// The `project_iterations/{id}/processed_events/{derivedKey}` document.
///
/// Existence of the entry means the event's side effects have been
/// durably applied; the entry is written in the same transaction as
/// those effects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedEvent {
    pub event_type: String,
    pub project_iteration_id: String,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_image_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_image_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cutout_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub processed_at: Timestamp,
}

impl ProcessedEvent {
    /// A minimal ledger entry; event-specific fields are filled by the
    /// caller where known.
    pub fn new(
        event_type: impl Into<String>,
        project_iteration_id: impl Into<String>,
        correlation_id: impl Into<String>,
        processed_at: Timestamp,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            project_iteration_id: project_iteration_id.into(),
            correlation_id: correlation_id.into(),
            image_type: None,
            product_image_id: None,
            dataset_image_id: None,
            cutout_id: None,
            analysis_type: None,
            label: None,
            processed_at,
        }
    }
}
