//! Cutout analysis entity: one document per (cutout, analysis type) pair.

use annotator_core::identity;
use annotator_core::types::Timestamp;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// The `project_iterations/{id}/cutout_analyses/{cutoutId}__{analysisType}`
/// document. Uniqueness of the pair is enforced by the identifier itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CutoutAnalysis {
    pub cutout_id: String,
    pub analysis_type: String,
    pub project_iteration_id: String,
    /// Denormalized for the scoped count query.
    pub dataset_image_id: String,
    #[serde(default)]
    pub result: serde_json::Value,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl CutoutAnalysis {
    /// Derived document identifier for a (cutout, analysis type) pair.
    pub fn doc_id(cutout_id: &str, analysis_type: &str) -> Result<String, StoreError> {
        Ok(identity::derive(&[cutout_id, analysis_type])?)
    }
}
