//! Cutout entity: a detected sub-region of a dataset image.

use annotator_core::types::Timestamp;
use serde::{Deserialize, Serialize};

/// Field holding the set of analysis types applied to a cutout.
pub const ANALYSIS_TYPES_FIELD: &str = "analysis_types";

/// The `project_iterations/{id}/cutouts/{cutoutId}` document.
///
/// Cutouts have no natural key; their identifier is generated at
/// extraction time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cutout {
    pub cutout_id: String,
    pub project_iteration_id: String,
    pub dataset_image_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounding_box: Option<serde_json::Value>,
    /// Set of analysis types already applied. Mutated through the
    /// aggregate mutator's set operations only.
    #[serde(default)]
    pub analysis_types: Vec<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// DTO for creating a new cutout.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateCutout {
    /// Identifier assigned by the producer; `None` asks the repository to
    /// generate one.
    pub cutout_id: Option<String>,
    pub dataset_image_id: String,
    pub bounding_box: Option<serde_json::Value>,
}
