//! Dataset image entity under an iteration.

use annotator_core::status::DatasetImageStatus;
use annotator_core::types::Timestamp;
use serde::{Deserialize, Serialize};

/// The `project_iterations/{id}/dataset_images/{datasetImageId}` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetImage {
    pub dataset_image_id: String,
    pub project_iteration_id: String,
    pub status: DatasetImageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
    /// Number of cutouts extracted from this image. Absent until the
    /// extraction stage reports; `Some(0)` means extraction found none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cutout_count: Option<i64>,
    #[serde(default)]
    pub annotation_completed: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// DTO for creating a new dataset image.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateDatasetImage {
    pub dataset_image_id: String,
    pub image_path: Option<String>,
}

/// DTO for partial updates. Only `Some` fields are applied.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateDatasetImage {
    pub status: Option<DatasetImageStatus>,
    pub image_path: Option<String>,
    pub cutout_count: Option<i64>,
    pub annotation_completed: Option<bool>,
}
