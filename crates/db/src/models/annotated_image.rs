//! Annotated image summary and its cutout annotations.

use annotator_core::types::Timestamp;
use serde::{Deserialize, Serialize};

/// The `project_iterations/{id}/annotated_images/{datasetImageId}`
/// summary document.
///
/// `annotations_count` is denormalized from the `cutouts` subcollection
/// and equals the number of children at every quiescent point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotatedImageSummary {
    pub dataset_image_id: String,
    pub project_iteration_id: String,
    #[serde(default)]
    pub annotations_count: i64,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// The `.../annotated_images/{datasetImageId}/cutouts/{cutoutId}`
/// document: one annotation per (dataset image, cutout).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CutoutAnnotation {
    pub cutout_id: String,
    pub dataset_image_id: String,
    pub project_iteration_id: String,
    pub product_image_id: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotated_image_path: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// DTO for upserting a cutout annotation.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateCutoutAnnotation {
    pub cutout_id: String,
    pub product_image_id: String,
    pub label: String,
    pub annotated_image_path: Option<String>,
}
