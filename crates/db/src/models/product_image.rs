//! Product image entity under an iteration.

use std::collections::BTreeMap;

use annotator_core::status::ProductImageStatus;
use annotator_core::types::Timestamp;
use serde::{Deserialize, Serialize};

/// The `project_iterations/{id}/product_images/{productImageId}` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductImage {
    pub product_image_id: String,
    pub project_iteration_id: String,
    pub status: ProductImageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
    /// Product label assigned at download time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Analysis results keyed by analysis type.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub analysis_results: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_error: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// DTO for creating a new product image.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateProductImage {
    pub product_image_id: String,
    pub image_path: Option<String>,
    pub label: Option<String>,
}

/// DTO for partial updates. Only `Some` fields are applied.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateProductImage {
    pub status: Option<ProductImageStatus>,
    pub image_path: Option<String>,
    pub label: Option<String>,
    pub analysis_error: Option<String>,
}
