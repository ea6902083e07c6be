//! Entity models.
//!
//! Each submodule contains a serde entity struct mirroring the stored
//! document (optional fields are `Option`, absent-or-null on the wire)
//! and, where creation takes caller input, a `Create*` DTO.

pub mod annotated_image;
pub mod billing;
pub mod cutout;
pub mod cutout_analysis;
pub mod dataset_image;
pub mod processed_event;
pub mod product_image;
pub mod project_iteration;
pub mod usage_cache;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreError;
use crate::store::Document;

/// Serialize a model into a stored document.
pub fn to_document<T: Serialize>(value: &T) -> Result<Document, StoreError> {
    match serde_json::to_value(value)? {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(StoreError::Internal(format!(
            "model serialized to non-object JSON: {other}"
        ))),
    }
}

/// Deserialize a stored document into a model.
pub fn from_document<T: DeserializeOwned>(doc: Document) -> Result<T, StoreError> {
    Ok(serde_json::from_value(serde_json::Value::Object(doc))?)
}
