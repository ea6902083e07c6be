//! Project iteration aggregate root.

use annotator_core::status::IterationStatus;
use annotator_core::types::Timestamp;
use serde::{Deserialize, Serialize};

/// Counter field names, used with the aggregate mutator.
pub mod counters {
    pub const TOTAL_PRODUCT_IMAGES: &str = "total_product_images";
    pub const TOTAL_DATASET_IMAGES: &str = "total_dataset_images";
    pub const PRODUCT_IMAGES_DOWNLOADED: &str = "product_images_downloaded";
    pub const DATASET_IMAGES_DOWNLOADED: &str = "dataset_images_downloaded";
    pub const DATASET_IMAGES_EXTRACTED: &str = "dataset_images_extracted";
    pub const CUTOUTS_EXTRACTED: &str = "cutouts_extracted";
    pub const PRODUCT_IMAGES_ANALYZED: &str = "product_images_analyzed";
    pub const CUTOUTS_ANALYZED: &str = "cutouts_analyzed";
    pub const DATASET_IMAGES_ANNOTATED: &str = "dataset_images_annotated";
    pub const ANNOTATIONS_CREATED: &str = "annotations_created";
    pub const EVENTS_PROCESSED: &str = "events_processed";
    pub const FAILURES_RECORDED: &str = "failures_recorded";
}

/// The `project_iterations/{id}` document.
///
/// Owns the lifecycle status and twelve non-negative counters. The two
/// totals are written once at creation; every other counter changes only
/// through transactional increments, never blind overwrite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectIteration {
    pub project_iteration_id: String,
    pub status: IterationStatus,
    /// Analysis types every product image and cutout must pass through.
    pub analysis_types: Vec<String>,

    pub total_product_images: i64,
    pub total_dataset_images: i64,
    #[serde(default)]
    pub product_images_downloaded: i64,
    #[serde(default)]
    pub dataset_images_downloaded: i64,
    #[serde(default)]
    pub dataset_images_extracted: i64,
    #[serde(default)]
    pub cutouts_extracted: i64,
    #[serde(default)]
    pub product_images_analyzed: i64,
    #[serde(default)]
    pub cutouts_analyzed: i64,
    #[serde(default)]
    pub dataset_images_annotated: i64,
    #[serde(default)]
    pub annotations_created: i64,
    #[serde(default)]
    pub events_processed: i64,
    #[serde(default)]
    pub failures_recorded: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl ProjectIteration {
    /// Number of configured analysis passes.
    fn analysis_pass_count(&self) -> i64 {
        self.analysis_types.len() as i64
    }

    /// All product and dataset images downloaded.
    pub fn downloads_complete(&self) -> bool {
        self.product_images_downloaded == self.total_product_images
            && self.dataset_images_downloaded == self.total_dataset_images
    }

    /// Every dataset image has reported its cutouts.
    pub fn extraction_complete(&self) -> bool {
        self.dataset_images_extracted == self.total_dataset_images
    }

    /// Every (product image, analysis type) and (cutout, analysis type)
    /// pair has an analysis. `cutouts_extracted` is final before the
    /// analyzing stage begins, so the comparison is stable.
    pub fn analysis_complete(&self) -> bool {
        let k = self.analysis_pass_count();
        self.product_images_analyzed == self.total_product_images * k
            && self.cutouts_analyzed == self.cutouts_extracted * k
    }

    /// Every dataset image has been annotated.
    pub fn annotation_complete(&self) -> bool {
        self.dataset_images_annotated == self.total_dataset_images
    }
}

/// DTO for creating a new project iteration.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateProjectIteration {
    pub analysis_types: Vec<String>,
    pub total_product_images: i64,
    pub total_dataset_images: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn iteration() -> ProjectIteration {
        ProjectIteration {
            project_iteration_id: "it-1".into(),
            status: IterationStatus::Downloading,
            analysis_types: vec!["initial".into(), "detailed".into()],
            total_product_images: 1,
            total_dataset_images: 3,
            product_images_downloaded: 0,
            dataset_images_downloaded: 0,
            dataset_images_extracted: 0,
            cutouts_extracted: 0,
            product_images_analyzed: 0,
            cutouts_analyzed: 0,
            dataset_images_annotated: 0,
            annotations_created: 0,
            events_processed: 0,
            failures_recorded: 0,
            failure_reason: None,
            expires_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn downloads_complete_requires_both_kinds() {
        let mut it = iteration();
        it.product_images_downloaded = 1;
        assert!(!it.downloads_complete());
        it.dataset_images_downloaded = 3;
        assert!(it.downloads_complete());
    }

    #[test]
    fn analysis_complete_scales_with_analysis_types() {
        let mut it = iteration();
        it.cutouts_extracted = 4;
        it.product_images_analyzed = 2;
        it.cutouts_analyzed = 8;
        assert!(it.analysis_complete());
        it.cutouts_analyzed = 7;
        assert!(!it.analysis_complete());
    }

    #[test]
    fn counters_default_to_zero_on_missing_fields() {
        let doc = serde_json::json!({
            "project_iteration_id": "it-1",
            "status": "downloading",
            "analysis_types": ["initial"],
            "total_product_images": 1,
            "total_dataset_images": 2,
            "created_at": Utc::now(),
            "updated_at": Utc::now(),
        });
        let it: ProjectIteration = serde_json::from_value(doc).unwrap();
        assert_eq!(it.dataset_images_downloaded, 0);
        assert_eq!(it.events_processed, 0);
    }
}
