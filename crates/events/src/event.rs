//! Event records consumed from the delivery transport.
//!
//! Events are delivered at least once; each variant exposes the ordered
//! natural-key parts its idempotency ledger identifier derives from, so
//! redelivery addresses the same ledger document.

use annotator_core::status::IterationStatus;
use annotator_core::types::Timestamp;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A domain event plus its routing metadata, as read off the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub project_iteration_id: String,
    pub correlation_id: String,
    pub occurred_at: Timestamp,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl EventEnvelope {
    /// Ordered identifier parts for the idempotency ledger entry.
    ///
    /// A missing natural-key field yields an empty part, which the
    /// identity deriver rejects, so malformed events never reach the
    /// ledger.
    pub fn idempotency_parts(&self) -> Vec<String> {
        match &self.payload {
            EventPayload::StartProjectIteration { .. } => vec![
                "start_project_iteration".into(),
                self.project_iteration_id.clone(),
            ],
            EventPayload::ImageDownloaded {
                image_type: ImageKind::Product,
                product_image_id,
                ..
            } => vec![
                "image_downloaded".into(),
                "product".into(),
                product_image_id.clone().unwrap_or_default(),
            ],
            EventPayload::ImageDownloaded {
                image_type: ImageKind::Dataset,
                dataset_image_id,
                ..
            } => vec![
                "image_downloaded".into(),
                "dataset".into(),
                dataset_image_id.clone().unwrap_or_default(),
            ],
            EventPayload::CutoutsReady { dataset_image_id, .. } => {
                vec!["cutouts_ready".into(), dataset_image_id.clone()]
            }
            EventPayload::ProductImageAnalyzed {
                product_image_id,
                analysis_type,
                ..
            } => vec![
                "product_image_analyzed".into(),
                product_image_id.clone(),
                analysis_type.clone(),
            ],
            EventPayload::DatasetImageAnalyzed {
                cutout_id,
                analysis_type,
                ..
            } => vec![
                "dataset_image_analyzed".into(),
                cutout_id.clone(),
                analysis_type.clone(),
            ],
            EventPayload::AnnotateDataset { dataset_image_id, .. } => {
                vec!["annotate_dataset".into(), dataset_image_id.clone()]
            }
            EventPayload::AnnotationCreated { dataset_image_id, .. } => {
                vec!["annotation_created".into(), dataset_image_id.clone()]
            }
            // No natural key: fall back to one ledger entry per iteration.
            EventPayload::IterationFailed { .. } => vec![
                "iteration_failed".into(),
                self.project_iteration_id.clone(),
            ],
        }
    }

    /// Wire name of the event type.
    pub fn event_type(&self) -> &'static str {
        match &self.payload {
            EventPayload::StartProjectIteration { .. } => "start_project_iteration",
            EventPayload::ImageDownloaded { .. } => "image_downloaded",
            EventPayload::CutoutsReady { .. } => "cutouts_ready",
            EventPayload::ProductImageAnalyzed { .. } => "product_image_analyzed",
            EventPayload::DatasetImageAnalyzed { .. } => "dataset_image_analyzed",
            EventPayload::AnnotateDataset { .. } => "annotate_dataset",
            EventPayload::AnnotationCreated { .. } => "annotation_created",
            EventPayload::IterationFailed { .. } => "iteration_failed",
        }
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Which kind of image an `image_downloaded` event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageKind {
    Product,
    Dataset,
}

/// Product image declared by `start_project_iteration`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProductImage {
    pub product_image_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Dataset image declared by `start_project_iteration`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDatasetImage {
    pub dataset_image_id: String,
}

/// One extracted cutout in a `cutouts_ready` event. The extractor
/// assigns the identifier, so redelivered events re-create the same
/// documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CutoutSpec {
    pub cutout_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounding_box: Option<serde_json::Value>,
}

/// One annotation in an `annotate_dataset` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotationSpec {
    pub cutout_id: String,
    pub product_image_id: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotated_image_path: Option<String>,
}

/// Event-specific payload, tagged by `event_type` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventPayload {
    StartProjectIteration {
        product_image: NewProductImage,
        dataset_images: Vec<NewDatasetImage>,
        analysis_types: Vec<String>,
    },
    ImageDownloaded {
        image_type: ImageKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        product_image_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dataset_image_id: Option<String>,
        image_path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    CutoutsReady {
        dataset_image_id: String,
        cutout_count: i64,
        cutouts: Vec<CutoutSpec>,
    },
    ProductImageAnalyzed {
        product_image_id: String,
        analysis_type: String,
        analysis_result: serde_json::Value,
    },
    DatasetImageAnalyzed {
        dataset_image_id: String,
        cutout_id: String,
        analysis_type: String,
        analysis_result: serde_json::Value,
    },
    AnnotateDataset {
        dataset_image_id: String,
        annotations: Vec<AnnotationSpec>,
    },
    AnnotationCreated {
        dataset_image_id: String,
        cutout_id: String,
        product_image_id: String,
        label: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        annotated_image_path: Option<String>,
    },
    IterationFailed {
        service_name: String,
        error_message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_type: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Callback events
// ---------------------------------------------------------------------------

/// Outbound status-reporting event emitted after aggregate changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "callback_type", rename_all = "snake_case")]
pub enum CallbackEvent {
    ProjectStatusChanged {
        project_iteration_id: String,
        status: IterationStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure_reason: Option<String>,
    },
    ProjectProgressUpdated {
        project_iteration_id: String,
        /// Snapshot of the iteration's counters.
        progress: serde_json::Value,
    },
    AnnotationCreated {
        project_iteration_id: String,
        dataset_image_id: String,
        annotations_count: i64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn envelope(payload: EventPayload) -> EventEnvelope {
        EventEnvelope {
            project_iteration_id: "it-1".into(),
            correlation_id: "corr-1".into(),
            occurred_at: Utc::now(),
            payload,
        }
    }

    #[test]
    fn wire_format_is_flat_and_tagged() {
        let event = envelope(EventPayload::CutoutsReady {
            dataset_image_id: "ds-1".into(),
            cutout_count: 1,
            cutouts: vec![CutoutSpec {
                cutout_id: "c-1".into(),
                bounding_box: None,
            }],
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "cutouts_ready");
        assert_eq!(json["project_iteration_id"], "it-1");
        assert_eq!(json["dataset_image_id"], "ds-1");

        let back: EventEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(back.event_type(), "cutouts_ready");
    }

    #[test]
    fn idempotency_parts_distinguish_image_kinds() {
        let product = envelope(EventPayload::ImageDownloaded {
            image_type: ImageKind::Product,
            product_image_id: Some("p-1".into()),
            dataset_image_id: None,
            image_path: "/tmp/p.png".into(),
            label: Some("widget".into()),
        });
        let dataset = envelope(EventPayload::ImageDownloaded {
            image_type: ImageKind::Dataset,
            product_image_id: None,
            dataset_image_id: Some("ds-1".into()),
            image_path: "/tmp/d.png".into(),
            label: None,
        });
        assert_eq!(
            product.idempotency_parts(),
            vec!["image_downloaded", "product", "p-1"]
        );
        assert_eq!(
            dataset.idempotency_parts(),
            vec!["image_downloaded", "dataset", "ds-1"]
        );
    }

    #[test]
    fn analysis_parts_include_the_analysis_type() {
        let event = envelope(EventPayload::DatasetImageAnalyzed {
            dataset_image_id: "ds-1".into(),
            cutout_id: "c-1".into(),
            analysis_type: "detailed".into(),
            analysis_result: serde_json::json!({"score": 0.9}),
        });
        assert_eq!(
            event.idempotency_parts(),
            vec!["dataset_image_analyzed", "c-1", "detailed"]
        );
    }
}
