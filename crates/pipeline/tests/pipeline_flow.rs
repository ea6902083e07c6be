//! Integration tests for the event processing pipeline: aggregate
//! creation, counter-driven stage transitions, idempotent redelivery,
//! concurrent handlers, denormalized annotation counts, and failure
//! handling.

use assert_matches::assert_matches;
use chrono::Utc;
use std::sync::Arc;

use annotator_core::config::Config;
use annotator_core::status::IterationStatus;
use annotator_db::repositories::{AnnotatedImageRepo, ProductImageRepo};
use annotator_db::store::SharedStore;
use annotator_db::MemoryStore;
use annotator_events::event::{AnnotationSpec, CutoutSpec, NewDatasetImage, NewProductImage};
use annotator_events::{CallbackBus, CallbackEvent, EventEnvelope, EventPayload, ImageKind};
use annotator_pipeline::{EventProcessor, Outcome, PipelineError, StatusQueries};

const ITERATION: &str = "it-1";

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn setup() -> (SharedStore, EventProcessor, StatusQueries) {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let processor = EventProcessor::new(Arc::clone(&store), Config::default());
    let queries = StatusQueries::new(Arc::clone(&store), Config::default());
    (store, processor, queries)
}

fn envelope(payload: EventPayload) -> EventEnvelope {
    EventEnvelope {
        project_iteration_id: ITERATION.to_string(),
        correlation_id: "corr-1".to_string(),
        occurred_at: Utc::now(),
        payload,
    }
}

fn start_event(dataset_ids: &[&str], analysis_types: &[&str]) -> EventEnvelope {
    envelope(EventPayload::StartProjectIteration {
        product_image: NewProductImage {
            product_image_id: "p-1".into(),
            label: Some("widget".into()),
        },
        dataset_images: dataset_ids
            .iter()
            .map(|id| NewDatasetImage {
                dataset_image_id: id.to_string(),
            })
            .collect(),
        analysis_types: analysis_types.iter().map(|t| t.to_string()).collect(),
    })
}

fn product_downloaded() -> EventEnvelope {
    envelope(EventPayload::ImageDownloaded {
        image_type: ImageKind::Product,
        product_image_id: Some("p-1".into()),
        dataset_image_id: None,
        image_path: "/tmp/p-1.png".into(),
        label: Some("widget".into()),
    })
}

fn dataset_downloaded(dataset_image_id: &str) -> EventEnvelope {
    envelope(EventPayload::ImageDownloaded {
        image_type: ImageKind::Dataset,
        product_image_id: None,
        dataset_image_id: Some(dataset_image_id.to_string()),
        image_path: format!("/tmp/{dataset_image_id}.png"),
        label: None,
    })
}

fn cutouts_ready(dataset_image_id: &str, cutout_ids: &[&str]) -> EventEnvelope {
    envelope(EventPayload::CutoutsReady {
        dataset_image_id: dataset_image_id.to_string(),
        cutout_count: cutout_ids.len() as i64,
        cutouts: cutout_ids
            .iter()
            .map(|id| CutoutSpec {
                cutout_id: id.to_string(),
                bounding_box: Some(serde_json::json!({"x": 0, "y": 0, "w": 8, "h": 8})),
            })
            .collect(),
    })
}

fn product_analyzed(analysis_type: &str) -> EventEnvelope {
    envelope(EventPayload::ProductImageAnalyzed {
        product_image_id: "p-1".into(),
        analysis_type: analysis_type.to_string(),
        analysis_result: serde_json::json!({"score": 0.8}),
    })
}

fn dataset_analyzed(dataset_image_id: &str, cutout_id: &str, analysis_type: &str) -> EventEnvelope {
    envelope(EventPayload::DatasetImageAnalyzed {
        dataset_image_id: dataset_image_id.to_string(),
        cutout_id: cutout_id.to_string(),
        analysis_type: analysis_type.to_string(),
        analysis_result: serde_json::json!({"match": true}),
    })
}

fn annotate_dataset(dataset_image_id: &str, cutout_ids: &[&str]) -> EventEnvelope {
    envelope(EventPayload::AnnotateDataset {
        dataset_image_id: dataset_image_id.to_string(),
        annotations: cutout_ids
            .iter()
            .map(|id| AnnotationSpec {
                cutout_id: id.to_string(),
                product_image_id: "p-1".into(),
                label: "widget".into(),
                annotated_image_path: Some(format!("/out/{id}.png")),
            })
            .collect(),
    })
}

async fn apply(processor: &EventProcessor, event: &EventEnvelope) {
    assert_eq!(processor.process(event).await.unwrap(), Outcome::Applied);
}

/// Drive a one-dataset-image iteration into the `Analyzing` stage with
/// two extracted cutouts and a single analysis pass.
async fn advance_to_analyzing(processor: &EventProcessor) {
    apply(processor, &start_event(&["ds-1"], &["initial"])).await;
    apply(processor, &product_downloaded()).await;
    apply(processor, &dataset_downloaded("ds-1")).await;
    apply(processor, &cutouts_ready("ds-1", &["c-1", "c-2"])).await;
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_creates_the_full_aggregate() {
    let (store, processor, queries) = setup();

    apply(&processor, &start_event(&["ds-1", "ds-2", "ds-3"], &["initial"])).await;

    let iteration = queries.get_iteration(ITERATION).await.unwrap().unwrap();
    assert_eq!(iteration.status, IterationStatus::Downloading);
    assert_eq!(iteration.total_product_images, 1);
    assert_eq!(iteration.total_dataset_images, 3);
    assert_eq!(iteration.events_processed, 1);

    assert_eq!(queries.list_dataset_images(ITERATION).await.unwrap().len(), 3);

    let products = ProductImageRepo::new(store);
    assert!(products.get_by_id(ITERATION, "p-1").await.unwrap().is_some());
}

#[tokio::test]
async fn downloads_drive_the_transition_exactly_once() {
    let (_, processor, queries) = setup();
    apply(&processor, &start_event(&["ds-1", "ds-2", "ds-3"], &["initial"])).await;

    apply(&processor, &dataset_downloaded("ds-1")).await;
    apply(&processor, &dataset_downloaded("ds-2")).await;
    apply(&processor, &product_downloaded()).await;

    // Still downloading: one dataset image outstanding.
    let iteration = queries.get_iteration(ITERATION).await.unwrap().unwrap();
    assert_eq!(iteration.status, IterationStatus::Downloading);

    apply(&processor, &dataset_downloaded("ds-3")).await;

    let iteration = queries.get_iteration(ITERATION).await.unwrap().unwrap();
    assert_eq!(iteration.status, IterationStatus::CutoutExtraction);
    assert_eq!(iteration.product_images_downloaded, iteration.total_product_images);
    assert_eq!(iteration.dataset_images_downloaded, iteration.total_dataset_images);
}

#[tokio::test]
async fn redelivered_events_change_nothing() {
    let (_, processor, queries) = setup();
    apply(&processor, &start_event(&["ds-1", "ds-2", "ds-3"], &["initial"])).await;
    apply(&processor, &dataset_downloaded("ds-1")).await;
    apply(&processor, &dataset_downloaded("ds-2")).await;
    apply(&processor, &product_downloaded()).await;
    let last = dataset_downloaded("ds-3");
    apply(&processor, &last).await;

    let before = queries.get_iteration(ITERATION).await.unwrap().unwrap();

    // Redeliver the completing event.
    assert_eq!(
        processor.process(&last).await.unwrap(),
        Outcome::AlreadyProcessed
    );

    let after = queries.get_iteration(ITERATION).await.unwrap().unwrap();
    assert_eq!(after.status, before.status);
    assert_eq!(after.dataset_images_downloaded, before.dataset_images_downloaded);
    assert_eq!(after.events_processed, before.events_processed);
}

#[tokio::test]
async fn concurrent_analyses_lose_no_increment() {
    let (_, processor, queries) = setup();
    advance_to_analyzing(&processor).await;
    apply(&processor, &product_analyzed("initial")).await;

    let first = dataset_analyzed("ds-1", "c-1", "initial");
    let second = dataset_analyzed("ds-1", "c-2", "initial");
    let (a, b) = tokio::join!(processor.process(&first), processor.process(&second));
    assert_eq!(a.unwrap(), Outcome::Applied);
    assert_eq!(b.unwrap(), Outcome::Applied);

    let iteration = queries.get_iteration(ITERATION).await.unwrap().unwrap();
    assert_eq!(iteration.cutouts_analyzed, 2);
    // Both analysis passes complete: the stage advanced.
    assert_eq!(iteration.status, IterationStatus::Annotating);
    assert_eq!(
        queries
            .count_analyzed_cutouts(ITERATION, "ds-1", "initial")
            .await
            .unwrap(),
        2
    );
}

#[tokio::test]
async fn concurrent_delivery_of_one_event_applies_once() {
    let (_, processor, queries) = setup();
    apply(&processor, &start_event(&["ds-1", "ds-2"], &["initial"])).await;

    let event = dataset_downloaded("ds-1");
    let (a, b) = tokio::join!(processor.process(&event), processor.process(&event));
    let outcomes = [a.unwrap(), b.unwrap()];

    assert!(outcomes.contains(&Outcome::Applied));
    assert!(outcomes.contains(&Outcome::AlreadyProcessed));

    let iteration = queries.get_iteration(ITERATION).await.unwrap().unwrap();
    assert_eq!(iteration.dataset_images_downloaded, 1);
}

#[tokio::test]
async fn annotation_count_matches_children() {
    let (store, processor, queries) = setup();
    advance_to_analyzing(&processor).await;
    apply(&processor, &product_analyzed("initial")).await;
    apply(&processor, &dataset_analyzed("ds-1", "c-1", "initial")).await;
    apply(&processor, &dataset_analyzed("ds-1", "c-2", "initial")).await;

    let annotate = annotate_dataset("ds-1", &["c-1", "c-2"]);
    apply(&processor, &annotate).await;

    let summary = queries
        .get_annotation_summary(ITERATION, "ds-1")
        .await
        .unwrap()
        .unwrap();
    let annotated = AnnotatedImageRepo::new(store);
    assert_eq!(
        summary.annotations_count,
        annotated.count_annotations(ITERATION, "ds-1").await.unwrap() as i64
    );
    assert_eq!(summary.annotations_count, 2);

    // Redelivering the bulk event leaves the count intact.
    assert_eq!(
        processor.process(&annotate).await.unwrap(),
        Outcome::AlreadyProcessed
    );
    assert_eq!(
        annotated.count_annotations(ITERATION, "ds-1").await.unwrap(),
        2
    );
}

#[tokio::test]
async fn full_pipeline_reaches_completed() {
    let (_, processor, queries) = setup();

    // Two dataset images; the second yields no cutouts.
    apply(&processor, &start_event(&["ds-1", "ds-2"], &["initial"])).await;
    apply(&processor, &product_downloaded()).await;
    apply(&processor, &dataset_downloaded("ds-1")).await;
    apply(&processor, &dataset_downloaded("ds-2")).await;
    apply(&processor, &cutouts_ready("ds-1", &["c-1", "c-2"])).await;
    apply(&processor, &cutouts_ready("ds-2", &[])).await;
    apply(&processor, &product_analyzed("initial")).await;
    apply(&processor, &dataset_analyzed("ds-1", "c-1", "initial")).await;
    apply(&processor, &dataset_analyzed("ds-1", "c-2", "initial")).await;
    apply(&processor, &annotate_dataset("ds-1", &["c-1", "c-2"])).await;
    apply(&processor, &annotate_dataset("ds-2", &[])).await;

    let iteration = queries.get_iteration(ITERATION).await.unwrap().unwrap();
    assert_eq!(iteration.status, IterationStatus::Completed);
    assert_eq!(iteration.cutouts_extracted, 2);
    assert_eq!(iteration.dataset_images_annotated, 2);

    // Zero-cutout image recorded its count explicitly.
    let images = queries.list_dataset_images(ITERATION).await.unwrap();
    let ds2 = images.iter().find(|i| i.dataset_image_id == "ds-2").unwrap();
    assert_eq!(ds2.cutout_count, Some(0));

    // Redelivery of an applied event still reports the ledger hit.
    assert_eq!(
        processor.process(&dataset_downloaded("ds-1")).await.unwrap(),
        Outcome::AlreadyProcessed
    );
    // An unseen event for a terminal iteration is acknowledged unapplied.
    assert_eq!(
        processor.process(&product_analyzed("detailed")).await.unwrap(),
        Outcome::IgnoredTerminal
    );
}

#[tokio::test]
async fn failure_event_moves_the_iteration_to_failed() {
    let (_, processor, queries) = setup();
    apply(&processor, &start_event(&["ds-1"], &["initial"])).await;

    let failure = envelope(EventPayload::IterationFailed {
        service_name: "cutout-extractor".into(),
        error_message: "model checkpoint missing".into(),
        error_type: Some("FileNotFoundError".into()),
    });
    apply(&processor, &failure).await;

    let iteration = queries.get_iteration(ITERATION).await.unwrap().unwrap();
    assert_eq!(iteration.status, IterationStatus::Failed);
    assert_eq!(
        iteration.failure_reason.as_deref(),
        Some("cutout-extractor: model checkpoint missing")
    );
    assert_eq!(iteration.failures_recorded, 1);

    // No counter mutation after the terminal transition.
    assert_eq!(
        processor.process(&dataset_downloaded("ds-1")).await.unwrap(),
        Outcome::IgnoredTerminal
    );
    let after = queries.get_iteration(ITERATION).await.unwrap().unwrap();
    assert_eq!(after.dataset_images_downloaded, 0);
}

#[tokio::test]
async fn events_for_unknown_iterations_are_permanent_failures() {
    let (_, processor, _) = setup();

    let err = processor
        .process(&dataset_downloaded("ds-1"))
        .await
        .unwrap_err();
    assert_matches!(err, PipelineError::UnknownIteration(_));
    assert!(!err.should_redeliver());
}

#[tokio::test]
async fn malformed_events_fail_validation() {
    let (_, processor, _) = setup();
    apply(&processor, &start_event(&["ds-1"], &["initial"])).await;

    let event = envelope(EventPayload::ImageDownloaded {
        image_type: ImageKind::Product,
        product_image_id: None,
        dataset_image_id: None,
        image_path: "/tmp/p.png".into(),
        label: None,
    });
    let err = processor.process(&event).await.unwrap_err();
    assert_matches!(err, PipelineError::Validation(_));
    assert!(!err.should_redeliver());
}

#[tokio::test]
async fn status_changes_are_published_to_the_callback_bus() {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let callbacks = Arc::new(CallbackBus::default());
    let mut rx = callbacks.subscribe();
    let processor = EventProcessor::new(Arc::clone(&store), Config::default())
        .with_callbacks(Arc::clone(&callbacks));

    apply(&processor, &start_event(&["ds-1"], &["initial"])).await;

    let first = rx.recv().await.unwrap();
    assert_matches!(
        first,
        CallbackEvent::ProjectStatusChanged {
            status: IterationStatus::Downloading,
            ..
        }
    );
    let second = rx.recv().await.unwrap();
    assert_matches!(second, CallbackEvent::ProjectProgressUpdated { .. });
}
