//! Event processor: applies domain events exactly once and advances the
//! iteration state machine.
//!
//! Every handler follows the same shape: any bulk document creation runs
//! first through idempotent deterministic-id batch writes, then a single
//! optimistic transaction reads the aggregate, checks the idempotency
//! ledger, applies counter increments and per-entity writes, evaluates
//! the transition guards against the post-increment state, and stages
//! the ledger mark as its last write. Redelivery at any crash point
//! either replays idempotent writes or short-circuits on the ledger.

use std::sync::Arc;

use annotator_core::config::Config;
use annotator_core::status::{DatasetImageStatus, IterationStatus, ProductImageStatus};
use annotator_core::types::Timestamp;
use annotator_db::models::annotated_image::CreateCutoutAnnotation;
use annotator_db::models::cutout::CreateCutout;
use annotator_db::models::dataset_image::{CreateDatasetImage, UpdateDatasetImage};
use annotator_db::models::processed_event::ProcessedEvent;
use annotator_db::models::product_image::{CreateProductImage, UpdateProductImage};
use annotator_db::models::project_iteration::{counters, CreateProjectIteration, ProjectIteration};
use annotator_db::repositories::{
    AnnotatedImageRepo, CutoutAnalysisRepo, CutoutRepo, DatasetImageRepo, ProcessedEventRepo,
    ProductImageRepo, ProjectIterationRepo,
};
use annotator_db::store::{run_transaction, SharedStore, Transaction};
use annotator_db::StoreError;
use annotator_events::event::{AnnotationSpec, CutoutSpec, NewDatasetImage, NewProductImage};
use annotator_events::{CallbackBus, CallbackEvent, EventEnvelope, EventPayload, ImageKind};
use chrono::Utc;

use crate::error::{Outcome, PipelineError};

/// Result of a handler's guarded transaction.
enum TxResult {
    Applied {
        iteration: ProjectIteration,
        status_change: Option<IterationStatus>,
        annotations_count: Option<i64>,
    },
    AlreadyProcessed,
    Terminal,
    MissingIteration,
}

/// Outcome of the shared precondition checks inside a transaction.
enum Gate {
    Proceed(ProjectIteration),
    Stop(TxResult),
}

/// Consumes domain events and mutates the aggregate state exactly once
/// per event.
pub struct EventProcessor {
    store: SharedStore,
    iterations: ProjectIterationRepo,
    dataset_images: DatasetImageRepo,
    product_images: ProductImageRepo,
    cutouts: CutoutRepo,
    cutout_analyses: CutoutAnalysisRepo,
    annotated_images: AnnotatedImageRepo,
    guard: ProcessedEventRepo,
    callbacks: Option<Arc<CallbackBus>>,
}

impl EventProcessor {
    pub fn new(store: SharedStore, config: Config) -> Self {
        Self {
            iterations: ProjectIterationRepo::new(Arc::clone(&store), config),
            dataset_images: DatasetImageRepo::new(Arc::clone(&store)),
            product_images: ProductImageRepo::new(Arc::clone(&store)),
            cutouts: CutoutRepo::new(Arc::clone(&store)),
            cutout_analyses: CutoutAnalysisRepo::new(Arc::clone(&store)),
            annotated_images: AnnotatedImageRepo::new(Arc::clone(&store)),
            guard: ProcessedEventRepo::new(Arc::clone(&store)),
            callbacks: None,
            store,
        }
    }

    /// Publish status callbacks on the given bus after applied events.
    pub fn with_callbacks(mut self, callbacks: Arc<CallbackBus>) -> Self {
        self.callbacks = Some(callbacks);
        self
    }

    /// Process one delivered event.
    ///
    /// Returns the applied/no-op outcome; errors carry the
    /// acknowledge-versus-redeliver decision via
    /// [`PipelineError::should_redeliver`].
    pub async fn process(&self, event: &EventEnvelope) -> Result<Outcome, PipelineError> {
        let owned_parts = event.idempotency_parts();
        let parts: Vec<&str> = owned_parts.iter().map(String::as_str).collect();

        let result = match &event.payload {
            EventPayload::StartProjectIteration {
                product_image,
                dataset_images,
                analysis_types,
            } => {
                self.handle_start(event, product_image, dataset_images, analysis_types, &parts)
                    .await?
            }
            EventPayload::ImageDownloaded {
                image_type,
                product_image_id,
                dataset_image_id,
                image_path,
                label,
            } => {
                self.handle_image_downloaded(
                    event,
                    *image_type,
                    product_image_id.as_deref(),
                    dataset_image_id.as_deref(),
                    image_path,
                    label.as_deref(),
                    &parts,
                )
                .await?
            }
            EventPayload::CutoutsReady {
                dataset_image_id,
                cutouts,
                ..
            } => {
                self.handle_cutouts_ready(event, dataset_image_id, cutouts, &parts)
                    .await?
            }
            EventPayload::ProductImageAnalyzed {
                product_image_id,
                analysis_type,
                analysis_result,
            } => {
                self.handle_product_image_analyzed(
                    event,
                    product_image_id,
                    analysis_type,
                    analysis_result,
                    &parts,
                )
                .await?
            }
            EventPayload::DatasetImageAnalyzed {
                dataset_image_id,
                cutout_id,
                analysis_type,
                analysis_result,
            } => {
                self.handle_dataset_image_analyzed(
                    event,
                    dataset_image_id,
                    cutout_id,
                    analysis_type,
                    analysis_result,
                    &parts,
                )
                .await?
            }
            EventPayload::AnnotateDataset {
                dataset_image_id,
                annotations,
            } => {
                self.handle_annotate_dataset(event, dataset_image_id, annotations, &parts)
                    .await?
            }
            EventPayload::AnnotationCreated {
                dataset_image_id,
                cutout_id,
                product_image_id,
                label,
                annotated_image_path,
            } => {
                self.handle_annotation_created(
                    event,
                    dataset_image_id,
                    AnnotationSpec {
                        cutout_id: cutout_id.clone(),
                        product_image_id: product_image_id.clone(),
                        label: label.clone(),
                        annotated_image_path: annotated_image_path.clone(),
                    },
                    &parts,
                )
                .await?
            }
            EventPayload::IterationFailed {
                service_name,
                error_message,
                ..
            } => {
                self.handle_iteration_failed(event, service_name, error_message, &parts)
                    .await?
            }
        };

        match result {
            TxResult::Applied {
                iteration,
                status_change,
                annotations_count,
            } => {
                tracing::info!(
                    project_iteration_id = %event.project_iteration_id,
                    event_type = event.event_type(),
                    correlation_id = %event.correlation_id,
                    status = %iteration.status,
                    "applied event"
                );
                self.emit_callbacks(event, &iteration, status_change, annotations_count);
                Ok(Outcome::Applied)
            }
            TxResult::AlreadyProcessed => {
                tracing::debug!(
                    project_iteration_id = %event.project_iteration_id,
                    event_type = event.event_type(),
                    "event already processed, skipping"
                );
                Ok(Outcome::AlreadyProcessed)
            }
            TxResult::Terminal => {
                tracing::debug!(
                    project_iteration_id = %event.project_iteration_id,
                    event_type = event.event_type(),
                    "iteration is terminal, ignoring event"
                );
                Ok(Outcome::IgnoredTerminal)
            }
            TxResult::MissingIteration => Err(PipelineError::UnknownIteration(
                event.project_iteration_id.clone(),
            )),
        }
    }

    /// Move a non-terminal iteration to `Failed` with a recorded reason.
    ///
    /// Used by the failure-event handler and by consumers that hit a
    /// permanent processing error. Returns `false` if the iteration was
    /// already terminal (or does not exist).
    pub async fn fail_iteration(
        &self,
        project_iteration_id: &str,
        reason: &str,
    ) -> Result<bool, PipelineError> {
        let failed = run_transaction(self.store.as_ref(), |mut tx| async move {
            let Some(iteration) = self
                .iterations
                .get_in_tx(&mut tx, project_iteration_id)
                .await?
            else {
                return Ok((tx, None));
            };
            if iteration.status.is_terminal() {
                return Ok((tx, None));
            }
            let now = Utc::now();
            let mut updated = self
                .iterations
                .stage_increment_counters(
                    &mut tx,
                    project_iteration_id,
                    &[(counters::FAILURES_RECORDED, 1)],
                    now,
                )
                .await?;
            self.iterations.stage_set_status(
                &mut tx,
                project_iteration_id,
                IterationStatus::Failed,
                Some(reason),
                now,
            )?;
            updated.status = IterationStatus::Failed;
            updated.failure_reason = Some(reason.to_string());
            Ok((tx, Some(updated)))
        })
        .await?;

        match failed {
            Some(iteration) => {
                tracing::warn!(project_iteration_id, reason, "iteration failed");
                if let Some(bus) = &self.callbacks {
                    bus.publish(CallbackEvent::ProjectStatusChanged {
                        project_iteration_id: project_iteration_id.to_string(),
                        status: iteration.status,
                        failure_reason: iteration.failure_reason.clone(),
                    });
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // -----------------------------------------------------------------------
    // Handlers
    // -----------------------------------------------------------------------

    async fn handle_start(
        &self,
        event: &EventEnvelope,
        product_image: &NewProductImage,
        dataset_images: &[NewDatasetImage],
        analysis_types: &[String],
        parts: &[&str],
    ) -> Result<TxResult, PipelineError> {
        if dataset_images.is_empty() {
            return Err(PipelineError::Validation(
                "start_project_iteration requires at least one dataset image".into(),
            ));
        }

        // Cheap short-circuit before any bulk writes.
        if self
            .guard
            .is_processed(&event.project_iteration_id, parts)
            .await?
        {
            return Ok(TxResult::AlreadyProcessed);
        }

        // Child documents have deterministic identifiers, so re-creating
        // them on redelivery is a no-op.
        match self
            .product_images
            .create(
                &event.project_iteration_id,
                CreateProductImage {
                    product_image_id: product_image.product_image_id.clone(),
                    image_path: None,
                    label: product_image.label.clone(),
                },
            )
            .await
        {
            Ok(_) | Err(StoreError::AlreadyExists { .. }) => {}
            Err(e) => return Err(e.into()),
        }
        self.dataset_images
            .create_many(
                &event.project_iteration_id,
                dataset_images
                    .iter()
                    .map(|d| CreateDatasetImage {
                        dataset_image_id: d.dataset_image_id.clone(),
                        image_path: None,
                    })
                    .collect(),
            )
            .await?;

        let input = CreateProjectIteration {
            analysis_types: analysis_types.to_vec(),
            total_product_images: 1,
            total_dataset_images: dataset_images.len() as i64,
        };
        let record = self.ledger_record(event);

        let result = run_transaction(self.store.as_ref(), |mut tx| {
            let input = input.clone();
            let record = record.clone();
            async move {
                if self
                    .guard
                    .check_in_tx(&mut tx, &event.project_iteration_id, parts)
                    .await?
                {
                    return Ok((tx, TxResult::AlreadyProcessed));
                }
                let now = Utc::now();
                self.iterations
                    .stage_create(&mut tx, &event.project_iteration_id, input, now)?;
                let iteration = self
                    .iterations
                    .stage_increment_counters(
                        &mut tx,
                        &event.project_iteration_id,
                        &[(counters::EVENTS_PROCESSED, 1)],
                        now,
                    )
                    .await?;
                self.guard
                    .stage_mark(&mut tx, &event.project_iteration_id, parts, &record)?;
                Ok((
                    tx,
                    TxResult::Applied {
                        iteration,
                        status_change: Some(IterationStatus::Downloading),
                        annotations_count: None,
                    },
                ))
            }
        })
        .await;

        match result {
            Ok(r) => Ok(r),
            // A concurrent worker created the iteration first; the ledger
            // entry committed with it.
            Err(StoreError::AlreadyExists { .. }) => Ok(TxResult::AlreadyProcessed),
            Err(e) => Err(e.into()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_image_downloaded(
        &self,
        event: &EventEnvelope,
        image_type: ImageKind,
        product_image_id: Option<&str>,
        dataset_image_id: Option<&str>,
        image_path: &str,
        label: Option<&str>,
        parts: &[&str],
    ) -> Result<TxResult, PipelineError> {
        match image_type {
            ImageKind::Product if product_image_id.is_none() => {
                return Err(PipelineError::Validation(
                    "image_downloaded(product) requires product_image_id".into(),
                ));
            }
            ImageKind::Dataset if dataset_image_id.is_none() => {
                return Err(PipelineError::Validation(
                    "image_downloaded(dataset) requires dataset_image_id".into(),
                ));
            }
            _ => {}
        }
        let record = self.ledger_record(event);

        run_transaction(self.store.as_ref(), |mut tx| {
            let record = record.clone();
            async move {
                let iteration = match self.gate(&mut tx, event, parts).await? {
                    Gate::Proceed(it) => it,
                    Gate::Stop(result) => return Ok((tx, result)),
                };
                let now = Utc::now();

                let deltas = match image_type {
                    ImageKind::Product => [
                        (counters::PRODUCT_IMAGES_DOWNLOADED, 1),
                        (counters::EVENTS_PROCESSED, 1),
                    ],
                    ImageKind::Dataset => [
                        (counters::DATASET_IMAGES_DOWNLOADED, 1),
                        (counters::EVENTS_PROCESSED, 1),
                    ],
                };
                let mut updated = self
                    .iterations
                    .stage_increment_counters(&mut tx, &event.project_iteration_id, &deltas, now)
                    .await?;

                match image_type {
                    ImageKind::Product => {
                        self.product_images
                            .stage_update(
                                &mut tx,
                                &event.project_iteration_id,
                                product_image_id.unwrap_or_default(),
                                UpdateProductImage {
                                    status: Some(ProductImageStatus::Downloaded),
                                    image_path: Some(image_path.to_string()),
                                    label: label.map(str::to_string),
                                    analysis_error: None,
                                },
                                now,
                            )
                            .await?;
                    }
                    ImageKind::Dataset => {
                        self.dataset_images
                            .stage_update(
                                &mut tx,
                                &event.project_iteration_id,
                                dataset_image_id.unwrap_or_default(),
                                UpdateDatasetImage {
                                    status: Some(DatasetImageStatus::Downloaded),
                                    image_path: Some(image_path.to_string()),
                                    ..Default::default()
                                },
                                now,
                            )
                            .await?;
                    }
                }

                let status_change =
                    self.stage_transition(&mut tx, event, &iteration, &mut updated, now)?;
                self.guard
                    .stage_mark(&mut tx, &event.project_iteration_id, parts, &record)?;
                Ok((
                    tx,
                    TxResult::Applied {
                        iteration: updated,
                        status_change,
                        annotations_count: None,
                    },
                ))
            }
        })
        .await
        .map_err(Into::into)
    }

    async fn handle_cutouts_ready(
        &self,
        event: &EventEnvelope,
        dataset_image_id: &str,
        cutouts: &[CutoutSpec],
        parts: &[&str],
    ) -> Result<TxResult, PipelineError> {
        if cutouts.iter().any(|c| c.cutout_id.is_empty()) {
            return Err(PipelineError::Validation(
                "cutouts_ready requires extractor-assigned cutout ids".into(),
            ));
        }

        if self
            .guard
            .is_processed(&event.project_iteration_id, parts)
            .await?
        {
            return Ok(TxResult::AlreadyProcessed);
        }

        // Bulk creation with producer-assigned identifiers: redelivery
        // re-creates the same documents.
        if !cutouts.is_empty() {
            self.cutouts
                .create_many(
                    &event.project_iteration_id,
                    cutouts
                        .iter()
                        .map(|c| CreateCutout {
                            cutout_id: Some(c.cutout_id.clone()),
                            dataset_image_id: dataset_image_id.to_string(),
                            bounding_box: c.bounding_box.clone(),
                        })
                        .collect(),
                )
                .await?;
        }

        let cutout_count = cutouts.len() as i64;
        let record = self.ledger_record(event);

        run_transaction(self.store.as_ref(), |mut tx| {
            let record = record.clone();
            async move {
                let iteration = match self.gate(&mut tx, event, parts).await? {
                    Gate::Proceed(it) => it,
                    Gate::Stop(result) => return Ok((tx, result)),
                };
                let now = Utc::now();

                let mut updated = self
                    .iterations
                    .stage_increment_counters(
                        &mut tx,
                        &event.project_iteration_id,
                        &[
                            (counters::DATASET_IMAGES_EXTRACTED, 1),
                            (counters::CUTOUTS_EXTRACTED, cutout_count),
                            (counters::EVENTS_PROCESSED, 1),
                        ],
                        now,
                    )
                    .await?;

                // Zero cutouts is recorded explicitly on the image.
                self.dataset_images
                    .stage_update(
                        &mut tx,
                        &event.project_iteration_id,
                        dataset_image_id,
                        UpdateDatasetImage {
                            status: Some(DatasetImageStatus::Extracted),
                            cutout_count: Some(cutout_count),
                            ..Default::default()
                        },
                        now,
                    )
                    .await?;

                let status_change =
                    self.stage_transition(&mut tx, event, &iteration, &mut updated, now)?;
                self.guard
                    .stage_mark(&mut tx, &event.project_iteration_id, parts, &record)?;
                Ok((
                    tx,
                    TxResult::Applied {
                        iteration: updated,
                        status_change,
                        annotations_count: None,
                    },
                ))
            }
        })
        .await
        .map_err(Into::into)
    }

    async fn handle_product_image_analyzed(
        &self,
        event: &EventEnvelope,
        product_image_id: &str,
        analysis_type: &str,
        analysis_result: &serde_json::Value,
        parts: &[&str],
    ) -> Result<TxResult, PipelineError> {
        let record = self.ledger_record(event);

        run_transaction(self.store.as_ref(), |mut tx| {
            let record = record.clone();
            async move {
                let iteration = match self.gate(&mut tx, event, parts).await? {
                    Gate::Proceed(it) => it,
                    Gate::Stop(result) => return Ok((tx, result)),
                };
                let now = Utc::now();

                let mut updated = self
                    .iterations
                    .stage_increment_counters(
                        &mut tx,
                        &event.project_iteration_id,
                        &[
                            (counters::PRODUCT_IMAGES_ANALYZED, 1),
                            (counters::EVENTS_PROCESSED, 1),
                        ],
                        now,
                    )
                    .await?;

                self.product_images
                    .stage_record_analysis(
                        &mut tx,
                        &event.project_iteration_id,
                        product_image_id,
                        analysis_type,
                        analysis_result.clone(),
                        now,
                    )
                    .await?;

                let status_change =
                    self.stage_transition(&mut tx, event, &iteration, &mut updated, now)?;
                self.guard
                    .stage_mark(&mut tx, &event.project_iteration_id, parts, &record)?;
                Ok((
                    tx,
                    TxResult::Applied {
                        iteration: updated,
                        status_change,
                        annotations_count: None,
                    },
                ))
            }
        })
        .await
        .map_err(Into::into)
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_dataset_image_analyzed(
        &self,
        event: &EventEnvelope,
        dataset_image_id: &str,
        cutout_id: &str,
        analysis_type: &str,
        analysis_result: &serde_json::Value,
        parts: &[&str],
    ) -> Result<TxResult, PipelineError> {
        let record = self.ledger_record(event);

        run_transaction(self.store.as_ref(), |mut tx| {
            let record = record.clone();
            async move {
                let iteration = match self.gate(&mut tx, event, parts).await? {
                    Gate::Proceed(it) => it,
                    Gate::Stop(result) => return Ok((tx, result)),
                };
                let now = Utc::now();

                let mut updated = self
                    .iterations
                    .stage_increment_counters(
                        &mut tx,
                        &event.project_iteration_id,
                        &[
                            (counters::CUTOUTS_ANALYZED, 1),
                            (counters::EVENTS_PROCESSED, 1),
                        ],
                        now,
                    )
                    .await?;

                // One analysis document per (cutout, type) pair: the
                // derived identifier makes a duplicate impossible.
                self.cutout_analyses
                    .stage_upsert(
                        &mut tx,
                        &event.project_iteration_id,
                        cutout_id,
                        analysis_type,
                        dataset_image_id,
                        analysis_result.clone(),
                        now,
                    )
                    .await?;
                self.cutouts
                    .stage_add_analysis_type(
                        &mut tx,
                        &event.project_iteration_id,
                        cutout_id,
                        analysis_type,
                        now,
                    )
                    .await?;

                let status_change =
                    self.stage_transition(&mut tx, event, &iteration, &mut updated, now)?;
                self.guard
                    .stage_mark(&mut tx, &event.project_iteration_id, parts, &record)?;
                Ok((
                    tx,
                    TxResult::Applied {
                        iteration: updated,
                        status_change,
                        annotations_count: None,
                    },
                ))
            }
        })
        .await
        .map_err(Into::into)
    }

    async fn handle_annotate_dataset(
        &self,
        event: &EventEnvelope,
        dataset_image_id: &str,
        annotations: &[AnnotationSpec],
        parts: &[&str],
    ) -> Result<TxResult, PipelineError> {
        if self
            .guard
            .is_processed(&event.project_iteration_id, parts)
            .await?
        {
            return Ok(TxResult::AlreadyProcessed);
        }

        // Bulk upsert keyed by cutout id; safe to replay on redelivery.
        self.annotated_images
            .bulk_upsert_annotations(
                &event.project_iteration_id,
                dataset_image_id,
                annotations
                    .iter()
                    .map(|a| CreateCutoutAnnotation {
                        cutout_id: a.cutout_id.clone(),
                        product_image_id: a.product_image_id.clone(),
                        label: a.label.clone(),
                        annotated_image_path: a.annotated_image_path.clone(),
                    })
                    .collect(),
            )
            .await?;

        let annotation_total = annotations.len() as i64;
        let record = self.ledger_record(event);

        run_transaction(self.store.as_ref(), |mut tx| {
            let record = record.clone();
            async move {
                let iteration = match self.gate(&mut tx, event, parts).await? {
                    Gate::Proceed(it) => it,
                    Gate::Stop(result) => return Ok((tx, result)),
                };
                let now = Utc::now();

                // Recounted on every attempt: the summary read below puts
                // this transaction in conflict with any concurrent
                // annotation writer, so a retry observes a fresh count.
                let count = self
                    .annotated_images
                    .count_annotations(&event.project_iteration_id, dataset_image_id)
                    .await? as i64;

                let mut updated = self
                    .iterations
                    .stage_increment_counters(
                        &mut tx,
                        &event.project_iteration_id,
                        &[
                            (counters::DATASET_IMAGES_ANNOTATED, 1),
                            (counters::ANNOTATIONS_CREATED, annotation_total),
                            (counters::EVENTS_PROCESSED, 1),
                        ],
                        now,
                    )
                    .await?;

                self.annotated_images
                    .stage_set_summary_count(
                        &mut tx,
                        &event.project_iteration_id,
                        dataset_image_id,
                        count,
                        now,
                    )
                    .await?;
                self.dataset_images
                    .stage_update(
                        &mut tx,
                        &event.project_iteration_id,
                        dataset_image_id,
                        UpdateDatasetImage {
                            status: Some(DatasetImageStatus::Annotated),
                            annotation_completed: Some(true),
                            ..Default::default()
                        },
                        now,
                    )
                    .await?;

                let status_change =
                    self.stage_transition(&mut tx, event, &iteration, &mut updated, now)?;
                self.guard
                    .stage_mark(&mut tx, &event.project_iteration_id, parts, &record)?;
                Ok((
                    tx,
                    TxResult::Applied {
                        iteration: updated,
                        status_change,
                        annotations_count: Some(count),
                    },
                ))
            }
        })
        .await
        .map_err(Into::into)
    }

    async fn handle_annotation_created(
        &self,
        event: &EventEnvelope,
        dataset_image_id: &str,
        annotation: AnnotationSpec,
        parts: &[&str],
    ) -> Result<TxResult, PipelineError> {
        let record = self.ledger_record(event);

        run_transaction(self.store.as_ref(), |mut tx| {
            let record = record.clone();
            let annotation = annotation.clone();
            async move {
                let iteration = match self.gate(&mut tx, event, parts).await? {
                    Gate::Proceed(it) => it,
                    Gate::Stop(result) => return Ok((tx, result)),
                };
                let now = Utc::now();

                let mut updated = self
                    .iterations
                    .stage_increment_counters(
                        &mut tx,
                        &event.project_iteration_id,
                        &[
                            (counters::DATASET_IMAGES_ANNOTATED, 1),
                            (counters::ANNOTATIONS_CREATED, 1),
                            (counters::EVENTS_PROCESSED, 1),
                        ],
                        now,
                    )
                    .await?;

                let count = self
                    .annotated_images
                    .stage_record_annotation(
                        &mut tx,
                        &event.project_iteration_id,
                        dataset_image_id,
                        CreateCutoutAnnotation {
                            cutout_id: annotation.cutout_id,
                            product_image_id: annotation.product_image_id,
                            label: annotation.label,
                            annotated_image_path: annotation.annotated_image_path,
                        },
                        now,
                    )
                    .await?;
                self.dataset_images
                    .stage_update(
                        &mut tx,
                        &event.project_iteration_id,
                        dataset_image_id,
                        UpdateDatasetImage {
                            status: Some(DatasetImageStatus::Annotated),
                            annotation_completed: Some(true),
                            ..Default::default()
                        },
                        now,
                    )
                    .await?;

                let status_change =
                    self.stage_transition(&mut tx, event, &iteration, &mut updated, now)?;
                self.guard
                    .stage_mark(&mut tx, &event.project_iteration_id, parts, &record)?;
                Ok((
                    tx,
                    TxResult::Applied {
                        iteration: updated,
                        status_change,
                        annotations_count: Some(count),
                    },
                ))
            }
        })
        .await
        .map_err(Into::into)
    }

    async fn handle_iteration_failed(
        &self,
        event: &EventEnvelope,
        service_name: &str,
        error_message: &str,
        parts: &[&str],
    ) -> Result<TxResult, PipelineError> {
        let record = self.ledger_record(event);
        let reason = format!("{service_name}: {error_message}");

        run_transaction(self.store.as_ref(), |mut tx| {
            let record = record.clone();
            let reason = reason.clone();
            async move {
                let _ = match self.gate(&mut tx, event, parts).await? {
                    Gate::Proceed(it) => it,
                    Gate::Stop(result) => return Ok((tx, result)),
                };
                let now = Utc::now();

                let mut updated = self
                    .iterations
                    .stage_increment_counters(
                        &mut tx,
                        &event.project_iteration_id,
                        &[
                            (counters::FAILURES_RECORDED, 1),
                            (counters::EVENTS_PROCESSED, 1),
                        ],
                        now,
                    )
                    .await?;
                self.iterations.stage_set_status(
                    &mut tx,
                    &event.project_iteration_id,
                    IterationStatus::Failed,
                    Some(&reason),
                    now,
                )?;
                updated.status = IterationStatus::Failed;
                updated.failure_reason = Some(reason);

                self.guard
                    .stage_mark(&mut tx, &event.project_iteration_id, parts, &record)?;
                Ok((
                    tx,
                    TxResult::Applied {
                        iteration: updated,
                        status_change: Some(IterationStatus::Failed),
                        annotations_count: None,
                    },
                ))
            }
        })
        .await
        .map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // Shared pieces
    // -----------------------------------------------------------------------

    /// Precondition checks every handler runs inside its transaction:
    /// the iteration exists, the event is unseen, and the iteration is
    /// not terminal. The ledger is consulted first so a redelivered,
    /// already-applied event reports `AlreadyProcessed` even after the
    /// iteration reached a terminal state.
    async fn gate(
        &self,
        tx: &mut Transaction,
        event: &EventEnvelope,
        parts: &[&str],
    ) -> Result<Gate, StoreError> {
        let Some(iteration) = self
            .iterations
            .get_in_tx(tx, &event.project_iteration_id)
            .await?
        else {
            return Ok(Gate::Stop(TxResult::MissingIteration));
        };
        if self
            .guard
            .check_in_tx(tx, &event.project_iteration_id, parts)
            .await?
        {
            return Ok(Gate::Stop(TxResult::AlreadyProcessed));
        }
        if iteration.status.is_terminal() {
            return Ok(Gate::Stop(TxResult::Terminal));
        }
        Ok(Gate::Proceed(iteration))
    }

    /// Evaluate the transition guards against the post-increment state
    /// and stage the status change when one fires.
    ///
    /// Guards compare counters read in the same transaction that applied
    /// the increments, so concurrent handlers cannot both observe the
    /// completing value: the loser's commit conflicts and retries.
    fn stage_transition(
        &self,
        tx: &mut Transaction,
        event: &EventEnvelope,
        before: &ProjectIteration,
        updated: &mut ProjectIteration,
        now: Timestamp,
    ) -> Result<Option<IterationStatus>, StoreError> {
        let next = match before.status {
            IterationStatus::Downloading if updated.downloads_complete() => {
                Some(IterationStatus::CutoutExtraction)
            }
            IterationStatus::CutoutExtraction if updated.extraction_complete() => {
                Some(IterationStatus::Analyzing)
            }
            IterationStatus::Analyzing if updated.analysis_complete() => {
                Some(IterationStatus::Annotating)
            }
            IterationStatus::Annotating if updated.annotation_complete() => {
                Some(IterationStatus::Completed)
            }
            _ => None,
        };

        if let Some(next) = next {
            self.iterations
                .stage_set_status(tx, &event.project_iteration_id, next, None, now)?;
            updated.status = next;
        }
        Ok(next)
    }

    /// Ledger entry for the event, echoing its natural-key fields.
    fn ledger_record(&self, event: &EventEnvelope) -> ProcessedEvent {
        let mut record = ProcessedEvent::new(
            event.event_type(),
            event.project_iteration_id.as_str(),
            event.correlation_id.as_str(),
            Utc::now(),
        );
        match &event.payload {
            EventPayload::ImageDownloaded {
                image_type,
                product_image_id,
                dataset_image_id,
                label,
                ..
            } => {
                record.image_type = Some(
                    match image_type {
                        ImageKind::Product => "product",
                        ImageKind::Dataset => "dataset",
                    }
                    .to_string(),
                );
                record.product_image_id = product_image_id.clone();
                record.dataset_image_id = dataset_image_id.clone();
                record.label = label.clone();
            }
            EventPayload::CutoutsReady { dataset_image_id, .. }
            | EventPayload::AnnotateDataset { dataset_image_id, .. } => {
                record.dataset_image_id = Some(dataset_image_id.clone());
            }
            EventPayload::ProductImageAnalyzed {
                product_image_id,
                analysis_type,
                ..
            } => {
                record.product_image_id = Some(product_image_id.clone());
                record.analysis_type = Some(analysis_type.clone());
            }
            EventPayload::DatasetImageAnalyzed {
                dataset_image_id,
                cutout_id,
                analysis_type,
                ..
            } => {
                record.dataset_image_id = Some(dataset_image_id.clone());
                record.cutout_id = Some(cutout_id.clone());
                record.analysis_type = Some(analysis_type.clone());
            }
            EventPayload::AnnotationCreated {
                dataset_image_id,
                cutout_id,
                label,
                ..
            } => {
                record.dataset_image_id = Some(dataset_image_id.clone());
                record.cutout_id = Some(cutout_id.clone());
                record.label = Some(label.clone());
            }
            EventPayload::StartProjectIteration { .. } | EventPayload::IterationFailed { .. } => {}
        }
        record
    }

    fn emit_callbacks(
        &self,
        event: &EventEnvelope,
        iteration: &ProjectIteration,
        status_change: Option<IterationStatus>,
        annotations_count: Option<i64>,
    ) {
        let Some(bus) = &self.callbacks else {
            return;
        };
        if let Some(status) = status_change {
            bus.publish(CallbackEvent::ProjectStatusChanged {
                project_iteration_id: event.project_iteration_id.clone(),
                status,
                failure_reason: iteration.failure_reason.clone(),
            });
        }
        if let Some(annotations_count) = annotations_count {
            if let EventPayload::AnnotateDataset { dataset_image_id, .. }
            | EventPayload::AnnotationCreated { dataset_image_id, .. } = &event.payload
            {
                bus.publish(CallbackEvent::AnnotationCreated {
                    project_iteration_id: event.project_iteration_id.clone(),
                    dataset_image_id: dataset_image_id.clone(),
                    annotations_count,
                });
            }
        }
        if let Ok(progress) = serde_json::to_value(iteration) {
            bus.publish(CallbackEvent::ProjectProgressUpdated {
                project_iteration_id: event.project_iteration_id.clone(),
                progress,
            });
        }
    }
}
