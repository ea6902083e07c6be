//! Repository for the `project_iterations` collection.

use annotator_core::config::Config;
use annotator_core::status::IterationStatus;
use annotator_core::types::Timestamp;
use chrono::Utc;

use crate::error::StoreError;
use crate::models::project_iteration::{CreateProjectIteration, ProjectIteration};
use crate::models::{from_document, to_document};
use crate::repositories::{iteration_collection, iteration_doc, mutator};
use crate::store::{DocRef, Document, SharedStore, Transaction};

/// Iteration-owned subcollections, in purge order.
const CHILD_COLLECTIONS: &[&str] = &[
    "dataset_images",
    "product_images",
    "cutouts",
    "cutout_analyses",
    "annotated_images",
    "processed_events",
];

/// Provides CRUD and counter operations for project iterations.
pub struct ProjectIterationRepo {
    store: SharedStore,
    config: Config,
}

impl ProjectIterationRepo {
    pub fn new(store: SharedStore, config: Config) -> Self {
        Self { store, config }
    }

    fn doc(&self, project_iteration_id: &str) -> DocRef {
        iteration_doc(project_iteration_id)
    }

    /// Create a new iteration in `Downloading` state with zeroed
    /// counters. Fails with `AlreadyExists` if the iteration exists.
    pub async fn create(
        &self,
        project_iteration_id: &str,
        input: CreateProjectIteration,
    ) -> Result<ProjectIteration, StoreError> {
        let now = Utc::now();
        let iteration = self.build(project_iteration_id, input, now);
        self.store
            .create(&self.doc(project_iteration_id), to_document(&iteration)?)
            .await?;
        tracing::debug!(project_iteration_id, "created project iteration");
        Ok(iteration)
    }

    /// Stage creation of a new iteration inside a caller-owned
    /// transaction; commit fails with `AlreadyExists` if it was created
    /// concurrently.
    pub fn stage_create(
        &self,
        tx: &mut Transaction,
        project_iteration_id: &str,
        input: CreateProjectIteration,
        now: Timestamp,
    ) -> Result<ProjectIteration, StoreError> {
        let iteration = self.build(project_iteration_id, input, now);
        tx.create(&self.doc(project_iteration_id), to_document(&iteration)?);
        Ok(iteration)
    }

    fn build(
        &self,
        project_iteration_id: &str,
        input: CreateProjectIteration,
        now: Timestamp,
    ) -> ProjectIteration {
        ProjectIteration {
            project_iteration_id: project_iteration_id.to_string(),
            status: IterationStatus::Downloading,
            analysis_types: input.analysis_types,
            total_product_images: input.total_product_images,
            total_dataset_images: input.total_dataset_images,
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
            expires_at: Some(self.config.iteration_expiry(now)),
            created_at: now,
            updated_at: now,
        }
    }

    pub async fn get_by_id(
        &self,
        project_iteration_id: &str,
    ) -> Result<Option<ProjectIteration>, StoreError> {
        self.store
            .get(&self.doc(project_iteration_id))
            .await?
            .map(from_document)
            .transpose()
    }

    /// Read the iteration inside a transaction, recording it in the
    /// read set.
    pub async fn get_in_tx(
        &self,
        tx: &mut Transaction,
        project_iteration_id: &str,
    ) -> Result<Option<ProjectIteration>, StoreError> {
        tx.get(&self.doc(project_iteration_id))
            .await?
            .map(from_document)
            .transpose()
    }

    /// Stage a status change (and optional failure reason).
    pub fn stage_set_status(
        &self,
        tx: &mut Transaction,
        project_iteration_id: &str,
        status: IterationStatus,
        failure_reason: Option<&str>,
        now: Timestamp,
    ) -> Result<(), StoreError> {
        let mut update = Document::new();
        update.insert("status".to_string(), serde_json::to_value(status)?);
        if let Some(reason) = failure_reason {
            update.insert("failure_reason".to_string(), reason.into());
        }
        update.insert("updated_at".to_string(), serde_json::to_value(now)?);
        tx.merge(&self.doc(project_iteration_id), update);
        Ok(())
    }

    /// Increment iteration counters in their own retrying transaction.
    pub async fn increment_counters(
        &self,
        project_iteration_id: &str,
        deltas: &[(&str, i64)],
    ) -> Result<(), StoreError> {
        mutator::increment_fields(self.store.as_ref(), &self.doc(project_iteration_id), deltas)
            .await
    }

    /// Stage counter increments inside a caller-owned transaction and
    /// return the iteration as it will read after commit, so transition
    /// guards evaluate against the post-increment state.
    pub async fn stage_increment_counters(
        &self,
        tx: &mut Transaction,
        project_iteration_id: &str,
        deltas: &[(&str, i64)],
        now: Timestamp,
    ) -> Result<ProjectIteration, StoreError> {
        let updated = mutator::stage_increments(
            tx,
            &self.doc(project_iteration_id),
            deltas,
            now,
        )
        .await?;
        from_document(updated)
    }

    /// Administrative bulk deletion of an iteration subtree. Not part of
    /// event processing. Returns the number of deleted documents.
    pub async fn purge(&self, project_iteration_id: &str) -> Result<usize, StoreError> {
        let mut deleted = 0;

        // Nested annotation documents live under a per-dataset-image
        // subcollection; collect the ids from both the images and any
        // summaries so orphaned annotations are removed too.
        let summaries = iteration_collection(project_iteration_id, "annotated_images");
        let mut dataset_ids: Vec<String> = self
            .store
            .query(
                &iteration_collection(project_iteration_id, "dataset_images"),
                &[],
            )
            .await?
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        dataset_ids.extend(
            self.store
                .query(&summaries, &[])
                .await?
                .into_iter()
                .map(|(id, _)| id),
        );
        dataset_ids.sort();
        dataset_ids.dedup();
        for dataset_image_id in &dataset_ids {
            let nested = summaries.doc(dataset_image_id).collection("cutouts");
            for (cutout_id, _) in self.store.query(&nested, &[]).await? {
                if self.store.delete(&nested.doc(cutout_id)).await? {
                    deleted += 1;
                }
            }
        }

        for name in CHILD_COLLECTIONS {
            let scope = iteration_collection(project_iteration_id, name);
            for (id, _) in self.store.query(&scope, &[]).await? {
                if self.store.delete(&scope.doc(id)).await? {
                    deleted += 1;
                }
            }
            tracing::debug!(project_iteration_id, collection = name, "purged collection");
        }
        if self.store.delete(&self.doc(project_iteration_id)).await? {
            deleted += 1;
        }
        tracing::debug!(project_iteration_id, deleted, "purged project iteration");
        Ok(deleted)
    }
}
