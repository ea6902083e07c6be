//! Repository for the `dataset_images` subcollection.

use annotator_core::status::DatasetImageStatus;
use annotator_core::types::Timestamp;
use chrono::Utc;

use crate::error::StoreError;
use crate::models::dataset_image::{CreateDatasetImage, DatasetImage, UpdateDatasetImage};
use crate::models::{from_document, to_document};
use crate::repositories::iteration_collection;
use crate::store::{BatchWrite, CollectionRef, DocRef, Document, SharedStore, Transaction};

const COLLECTION: &str = "dataset_images";

/// Provides CRUD operations for dataset images.
pub struct DatasetImageRepo {
    store: SharedStore,
}

impl DatasetImageRepo {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    fn collection(&self, project_iteration_id: &str) -> CollectionRef {
        iteration_collection(project_iteration_id, COLLECTION)
    }

    fn doc(&self, project_iteration_id: &str, dataset_image_id: &str) -> DocRef {
        self.collection(project_iteration_id).doc(dataset_image_id)
    }

    fn build(
        &self,
        project_iteration_id: &str,
        input: CreateDatasetImage,
        now: Timestamp,
    ) -> DatasetImage {
        DatasetImage {
            dataset_image_id: input.dataset_image_id,
            project_iteration_id: project_iteration_id.to_string(),
            status: DatasetImageStatus::Pending,
            image_path: input.image_path,
            cutout_count: None,
            annotation_completed: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create-if-absent. Fails with `AlreadyExists` on a duplicate id.
    pub async fn create(
        &self,
        project_iteration_id: &str,
        input: CreateDatasetImage,
    ) -> Result<DatasetImage, StoreError> {
        let image = self.build(project_iteration_id, input, Utc::now());
        self.store
            .create(
                &self.doc(project_iteration_id, &image.dataset_image_id),
                to_document(&image)?,
            )
            .await?;
        tracing::debug!(
            project_iteration_id,
            dataset_image_id = %image.dataset_image_id,
            "created dataset image"
        );
        Ok(image)
    }

    /// Bulk creation through a batch write. Identifiers are caller
    /// supplied and deterministic, so redelivery re-creates the same
    /// documents: `AlreadyExists` per item is benign and skipped.
    /// Returns the number of documents actually created.
    pub async fn create_many(
        &self,
        project_iteration_id: &str,
        inputs: Vec<CreateDatasetImage>,
    ) -> Result<usize, StoreError> {
        let now = Utc::now();
        let mut writes = Vec::with_capacity(inputs.len());
        for input in inputs {
            let image = self.build(project_iteration_id, input, now);
            writes.push(BatchWrite::Create {
                doc: self.doc(project_iteration_id, &image.dataset_image_id),
                data: to_document(&image)?,
            });
        }
        let results = self.store.batch_write(writes).await?;

        let mut created = 0;
        for item in results {
            match item.result {
                Ok(()) => created += 1,
                Err(StoreError::AlreadyExists { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        tracing::debug!(project_iteration_id, created, "bulk created dataset images");
        Ok(created)
    }

    pub async fn get_by_id(
        &self,
        project_iteration_id: &str,
        dataset_image_id: &str,
    ) -> Result<Option<DatasetImage>, StoreError> {
        self.store
            .get(&self.doc(project_iteration_id, dataset_image_id))
            .await?
            .map(from_document)
            .transpose()
    }

    pub async fn list_by_iteration(
        &self,
        project_iteration_id: &str,
    ) -> Result<Vec<DatasetImage>, StoreError> {
        self.store
            .query(&self.collection(project_iteration_id), &[])
            .await?
            .into_iter()
            .map(|(_, data)| from_document(data))
            .collect()
    }

    pub async fn count_by_iteration(
        &self,
        project_iteration_id: &str,
    ) -> Result<usize, StoreError> {
        Ok(self
            .store
            .query(&self.collection(project_iteration_id), &[])
            .await?
            .len())
    }

    /// Apply a partial update. Only `Some` fields are written.
    pub async fn update(
        &self,
        project_iteration_id: &str,
        dataset_image_id: &str,
        input: UpdateDatasetImage,
    ) -> Result<(), StoreError> {
        let update = Self::build_update(input, Utc::now())?;
        self.store
            .set_merge(&self.doc(project_iteration_id, dataset_image_id), update)
            .await?;
        tracing::debug!(project_iteration_id, dataset_image_id, "updated dataset image");
        Ok(())
    }

    /// Stage a partial update inside a caller-owned transaction. The
    /// document is read first so a concurrent writer forces a retry.
    pub async fn stage_update(
        &self,
        tx: &mut Transaction,
        project_iteration_id: &str,
        dataset_image_id: &str,
        input: UpdateDatasetImage,
        now: Timestamp,
    ) -> Result<(), StoreError> {
        let doc = self.doc(project_iteration_id, dataset_image_id);
        if tx.get(&doc).await?.is_none() {
            return Err(StoreError::NotFound { path: doc.path() });
        }
        tx.merge(&doc, Self::build_update(input, now)?);
        Ok(())
    }

    fn build_update(input: UpdateDatasetImage, now: Timestamp) -> Result<Document, StoreError> {
        let mut update = Document::new();
        if let Some(status) = input.status {
            update.insert("status".to_string(), serde_json::to_value(status)?);
        }
        if let Some(path) = input.image_path {
            update.insert("image_path".to_string(), path.into());
        }
        if let Some(count) = input.cutout_count {
            update.insert("cutout_count".to_string(), count.into());
        }
        if let Some(done) = input.annotation_completed {
            update.insert("annotation_completed".to_string(), done.into());
        }
        update.insert("updated_at".to_string(), serde_json::to_value(now)?);
        Ok(update)
    }
}
