//! Repository for the `annotated_images` subcollection and its nested
//! per-image `cutouts` annotations.

use annotator_core::types::Timestamp;
use chrono::Utc;

use crate::error::StoreError;
use crate::models::annotated_image::{
    AnnotatedImageSummary, CreateCutoutAnnotation, CutoutAnnotation,
};
use crate::models::{from_document, to_document};
use crate::repositories::iteration_collection;
use crate::store::{
    run_transaction, BatchWrite, CollectionRef, DocRef, Document, SharedStore, Transaction,
};

const COLLECTION: &str = "annotated_images";
const NESTED: &str = "cutouts";

/// Provides summary and annotation operations for annotated images.
pub struct AnnotatedImageRepo {
    store: SharedStore,
}

impl AnnotatedImageRepo {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    fn summary_doc(&self, project_iteration_id: &str, dataset_image_id: &str) -> DocRef {
        iteration_collection(project_iteration_id, COLLECTION).doc(dataset_image_id)
    }

    fn annotations(&self, project_iteration_id: &str, dataset_image_id: &str) -> CollectionRef {
        self.summary_doc(project_iteration_id, dataset_image_id)
            .collection(NESTED)
    }

    pub async fn get_summary(
        &self,
        project_iteration_id: &str,
        dataset_image_id: &str,
    ) -> Result<Option<AnnotatedImageSummary>, StoreError> {
        self.store
            .get(&self.summary_doc(project_iteration_id, dataset_image_id))
            .await?
            .map(from_document)
            .transpose()
    }

    pub async fn list_annotations(
        &self,
        project_iteration_id: &str,
        dataset_image_id: &str,
    ) -> Result<Vec<CutoutAnnotation>, StoreError> {
        self.store
            .query(&self.annotations(project_iteration_id, dataset_image_id), &[])
            .await?
            .into_iter()
            .map(|(_, data)| from_document(data))
            .collect()
    }

    /// Number of annotation children. O(matching documents).
    pub async fn count_annotations(
        &self,
        project_iteration_id: &str,
        dataset_image_id: &str,
    ) -> Result<usize, StoreError> {
        Ok(self
            .store
            .query(&self.annotations(project_iteration_id, dataset_image_id), &[])
            .await?
            .len())
    }

    /// Distinct cutout ids among the annotations. The store has no
    /// distinct operator, so this de-duplicates the child ids.
    pub async fn distinct_cutout_ids(
        &self,
        project_iteration_id: &str,
        dataset_image_id: &str,
    ) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = self
            .store
            .query(&self.annotations(project_iteration_id, dataset_image_id), &[])
            .await?
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    fn build(
        &self,
        project_iteration_id: &str,
        dataset_image_id: &str,
        input: CreateCutoutAnnotation,
        now: Timestamp,
    ) -> CutoutAnnotation {
        CutoutAnnotation {
            cutout_id: input.cutout_id,
            dataset_image_id: dataset_image_id.to_string(),
            project_iteration_id: project_iteration_id.to_string(),
            product_image_id: input.product_image_id,
            label: input.label,
            annotated_image_path: input.annotated_image_path,
            created_at: now,
            updated_at: now,
        }
    }

    fn mutable_fields(input: &CutoutAnnotation) -> Result<Document, StoreError> {
        let mut update = Document::new();
        update.insert(
            "product_image_id".to_string(),
            input.product_image_id.clone().into(),
        );
        update.insert("label".to_string(), input.label.clone().into());
        if let Some(path) = &input.annotated_image_path {
            update.insert("annotated_image_path".to_string(), path.clone().into());
        }
        update.insert("updated_at".to_string(), serde_json::to_value(input.updated_at)?);
        Ok(update)
    }

    /// Create-or-update a single annotation; `created_at` is write-once.
    pub async fn upsert_annotation(
        &self,
        project_iteration_id: &str,
        dataset_image_id: &str,
        input: CreateCutoutAnnotation,
    ) -> Result<(), StoreError> {
        let annotation = self.build(project_iteration_id, dataset_image_id, input, Utc::now());
        let doc = self
            .annotations(project_iteration_id, dataset_image_id)
            .doc(&annotation.cutout_id);

        run_transaction(self.store.as_ref(), |mut tx| {
            let doc = doc.clone();
            let annotation = annotation.clone();
            async move {
                match tx.get(&doc).await? {
                    None => tx.create(&doc, to_document(&annotation)?),
                    Some(_) => tx.merge(&doc, Self::mutable_fields(&annotation)?),
                }
                Ok((tx, ()))
            }
        })
        .await?;

        tracing::debug!(project_iteration_id, dataset_image_id, "upserted annotation");
        Ok(())
    }

    /// Bulk-upsert annotations through batch writes keyed by cutout id.
    ///
    /// Runs in two phases: create everything, then merge the mutable
    /// fields of the items that already existed. Both phases are
    /// idempotent, so a redelivered bulk event converges to the same
    /// state. Returns the number of documents newly created.
    pub async fn bulk_upsert_annotations(
        &self,
        project_iteration_id: &str,
        dataset_image_id: &str,
        inputs: Vec<CreateCutoutAnnotation>,
    ) -> Result<usize, StoreError> {
        let now = Utc::now();
        let scope = self.annotations(project_iteration_id, dataset_image_id);

        let mut annotations = Vec::with_capacity(inputs.len());
        let mut creates = Vec::with_capacity(inputs.len());
        for input in inputs {
            let annotation = self.build(project_iteration_id, dataset_image_id, input, now);
            creates.push(BatchWrite::Create {
                doc: scope.doc(&annotation.cutout_id),
                data: to_document(&annotation)?,
            });
            annotations.push(annotation);
        }
        let results = self.store.batch_write(creates).await?;

        let mut created = 0;
        let mut merges = Vec::new();
        for (item, annotation) in results.into_iter().zip(&annotations) {
            match item.result {
                Ok(()) => created += 1,
                Err(StoreError::AlreadyExists { .. }) => merges.push(BatchWrite::Merge {
                    doc: item.doc,
                    data: Self::mutable_fields(annotation)?,
                }),
                Err(e) => return Err(e),
            }
        }
        if !merges.is_empty() {
            for item in self.store.batch_write(merges).await? {
                item.result?;
            }
        }

        tracing::debug!(
            project_iteration_id,
            dataset_image_id,
            total = annotations.len(),
            created,
            "bulk upserted annotations"
        );
        Ok(created)
    }

    /// Stage one annotation and the matching summary adjustment in a
    /// caller-owned transaction.
    ///
    /// The summary count moves relative to the current value (+1 only
    /// when the annotation is new) inside the same transaction as the
    /// annotation write, so the denormalized count always equals the
    /// number of children. Returns the count as it will read after
    /// commit.
    pub async fn stage_record_annotation(
        &self,
        tx: &mut Transaction,
        project_iteration_id: &str,
        dataset_image_id: &str,
        input: CreateCutoutAnnotation,
        now: Timestamp,
    ) -> Result<i64, StoreError> {
        let annotation = self.build(project_iteration_id, dataset_image_id, input, now);
        let doc = self
            .annotations(project_iteration_id, dataset_image_id)
            .doc(&annotation.cutout_id);

        let is_new = match tx.get(&doc).await? {
            None => {
                tx.create(&doc, to_document(&annotation)?);
                true
            }
            Some(_) => {
                tx.merge(&doc, Self::mutable_fields(&annotation)?);
                false
            }
        };

        let summary_doc = self.summary_doc(project_iteration_id, dataset_image_id);
        let count = match tx.get(&summary_doc).await?.map(from_document::<AnnotatedImageSummary>) {
            None => {
                let count = i64::from(is_new);
                let summary = AnnotatedImageSummary {
                    dataset_image_id: dataset_image_id.to_string(),
                    project_iteration_id: project_iteration_id.to_string(),
                    annotations_count: count,
                    created_at: now,
                    updated_at: now,
                };
                tx.create(&summary_doc, to_document(&summary)?);
                count
            }
            Some(summary) => {
                let count = summary?.annotations_count + i64::from(is_new);
                let mut update = Document::new();
                update.insert("annotations_count".to_string(), count.into());
                update.insert("updated_at".to_string(), serde_json::to_value(now)?);
                tx.merge(&summary_doc, update);
                count
            }
        };
        Ok(count)
    }

    /// Stage the denormalized summary count inside a caller-owned
    /// transaction, creating the summary on first write.
    pub async fn stage_set_summary_count(
        &self,
        tx: &mut Transaction,
        project_iteration_id: &str,
        dataset_image_id: &str,
        annotations_count: i64,
        now: Timestamp,
    ) -> Result<(), StoreError> {
        let doc = self.summary_doc(project_iteration_id, dataset_image_id);
        match tx.get(&doc).await? {
            None => {
                let summary = AnnotatedImageSummary {
                    dataset_image_id: dataset_image_id.to_string(),
                    project_iteration_id: project_iteration_id.to_string(),
                    annotations_count,
                    created_at: now,
                    updated_at: now,
                };
                tx.create(&doc, to_document(&summary)?);
            }
            Some(_) => {
                let mut update = Document::new();
                update.insert("annotations_count".to_string(), annotations_count.into());
                update.insert("updated_at".to_string(), serde_json::to_value(now)?);
                tx.merge(&doc, update);
            }
        }
        Ok(())
    }
}
