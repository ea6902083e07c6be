//! Repository for the `cutout_analyses` subcollection.
//!
//! One document per (cutout, analysis type) pair; the pair is encoded in
//! the document identifier, so an upsert can never create a duplicate.

use annotator_core::types::Timestamp;
use chrono::Utc;

use crate::error::StoreError;
use crate::models::cutout_analysis::CutoutAnalysis;
use crate::models::{from_document, to_document};
use crate::repositories::iteration_collection;
use crate::store::{
    run_transaction, CollectionRef, Document, FieldFilter, SharedStore, Transaction,
};

const COLLECTION: &str = "cutout_analyses";

/// Provides upsert and aggregation queries for cutout analyses.
pub struct CutoutAnalysisRepo {
    store: SharedStore,
}

impl CutoutAnalysisRepo {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    fn collection(&self, project_iteration_id: &str) -> CollectionRef {
        iteration_collection(project_iteration_id, COLLECTION)
    }

    /// Create-or-update the analysis document for a (cutout, analysis
    /// type) pair. On first creation the full record is written; on a
    /// repeat only the result and `updated_at` change, keeping
    /// `created_at` write-once.
    pub async fn upsert(
        &self,
        project_iteration_id: &str,
        cutout_id: &str,
        analysis_type: &str,
        dataset_image_id: &str,
        result: serde_json::Value,
    ) -> Result<(), StoreError> {
        run_transaction(self.store.as_ref(), |mut tx| {
            let result = result.clone();
            async move {
                self.stage_upsert(
                    &mut tx,
                    project_iteration_id,
                    cutout_id,
                    analysis_type,
                    dataset_image_id,
                    result,
                    Utc::now(),
                )
                .await?;
                Ok((tx, ()))
            }
        })
        .await?;

        tracing::debug!(project_iteration_id, cutout_id, analysis_type, "upserted cutout analysis");
        Ok(())
    }

    /// Stage the create-or-update inside a caller-owned transaction.
    pub async fn stage_upsert(
        &self,
        tx: &mut Transaction,
        project_iteration_id: &str,
        cutout_id: &str,
        analysis_type: &str,
        dataset_image_id: &str,
        result: serde_json::Value,
        now: Timestamp,
    ) -> Result<(), StoreError> {
        let doc_id = CutoutAnalysis::doc_id(cutout_id, analysis_type)?;
        let doc = self.collection(project_iteration_id).doc(doc_id);
        match tx.get(&doc).await? {
            None => {
                let analysis = CutoutAnalysis {
                    cutout_id: cutout_id.to_string(),
                    analysis_type: analysis_type.to_string(),
                    project_iteration_id: project_iteration_id.to_string(),
                    dataset_image_id: dataset_image_id.to_string(),
                    result,
                    created_at: now,
                    updated_at: now,
                };
                tx.create(&doc, to_document(&analysis)?);
            }
            Some(_) => {
                let mut update = Document::new();
                update.insert("result".to_string(), result);
                update.insert("updated_at".to_string(), serde_json::to_value(now)?);
                tx.merge(&doc, update);
            }
        }
        Ok(())
    }

    pub async fn get(
        &self,
        project_iteration_id: &str,
        cutout_id: &str,
        analysis_type: &str,
    ) -> Result<Option<CutoutAnalysis>, StoreError> {
        let doc_id = CutoutAnalysis::doc_id(cutout_id, analysis_type)?;
        self.store
            .get(&self.collection(project_iteration_id).doc(doc_id))
            .await?
            .map(from_document)
            .transpose()
    }

    /// Count of analyses of one type for one dataset image.
    ///
    /// Answered by a scoped equality query in place of a cross-collection
    /// join: cost is O(matching documents), not O(1).
    pub async fn count_by_dataset_image(
        &self,
        project_iteration_id: &str,
        dataset_image_id: &str,
        analysis_type: &str,
    ) -> Result<usize, StoreError> {
        Ok(self
            .store
            .query(
                &self.collection(project_iteration_id),
                &[
                    FieldFilter::eq("dataset_image_id", dataset_image_id),
                    FieldFilter::eq("analysis_type", analysis_type),
                ],
            )
            .await?
            .len())
    }
}
