//! Repository for the `product_images` subcollection.

use annotator_core::status::ProductImageStatus;
use annotator_core::types::Timestamp;
use chrono::Utc;

use crate::error::StoreError;
use crate::models::product_image::{CreateProductImage, ProductImage, UpdateProductImage};
use crate::models::{from_document, to_document};
use crate::repositories::iteration_collection;
use crate::store::{run_transaction, CollectionRef, DocRef, Document, SharedStore, Transaction};

const COLLECTION: &str = "product_images";

/// Provides CRUD and analysis-result operations for product images.
pub struct ProductImageRepo {
    store: SharedStore,
}

impl ProductImageRepo {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    fn collection(&self, project_iteration_id: &str) -> CollectionRef {
        iteration_collection(project_iteration_id, COLLECTION)
    }

    fn doc(&self, project_iteration_id: &str, product_image_id: &str) -> DocRef {
        self.collection(project_iteration_id).doc(product_image_id)
    }

    /// Create-if-absent. Fails with `AlreadyExists` on a duplicate id.
    pub async fn create(
        &self,
        project_iteration_id: &str,
        input: CreateProductImage,
    ) -> Result<ProductImage, StoreError> {
        let now = Utc::now();
        let image = ProductImage {
            product_image_id: input.product_image_id,
            project_iteration_id: project_iteration_id.to_string(),
            status: ProductImageStatus::Pending,
            image_path: input.image_path,
            label: input.label,
            analysis_results: Default::default(),
            analysis_error: None,
            created_at: now,
            updated_at: now,
        };
        self.store
            .create(
                &self.doc(project_iteration_id, &image.product_image_id),
                to_document(&image)?,
            )
            .await?;
        tracing::debug!(
            project_iteration_id,
            product_image_id = %image.product_image_id,
            "created product image"
        );
        Ok(image)
    }

    pub async fn get_by_id(
        &self,
        project_iteration_id: &str,
        product_image_id: &str,
    ) -> Result<Option<ProductImage>, StoreError> {
        self.store
            .get(&self.doc(project_iteration_id, product_image_id))
            .await?
            .map(from_document)
            .transpose()
    }

    pub async fn list_by_iteration(
        &self,
        project_iteration_id: &str,
    ) -> Result<Vec<ProductImage>, StoreError> {
        self.store
            .query(&self.collection(project_iteration_id), &[])
            .await?
            .into_iter()
            .map(|(_, data)| from_document(data))
            .collect()
    }

    /// Apply a partial update. Only `Some` fields are written.
    pub async fn update(
        &self,
        project_iteration_id: &str,
        product_image_id: &str,
        input: UpdateProductImage,
    ) -> Result<(), StoreError> {
        let update = Self::build_update(input, Utc::now())?;
        self.store
            .set_merge(&self.doc(project_iteration_id, product_image_id), update)
            .await?;
        tracing::debug!(project_iteration_id, product_image_id, "updated product image");
        Ok(())
    }

    /// Stage a partial update inside a caller-owned transaction. The
    /// document is read first so a concurrent writer forces a retry.
    pub async fn stage_update(
        &self,
        tx: &mut Transaction,
        project_iteration_id: &str,
        product_image_id: &str,
        input: UpdateProductImage,
        now: Timestamp,
    ) -> Result<(), StoreError> {
        let doc = self.doc(project_iteration_id, product_image_id);
        if tx.get(&doc).await?.is_none() {
            return Err(StoreError::NotFound { path: doc.path() });
        }
        tx.merge(&doc, Self::build_update(input, now)?);
        Ok(())
    }

    /// Record one analysis result in its own retrying transaction.
    ///
    /// The results map is read-modified-written so two analysis types
    /// landing concurrently cannot overwrite each other.
    pub async fn record_analysis(
        &self,
        project_iteration_id: &str,
        product_image_id: &str,
        analysis_type: &str,
        result: serde_json::Value,
    ) -> Result<(), StoreError> {
        run_transaction(self.store.as_ref(), |mut tx| {
            let result = result.clone();
            async move {
                self.stage_record_analysis(
                    &mut tx,
                    project_iteration_id,
                    product_image_id,
                    analysis_type,
                    result,
                    Utc::now(),
                )
                .await?;
                Ok((tx, ()))
            }
        })
        .await
    }

    /// Stage an analysis result inside a caller-owned transaction.
    pub async fn stage_record_analysis(
        &self,
        tx: &mut Transaction,
        project_iteration_id: &str,
        product_image_id: &str,
        analysis_type: &str,
        result: serde_json::Value,
        now: Timestamp,
    ) -> Result<(), StoreError> {
        let doc = self.doc(project_iteration_id, product_image_id);
        let data = tx.get(&doc).await?.ok_or_else(|| StoreError::NotFound {
            path: doc.path(),
        })?;
        let mut image: ProductImage = from_document(data)?;
        image.analysis_results.insert(analysis_type.to_string(), result);
        image.status = ProductImageStatus::Analyzed;
        image.updated_at = now;

        let mut update = Document::new();
        update.insert(
            "analysis_results".to_string(),
            serde_json::to_value(&image.analysis_results)?,
        );
        update.insert("status".to_string(), serde_json::to_value(image.status)?);
        update.insert("updated_at".to_string(), serde_json::to_value(now)?);
        tx.merge(&doc, update);
        Ok(())
    }

    fn build_update(input: UpdateProductImage, now: Timestamp) -> Result<Document, StoreError> {
        let mut update = Document::new();
        if let Some(status) = input.status {
            update.insert("status".to_string(), serde_json::to_value(status)?);
        }
        if let Some(path) = input.image_path {
            update.insert("image_path".to_string(), path.into());
        }
        if let Some(label) = input.label {
            update.insert("label".to_string(), label.into());
        }
        if let Some(error) = input.analysis_error {
            update.insert("analysis_error".to_string(), error.into());
        }
        update.insert("updated_at".to_string(), serde_json::to_value(now)?);
        Ok(update)
    }
}
