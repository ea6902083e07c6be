//! Repository for the `cutouts` subcollection.

use annotator_core::identity;
use annotator_core::types::Timestamp;
use chrono::Utc;

use crate::error::StoreError;
use crate::models::cutout::{CreateCutout, Cutout, ANALYSIS_TYPES_FIELD};
use crate::models::{from_document, to_document};
use crate::repositories::{iteration_collection, mutator};
use crate::store::{BatchWrite, CollectionRef, DocRef, FieldFilter, SharedStore, Transaction};

const COLLECTION: &str = "cutouts";

/// Attempts at generating a non-colliding identifier before giving up.
const GENERATE_ATTEMPTS: u32 = 3;

/// Provides CRUD and set-mutation operations for cutouts.
pub struct CutoutRepo {
    store: SharedStore,
}

impl CutoutRepo {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    fn collection(&self, project_iteration_id: &str) -> CollectionRef {
        iteration_collection(project_iteration_id, COLLECTION)
    }

    fn doc(&self, project_iteration_id: &str, cutout_id: &str) -> DocRef {
        self.collection(project_iteration_id).doc(cutout_id)
    }

    fn build(
        &self,
        project_iteration_id: &str,
        cutout_id: String,
        input: &CreateCutout,
        now: Timestamp,
    ) -> Cutout {
        Cutout {
            cutout_id,
            project_iteration_id: project_iteration_id.to_string(),
            dataset_image_id: input.dataset_image_id.clone(),
            bounding_box: input.bounding_box.clone(),
            analysis_types: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a cutout. A producer-assigned identifier is created
    /// if-absent; without one, a fresh identifier is generated and a
    /// duplicate is retried with a new identifier before surfacing
    /// `IdentifierCollision`.
    pub async fn create(
        &self,
        project_iteration_id: &str,
        input: CreateCutout,
    ) -> Result<Cutout, StoreError> {
        let now = Utc::now();

        if let Some(id) = input.cutout_id.clone() {
            let cutout = self.build(project_iteration_id, id, &input, now);
            self.store
                .create(
                    &self.doc(project_iteration_id, &cutout.cutout_id),
                    to_document(&cutout)?,
                )
                .await?;
            tracing::debug!(project_iteration_id, cutout_id = %cutout.cutout_id, "created cutout");
            return Ok(cutout);
        }

        let mut last_id = String::new();
        for _ in 0..GENERATE_ATTEMPTS {
            let id = identity::generate();
            let cutout = self.build(project_iteration_id, id.clone(), &input, now);
            match self
                .store
                .create(
                    &self.doc(project_iteration_id, &id),
                    to_document(&cutout)?,
                )
                .await
            {
                Ok(()) => {
                    tracing::debug!(project_iteration_id, cutout_id = %id, "created cutout");
                    return Ok(cutout);
                }
                Err(StoreError::AlreadyExists { .. }) => {
                    tracing::warn!(cutout_id = %id, "generated identifier collided, regenerating");
                    last_id = id;
                }
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::IdentifierCollision { id: last_id })
    }

    /// Bulk creation through a batch write. Identifiers must be producer
    /// assigned so redelivery re-creates the same documents;
    /// `AlreadyExists` per item is benign and skipped. Returns the number
    /// of documents actually created.
    pub async fn create_many(
        &self,
        project_iteration_id: &str,
        inputs: Vec<CreateCutout>,
    ) -> Result<usize, StoreError> {
        let now = Utc::now();
        let mut writes = Vec::with_capacity(inputs.len());
        for input in inputs {
            let id = input.cutout_id.clone().ok_or_else(|| {
                StoreError::Internal(
                    "bulk cutout creation requires producer-assigned identifiers".to_string(),
                )
            })?;
            let cutout = self.build(project_iteration_id, id, &input, now);
            writes.push(BatchWrite::Create {
                doc: self.doc(project_iteration_id, &cutout.cutout_id),
                data: to_document(&cutout)?,
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
        tracing::debug!(project_iteration_id, created, "bulk created cutouts");
        Ok(created)
    }

    pub async fn get_by_id(
        &self,
        project_iteration_id: &str,
        cutout_id: &str,
    ) -> Result<Option<Cutout>, StoreError> {
        self.store
            .get(&self.doc(project_iteration_id, cutout_id))
            .await?
            .map(from_document)
            .transpose()
    }

    pub async fn list_by_iteration(
        &self,
        project_iteration_id: &str,
    ) -> Result<Vec<Cutout>, StoreError> {
        self.store
            .query(&self.collection(project_iteration_id), &[])
            .await?
            .into_iter()
            .map(|(_, data)| from_document(data))
            .collect()
    }

    pub async fn list_by_dataset_image(
        &self,
        project_iteration_id: &str,
        dataset_image_id: &str,
    ) -> Result<Vec<Cutout>, StoreError> {
        self.store
            .query(
                &self.collection(project_iteration_id),
                &[FieldFilter::eq("dataset_image_id", dataset_image_id)],
            )
            .await?
            .into_iter()
            .map(|(_, data)| from_document(data))
            .collect()
    }

    /// Count of cutouts for one dataset image. O(matching documents).
    pub async fn count_by_dataset_image(
        &self,
        project_iteration_id: &str,
        dataset_image_id: &str,
    ) -> Result<usize, StoreError> {
        Ok(self
            .store
            .query(
                &self.collection(project_iteration_id),
                &[FieldFilter::eq("dataset_image_id", dataset_image_id)],
            )
            .await?
            .len())
    }

    /// Add an analysis type to the cutout's set in its own retrying
    /// transaction.
    pub async fn add_analysis_type(
        &self,
        project_iteration_id: &str,
        cutout_id: &str,
        analysis_type: &str,
    ) -> Result<(), StoreError> {
        self.mutate_analysis_types(project_iteration_id, cutout_id, &[analysis_type.to_string()], &[])
            .await
    }

    /// Set-mutate the cutout's analysis types. Additions are applied
    /// before removals, so an element in both sets ends up absent.
    pub async fn mutate_analysis_types(
        &self,
        project_iteration_id: &str,
        cutout_id: &str,
        add: &[String],
        remove: &[String],
    ) -> Result<(), StoreError> {
        mutator::mutate_set(
            self.store.as_ref(),
            &self.doc(project_iteration_id, cutout_id),
            ANALYSIS_TYPES_FIELD,
            add,
            remove,
        )
        .await
    }

    /// Stage the set addition inside a caller-owned transaction.
    pub async fn stage_add_analysis_type(
        &self,
        tx: &mut Transaction,
        project_iteration_id: &str,
        cutout_id: &str,
        analysis_type: &str,
        now: Timestamp,
    ) -> Result<(), StoreError> {
        mutator::stage_set_mutation(
            tx,
            &self.doc(project_iteration_id, cutout_id),
            ANALYSIS_TYPES_FIELD,
            &[analysis_type.to_string()],
            &[],
            now,
        )
        .await
        .map(|_| ())
    }
}
