//! Read-only query surface for external stage implementations.
//!
//! All operations are side-effect free. Counting operations are answered
//! by scoped equality queries rather than database-side joins, so their
//! cost is O(matching documents), not O(1).

use std::sync::Arc;

use annotator_db::models::annotated_image::AnnotatedImageSummary;
use annotator_db::models::cutout::Cutout;
use annotator_db::models::dataset_image::DatasetImage;
use annotator_db::models::project_iteration::ProjectIteration;
use annotator_db::repositories::{
    AnnotatedImageRepo, CutoutAnalysisRepo, CutoutRepo, DatasetImageRepo, ProjectIterationRepo,
};
use annotator_db::store::SharedStore;
use annotator_db::StoreError;

use annotator_core::config::Config;

/// Read-only view over the pipeline's aggregate state.
pub struct StatusQueries {
    iterations: ProjectIterationRepo,
    dataset_images: DatasetImageRepo,
    cutouts: CutoutRepo,
    cutout_analyses: CutoutAnalysisRepo,
    annotated_images: AnnotatedImageRepo,
}

impl StatusQueries {
    pub fn new(store: SharedStore, config: Config) -> Self {
        Self {
            iterations: ProjectIterationRepo::new(Arc::clone(&store), config),
            dataset_images: DatasetImageRepo::new(Arc::clone(&store)),
            cutouts: CutoutRepo::new(Arc::clone(&store)),
            cutout_analyses: CutoutAnalysisRepo::new(Arc::clone(&store)),
            annotated_images: AnnotatedImageRepo::new(store),
        }
    }

    pub async fn get_iteration(
        &self,
        project_iteration_id: &str,
    ) -> Result<Option<ProjectIteration>, StoreError> {
        self.iterations.get_by_id(project_iteration_id).await
    }

    pub async fn list_dataset_images(
        &self,
        project_iteration_id: &str,
    ) -> Result<Vec<DatasetImage>, StoreError> {
        self.dataset_images
            .list_by_iteration(project_iteration_id)
            .await
    }

    /// Cutouts of the iteration, optionally narrowed to one dataset
    /// image.
    pub async fn list_cutouts(
        &self,
        project_iteration_id: &str,
        dataset_image_id: Option<&str>,
    ) -> Result<Vec<Cutout>, StoreError> {
        match dataset_image_id {
            Some(dataset_image_id) => {
                self.cutouts
                    .list_by_dataset_image(project_iteration_id, dataset_image_id)
                    .await
            }
            None => self.cutouts.list_by_iteration(project_iteration_id).await,
        }
    }

    /// Number of cutouts of one dataset image holding an analysis of the
    /// given type. O(matching documents).
    pub async fn count_analyzed_cutouts(
        &self,
        project_iteration_id: &str,
        dataset_image_id: &str,
        analysis_type: &str,
    ) -> Result<usize, StoreError> {
        self.cutout_analyses
            .count_by_dataset_image(project_iteration_id, dataset_image_id, analysis_type)
            .await
    }

    pub async fn get_annotation_summary(
        &self,
        project_iteration_id: &str,
        dataset_image_id: &str,
    ) -> Result<Option<AnnotatedImageSummary>, StoreError> {
        self.annotated_images
            .get_summary(project_iteration_id, dataset_image_id)
            .await
    }
}
