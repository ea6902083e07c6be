//! Repository layer.
//!
//! Each repository wraps one entity kind over the shared store handle
//! injected at construction time. Write operations log at debug level;
//! counter and set mutations delegate to [`mutator`].

pub mod annotated_image_repo;
pub mod billing_repo;
pub mod cutout_analysis_repo;
pub mod cutout_repo;
pub mod dataset_image_repo;
pub mod mutator;
pub mod processed_event_repo;
pub mod product_image_repo;
pub mod project_iteration_repo;
pub mod usage_cache_repo;

pub use annotated_image_repo::AnnotatedImageRepo;
pub use billing_repo::BillingRepo;
pub use cutout_analysis_repo::CutoutAnalysisRepo;
pub use cutout_repo::CutoutRepo;
pub use dataset_image_repo::DatasetImageRepo;
pub use processed_event_repo::ProcessedEventRepo;
pub use product_image_repo::ProductImageRepo;
pub use project_iteration_repo::ProjectIterationRepo;
pub use usage_cache_repo::UsageCacheRepo;

use crate::store::{CollectionRef, DocRef};

/// Root collection for iteration subtrees.
pub(crate) const PROJECT_ITERATIONS: &str = "project_iterations";

pub(crate) fn iteration_doc(project_iteration_id: &str) -> DocRef {
    CollectionRef::root(PROJECT_ITERATIONS).doc(project_iteration_id)
}

pub(crate) fn iteration_collection(project_iteration_id: &str, name: &str) -> CollectionRef {
    iteration_doc(project_iteration_id).collection(name)
}
