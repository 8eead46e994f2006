//! Repository layer.
//!
//! Each repository is a zero-sized struct providing async methods that
//! accept `&PgPool` as the first argument. The annotation repository is
//! generic over the annotation kind.

pub mod annotation_repo;
pub mod dataset_repo;
pub mod mask_item_repo;
pub mod revision_repo;

pub use annotation_repo::{AnnotationRepo, GroupRepo, TrackRepo};
pub use dataset_repo::DatasetRepo;
pub use mask_item_repo::MaskItemRepo;
pub use revision_repo::RevisionRepo;
