//! Domain types and pure algorithms for the DIVE annotation store.
//!
//! Nothing in this crate performs I/O. Persistence lives in `dive-db` and
//! the storage seams and services live in `dive-engine`.

pub mod annotation;
pub mod batch;
pub mod dive_json;
pub mod error;
pub mod labels;
pub mod mask;
pub mod merge;
pub mod revision;
pub mod rle;
pub mod types;
