//! Row structs and DTOs.
//!
//! Each submodule contains:
//! - A `FromRow` + `Serialize` entity struct matching the database row
//! - A `Deserialize` create DTO for inserts where rows are created from input

pub mod annotation;
pub mod dataset;
pub mod label;
pub mod mask_item;
pub mod revision;
