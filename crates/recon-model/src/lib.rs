//! Data model shared by every tier: identifiers, statuses, task and node records.

mod domain;
pub use domain::*;

mod error;
pub use error::ModelError;
