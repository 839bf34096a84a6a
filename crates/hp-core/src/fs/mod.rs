//! Local filesystem helpers.

pub mod staging;

pub use staging::{stage, StageError, StagedFile};
