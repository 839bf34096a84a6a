//! Security utilities: input validation and audit logging.

pub mod audit;
pub mod input;
