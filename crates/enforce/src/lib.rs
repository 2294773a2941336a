//! Enforcing subsystem: a per-parent coordinator that keeps a declared set
//! of resources and cross-object patches continually applied against
//! concurrent mutation, deletion and drift.

#![forbid(unsafe_code)]

pub mod coordinator;
pub mod patch;
pub mod resource;
pub mod status;
pub mod validate;

pub use coordinator::{Coordinator, CoordinatorOptions};
pub use status::{PatchConditions, ResourceConditions, RECONCILER_BUCKET};
pub use validate::Validator;

/// Errors surfaced to the embedding controller.
#[derive(Debug, thiserror::Error)]
pub enum EnforceError {
    /// The desired set was rejected; running state is untouched. Carries
    /// every problem found, not just the first.
    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("discovery: {0}")]
    Discovery(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for EnforceError {
    fn from(e: anyhow::Error) -> Self {
        EnforceError::Internal(format!("{:#}", e))
    }
}

pub type EnforceResult<T> = Result<T, EnforceError>;
