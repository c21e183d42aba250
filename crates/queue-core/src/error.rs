//! The crate-wide error taxonomy.
//!
//! Mirrors the split already used by the store crate's own error handling:
//! a small enum of well-known kinds, with `#[from]` conversions for the
//! lower-level errors that naturally produce them.

use crate::job::JobId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid job spec: {0}")]
    InvalidJobSpec(String),

    #[error("job {0} already exists")]
    DuplicateId(JobId),

    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("version conflict on job {0}")]
    VersionConflict(JobId),

    #[error("job store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("executor failed: {0}")]
    ExecutorFailure(String),
}
