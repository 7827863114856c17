//! Error taxonomy
//!
//! - data-access failures (`StoreError::Database`, `SourceError`) always name the operation
//! - absence of a stored metric is `StoreError::NotFound`, never a database error
//! - per-account failures inside the refresh pipeline are `PipelineError::Batch`

use crate::types::Height;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("database error while {op}: {source}")]
    Database {
        op: &'static str,
        #[source]
        source: rusqlite::Error,
    },
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("malformed value while {op}: {detail}")]
    Malformed { op: &'static str, detail: String },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Attach the operation name to a rusqlite result
pub(crate) trait DbResultExt<T> {
    fn during(self, op: &'static str) -> Result<T, StoreError>;
}

impl<T> DbResultExt<T> for Result<T, rusqlite::Error> {
    fn during(self, op: &'static str) -> Result<T, StoreError> {
        self.map_err(|source| StoreError::Database { op, source })
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SourceError {
    #[error("chain source request failed while {op}: {source}")]
    Http {
        op: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("chain source returned {status} while {op}")]
    Status { op: &'static str, status: u16 },
    #[error("unexpected chain source payload while {op}: {detail}")]
    Malformed { op: &'static str, detail: String },
    #[error("account {address} not found at height {height}")]
    AccountNotFound { address: String, height: Height },
}

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("arithmetic overflow while computing {0}")]
    Overflow(&'static str),
    #[error("refresh batch {index} stopped at account {address}: {source}")]
    Batch {
        index: usize,
        address: String,
        #[source]
        source: Box<PipelineError>,
    },
    #[error("refresh batch {index} did not complete: {message}")]
    TaskFailed { index: usize, message: String },
}

impl PipelineError {
    /// Index of the refresh batch that produced this error, if any
    pub fn batch_index(&self) -> Option<usize> {
        match self {
            PipelineError::Batch { index, .. } | PipelineError::TaskFailed { index, .. } => {
                Some(*index)
            }
            _ => None,
        }
    }
}
