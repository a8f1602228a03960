//! Persistence layer for race-ace
//!
//! File-backed storage for simulated experience (append-only, partitioned by
//! event date) and for the rolling playbook history. Every file is committed
//! whole through a temp-file-then-rename, so readers never observe a partial write.

pub mod atomic;
pub mod repository;
pub mod schema;

use chrono::NaiveDate;
use std::path::PathBuf;
use thiserror::Error;

pub use atomic::{write_atomic, StagedFile};
pub use repository::{DateRange, ExperienceStore, PlaybookDocument, PlaybookStore, WriteSummary};
pub use schema::{Action, ExperienceRecord, PartitionScheme};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt store file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Invalid date range: {start} > {end}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },

    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
