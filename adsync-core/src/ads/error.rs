use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdError {
    #[error("failed to read ad file {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("failed to parse ad file {path}: {source}")]
    Parse {
        source: serde_yaml::Error,
        path: PathBuf,
    },
    #[error("invalid ad {path}: {message}")]
    Validation { path: PathBuf, message: String },
    #[error("invalid file pattern `{pattern}`: {source}")]
    Pattern {
        pattern: String,
        source: glob::PatternError,
    },
    #[error("duplicate local id `{local_id}` in {first} and {second}")]
    DuplicateId {
        local_id: String,
        first: PathBuf,
        second: PathBuf,
    },
    #[error("failed to write ad state {path}: {source}")]
    Write { source: io::Error, path: PathBuf },
    #[error("failed to serialize ad state {path}: {source}")]
    Serialize {
        source: serde_yaml::Error,
        path: PathBuf,
    },
}

impl AdError {
    pub fn validation(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        AdError::Validation {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            AdError::Io { path, .. }
            | AdError::Parse { path, .. }
            | AdError::Validation { path, .. }
            | AdError::Write { path, .. }
            | AdError::Serialize { path, .. } => Some(path),
            AdError::DuplicateId { second, .. } => Some(second),
            AdError::Pattern { .. } => None,
        }
    }
}

pub type AdResult<T> = Result<T, AdError>;
