use std::path::PathBuf;

use thiserror::Error;

use crate::ads::AdError;
use crate::browser::{BrowserError, TelemetryError};
use crate::error::ConfigError;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ledger path not configured")]
    MissingStore,
    #[error("failed to open database at {path}: {source}")]
    OpenDatabase {
        path: PathBuf,
        source: rusqlite::Error,
    },
}

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Ad(#[from] AdError),
    #[error(transparent)]
    Browser(#[from] BrowserError),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),
}

pub type ReconcileResult<T> = std::result::Result<T, ReconcileError>;
