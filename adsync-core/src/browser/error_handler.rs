use std::fmt;
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags};
use serde::Serialize;
use thiserror::Error;

use super::error::{BrowserError, BrowserResult};
use crate::sqlite::open_configured;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Validation,
    TransientNetwork,
    UiTimeout,
    SessionLost,
    AuthenticationBlocked,
    ManualInterventionRequired,
    Cancelled,
    Unexpected,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::Validation => "validation",
            FailureCategory::TransientNetwork => "transient_network",
            FailureCategory::UiTimeout => "ui_timeout",
            FailureCategory::SessionLost => "session_lost",
            FailureCategory::AuthenticationBlocked => "authentication_blocked",
            FailureCategory::ManualInterventionRequired => "manual_intervention_required",
            FailureCategory::Cancelled => "cancelled",
            FailureCategory::Unexpected => "unexpected",
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(
            self,
            FailureCategory::TransientNetwork
                | FailureCategory::UiTimeout
                | FailureCategory::SessionLost
        )
    }

    /// Categories that stop the whole pass, reported as blocked.
    pub fn blocks_run(&self) -> bool {
        matches!(
            self,
            FailureCategory::AuthenticationBlocked | FailureCategory::ManualInterventionRequired
        )
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct ErrorCategorizer;

impl ErrorCategorizer {
    pub fn categorize(error: &BrowserError) -> FailureCategory {
        match error {
            BrowserError::Timeout(_) => FailureCategory::UiTimeout,
            BrowserError::Network(_) | BrowserError::StaleElement(_) | BrowserError::Io(_) => {
                FailureCategory::TransientNetwork
            }
            BrowserError::SessionLost(_) => FailureCategory::SessionLost,
            BrowserError::Rejected(_)
            | BrowserError::Configuration(_)
            | BrowserError::PageBudgetExceeded { .. } => FailureCategory::Validation,
            BrowserError::AuthenticationBlocked(_) => FailureCategory::AuthenticationBlocked,
            BrowserError::ManualIntervention(_) => FailureCategory::ManualInterventionRequired,
            BrowserError::Cancelled => FailureCategory::Cancelled,
            BrowserError::Launch(message) => {
                if message.to_lowercase().contains("permission") {
                    FailureCategory::Unexpected
                } else {
                    FailureCategory::TransientNetwork
                }
            }
            BrowserError::Cdp(err) => {
                let text = err.to_string().to_lowercase();
                if text.contains("timeout") {
                    FailureCategory::UiTimeout
                } else if text.contains("websocket")
                    || text.contains("connection")
                    || text.contains("channel")
                    || text.contains("net::")
                {
                    FailureCategory::TransientNetwork
                } else {
                    FailureCategory::Unexpected
                }
            }
            BrowserError::Profile(_) | BrowserError::Telemetry(_) | BrowserError::Unexpected(_) => {
                FailureCategory::Unexpected
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub enum RemediationAction {
    RetryScheduled { delay_ms: u64 },
    Reauthenticate { delay_ms: u64 },
    Abort,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureContext {
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub category: FailureCategory,
    pub error_message: String,
    pub attempt: usize,
    pub action: RemediationAction,
}

/// One reconciliation pass as persisted in `sync_runs`.
#[derive(Debug, Clone, Serialize)]
pub struct RunContext {
    pub timestamp: DateTime<Utc>,
    pub mode: String,
    pub planned: usize,
    pub succeeded: usize,
    pub partial: usize,
    pub failed: usize,
    pub blocked: usize,
    pub skipped: usize,
    pub duration_ms: i64,
    pub aborted: Option<String>,
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl From<TelemetryError> for BrowserError {
    fn from(error: TelemetryError) -> Self {
        BrowserError::Telemetry(error.to_string())
    }
}

/// JSON-lines failure log plus a SQLite mirror for querying.
#[derive(Debug)]
pub struct AutomationTelemetry {
    log: Mutex<File>,
    db_path: PathBuf,
    flags: OpenFlags,
}

impl AutomationTelemetry {
    pub fn new(
        log_path: impl AsRef<Path>,
        db_path: impl AsRef<Path>,
    ) -> Result<Self, TelemetryError> {
        let log_path = log_path.as_ref().to_path_buf();
        if let Some(parent) = log_path.parent() {
            create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            create_dir_all(parent)?;
        }
        let telemetry = Self {
            log: Mutex::new(file),
            db_path,
            flags: OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        };
        telemetry.initialize_db()?;
        Ok(telemetry)
    }

    fn initialize_db(&self) -> Result<(), TelemetryError> {
        let conn = self.open_db()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sync_failures (
                ts DATETIME DEFAULT CURRENT_TIMESTAMP,
                operation TEXT,
                category TEXT,
                error_message TEXT,
                attempt INTEGER,
                remediation TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_sync_failures_ts ON sync_failures(ts DESC);
            CREATE TABLE IF NOT EXISTS sync_runs (
                ts DATETIME DEFAULT CURRENT_TIMESTAMP,
                mode TEXT,
                planned INTEGER,
                succeeded INTEGER,
                partial INTEGER,
                failed INTEGER,
                blocked INTEGER,
                skipped INTEGER,
                duration_ms INTEGER,
                aborted TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_sync_runs_ts ON sync_runs(ts DESC);",
        )?;
        Ok(())
    }

    fn open_db(&self) -> Result<Connection, TelemetryError> {
        let conn = open_configured(&self.db_path, self.flags)?;
        Ok(conn)
    }

    pub fn record_failure(&self, failure: &FailureContext) -> Result<(), TelemetryError> {
        let json = serde_json::to_string(failure)?;
        if let Ok(mut guard) = self.log.lock() {
            writeln!(guard, "{json}")?;
            guard.flush()?;
        }
        let conn = self.open_db()?;
        conn.execute(
            "INSERT INTO sync_failures (operation, category, error_message, attempt, remediation)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                failure.operation,
                failure.category.as_str(),
                failure.error_message,
                failure.attempt as i64,
                serde_json::to_string(&failure.action)?,
            ],
        )?;
        Ok(())
    }

    pub fn record_run(&self, run: &RunContext) -> Result<(), TelemetryError> {
        let conn = self.open_db()?;
        conn.execute(
            "INSERT INTO sync_runs (
                mode, planned, succeeded, partial, failed, blocked, skipped, duration_ms, aborted
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                run.mode,
                run.planned as i64,
                run.succeeded as i64,
                run.partial as i64,
                run.failed as i64,
                run.blocked as i64,
                run.skipped as i64,
                run.duration_ms,
                run.aborted,
            ],
        )?;
        Ok(())
    }

    pub fn database_path(&self) -> &Path {
        &self.db_path
    }
}

pub fn telemetry_failure(
    telemetry: &AutomationTelemetry,
    operation: &str,
    error: &BrowserError,
    attempt: usize,
    action: RemediationAction,
) -> BrowserResult<()> {
    let entry = FailureContext {
        timestamp: Utc::now(),
        operation: operation.to_string(),
        category: ErrorCategorizer::categorize(error),
        error_message: error.to_string(),
        attempt,
        action,
    };
    telemetry.record_failure(&entry)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn categorizes_retryable_and_blocking_errors() {
        let cases = [
            (BrowserError::Timeout("#postad-title".into()), FailureCategory::UiTimeout),
            (BrowserError::Network("reset".into()), FailureCategory::TransientNetwork),
            (BrowserError::SessionLost("login page".into()), FailureCategory::SessionLost),
            (BrowserError::Rejected("price".into()), FailureCategory::Validation),
            (
                BrowserError::PageBudgetExceeded { max_pages: 50 },
                FailureCategory::Validation,
            ),
            (
                BrowserError::AuthenticationBlocked("captcha".into()),
                FailureCategory::AuthenticationBlocked,
            ),
            (BrowserError::Cancelled, FailureCategory::Cancelled),
        ];
        for (error, expected) in cases {
            assert_eq!(ErrorCategorizer::categorize(&error), expected, "{error}");
        }
        assert!(FailureCategory::SessionLost.retryable());
        assert!(!FailureCategory::Validation.retryable());
        assert!(FailureCategory::ManualInterventionRequired.blocks_run());
        assert!(!FailureCategory::UiTimeout.blocks_run());
    }

    #[test]
    fn telemetry_persists_entries() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("failures.jsonl");
        let db_path = dir.path().join("telemetry.sqlite");
        let telemetry = AutomationTelemetry::new(&log_path, &db_path).unwrap();

        let error = BrowserError::Timeout("#pstad-submit".into());
        telemetry_failure(
            &telemetry,
            "create sofa",
            &error,
            1,
            RemediationAction::RetryScheduled { delay_ms: 2000 },
        )
        .unwrap();
        telemetry
            .record_run(&RunContext {
                timestamp: Utc::now(),
                mode: "reconcile".into(),
                planned: 2,
                succeeded: 1,
                partial: 0,
                failed: 1,
                blocked: 0,
                skipped: 0,
                duration_ms: 1200,
                aborted: None,
            })
            .unwrap();

        let log_contents = std::fs::read_to_string(&log_path).unwrap();
        assert!(log_contents.contains("#pstad-submit"));
        assert!(log_contents.contains("ui_timeout"));

        let conn = Connection::open(&db_path).unwrap();
        let failure_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM sync_failures", [], |row| row.get(0))
            .unwrap();
        assert_eq!(failure_count, 1);
        let run_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM sync_runs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(run_count, 1);
    }
}
