use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags};

use crate::sqlite::open_configured;

use super::error::{LedgerError, LedgerResult};
use super::models::OperationRecord;

const LEDGER_SCHEMA: &str = include_str!("../../sql/ledger.sql");

#[derive(Debug, Clone)]
pub struct OperationLedgerBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for OperationLedgerBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl OperationLedgerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> LedgerResult<OperationLedger> {
        let path = self.path.ok_or(LedgerError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(OperationLedger { path, flags })
    }
}

/// Listings adsync created, and every operation it executed.
#[derive(Debug, Clone)]
pub struct OperationLedger {
    path: PathBuf,
    flags: OpenFlags,
}

/// One `operations` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub seq: i64,
    pub kind: String,
    pub local_id: Option<String>,
    pub remote_id: Option<String>,
    pub reason: String,
    pub outcome: String,
    pub attempts: i64,
}

impl OperationLedger {
    pub fn builder() -> OperationLedgerBuilder {
        OperationLedgerBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> LedgerResult<Self> {
        OperationLedgerBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> LedgerResult<Connection> {
        open_configured(&self.path, self.flags).map_err(|source| LedgerError::OpenDatabase {
            path: self.path.clone(),
            source,
        })
    }

    pub fn initialize(&self) -> LedgerResult<()> {
        let conn = self.open()?;
        conn.execute_batch(LEDGER_SCHEMA)?;
        Ok(())
    }

    pub fn record_published(
        &self,
        remote_id: &str,
        local_id: &str,
        content_hash: Option<&str>,
        at: DateTime<Utc>,
    ) -> LedgerResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO listings (remote_id, local_id, content_hash, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(remote_id) DO UPDATE SET
                local_id = excluded.local_id,
                content_hash = excluded.content_hash,
                updated_at = excluded.updated_at,
                deleted_at = NULL",
            params![remote_id, local_id, content_hash, at.naive_utc()],
        )?;
        Ok(())
    }

    /// Returns false when the ledger never knew the listing.
    pub fn mark_deleted(&self, remote_id: &str, at: DateTime<Utc>) -> LedgerResult<bool> {
        let conn = self.open()?;
        let changed = conn.execute(
            "UPDATE listings SET deleted_at = ?2 WHERE remote_id = ?1 AND deleted_at IS NULL",
            params![remote_id, at.naive_utc()],
        )?;
        Ok(changed > 0)
    }

    /// Listings created by adsync that were not deleted since.
    pub fn live_remote_ids(&self) -> LedgerResult<HashSet<String>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT remote_id FROM listings WHERE deleted_at IS NULL")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(ids)
    }

    pub fn record_execution(&self, run_id: &str, record: &OperationRecord) -> LedgerResult<()> {
        let conn = self.open()?;
        let operation = &record.operation;
        conn.execute(
            "INSERT INTO operations (
                run_id, seq, kind, local_id, remote_id, reason, outcome, detail, attempts, recorded_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                run_id,
                operation.seq as i64,
                operation.kind.as_str(),
                operation.local_id,
                operation.remote_id,
                operation.reason.as_str(),
                record.outcome.as_str(),
                record.outcome.detail(),
                record.attempts as i64,
                Utc::now().naive_utc(),
            ],
        )?;
        Ok(())
    }

    pub fn operations_for_run(&self, run_id: &str) -> LedgerResult<Vec<LedgerEntry>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT seq, kind, local_id, remote_id, reason, outcome, attempts
             FROM operations WHERE run_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(LedgerEntry {
                    seq: row.get(0)?,
                    kind: row.get(1)?,
                    local_id: row.get(2)?,
                    remote_id: row.get(3)?,
                    reason: row.get(4)?,
                    outcome: row.get(5)?,
                    attempts: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
