use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::browser::{BrowserMetrics, FailureCategory, RunContext};
use crate::remote::AmbiguousMatch;

use super::models::{OperationOutcome, OperationRecord, PlanMode, PlannedOperation};

/// Why a pass stopped before every operation ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AbortReason {
    pub category: FailureCategory,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub succeeded: usize,
    pub partial: usize,
    pub failed: usize,
    pub blocked: usize,
    pub skipped: usize,
    pub not_attempted: usize,
}

/// Everything one reconciliation pass did or decided not to do.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub mode: PlanMode,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub planned: Vec<PlannedOperation>,
    pub records: Vec<OperationRecord>,
    pub ambiguous: Vec<AmbiguousMatch>,
    pub validation_errors: Vec<String>,
    pub aborted: Option<AbortReason>,
    pub duration_ms: i64,
    pub metrics: BrowserMetrics,
}

impl RunReport {
    pub fn new(run_id: impl Into<String>, mode: PlanMode, dry_run: bool) -> Self {
        Self {
            run_id: run_id.into(),
            mode,
            dry_run,
            started_at: Utc::now(),
            planned: Vec::new(),
            records: Vec::new(),
            ambiguous: Vec::new(),
            validation_errors: Vec::new(),
            aborted: None,
            duration_ms: 0,
            metrics: BrowserMetrics::default(),
        }
    }

    pub fn counts(&self) -> OutcomeCounts {
        let mut counts = OutcomeCounts::default();
        for record in &self.records {
            match record.outcome {
                OperationOutcome::Succeeded { .. } => counts.succeeded += 1,
                OperationOutcome::PartialSuccess { .. } => counts.partial += 1,
                OperationOutcome::Failed { .. } => counts.failed += 1,
                OperationOutcome::Blocked { .. } => counts.blocked += 1,
                OperationOutcome::Skipped => counts.skipped += 1,
                OperationOutcome::NotAttempted { .. } => counts.not_attempted += 1,
            }
        }
        counts
    }

    pub fn record(&self, seq: usize) -> Option<&OperationRecord> {
        self.records.iter().find(|record| record.operation.seq == seq)
    }

    /// False when anything failed, was blocked, aborted the pass, or an ad
    /// file could not be loaded. Partial successes still count as ok.
    pub fn exit_ok(&self) -> bool {
        self.aborted.is_none()
            && self.validation_errors.is_empty()
            && !self.records.iter().any(|record| record.outcome.is_failure())
    }

    pub fn has_warnings(&self) -> bool {
        let counts = self.counts();
        counts.partial > 0 || !self.ambiguous.is_empty()
    }

    pub fn to_run_context(&self) -> RunContext {
        let counts = self.counts();
        RunContext {
            timestamp: self.started_at,
            mode: self.mode.as_str().to_string(),
            planned: self.planned.len(),
            succeeded: counts.succeeded,
            partial: counts.partial,
            failed: counts.failed,
            blocked: counts.blocked,
            skipped: counts.skipped,
            duration_ms: self.duration_ms,
            aborted: self
                .aborted
                .as_ref()
                .map(|reason| format!("{}: {}", reason.category, reason.message)),
        }
    }
}

/// What happened to one listing of a download pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DownloadOutcome {
    /// Written to `path`; `content_hash` is absent when the file did not
    /// validate as an ad and needs editing first.
    Saved {
        path: PathBuf,
        content_hash: Option<String>,
    },
    /// Read but not written, as without persistence.
    Extracted,
    NotFound,
    Failed {
        category: FailureCategory,
        message: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadRecord {
    pub remote_id: String,
    pub title: Option<String>,
    pub outcome: DownloadOutcome,
}

/// Result of copying live listings into ad files.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadReport {
    pub selector: String,
    pub records: Vec<DownloadRecord>,
    pub aborted: Option<AbortReason>,
}

impl DownloadReport {
    pub fn new(selector: impl Into<String>) -> Self {
        Self {
            selector: selector.into(),
            records: Vec::new(),
            aborted: None,
        }
    }

    pub fn saved(&self) -> usize {
        self.records
            .iter()
            .filter(|record| matches!(record.outcome, DownloadOutcome::Saved { .. }))
            .count()
    }

    /// Listings asked for by id that the site does not show count as failures.
    pub fn exit_ok(&self) -> bool {
        self.aborted.is_none()
            && !self.records.iter().any(|record| {
                matches!(
                    record.outcome,
                    DownloadOutcome::Failed { .. } | DownloadOutcome::NotFound
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::models::{OperationKind, ReasonCode};

    fn record(seq: usize, outcome: OperationOutcome) -> OperationRecord {
        OperationRecord::new(
            PlannedOperation {
                seq,
                kind: OperationKind::Update,
                local_id: Some(format!("ad-{seq}")),
                title: None,
                remote_id: Some(format!("{}", 2_000_000 + seq)),
                reason: ReasonCode::ContentDrift,
                replaces: None,
            },
            outcome,
            1,
        )
    }

    #[test]
    fn partial_success_keeps_exit_ok() {
        let mut report = RunReport::new("run", PlanMode::Reconcile, false);
        report.records.push(record(1, OperationOutcome::Succeeded { remote_id: None }));
        report.records.push(record(
            2,
            OperationOutcome::PartialSuccess {
                completed_steps: vec!["submitted".into()],
                detail: "1 of 2 images attached".into(),
            },
        ));
        assert!(report.exit_ok());
        assert!(report.has_warnings());
        assert_eq!(report.counts().partial, 1);
    }

    #[test]
    fn failures_aborts_and_invalid_files_fail_the_run() {
        let mut failed = RunReport::new("run", PlanMode::Reconcile, false);
        failed.records.push(record(
            1,
            OperationOutcome::Failed {
                category: FailureCategory::UiTimeout,
                message: "timeout waiting for #pstad-submit".into(),
                attempts: 3,
            },
        ));
        assert!(!failed.exit_ok());

        let mut aborted = RunReport::new("run", PlanMode::Reconcile, false);
        aborted.aborted = Some(AbortReason {
            category: FailureCategory::AuthenticationBlocked,
            message: "captcha".into(),
        });
        assert!(!aborted.exit_ok());
        assert_eq!(
            aborted.to_run_context().aborted.as_deref(),
            Some("authentication_blocked: captcha")
        );

        let mut invalid = RunReport::new("run", PlanMode::Reconcile, true);
        invalid.validation_errors.push("invalid ad ads/x.yaml: title too short".into());
        assert!(!invalid.exit_ok());
    }

    #[test]
    fn download_needs_every_listing_found() {
        let mut report = DownloadReport::new("2000001,2000002");
        report.records.push(DownloadRecord {
            remote_id: "2000001".into(),
            title: Some("Lampe aus Messing".into()),
            outcome: DownloadOutcome::Saved {
                path: PathBuf::from("downloaded-ads/ad_2000001.yaml"),
                content_hash: None,
            },
        });
        assert!(report.exit_ok());
        assert_eq!(report.saved(), 1);

        report.records.push(DownloadRecord {
            remote_id: "2000002".into(),
            title: None,
            outcome: DownloadOutcome::NotFound,
        });
        assert!(!report.exit_ok());
    }
}
