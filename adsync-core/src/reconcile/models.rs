use std::fmt;

use serde::Serialize;

use crate::ads::Ad;
use crate::browser::FailureCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    Skip,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::Skip => "skip",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the planner chose an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    NotPublished,
    /// The recorded listing no longer exists remotely.
    RemoteMissing,
    ContentDrift,
    HashUnknown,
    Forced,
    NoDrift,
    Reserved,
    MarkedForRemoval,
    DeleteRequested,
    Orphaned,
    Republication,
    ReplacedListing,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::NotPublished => "not_published",
            ReasonCode::RemoteMissing => "remote_missing",
            ReasonCode::ContentDrift => "content_drift",
            ReasonCode::HashUnknown => "hash_unknown",
            ReasonCode::Forced => "forced",
            ReasonCode::NoDrift => "no_drift",
            ReasonCode::Reserved => "reserved",
            ReasonCode::MarkedForRemoval => "marked_for_removal",
            ReasonCode::DeleteRequested => "delete_requested",
            ReasonCode::Orphaned => "orphaned",
            ReasonCode::Republication => "republication",
            ReasonCode::ReplacedListing => "replaced_listing",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanMode {
    /// `publish`: create, update, replace and delete as needed.
    Reconcile,
    /// `update`: only touch listings that already exist.
    UpdateOnly,
    /// `delete`: remove every selected ad that has a listing.
    DeleteSelected,
}

impl PlanMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanMode::Reconcile => "reconcile",
            PlanMode::UpdateOnly => "update_only",
            PlanMode::DeleteSelected => "delete_selected",
        }
    }
}

/// A unit of planned work. Consumed once by the executor.
#[derive(Debug, Serialize)]
pub struct Operation {
    pub seq: usize,
    pub kind: OperationKind,
    pub ad: Option<Ad>,
    pub remote_id: Option<String>,
    pub reason: ReasonCode,
    /// For a republication Create: the listing it supersedes.
    pub replaces: Option<String>,
}

impl Operation {
    pub(crate) fn new(
        kind: OperationKind,
        ad: Option<&Ad>,
        remote_id: Option<String>,
        reason: ReasonCode,
    ) -> Self {
        Self {
            seq: 0,
            kind,
            ad: ad.cloned(),
            remote_id,
            reason,
            replaces: None,
        }
    }

    pub fn local_id(&self) -> Option<&str> {
        self.ad.as_ref().map(|ad| ad.local_id.as_str())
    }

    /// `create sofa`, `delete 2000003`.
    pub fn label(&self) -> String {
        match (self.local_id(), &self.remote_id) {
            (Some(local), _) => format!("{} {local}", self.kind),
            (None, Some(remote)) => format!("{} {remote}", self.kind),
            (None, None) => self.kind.to_string(),
        }
    }

    /// The superseded listing when this is one half of a republication.
    pub fn replacement_of(&self) -> Option<&str> {
        replacement_of(self.kind, self.reason, &self.remote_id, &self.replaces)
    }

    pub fn summary(&self) -> PlannedOperation {
        PlannedOperation {
            seq: self.seq,
            kind: self.kind,
            local_id: self.local_id().map(str::to_string),
            title: self.ad.as_ref().map(|ad| ad.title.clone()),
            remote_id: self.remote_id.clone(),
            reason: self.reason,
            replaces: self.replaces.clone(),
        }
    }
}

/// Report-side view of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedOperation {
    pub seq: usize,
    pub kind: OperationKind,
    pub local_id: Option<String>,
    pub title: Option<String>,
    pub remote_id: Option<String>,
    pub reason: ReasonCode,
    pub replaces: Option<String>,
}

impl PlannedOperation {
    pub fn replacement_of(&self) -> Option<&str> {
        replacement_of(self.kind, self.reason, &self.remote_id, &self.replaces)
    }
}

// The Create carries the old id in `replaces`, the Delete targets it directly.
fn replacement_of<'a>(
    kind: OperationKind,
    reason: ReasonCode,
    remote_id: &'a Option<String>,
    replaces: &'a Option<String>,
) -> Option<&'a str> {
    match (kind, reason) {
        (OperationKind::Create, _) => replaces.as_deref(),
        (OperationKind::Delete, ReasonCode::ReplacedListing) => remote_id.as_deref(),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OperationOutcome {
    Succeeded {
        remote_id: Option<String>,
    },
    PartialSuccess {
        completed_steps: Vec<String>,
        detail: String,
    },
    Failed {
        category: FailureCategory,
        message: String,
        attempts: usize,
    },
    Skipped,
    Blocked {
        category: FailureCategory,
        message: String,
    },
    NotAttempted {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl OperationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationOutcome::Succeeded { .. } => "succeeded",
            OperationOutcome::PartialSuccess { .. } => "partial_success",
            OperationOutcome::Failed { .. } => "failed",
            OperationOutcome::Skipped => "skipped",
            OperationOutcome::Blocked { .. } => "blocked",
            OperationOutcome::NotAttempted { .. } => "not_attempted",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            OperationOutcome::Failed { .. } | OperationOutcome::Blocked { .. }
        )
    }

    /// Whether the change reached the site, fully or in part.
    pub fn landed(&self) -> bool {
        matches!(
            self,
            OperationOutcome::Succeeded { .. } | OperationOutcome::PartialSuccess { .. }
        )
    }

    pub fn detail(&self) -> Option<String> {
        match self {
            OperationOutcome::Succeeded { remote_id } => remote_id.clone(),
            OperationOutcome::PartialSuccess { detail, .. } => Some(detail.clone()),
            OperationOutcome::Failed { message, .. } | OperationOutcome::Blocked { message, .. } => {
                Some(message.clone())
            }
            OperationOutcome::NotAttempted { reason } => reason.clone(),
            OperationOutcome::Skipped => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationRecord {
    #[serde(flatten)]
    pub operation: PlannedOperation,
    pub outcome: OperationOutcome,
    pub attempts: usize,
}

impl OperationRecord {
    pub fn new(operation: PlannedOperation, outcome: OperationOutcome, attempts: usize) -> Self {
        Self {
            operation,
            outcome,
            attempts,
        }
    }
}
