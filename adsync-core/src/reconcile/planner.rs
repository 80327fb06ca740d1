use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::ads::{content_hash, Ad, AdSelector};
use crate::config::{ReconcileSection, ReplaceOrder};
use crate::remote::{
    AmbiguousMatch, IdentityMatcher, MatchResult, RemoteAdSummary, RemoteSnapshot, RemoteStatus,
};

use super::models::{Operation, OperationKind, PlanMode, ReasonCode};

#[derive(Debug, Clone)]
pub struct PlannerSettings {
    pub republish: bool,
    pub delete_orphans: bool,
    pub replace_order: ReplaceOrder,
    /// Suppresses the Delete half of a replacement.
    pub keep_old: bool,
}

impl PlannerSettings {
    pub fn new(reconcile: &ReconcileSection, replace_order: ReplaceOrder, keep_old: bool) -> Self {
        Self {
            republish: reconcile.republish,
            delete_orphans: reconcile.delete_orphans,
            replace_order,
            keep_old,
        }
    }
}

/// What one pass knows when it plans.
pub struct PlanInput<'a> {
    pub mode: PlanMode,
    pub selector: &'a AdSelector,
    /// The ads selected for this run.
    pub ads: &'a [Ad],
    /// Remote ids recorded by any ad file, selected or not.
    pub claimed: HashSet<String>,
    /// Remote ids the ledger says adsync created and never deleted.
    pub ledger_ids: HashSet<String>,
    pub snapshot: &'a RemoteSnapshot,
    pub now: DateTime<Utc>,
}

/// Operations in execution order plus the ads that could not be matched safely.
#[derive(Debug, Serialize)]
pub struct Plan {
    pub mode: PlanMode,
    pub operations: Vec<Operation>,
    pub ambiguous: Vec<AmbiguousMatch>,
    pub phase_order: Vec<OperationKind>,
}

impl Plan {
    /// Non-empty phases, in order. Operations keep their sequence numbers.
    pub fn into_phases(self) -> Vec<(OperationKind, Vec<Operation>)> {
        let mut phases: Vec<(OperationKind, Vec<Operation>)> = self
            .phase_order
            .iter()
            .map(|kind| (*kind, Vec::new()))
            .collect();
        for operation in self.operations {
            if let Some((_, bucket)) = phases.iter_mut().find(|(kind, _)| *kind == operation.kind) {
                bucket.push(operation);
            }
        }
        phases.retain(|(_, bucket)| !bucket.is_empty());
        phases
    }

    pub fn count(&self, kind: OperationKind) -> usize {
        self.operations.iter().filter(|op| op.kind == kind).count()
    }
}

pub struct ReconcilePlanner {
    settings: PlannerSettings,
}

struct Builder {
    operations: Vec<Operation>,
    ambiguous: Vec<AmbiguousMatch>,
    targeted: HashSet<String>,
    replacement: bool,
}

impl Builder {
    fn push(&mut self, operation: Operation) {
        if let Some(remote_id) = &operation.remote_id {
            if operation.kind != OperationKind::Skip && !self.targeted.insert(remote_id.clone()) {
                warn!(
                    target: "reconcile.planner",
                    remote_id = %remote_id,
                    operation = %operation.label(),
                    "listing already targeted in this pass, dropping operation"
                );
                return;
            }
        }
        self.operations.push(operation);
    }
}

impl ReconcilePlanner {
    pub fn new(settings: PlannerSettings) -> Self {
        Self { settings }
    }

    pub fn plan(&self, input: PlanInput<'_>) -> Plan {
        let matcher = IdentityMatcher::new(input.snapshot, input.claimed.clone());
        let mut builder = Builder {
            operations: Vec::new(),
            ambiguous: Vec::new(),
            targeted: HashSet::new(),
            replacement: false,
        };

        for ad in input.ads {
            let matched = matcher.match_ad(ad);
            if let MatchResult::Ambiguous(candidates) = &matched {
                warn!(
                    target: "reconcile.planner",
                    ad = %ad.local_id,
                    title = %ad.title,
                    candidates = ?candidates,
                    "several listings share this title, leaving the ad alone"
                );
                builder.ambiguous.push(AmbiguousMatch {
                    local_id: ad.local_id.clone(),
                    title: ad.title.clone(),
                    candidates: candidates.clone(),
                });
                continue;
            }
            let summary = matched.summary();
            match input.mode {
                PlanMode::DeleteSelected => self.plan_delete(&mut builder, ad, summary),
                PlanMode::Reconcile | PlanMode::UpdateOnly => {
                    self.plan_desired(&mut builder, &input, ad, summary)
                }
            }
        }

        if input.mode == PlanMode::Reconcile && self.settings.delete_orphans {
            for summary in input.snapshot.ads() {
                let id = &summary.remote_id;
                if input.claimed.contains(id)
                    || builder.targeted.contains(id)
                    || !input.ledger_ids.contains(id)
                {
                    continue;
                }
                builder.push(Operation::new(
                    OperationKind::Delete,
                    None,
                    Some(id.clone()),
                    ReasonCode::Orphaned,
                ));
            }
        }

        let phase_order = self.phase_order(builder.replacement);
        let mut operations = builder.operations;
        operations.sort_by_key(|op| {
            phase_order
                .iter()
                .position(|kind| *kind == op.kind)
                .unwrap_or(phase_order.len())
        });
        for (index, operation) in operations.iter_mut().enumerate() {
            operation.seq = index + 1;
        }

        let plan = Plan {
            mode: input.mode,
            operations,
            ambiguous: builder.ambiguous,
            phase_order,
        };
        info!(
            target: "reconcile.planner",
            mode = input.mode.as_str(),
            create = plan.count(OperationKind::Create),
            update = plan.count(OperationKind::Update),
            delete = plan.count(OperationKind::Delete),
            skip = plan.count(OperationKind::Skip),
            ambiguous = plan.ambiguous.len(),
            "planned reconciliation pass"
        );
        plan
    }

    fn plan_delete(&self, builder: &mut Builder, ad: &Ad, summary: Option<&RemoteAdSummary>) {
        match summary {
            Some(summary) => builder.push(Operation::new(
                OperationKind::Delete,
                Some(ad),
                Some(summary.remote_id.clone()),
                ReasonCode::DeleteRequested,
            )),
            None => debug!(target: "reconcile.planner", ad = %ad.local_id, "no listing to delete"),
        }
    }

    fn plan_desired(
        &self,
        builder: &mut Builder,
        input: &PlanInput<'_>,
        ad: &Ad,
        summary: Option<&RemoteAdSummary>,
    ) {
        if ad.remove {
            if input.mode == PlanMode::Reconcile {
                if let Some(summary) = summary {
                    builder.push(Operation::new(
                        OperationKind::Delete,
                        Some(ad),
                        Some(summary.remote_id.clone()),
                        ReasonCode::MarkedForRemoval,
                    ));
                }
            }
            return;
        }
        if !ad.active {
            debug!(target: "reconcile.planner", ad = %ad.local_id, "inactive, not planned");
            return;
        }

        let Some(summary) = summary else {
            if input.mode == PlanMode::Reconcile {
                let reason = if ad.remote_id.is_some() {
                    ReasonCode::RemoteMissing
                } else {
                    ReasonCode::NotPublished
                };
                builder.push(Operation::new(OperationKind::Create, Some(ad), None, reason));
            } else {
                debug!(target: "reconcile.planner", ad = %ad.local_id, "not published, nothing to update");
            }
            return;
        };
        let remote_id = summary.remote_id.clone();

        if summary.status == RemoteStatus::Paused {
            builder.push(Operation::new(
                OperationKind::Skip,
                Some(ad),
                Some(remote_id),
                ReasonCode::Reserved,
            ));
            return;
        }

        if input.mode == PlanMode::Reconcile
            && self.settings.republish
            && input.selector.allows_republication()
            && ad.republication_due(input.now)
        {
            let mut create = Operation::new(
                OperationKind::Create,
                Some(ad),
                None,
                ReasonCode::Republication,
            );
            create.replaces = Some(remote_id.clone());
            builder.push(create);
            if self.settings.keep_old {
                builder.targeted.insert(remote_id);
            } else {
                builder.push(Operation::new(
                    OperationKind::Delete,
                    Some(ad),
                    Some(remote_id),
                    ReasonCode::ReplacedListing,
                ));
                builder.replacement = true;
            }
            return;
        }

        let reason = if input.selector.forces_update() {
            Some(ReasonCode::Forced)
        } else {
            match &ad.content_hash {
                None => Some(ReasonCode::HashUnknown),
                Some(recorded) if *recorded != content_hash(ad) => Some(ReasonCode::ContentDrift),
                Some(_) => None,
            }
        };
        let kind = if reason.is_some() {
            OperationKind::Update
        } else {
            OperationKind::Skip
        };
        builder.push(Operation::new(
            kind,
            Some(ad),
            Some(remote_id),
            reason.unwrap_or(ReasonCode::NoDrift),
        ));
    }

    fn phase_order(&self, replacement: bool) -> Vec<OperationKind> {
        use OperationKind::*;
        if replacement && self.settings.replace_order == ReplaceOrder::DeleteThenCreate {
            vec![Skip, Delete, Update, Create]
        } else {
            vec![Skip, Update, Create, Delete]
        }
    }
}
