//! Reconciliation passes: planning, execution, reporting and the operation ledger.

mod error;
mod executor;
mod ledger;
mod models;
mod planner;
mod report;
mod runner;

pub use error::{LedgerError, LedgerResult, ReconcileError, ReconcileResult};
pub use executor::{ChallengeHandling, OperationExecutor};
pub use ledger::{LedgerEntry, OperationLedger, OperationLedgerBuilder};
pub use models::{
    Operation, OperationKind, OperationOutcome, OperationRecord, PlanMode, PlannedOperation,
    ReasonCode,
};
pub use planner::{Plan, PlanInput, PlannerSettings, ReconcilePlanner};
pub use report::{AbortReason, DownloadOutcome, DownloadRecord, DownloadReport, OutcomeCounts, RunReport};
pub use runner::{Reconciler, ReconcilerBuilder, RunOptions};
