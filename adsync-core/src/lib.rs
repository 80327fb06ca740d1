pub mod ads;
pub mod browser;
pub mod config;
pub mod error;
pub mod reconcile;
pub mod remote;
pub mod session;
pub mod sqlite;

pub use ads::{Ad, AdCatalog, AdFilter, AdLoader, AdSelector};
pub use config::{load_config, AdsyncConfig};
pub use error::{ConfigError, Result};
pub use reconcile::{
    DownloadReport, OperationKind, OperationOutcome, PlanMode, ReconcileError, ReconcileResult, Reconciler,
    ReconcilerBuilder, RunOptions, RunReport,
};
pub use remote::{DownloadSelector, RemoteAdSummary, RemoteSnapshot};
pub use session::{ConsoleOperatorGate, OperatorGate, UnattendedOperatorGate};
