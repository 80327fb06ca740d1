mod automation;
mod driver;
mod error;
mod error_handler;
mod human;
mod metrics;
mod profile;
mod retry;
mod simulated;
mod site;
mod steps;

pub use automation::{
    BrowserAutomation, BrowserLauncher, ChromiumDriver, ChromiumDriverFactory, LaunchSettings,
};
pub use driver::{
    BrowserDriver, DriverFactory, ElementHandle, WaitCondition, WaitOutcome, POLL_INTERVAL,
};
pub use error::{BrowserError, BrowserResult};
pub use error_handler::{
    telemetry_failure, AutomationTelemetry, ErrorCategorizer, FailureCategory, FailureContext,
    RemediationAction, RunContext, TelemetryError,
};
pub use human::InputPacer;
pub use metrics::{record as record_metrics, snapshot as metrics_snapshot, BrowserMetrics, SharedMetrics};
pub use profile::{BrowserProfile, ProfileManager};
pub use retry::{RetryContext, RetryExhausted, RetryOutcome, RetryPolicy, SessionRecovery};
pub use simulated::{FaultPlan, SimulatedDriver, SimulatedListing, SimulatedMarketplace};
pub use site::SiteMap;
pub use steps::PageSteps;
