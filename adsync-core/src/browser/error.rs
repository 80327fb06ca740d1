use thiserror::Error;

pub type BrowserResult<T> = Result<T, BrowserError>;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("chromium launch failed: {0}")]
    Launch(String),
    #[error("cdp error: {0}")]
    Cdp(#[from] chromiumoxide::error::CdpError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timeout waiting for {0}")]
    Timeout(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("profile error: {0}")]
    Profile(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("session lost: {0}")]
    SessionLost(String),
    #[error("rejected by site: {0}")]
    Rejected(String),
    #[error("authentication blocked: {0}")]
    AuthenticationBlocked(String),
    #[error("manual intervention required: {0}")]
    ManualIntervention(String),
    #[error("listing view has more than {max_pages} pages, raise reconcile.max_pages")]
    PageBudgetExceeded { max_pages: usize },
    #[error("element is stale or unknown: {0}")]
    StaleElement(String),
    #[error("cancelled")]
    Cancelled,
    #[error("telemetry error: {0}")]
    Telemetry(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl From<tokio::task::JoinError> for BrowserError {
    fn from(err: tokio::task::JoinError) -> Self {
        BrowserError::Unexpected(err.to_string())
    }
}
