use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};

use super::error::BrowserResult;

pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Opaque reference to an element found on the current page.
///
/// Handles are invalidated by navigation; drivers answer stale handles with
/// `BrowserError::StaleElement`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ElementHandle {
    pub id: u64,
    pub selector: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitCondition {
    Present(String),
    Absent(String),
    UrlContains(String),
    /// Satisfied by the first satisfied member; `Ready::index` names it.
    Any(Vec<WaitCondition>),
}

impl WaitCondition {
    pub fn present(selector: impl Into<String>) -> Self {
        WaitCondition::Present(selector.into())
    }

    pub fn any_present<I, S>(selectors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        WaitCondition::Any(selectors.into_iter().map(|s| WaitCondition::Present(s.into())).collect())
    }

    pub fn describe(&self) -> String {
        match self {
            WaitCondition::Present(selector) => selector.clone(),
            WaitCondition::Absent(selector) => format!("absence of {selector}"),
            WaitCondition::UrlContains(fragment) => format!("url containing {fragment}"),
            WaitCondition::Any(conditions) => conditions
                .iter()
                .map(WaitCondition::describe)
                .collect::<Vec<_>>()
                .join(" | "),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready { index: usize },
    TimedOut,
}

/// The narrow set of page interactions the engine needs from a browser.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn navigate(&self, url: &str) -> BrowserResult<()>;
    async fn find(&self, selector: &str) -> BrowserResult<Option<ElementHandle>>;
    async fn find_all(&self, selector: &str) -> BrowserResult<Vec<ElementHandle>>;
    async fn find_within(
        &self,
        parent: &ElementHandle,
        selector: &str,
    ) -> BrowserResult<Option<ElementHandle>>;
    async fn fill(&self, element: &ElementHandle, text: &str) -> BrowserResult<()>;
    async fn select(&self, element: &ElementHandle, value: &str) -> BrowserResult<()>;
    async fn click(&self, element: &ElementHandle) -> BrowserResult<()>;
    async fn upload(&self, element: &ElementHandle, file: &Path) -> BrowserResult<()>;
    async fn current_url(&self) -> BrowserResult<String>;
    async fn read_text(&self, element: &ElementHandle) -> BrowserResult<String>;
    async fn read_attribute(
        &self,
        element: &ElementHandle,
        name: &str,
    ) -> BrowserResult<Option<String>>;
    async fn close(&self) -> BrowserResult<()>;

    /// Polls until `condition` holds or `timeout` elapses.
    async fn wait_for(
        &self,
        condition: &WaitCondition,
        timeout: Duration,
    ) -> BrowserResult<WaitOutcome> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(index) = self.evaluate(condition).await? {
                return Ok(WaitOutcome::Ready { index });
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(WaitOutcome::TimedOut);
            }
            sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Evaluates `condition` once.
    async fn evaluate(&self, condition: &WaitCondition) -> BrowserResult<Option<usize>> {
        match condition {
            WaitCondition::Present(selector) => {
                Ok(self.find(selector).await?.map(|_| 0))
            }
            WaitCondition::Absent(selector) => {
                Ok(self.find(selector).await?.is_none().then_some(0))
            }
            WaitCondition::UrlContains(fragment) => {
                Ok(self.current_url().await?.contains(fragment.as_str()).then_some(0))
            }
            WaitCondition::Any(conditions) => {
                for (index, member) in conditions.iter().enumerate() {
                    let satisfied = match member {
                        WaitCondition::Any(_) => false,
                        leaf => self.evaluate(leaf).await?.is_some(),
                    };
                    if satisfied {
                        return Ok(Some(index));
                    }
                }
                Ok(None)
            }
        }
    }
}

/// Opens browser contexts; one per session.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn open(&self) -> BrowserResult<Arc<dyn BrowserDriver>>;
}
