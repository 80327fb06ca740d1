use std::future::Future;
use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::driver::{BrowserDriver, ElementHandle, WaitCondition, WaitOutcome};
use super::error::{BrowserError, BrowserResult};
use super::metrics::{record, SharedMetrics};
use super::site::SiteMap;

/// Single page interactions with timeouts, cancellation and login detection.
pub struct PageSteps<'a> {
    driver: &'a dyn BrowserDriver,
    site: &'a SiteMap,
    cancel: &'a CancellationToken,
    metrics: Option<&'a SharedMetrics>,
}

impl<'a> PageSteps<'a> {
    pub fn new(
        driver: &'a dyn BrowserDriver,
        site: &'a SiteMap,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            driver,
            site,
            cancel,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: &'a SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn driver(&self) -> &'a dyn BrowserDriver {
        self.driver
    }

    pub fn site(&self) -> &'a SiteMap {
        self.site
    }

    pub fn cancel(&self) -> &'a CancellationToken {
        self.cancel
    }

    pub fn metrics(&self) -> Option<&'a SharedMetrics> {
        self.metrics
    }

    async fn guarded<T, F>(&self, future: F) -> BrowserResult<T>
    where
        F: Future<Output = BrowserResult<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(BrowserError::Cancelled),
            result = future => result,
        }
    }

    /// Navigates without checking authentication.
    pub async fn open_public(&self, url: &str) -> BrowserResult<()> {
        debug!(url, "open");
        self.guarded(self.driver.navigate(url)).await?;
        if let Some(metrics) = self.metrics {
            record(metrics, |m| m.record_page_open());
        }
        Ok(())
    }

    /// Navigates and fails with `SessionLost` when the site bounces to login.
    pub async fn open(&self, url: &str) -> BrowserResult<()> {
        self.open_public(url).await?;
        self.ensure_authenticated().await
    }

    pub async fn ensure_authenticated(&self) -> BrowserResult<()> {
        let current = self.guarded(self.driver.current_url()).await?;
        if self.site.is_login_page(&current) {
            return Err(BrowserError::SessionLost(format!(
                "redirected to login page {current}"
            )));
        }
        Ok(())
    }

    pub async fn wait(&self, condition: &WaitCondition, timeout: Duration) -> BrowserResult<WaitOutcome> {
        self.guarded(self.driver.wait_for(condition, timeout)).await
    }

    pub async fn optional(&self, selector: &str) -> BrowserResult<Option<ElementHandle>> {
        self.guarded(self.driver.find(selector)).await
    }

    /// Waits for `selector`; a timeout on the login page is reported as session loss.
    pub async fn require(&self, selector: &str) -> BrowserResult<ElementHandle> {
        let condition = WaitCondition::present(selector);
        if let WaitOutcome::Ready { .. } = self.wait(&condition, self.site.element_timeout).await? {
            if let Some(element) = self.optional(selector).await? {
                return Ok(element);
            }
        }
        self.ensure_authenticated().await?;
        Err(BrowserError::Timeout(selector.to_string()))
    }

    pub async fn fill(&self, selector: &str, text: &str) -> BrowserResult<()> {
        let element = self.require(selector).await?;
        self.guarded(self.driver.fill(&element, text)).await?;
        self.interacted();
        Ok(())
    }

    pub async fn choose(&self, selector: &str, value: &str) -> BrowserResult<()> {
        let element = self.require(selector).await?;
        self.guarded(self.driver.select(&element, value)).await?;
        self.interacted();
        Ok(())
    }

    pub async fn click(&self, selector: &str) -> BrowserResult<()> {
        let element = self.require(selector).await?;
        self.click_element(&element).await
    }

    pub async fn click_element(&self, element: &ElementHandle) -> BrowserResult<()> {
        self.guarded(self.driver.click(element)).await?;
        self.interacted();
        Ok(())
    }

    pub async fn all(&self, selector: &str) -> BrowserResult<Vec<ElementHandle>> {
        self.guarded(self.driver.find_all(selector)).await
    }

    pub async fn within(
        &self,
        parent: &ElementHandle,
        selector: &str,
    ) -> BrowserResult<Option<ElementHandle>> {
        self.guarded(self.driver.find_within(parent, selector)).await
    }

    pub async fn text(&self, element: &ElementHandle) -> BrowserResult<String> {
        Ok(self.guarded(self.driver.read_text(element)).await?.trim().to_string())
    }

    pub async fn attribute(
        &self,
        element: &ElementHandle,
        name: &str,
    ) -> BrowserResult<Option<String>> {
        self.guarded(self.driver.read_attribute(element, name)).await
    }

    pub async fn upload(&self, element: &ElementHandle, file: &Path) -> BrowserResult<()> {
        self.guarded(self.driver.upload(element, file)).await
    }

    pub async fn current_url(&self) -> BrowserResult<String> {
        self.guarded(self.driver.current_url()).await
    }

    fn interacted(&self) {
        if let Some(metrics) = self.metrics {
            record(metrics, |m| m.record_interaction());
        }
    }
}
