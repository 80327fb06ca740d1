use std::collections::HashSet;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::ads::models::parse_timestamp;
use crate::browser::{record_metrics, BrowserError, BrowserResult, ElementHandle, PageSteps, SiteMap};

use super::models::{RemoteAdSummary, RemoteSnapshot, RemoteStatus};

/// Pages through the listing-management view of the logged-in account.
#[derive(Debug, Clone)]
pub struct RemoteStateReader {
    max_pages: usize,
}

impl RemoteStateReader {
    pub fn new(max_pages: usize) -> Self {
        Self {
            max_pages: max_pages.max(1),
        }
    }

    /// Reads every listing, following "next page" until it disappears.
    pub async fn read(&self, steps: &PageSteps<'_>) -> BrowserResult<RemoteSnapshot> {
        steps.open(&steps.site().manage_url()).await?;
        let mut ads = Vec::new();
        let mut seen = HashSet::new();
        let mut page = 1;
        loop {
            for (_, summary) in self.read_page(steps).await? {
                if seen.insert(summary.remote_id.clone()) {
                    ads.push(summary);
                }
            }
            if !self.advance(steps, page).await? {
                break;
            }
            page += 1;
        }
        info!(listings = ads.len(), pages = page, "read remote listings");
        Ok(RemoteSnapshot::new(ads, Utc::now()))
    }

    /// Re-reads the management view until the listing `remote_id` shows up.
    pub async fn locate(
        &self,
        steps: &PageSteps<'_>,
        remote_id: &str,
    ) -> BrowserResult<Option<RemoteAdSummary>> {
        Ok(self
            .locate_row(steps, remote_id)
            .await?
            .map(|(_, summary)| summary))
    }

    /// Like [`locate`](Self::locate) but also returns the row element, valid
    /// until the next navigation.
    pub async fn locate_row(
        &self,
        steps: &PageSteps<'_>,
        remote_id: &str,
    ) -> BrowserResult<Option<(ElementHandle, RemoteAdSummary)>> {
        steps.open(&steps.site().manage_url()).await?;
        let mut page = 1;
        loop {
            let found = self
                .read_page(steps)
                .await?
                .into_iter()
                .find(|(_, summary)| summary.remote_id == remote_id);
            if found.is_some() {
                return Ok(found);
            }
            if !self.advance(steps, page).await? {
                return Ok(None);
            }
            page += 1;
        }
    }

    async fn read_page(
        &self,
        steps: &PageSteps<'_>,
    ) -> BrowserResult<Vec<(ElementHandle, RemoteAdSummary)>> {
        let selectors = &steps.site().selectors;
        let rows = steps.all(&selectors.listing_item).await?;
        let mut parsed = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(summary) = parse_row(steps, steps.site(), &row).await? {
                parsed.push((row, summary));
            }
        }
        let count = parsed.len() as u64;
        if let Some(metrics) = steps.metrics() {
            record_metrics(metrics, |m| m.record_listings(count));
        }
        Ok(parsed)
    }

    /// Clicks the next-page control; false when there is none. A further page
    /// beyond `max_pages` is an error, never a silently shorter snapshot.
    async fn advance(&self, steps: &PageSteps<'_>, page: usize) -> BrowserResult<bool> {
        let Some(next) = steps.optional(&steps.site().selectors.next_page).await? else {
            return Ok(false);
        };
        if steps.attribute(&next, "disabled").await?.is_some() {
            return Ok(false);
        }
        if page >= self.max_pages {
            warn!(max_pages = self.max_pages, "more listing pages than allowed");
            return Err(BrowserError::PageBudgetExceeded {
                max_pages: self.max_pages,
            });
        }
        steps.click_element(&next).await?;
        steps.ensure_authenticated().await?;
        Ok(true)
    }
}

async fn parse_row(
    steps: &PageSteps<'_>,
    site: &SiteMap,
    row: &ElementHandle,
) -> BrowserResult<Option<RemoteAdSummary>> {
    let selectors = &site.selectors;
    let Some(remote_id) = steps
        .attribute(row, &selectors.listing_id_attribute)
        .await?
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
    else {
        debug!("skipping listing row without id");
        return Ok(None);
    };
    let title = match steps.within(row, &selectors.listing_title).await? {
        Some(title) => steps.text(&title).await?,
        None => String::new(),
    };
    let status = steps
        .attribute(row, &selectors.listing_state_attribute)
        .await?
        .map(|state| RemoteStatus::parse(&state))
        .unwrap_or(RemoteStatus::Active);
    let last_modified = steps
        .attribute(row, &selectors.listing_updated_attribute)
        .await?
        .and_then(|raw| parse_timestamp(&raw));
    Ok(Some(RemoteAdSummary {
        remote_id,
        title,
        status,
        last_modified,
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::browser::{BrowserDriver, BrowserMetrics, SimulatedMarketplace};
    use crate::config::{SelectorSection, SessionSection, SiteSection};

    async fn logged_in(market: &SimulatedMarketplace, site: &SiteMap) -> crate::browser::SimulatedDriver {
        let driver = market.driver();
        let s = &site.selectors;
        driver.navigate(&site.login_url()).await.unwrap();
        for (selector, value) in [(&s.login_email, "seller@example.com"), (&s.login_password, "secret")] {
            let field = driver.find(selector).await.unwrap().unwrap();
            driver.fill(&field, value).await.unwrap();
        }
        let submit = driver.find(&s.login_submit).await.unwrap().unwrap();
        driver.click(&submit).await.unwrap();
        driver
    }

    fn site() -> SiteMap {
        SiteMap::new(
            SiteSection::default(),
            SelectorSection::default(),
            &SessionSection::default(),
        )
    }

    #[tokio::test]
    async fn reads_all_pages_with_status() {
        let site = site();
        let market = SimulatedMarketplace::new(site.clone(), "seller@example.com", "secret")
            .with_page_size(2);
        let lamp = market.seed_listing("Lampe aus Messing", "active");
        let table = market.seed_listing("Tisch aus Eiche", "reserved");
        market.seed_listing("Stuhl aus Buche", "active");
        market.seed_listing("Regal aus Kiefer", "sold");
        market.seed_listing("Bett aus Ahorn", "active");
        let driver = logged_in(&market, &site).await;
        let cancel = CancellationToken::new();
        let metrics = Arc::new(Mutex::new(BrowserMetrics::default()));
        let steps = PageSteps::new(&driver, &site, &cancel).with_metrics(&metrics);

        let snapshot = RemoteStateReader::new(50).read(&steps).await.unwrap();
        assert_eq!(snapshot.len(), 5);
        assert_eq!(snapshot.get(&table).unwrap().status, RemoteStatus::Paused);
        assert_eq!(snapshot.get(&lamp).unwrap().title, "Lampe aus Messing");
        assert_eq!(metrics.lock().unwrap().listings_read, 5);

        let err = RemoteStateReader::new(2).read(&steps).await.unwrap_err();
        assert!(matches!(err, BrowserError::PageBudgetExceeded { max_pages: 2 }));
        let err = RemoteStateReader::new(2).locate(&steps, &lamp).await.unwrap_err();
        assert!(matches!(err, BrowserError::PageBudgetExceeded { .. }));
    }

    #[tokio::test]
    async fn locates_listing_on_later_page() {
        let site = site();
        let market = SimulatedMarketplace::new(site.clone(), "seller@example.com", "secret")
            .with_page_size(1);
        let oldest = market.seed_listing("Lampe aus Messing", "active");
        market.seed_listing("Tisch aus Eiche", "active");
        let driver = logged_in(&market, &site).await;
        let cancel = CancellationToken::new();
        let steps = PageSteps::new(&driver, &site, &cancel);
        let reader = RemoteStateReader::new(10);
        let found = reader.locate(&steps, &oldest).await.unwrap().unwrap();
        assert_eq!(found.title, "Lampe aus Messing");
        assert!(reader.locate(&steps, "999").await.unwrap().is_none());
    }
}
