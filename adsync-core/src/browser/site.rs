use std::time::Duration;

use crate::config::{AdsyncConfig, SelectorSection, SessionSection, SiteSection};

/// URLs, selectors and wait budgets for the marketplace.
#[derive(Debug, Clone)]
pub struct SiteMap {
    pub paths: SiteSection,
    pub selectors: SelectorSection,
    pub element_timeout: Duration,
    pub login_timeout: Duration,
}

impl SiteMap {
    pub fn new(paths: SiteSection, selectors: SelectorSection, session: &SessionSection) -> Self {
        Self {
            paths,
            selectors,
            element_timeout: Duration::from_secs(session.element_timeout_seconds),
            login_timeout: Duration::from_secs(session.login_timeout_seconds),
        }
    }

    pub fn from_config(config: &AdsyncConfig) -> Self {
        Self::new(
            config.site.clone(),
            config.selectors.clone(),
            &config.session,
        )
    }

    pub fn with_timeouts(mut self, element: Duration, login: Duration) -> Self {
        self.element_timeout = element;
        self.login_timeout = login;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.paths.root_url.trim_end_matches('/'), path)
    }

    pub fn root_url(&self) -> String {
        self.url("/")
    }

    pub fn login_url(&self) -> String {
        self.url(&self.paths.login_path)
    }

    pub fn post_url(&self) -> String {
        self.url(&self.paths.post_path)
    }

    pub fn edit_url(&self, remote_id: &str) -> String {
        self.url(&self.paths.edit_path.replace("{id}", remote_id))
    }

    pub fn category_url(&self, category: &str) -> String {
        self.url(&self.paths.category_path.replace("{category}", category))
    }

    pub fn manage_url(&self) -> String {
        self.url(&self.paths.manage_path)
    }

    pub fn view_url(&self, remote_id: &str) -> String {
        self.url(&self.paths.view_path.replace("{id}", remote_id))
    }

    pub fn is_login_page(&self, url: &str) -> bool {
        url.contains(&self.paths.login_page_marker)
    }

    /// Extracts the `adId` from a publish confirmation URL.
    pub fn confirmed_remote_id(&self, url: &str) -> Option<String> {
        let (_, tail) = url.split_once(&self.paths.confirmation_marker)?;
        let id: String = tail.chars().take_while(|c| c.is_ascii_alphanumeric()).collect();
        (!id.is_empty()).then_some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site() -> SiteMap {
        SiteMap::new(
            SiteSection::default(),
            SelectorSection::default(),
            &SessionSection::default(),
        )
    }

    #[test]
    fn builds_urls_from_paths() {
        let site = site();
        assert_eq!(
            site.edit_url("2874411"),
            "https://www.kleinanzeigen.de/p-anzeige-bearbeiten.html?adId=2874411"
        );
        assert!(site.category_url("80/88").ends_with("#?path=80/88"));
        assert!(site.view_url("2874411").ends_with("?keywords=2874411"));
        assert!(site.is_login_page(&site.login_url()));
        assert!(!site.is_login_page(&site.manage_url()));
    }

    #[test]
    fn parses_confirmation_ids() {
        let site = site();
        let url = "https://www.kleinanzeigen.de/p-anzeige-aufgeben-bestaetigung.html?adId=2874411&uuid=x";
        assert_eq!(site.confirmed_remote_id(url).as_deref(), Some("2874411"));
        assert_eq!(site.confirmed_remote_id("https://www.kleinanzeigen.de/"), None);
    }
}
