use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use tracing::warn;

use super::models::Ad;

/// Which ads a run considers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "ids")]
pub enum AdSelector {
    /// Every ad; matched listings are re-sent even without drift.
    All,
    /// Every ad under the normal drift and republication rules.
    #[default]
    Due,
    /// Only ads that were never published.
    New,
    /// Ads whose local or remote id is listed; treated like `all`.
    Ids(Vec<String>),
}

impl AdSelector {
    /// Parses the `--ads` argument, falling back to `due` for garbage input.
    pub fn parse_lenient(raw: &str) -> Self {
        raw.parse().unwrap_or_else(|err: String| {
            warn!(selector = raw, error = %err, "invalid ad selector, using `due`");
            AdSelector::Due
        })
    }

    pub fn forces_update(&self) -> bool {
        matches!(self, AdSelector::All | AdSelector::Ids(_))
    }

    pub fn allows_republication(&self) -> bool {
        matches!(self, AdSelector::All | AdSelector::Due)
    }

    pub fn matches(&self, ad: &Ad) -> bool {
        match self {
            AdSelector::All | AdSelector::Due => true,
            AdSelector::New => ad.remote_id.is_none(),
            AdSelector::Ids(ids) => ids.iter().any(|id| {
                id == &ad.local_id || ad.remote_id.as_deref() == Some(id.as_str())
            }),
        }
    }
}

impl FromStr for AdSelector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed {
            "all" => Ok(AdSelector::All),
            "due" | "" => Ok(AdSelector::Due),
            "new" => Ok(AdSelector::New),
            other => {
                let ids: Vec<String> = other
                    .split(',')
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
                    .collect();
                let valid = ids.iter().all(|id| {
                    id.chars()
                        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '/' | '.'))
                });
                if ids.is_empty() || !valid {
                    Err(format!("`{other}` is neither all, due, new nor a list of ids"))
                } else {
                    Ok(AdSelector::Ids(ids))
                }
            }
        }
    }
}

impl fmt::Display for AdSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdSelector::All => f.write_str("all"),
            AdSelector::Due => f.write_str("due"),
            AdSelector::New => f.write_str("new"),
            AdSelector::Ids(ids) => f.write_str(&ids.join(",")),
        }
    }
}

/// Selector plus optional tag narrowing.
#[derive(Debug, Clone, Default)]
pub struct AdFilter {
    pub selector: AdSelector,
    pub tags: Vec<String>,
}

impl AdFilter {
    pub fn new(selector: AdSelector) -> Self {
        Self {
            selector,
            tags: Vec::new(),
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn matches(&self, ad: &Ad) -> bool {
        self.selector.matches(ad) && (self.tags.is_empty() || self.tags.iter().any(|t| ad.has_tag(t)))
    }

    pub fn apply<'a>(&self, ads: impl IntoIterator<Item = &'a Ad>) -> Vec<Ad> {
        ads.into_iter().filter(|ad| self.matches(ad)).cloned().collect()
    }
}
