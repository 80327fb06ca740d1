use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use serde_yaml::Value;
use tracing::debug;

use crate::ads::models::parse_timestamp;
use crate::ads::{Contact, Price, PriceType, ShippingType};
use crate::browser::{BrowserError, BrowserResult, PageSteps, WaitCondition, WaitOutcome};
use crate::config::AdsSection;

/// Which live listings a download pass fetches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadSelector {
    All,
    /// Listings no ad file claims yet.
    New,
    Ids(Vec<String>),
}

impl FromStr for DownloadSelector {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(DownloadSelector::All),
            "new" => Ok(DownloadSelector::New),
            list => {
                let ids: Vec<String> = list
                    .split(',')
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
                    .collect();
                if ids.is_empty() || !ids.iter().all(|id| id.chars().all(|c| c.is_ascii_digit())) {
                    return Err(format!(
                        "expected all, new or comma-separated listing ids, got {raw:?}"
                    ));
                }
                Ok(DownloadSelector::Ids(ids))
            }
        }
    }
}

impl fmt::Display for DownloadSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadSelector::All => f.write_str("all"),
            DownloadSelector::New => f.write_str("new"),
            DownloadSelector::Ids(ids) => f.write_str(&ids.join(",")),
        }
    }
}

/// A live listing as read from its public page, in ad file layout.
///
/// Images, condition, category attributes and carrier packages are not shown
/// on the public page in a reliable form and are left out.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadedAd {
    #[serde(skip)]
    pub remote_id: String,
    pub active: bool,
    pub title: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "price_value")]
    pub price: Option<Price>,
    pub price_type: PriceType,
    pub shipping_type: ShippingType,
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "price_value")]
    pub shipping_costs: Option<Price>,
    pub sell_directly: bool,
    pub images: Vec<String>,
    pub contact: Contact,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_on: Option<String>,
}

/// Prices go to YAML the way people write them: `150` or `"89,50"`.
fn price_value<S: serde::Serializer>(price: &Option<Price>, serializer: S) -> Result<S::Ok, S::Error> {
    match price {
        Some(price) if price.minor % 100 == 0 => serializer.serialize_u64(price.minor / 100),
        Some(price) => serializer.serialize_str(&price.to_site_string()),
        None => serializer.serialize_none(),
    }
}

impl DownloadedAd {
    pub fn to_yaml(&self) -> Result<Value, serde_yaml::Error> {
        serde_yaml::to_value(self)
    }
}

/// Reads one listing from its public page.
#[derive(Debug, Clone)]
pub struct ListingExtractor {
    description_prefix: String,
    description_suffix: String,
}

impl ListingExtractor {
    pub fn new(settings: &AdsSection) -> Self {
        Self {
            description_prefix: settings.description_prefix.trim().to_string(),
            description_suffix: settings.description_suffix.trim().to_string(),
        }
    }

    /// `None` when the site no longer shows a listing with this id.
    pub async fn extract(
        &self,
        steps: &PageSteps<'_>,
        remote_id: &str,
    ) -> BrowserResult<Option<DownloadedAd>> {
        let site = steps.site();
        let s = &site.selectors;
        steps.open_public(&site.view_url(remote_id)).await?;
        let landing = WaitCondition::Any(vec![
            WaitCondition::present(&s.view_title),
            WaitCondition::UrlContains(site.paths.view_missing_marker.clone()),
        ]);
        match steps.wait(&landing, site.element_timeout).await? {
            WaitOutcome::Ready { index: 0 } => {}
            WaitOutcome::Ready { .. } => {
                debug!(remote_id, "listing not found on the site");
                return Ok(None);
            }
            WaitOutcome::TimedOut => return Err(BrowserError::Timeout(landing.describe())),
        }

        let title = self.text_of(steps, &s.view_title).await?.unwrap_or_default();
        let description = self
            .text_of(steps, &s.view_description)
            .await?
            .map(|text| self.strip_affixes(&text))
            .unwrap_or_default();
        let (price_type, price) = match self.text_of(steps, &s.view_price).await? {
            Some(text) => parse_price_text(&text),
            None => (PriceType::NotApplicable, None),
        };
        let (shipping_type, shipping_costs) =
            parse_shipping_text(self.text_of(steps, &s.view_shipping).await?.as_deref());
        let sell_directly = self
            .text_of(steps, &s.view_buy_now)
            .await?
            .is_some_and(|text| text.contains("Direkt kaufen"));

        let mut segments = Vec::new();
        for link in steps.all(&s.view_breadcrumb_links).await?.iter().skip(1).take(2) {
            let href = steps.attribute(link, "href").await?.unwrap_or_default();
            if let Some(id) = href.rsplit('/').next().and_then(|last| last.strip_prefix('c')) {
                segments.push(id.to_string());
            }
        }

        let zipcode = self.text_of(steps, &s.view_locality).await?.and_then(|text| {
            text.split(" - ")
                .next()
                .and_then(|left| left.split_whitespace().next())
                .map(str::to_string)
        });
        let street = self
            .text_of(steps, &s.view_street)
            .await?
            .map(|text| text.trim_end_matches(',').trim().to_string())
            .filter(|street| !street.is_empty());
        let name = self
            .text_of(steps, &s.view_contact_name)
            .await?
            .filter(|name| !name.is_empty());
        let created_on = self
            .text_of(steps, &s.view_created)
            .await?
            .and_then(|text| parse_timestamp(&text))
            .map(|at| at.format("%Y-%m-%d").to_string());

        Ok(Some(DownloadedAd {
            remote_id: remote_id.to_string(),
            active: true,
            title,
            description,
            category: (!segments.is_empty()).then(|| segments.join("/")),
            price,
            price_type,
            shipping_type,
            shipping_costs,
            sell_directly,
            images: Vec::new(),
            contact: Contact {
                name,
                street,
                zipcode,
                phone: None,
            },
            created_on,
        }))
    }

    async fn text_of(&self, steps: &PageSteps<'_>, selector: &str) -> BrowserResult<Option<String>> {
        match steps.optional(selector).await? {
            Some(element) => Ok(Some(steps.text(&element).await?)),
            None => Ok(None),
        }
    }

    fn strip_affixes(&self, text: &str) -> String {
        let text = text.trim();
        let text = text.strip_prefix(self.description_prefix.as_str()).unwrap_or(text);
        let text = text.strip_suffix(self.description_suffix.as_str()).unwrap_or(text);
        text.trim().to_string()
    }
}

/// `150 €`, `1.250 € VB`, `VB`, `Zu verschenken`.
fn parse_price_text(text: &str) -> (PriceType, Option<Price>) {
    let amount = || {
        text.split_whitespace()
            .next()
            .and_then(|raw| Price::parse(&raw.replace('.', "")))
    };
    match text.split_whitespace().last() {
        Some("€") => (PriceType::Fixed, amount()),
        Some("VB") if text.trim() == "VB" => (PriceType::Negotiable, None),
        Some("VB") => (PriceType::Negotiable, amount()),
        Some("verschenken") => (PriceType::GiveAway, None),
        _ => (PriceType::NotApplicable, None),
    }
}

/// `Nur Abholung`, `Versand möglich`, `+ Versand ab 5,49 €`.
fn parse_shipping_text(text: Option<&str>) -> (ShippingType, Option<Price>) {
    match text.map(str::trim) {
        Some("Nur Abholung") => (ShippingType::Pickup, None),
        Some("Versand möglich") => (ShippingType::Shipping, None),
        Some(text) if text.contains('€') => {
            let costs = text.split_whitespace().rev().nth(1).and_then(Price::parse);
            (ShippingType::Shipping, costs)
        }
        _ => (ShippingType::NotApplicable, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_accepts_keywords_and_id_lists() {
        assert_eq!("all".parse::<DownloadSelector>().unwrap(), DownloadSelector::All);
        assert_eq!(" NEW ".parse::<DownloadSelector>().unwrap(), DownloadSelector::New);
        assert_eq!(
            "2000001, 2000007".parse::<DownloadSelector>().unwrap(),
            DownloadSelector::Ids(vec!["2000001".into(), "2000007".into()])
        );
        assert!("due".parse::<DownloadSelector>().is_err());
        assert!(",".parse::<DownloadSelector>().is_err());
    }

    #[test]
    fn price_line_variants() {
        assert_eq!(
            parse_price_text("150 €"),
            (PriceType::Fixed, Some(Price::from_minor(15_000)))
        );
        assert_eq!(
            parse_price_text("1.250 € VB"),
            (PriceType::Negotiable, Some(Price::from_minor(125_000)))
        );
        assert_eq!(parse_price_text("VB"), (PriceType::Negotiable, None));
        assert_eq!(parse_price_text("Zu verschenken"), (PriceType::GiveAway, None));
        assert_eq!(parse_price_text("Preis auf Anfrage"), (PriceType::NotApplicable, None));
    }

    #[test]
    fn shipping_line_variants() {
        assert_eq!(parse_shipping_text(Some("Nur Abholung")), (ShippingType::Pickup, None));
        assert_eq!(parse_shipping_text(Some("Versand möglich")), (ShippingType::Shipping, None));
        assert_eq!(
            parse_shipping_text(Some("+ Versand ab 5,49 €")),
            (ShippingType::Shipping, Some(Price::from_minor(549)))
        );
        assert_eq!(parse_shipping_text(None), (ShippingType::NotApplicable, None));
    }

    #[test]
    fn description_loses_configured_affixes() {
        let extractor = ListingExtractor::new(&AdsSection {
            description_prefix: "Privatverkauf.\n".into(),
            description_suffix: "\n\nAbholung oder Versand möglich.".into(),
            ..AdsSection::default()
        });
        assert_eq!(
            extractor.strip_affixes("Privatverkauf.\nGut erhalten\n\nAbholung oder Versand möglich."),
            "Gut erhalten"
        );
        assert_eq!(extractor.strip_affixes("  Nur Text "), "Nur Text");
    }

    #[test]
    fn whole_prices_serialize_as_numbers() {
        let ad = DownloadedAd {
            remote_id: "2000001".into(),
            active: true,
            title: "Lampe aus Messing".into(),
            description: "Funktioniert".into(),
            category: None,
            price: Some(Price::from_minor(4_000)),
            price_type: PriceType::Fixed,
            shipping_type: ShippingType::Shipping,
            shipping_costs: Some(Price::from_minor(549)),
            sell_directly: false,
            images: Vec::new(),
            contact: Contact::default(),
            created_on: None,
        };
        let value = ad.to_yaml().unwrap();
        assert_eq!(value["price"].as_u64(), Some(40));
        assert_eq!(value["shipping_costs"].as_str(), Some("5,49"));
        assert_eq!(value["price_type"].as_str(), Some("FIXED"));
        assert!(value.get("id").is_none());
        assert!(value.get("category").is_none());
    }
}
