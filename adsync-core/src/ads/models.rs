use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdType {
    Offer,
    Wanted,
}

impl AdType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdType::Offer => "OFFER",
            AdType::Wanted => "WANTED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PriceType {
    Fixed,
    Negotiable,
    GiveAway,
    NotApplicable,
}

impl PriceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceType::Fixed => "FIXED",
            PriceType::Negotiable => "NEGOTIABLE",
            PriceType::GiveAway => "GIVE_AWAY",
            PriceType::NotApplicable => "NOT_APPLICABLE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShippingType {
    Pickup,
    Shipping,
    NotApplicable,
}

impl ShippingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShippingType::Pickup => "PICKUP",
            ShippingType::Shipping => "SHIPPING",
            ShippingType::NotApplicable => "NOT_APPLICABLE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    NewWithTag,
    New,
    LikeNew,
    Ok,
    Alright,
    Defect,
}

impl Condition {
    /// Option value used by the site's condition select.
    pub fn as_str(&self) -> &'static str {
        match self {
            Condition::NewWithTag => "new_with_tag",
            Condition::New => "new",
            Condition::LikeNew => "like_new",
            Condition::Ok => "ok",
            Condition::Alright => "alright",
            Condition::Defect => "defect",
        }
    }
}

impl FromStr for Condition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "new_with_tag" => Ok(Condition::NewWithTag),
            "new" => Ok(Condition::New),
            "like_new" => Ok(Condition::LikeNew),
            "ok" => Ok(Condition::Ok),
            "alright" => Ok(Condition::Alright),
            "defect" => Ok(Condition::Defect),
            other => Err(format!("unknown condition: {other}")),
        }
    }
}

/// Carrier packages offered in the shipping dialog, keyed by the name used in
/// ad files. Each belongs to one package size.
const SHIPPING_OPTIONS: [(&str, &str, &str); 8] = [
    ("DHL_2", "Klein", "Paket 2 kg"),
    ("Hermes_Päckchen", "Klein", "Päckchen"),
    ("Hermes_S", "Klein", "S-Paket"),
    ("DHL_5", "Mittel", "Paket 5 kg"),
    ("Hermes_M", "Mittel", "M-Paket"),
    ("DHL_10", "Groß", "Paket 10 kg"),
    ("DHL_31,5", "Groß", "Paket 31,5 kg"),
    ("Hermes_L", "Groß", "L-Paket"),
];

/// Package size and carrier label of a shipping option, e.g. `Hermes_S`.
pub fn shipping_package(option: &str) -> Option<(&'static str, &'static str)> {
    SHIPPING_OPTIONS
        .iter()
        .find(|(name, _, _)| *name == option)
        .map(|(_, size, package)| (*size, *package))
}

/// Every carrier label offered for a package size.
pub fn packages_of_size(size: &str) -> impl Iterator<Item = &'static str> + '_ {
    SHIPPING_OPTIONS
        .iter()
        .filter(move |(_, own, _)| *own == size)
        .map(|(_, _, package)| *package)
}

/// Amount in minor units (cents).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Price {
    pub minor: u64,
}

impl Price {
    pub fn from_minor(minor: u64) -> Self {
        Self { minor }
    }

    /// Accepts `150`, `150.5`, `89,50`. Anything else is rejected.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let normalized = raw.replace(',', ".");
        let (whole, fraction) = match normalized.split_once('.') {
            Some((whole, fraction)) => (whole, fraction),
            None => (normalized.as_str(), ""),
        };
        if whole.is_empty() || !whole.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        if fraction.len() > 2 || !fraction.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        if normalized.contains('.') && fraction.is_empty() {
            return None;
        }
        let units: u64 = whole.parse().ok()?;
        let cents: u64 = match fraction.len() {
            0 => 0,
            1 => fraction.parse::<u64>().ok()? * 10,
            _ => fraction.parse().ok()?,
        };
        units.checked_mul(100)?.checked_add(cents).map(Self::from_minor)
    }

    /// Stable representation used for hashing.
    pub fn canonical(&self) -> String {
        format!("{}.{:02}", self.minor / 100, self.minor % 100)
    }

    /// Representation typed into the site's price inputs.
    pub fn to_site_string(&self) -> String {
        if self.minor % 100 == 0 {
            (self.minor / 100).to_string()
        } else {
            format!("{},{:02}", self.minor / 100, self.minor % 100)
        }
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_site_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Contact {
    pub name: Option<String>,
    pub street: Option<String>,
    pub zipcode: Option<String>,
    pub phone: Option<String>,
}

impl Contact {
    pub fn merged_with(&self, defaults: &Contact) -> Contact {
        let pick = |own: &Option<String>, fallback: &Option<String>| {
            own.as_ref()
                .filter(|value| !value.trim().is_empty())
                .or(fallback.as_ref())
                .cloned()
        };
        Contact {
            name: pick(&self.name, &defaults.name),
            street: pick(&self.street, &defaults.street),
            zipcode: pick(&self.zipcode, &defaults.zipcode),
            phone: pick(&self.phone, &defaults.phone),
        }
    }
}

/// Ad file as written by the operator. Loose types; see `loader` for validation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AdFile {
    pub local_id: Option<String>,
    pub active: Option<bool>,
    pub remove: bool,
    #[serde(rename = "type")]
    pub ad_type: Option<AdType>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub category: Option<serde_yaml::Value>,
    pub price: Option<serde_yaml::Value>,
    pub price_type: Option<PriceType>,
    pub condition: Option<String>,
    pub shipping_type: Option<ShippingType>,
    pub shipping_costs: Option<serde_yaml::Value>,
    pub shipping_options: Vec<String>,
    pub sell_directly: Option<bool>,
    pub images: Vec<String>,
    pub contact: Contact,
    pub special_attributes: BTreeMap<String, serde_yaml::Value>,
    pub tags: Vec<String>,
    pub republication_interval: Option<u32>,
    pub id: Option<serde_yaml::Value>,
    pub content_hash: Option<String>,
    pub created_on: Option<String>,
    pub updated_on: Option<String>,
}

/// A validated, desired listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ad {
    pub local_id: String,
    pub source: PathBuf,
    pub active: bool,
    pub remove: bool,
    pub ad_type: AdType,
    pub title: String,
    pub description: String,
    pub category: Option<String>,
    pub price: Option<Price>,
    pub price_type: PriceType,
    pub condition: Option<Condition>,
    pub shipping_type: ShippingType,
    pub shipping_costs: Option<Price>,
    /// Carrier packages, all of one size. Sorted.
    pub shipping_options: Vec<String>,
    pub sell_directly: bool,
    pub images: Vec<PathBuf>,
    pub contact: Contact,
    pub attributes: BTreeMap<String, String>,
    pub tags: Vec<String>,
    pub republication_interval: Option<u32>,
    pub remote_id: Option<String>,
    pub content_hash: Option<String>,
    pub created_on: Option<DateTime<Utc>>,
    pub updated_on: Option<DateTime<Utc>>,
}

impl Ad {
    pub fn is_published(&self) -> bool {
        self.remote_id.is_some()
    }

    /// True when the listing is older than its republication interval.
    pub fn republication_due(&self, now: DateTime<Utc>) -> bool {
        let Some(interval) = self.republication_interval else {
            return false;
        };
        let Some(reference) = self.updated_on.or(self.created_on) else {
            return false;
        };
        now.signed_duration_since(reference) > chrono::Duration::days(i64::from(interval))
    }

    /// Buy-now only applies to shipped ads with carrier packages and a price.
    pub fn offers_buy_now(&self) -> bool {
        self.sell_directly
            && self.shipping_type == ShippingType::Shipping
            && !self.shipping_options.is_empty()
            && matches!(self.price_type, PriceType::Fixed | PriceType::Negotiable)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|own| own.eq_ignore_ascii_case(tag))
    }
}

/// Renders scalar YAML values (`123`, `"123"`, `80/88`) as plain strings.
pub fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.trim().to_string()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Parses RFC 3339, naive ISO-8601 (`2024-05-01T10:00:00.123`) and `dd.mm.yyyy`.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    for format in ["%d.%m.%Y", "%Y-%m-%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return date.and_hms_opt(0, 0, 0).map(|dt| Utc.from_utc_datetime(&dt));
        }
    }
    None
}

/// Ad values for unit tests across the crate.
#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub(crate) fn ad(local_id: &str, title: &str) -> Ad {
        Ad {
            local_id: local_id.into(),
            source: PathBuf::from(format!("ads/{local_id}.yaml")),
            active: true,
            remove: false,
            ad_type: AdType::Offer,
            title: title.into(),
            description: "Gut erhalten, Abholung bevorzugt".into(),
            category: Some("80/88".into()),
            price: Some(Price::from_minor(15_000)),
            price_type: PriceType::Negotiable,
            condition: None,
            shipping_type: ShippingType::Pickup,
            shipping_costs: None,
            shipping_options: Vec::new(),
            sell_directly: false,
            images: Vec::new(),
            contact: Contact::default(),
            attributes: BTreeMap::new(),
            tags: Vec::new(),
            republication_interval: None,
            remote_id: None,
            content_hash: None,
            created_on: None,
            updated_on: None,
        }
    }
}
