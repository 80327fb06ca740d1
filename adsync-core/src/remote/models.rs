use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteStatus {
    Active,
    /// Reserved or deactivated by the seller.
    Paused,
    Expired,
    Sold,
}

impl RemoteStatus {
    /// Maps the state attribute of a listing row; unknown values count as active.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "paused" | "reserved" | "inactive" | "deactivated" => RemoteStatus::Paused,
            "expired" | "ended" => RemoteStatus::Expired,
            "sold" => RemoteStatus::Sold,
            _ => RemoteStatus::Active,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteStatus::Active => "active",
            RemoteStatus::Paused => "paused",
            RemoteStatus::Expired => "expired",
            RemoteStatus::Sold => "sold",
        }
    }
}

impl fmt::Display for RemoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One listing as seen on the account's management view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteAdSummary {
    pub remote_id: String,
    pub title: String,
    pub status: RemoteStatus,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Immutable view of every listing under the account at `taken_at`.
#[derive(Debug, Clone, Serialize)]
pub struct RemoteSnapshot {
    ads: Vec<RemoteAdSummary>,
    taken_at: DateTime<Utc>,
    #[serde(skip)]
    by_id: HashMap<String, usize>,
    #[serde(skip)]
    by_title: HashMap<String, Vec<usize>>,
}

impl RemoteSnapshot {
    pub fn new(ads: Vec<RemoteAdSummary>, taken_at: DateTime<Utc>) -> Self {
        let mut by_id = HashMap::with_capacity(ads.len());
        let mut by_title: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, ad) in ads.iter().enumerate() {
            by_id.entry(ad.remote_id.clone()).or_insert(index);
            by_title.entry(ad.title.trim().to_string()).or_default().push(index);
        }
        Self {
            ads,
            taken_at,
            by_id,
            by_title,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), Utc::now())
    }

    pub fn ads(&self) -> &[RemoteAdSummary] {
        &self.ads
    }

    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    pub fn len(&self) -> usize {
        self.ads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ads.is_empty()
    }

    pub fn get(&self, remote_id: &str) -> Option<&RemoteAdSummary> {
        self.by_id.get(remote_id).map(|index| &self.ads[*index])
    }

    pub fn contains(&self, remote_id: &str) -> bool {
        self.by_id.contains_key(remote_id)
    }

    pub fn with_title<'s>(&'s self, title: &str) -> impl Iterator<Item = &'s RemoteAdSummary> + 's {
        self.by_title
            .get(title.trim())
            .into_iter()
            .flatten()
            .map(move |index| &self.ads[*index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(id: &str, title: &str) -> RemoteAdSummary {
        RemoteAdSummary {
            remote_id: id.into(),
            title: title.into(),
            status: RemoteStatus::Active,
            last_modified: None,
        }
    }

    #[test]
    fn unknown_states_count_as_active() {
        assert_eq!(RemoteStatus::parse("reserved"), RemoteStatus::Paused);
        assert_eq!(RemoteStatus::parse("SOLD"), RemoteStatus::Sold);
        assert_eq!(RemoteStatus::parse("something-new"), RemoteStatus::Active);
    }

    #[test]
    fn indexes_by_id_and_title() {
        let snapshot = RemoteSnapshot::new(
            vec![
                summary("1", "Sofa grau"),
                summary("2", "Sofa grau"),
                summary("3", "Lampe"),
            ],
            Utc::now(),
        );
        assert_eq!(snapshot.get("3").map(|ad| ad.title.as_str()), Some("Lampe"));
        assert_eq!(snapshot.with_title("Sofa grau").count(), 2);
        assert_eq!(snapshot.with_title("Tisch").count(), 0);
        assert!(!snapshot.contains("4"));
    }

    #[test]
    fn title_lookup_ignores_surrounding_whitespace_on_both_sides() {
        let snapshot = RemoteSnapshot::new(
            vec![summary("1", "  Lampe aus Messing\n"), summary("2", "Tisch")],
            Utc::now(),
        );
        let found: Vec<&str> = snapshot
            .with_title(" Lampe aus Messing ")
            .map(|ad| ad.remote_id.as_str())
            .collect();
        assert_eq!(found, vec!["1"]);
        assert_eq!(snapshot.with_title("Lampe aus Messing").count(), 1);
    }
}
