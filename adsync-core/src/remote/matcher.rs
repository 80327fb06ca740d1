use std::collections::HashSet;

use serde::Serialize;

use crate::ads::Ad;

use super::models::{RemoteAdSummary, RemoteSnapshot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchResult<'s> {
    ById(&'s RemoteAdSummary),
    ByTitle(&'s RemoteAdSummary),
    /// Several unclaimed listings carry the ad's title.
    Ambiguous(Vec<String>),
    Unmatched,
}

impl<'s> MatchResult<'s> {
    pub fn summary(&self) -> Option<&'s RemoteAdSummary> {
        match self {
            MatchResult::ById(summary) | MatchResult::ByTitle(summary) => Some(summary),
            MatchResult::Ambiguous(_) | MatchResult::Unmatched => None,
        }
    }
}

/// An ad left out of the pass because its title matched several listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AmbiguousMatch {
    pub local_id: String,
    pub title: String,
    pub candidates: Vec<String>,
}

/// Joins desired ads to observed listings: recorded id first, then exact title.
pub struct IdentityMatcher<'s> {
    snapshot: &'s RemoteSnapshot,
    claimed: HashSet<String>,
}

impl<'s> IdentityMatcher<'s> {
    /// `claimed` holds remote ids recorded by any ad file; those listings are
    /// never matched by title.
    pub fn new(snapshot: &'s RemoteSnapshot, claimed: HashSet<String>) -> Self {
        Self { snapshot, claimed }
    }

    pub fn match_ad(&self, ad: &Ad) -> MatchResult<'s> {
        if let Some(remote_id) = &ad.remote_id {
            return match self.snapshot.get(remote_id) {
                Some(summary) => MatchResult::ById(summary),
                None => MatchResult::Unmatched,
            };
        }
        let candidates: Vec<&'s RemoteAdSummary> = self
            .snapshot
            .with_title(&ad.title)
            .filter(|summary| !self.claimed.contains(&summary.remote_id))
            .collect();
        match candidates.as_slice() {
            [] => MatchResult::Unmatched,
            [only] => MatchResult::ByTitle(only),
            many => MatchResult::Ambiguous(many.iter().map(|s| s.remote_id.clone()).collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::ads::models::fixtures;
    use crate::remote::models::RemoteStatus;

    fn summary(id: &str, title: &str) -> RemoteAdSummary {
        RemoteAdSummary {
            remote_id: id.into(),
            title: title.into(),
            status: RemoteStatus::Active,
            last_modified: None,
        }
    }

    fn ad(title: &str, remote_id: Option<&str>) -> Ad {
        let mut ad = fixtures::ad("sofa", title);
        ad.remote_id = remote_id.map(str::to_string);
        ad
    }

    #[test]
    fn prefers_recorded_id_then_unclaimed_title() {
        let snapshot = RemoteSnapshot::new(
            vec![
                summary("10", "Sofa grau"),
                summary("11", "Sofa grau"),
                summary("12", "Lampe aus Messing"),
            ],
            Utc::now(),
        );
        let claimed: HashSet<String> = ["10".to_string()].into();
        let matcher = IdentityMatcher::new(&snapshot, claimed);

        assert!(matches!(matcher.match_ad(&ad("Sofa grau", Some("10"))), MatchResult::ById(s) if s.remote_id == "10"));
        assert!(matches!(matcher.match_ad(&ad("Sofa grau", None)), MatchResult::ByTitle(s) if s.remote_id == "11"));
        assert_eq!(matcher.match_ad(&ad("Sofa grau", Some("99"))), MatchResult::Unmatched);
        assert_eq!(matcher.match_ad(&ad("Tisch aus Eiche", None)), MatchResult::Unmatched);
    }

    #[test]
    fn duplicate_titles_are_ambiguous() {
        let snapshot = RemoteSnapshot::new(
            vec![summary("10", "Sofa grau"), summary("11", "Sofa grau")],
            Utc::now(),
        );
        let matcher = IdentityMatcher::new(&snapshot, HashSet::new());
        assert_eq!(
            matcher.match_ad(&ad("Sofa grau", None)),
            MatchResult::Ambiguous(vec!["10".into(), "11".into()])
        );
    }
}
