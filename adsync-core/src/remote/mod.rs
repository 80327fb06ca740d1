//! Observed state: the listings currently live under the account.

mod download;
mod matcher;
mod models;
mod reader;

pub use download::{DownloadSelector, DownloadedAd, ListingExtractor};
pub use matcher::{AmbiguousMatch, IdentityMatcher, MatchResult};
pub use models::{RemoteAdSummary, RemoteSnapshot, RemoteStatus};
pub use reader::RemoteStateReader;
