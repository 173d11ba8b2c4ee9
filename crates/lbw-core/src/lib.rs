//! Core domain model for Last Bottle Watch: listings, preference profiles, score records
//! and the filter stage that runs before any scoring call.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod filter;
mod profile;

pub use filter::{evaluate_filters, FilterDecision, ResolvedPriceRange};
pub use profile::{
    Contact, ContactFile, MatchTerm, MatchTermError, PreferenceProfile, PriceRange, ProfileError,
    ProfileFile,
};

pub const CRATE_NAME: &str = "lbw-core";

/// Stable identity of a sale, shared by every scrape of the same offer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListingKey(String);

impl ListingKey {
    pub fn external(id: &str) -> Self {
        Self(format!("ext:{}", id.trim()))
    }

    /// Deterministic key over the normalized name and the price in cents.
    pub fn derived(wine_name: &str, price: f64) -> Self {
        let cents = (price * 100.0).round() as i64;
        let source = format!("{}|{}", normalize_wine_name(wine_name), cents);
        Self(Uuid::new_v5(&Uuid::NAMESPACE_URL, source.as_bytes()).to_string())
    }

    /// Rehydrate a key read back from storage.
    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ListingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lower-cased alphanumeric words joined by single spaces. Accented letters are kept.
pub fn normalize_wine_name(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Row id assigned by the listing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListingId(pub i64);

impl fmt::Display for ListingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One scraped wine offer as observed at `scraped_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub key: ListingKey,
    pub wine_name: String,
    pub price: f64,
    pub wine_type: Option<String>,
    pub url: String,
    pub scraped_at: DateTime<Utc>,
}

impl Listing {
    pub fn new(
        wine_name: impl Into<String>,
        price: f64,
        wine_type: Option<String>,
        url: impl Into<String>,
        scraped_at: DateTime<Utc>,
    ) -> Self {
        let wine_name = wine_name.into().trim().to_string();
        Self {
            key: ListingKey::derived(&wine_name, price),
            wine_name,
            price,
            wine_type,
            url: url.into(),
            scraped_at,
        }
    }

    pub fn with_external_id(mut self, external_id: &str) -> Self {
        self.key = ListingKey::external(external_id);
        self
    }
}

/// A listing as persisted by the listing store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredListing {
    pub id: ListingId,
    pub first_seen_at: DateTime<Utc>,
    pub listing: Listing,
}

/// Terminal state of one (user, listing) evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Notified,
    Suppressed,
    FilteredPrice,
    FilteredDeny,
    ScoringError,
    /// Delivery failed; the next cycle may retry up to the attempt cap.
    NotifyPending,
    NotifyAbandoned,
}

impl Outcome {
    pub const ALL: [Outcome; 7] = [
        Outcome::Notified,
        Outcome::Suppressed,
        Outcome::FilteredPrice,
        Outcome::FilteredDeny,
        Outcome::ScoringError,
        Outcome::NotifyPending,
        Outcome::NotifyAbandoned,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Notified => "notified",
            Outcome::Suppressed => "suppressed",
            Outcome::FilteredPrice => "filtered_price",
            Outcome::FilteredDeny => "filtered_deny",
            Outcome::ScoringError => "scoring_error",
            Outcome::NotifyPending => "notify_pending",
            Outcome::NotifyAbandoned => "notify_abandoned",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Outcome::ScoringError | Outcome::NotifyPending | Outcome::NotifyAbandoned
        )
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown outcome `{0}`")]
pub struct UnknownOutcome(pub String);

impl FromStr for Outcome {
    type Err = UnknownOutcome;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Outcome::ALL
            .into_iter()
            .find(|o| o.as_str() == s)
            .ok_or_else(|| UnknownOutcome(s.to_string()))
    }
}

/// Durable result of evaluating one listing against one profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub user_id: String,
    pub listing_id: ListingId,
    pub score: Option<u8>,
    pub outcome: Outcome,
    pub notify_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
