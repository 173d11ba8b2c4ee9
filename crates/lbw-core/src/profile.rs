//! Per-user preference profiles, validated once at load time.

use std::collections::BTreeMap;
use std::fmt;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Inclusive price bounds; `None` on either side means open-ended.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "(Option<f64>, Option<f64>)", into = "(Option<f64>, Option<f64>)")]
pub struct PriceRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl From<(Option<f64>, Option<f64>)> for PriceRange {
    fn from((min, max): (Option<f64>, Option<f64>)) -> Self {
        Self { min, max }
    }
}

impl From<PriceRange> for (Option<f64>, Option<f64>) {
    fn from(range: PriceRange) -> Self {
        (range.min, range.max)
    }
}

impl PriceRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
        }
    }

    pub fn contains(&self, price: f64) -> bool {
        self.min.map_or(true, |min| price >= min) && self.max.map_or(true, |max| price <= max)
    }

    fn validate(&self, user_id: &str, field: &str) -> Result<(), ProfileError> {
        for bound in [self.min, self.max].into_iter().flatten() {
            if !bound.is_finite() || bound < 0.0 {
                return Err(ProfileError::InvalidPriceBound {
                    user_id: user_id.to_string(),
                    field: field.to_string(),
                    value: bound,
                });
            }
        }
        if let (Some(min), Some(max)) = (self.min, self.max) {
            if min > max {
                return Err(ProfileError::InvertedPriceRange {
                    user_id: user_id.to_string(),
                    field: field.to_string(),
                    min,
                    max,
                });
            }
        }
        Ok(())
    }
}

impl fmt::Display for PriceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = |v: Option<f64>| v.map_or_else(|| "Any".to_string(), |v| format!("${v}"));
        write!(f, "{} - {}", side(self.min), side(self.max))
    }
}

#[derive(Debug, Error)]
pub enum MatchTermError {
    #[error("match term is empty")]
    Empty,
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Always/never-notify term: a case-insensitive substring, or `/regex/`.
#[derive(Debug, Clone)]
pub enum MatchTerm {
    Substring { raw: String, needle: String },
    Pattern { raw: String, regex: Regex },
}

impl MatchTerm {
    pub fn parse(raw: &str) -> Result<Self, MatchTermError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(MatchTermError::Empty);
        }
        if let Some(pattern) = raw
            .strip_prefix('/')
            .and_then(|rest| rest.strip_suffix('/'))
            .filter(|p| !p.is_empty())
        {
            let regex = RegexBuilder::new(pattern).case_insensitive(true).build()?;
            return Ok(Self::Pattern {
                raw: raw.to_string(),
                regex,
            });
        }
        Ok(Self::Substring {
            raw: raw.to_string(),
            needle: raw.to_lowercase(),
        })
    }

    pub fn matches(&self, text: &str) -> bool {
        match self {
            Self::Substring { needle, .. } => text.to_lowercase().contains(needle.as_str()),
            Self::Pattern { regex, .. } => regex.is_match(text),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Substring { raw, .. } | Self::Pattern { raw, .. } => raw,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactFile {
    #[serde(default)]
    pub email: Option<String>,
}

/// Profile exactly as written in a user's YAML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileFile {
    #[serde(default)]
    pub profile: String,
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(default)]
    pub price_range: Option<PriceRange>,
    #[serde(default)]
    pub type_specific_price_ranges: BTreeMap<String, PriceRange>,
    #[serde(default)]
    pub always_notify_for: Vec<String>,
    #[serde(default)]
    pub never_notify_for: Vec<String>,
    #[serde(default)]
    pub notify_threshold: Option<i64>,
    #[serde(default)]
    pub contact: Option<ContactFile>,
    /// Older files put the address at the top level.
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub email: String,
}

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("profile `{user_id}`: notify_threshold is required")]
    MissingThreshold { user_id: String },
    #[error("profile `{user_id}`: notify_threshold {value} is outside 0..=100")]
    ThresholdOutOfRange { user_id: String, value: i64 },
    #[error("profile `{user_id}`: {field} bound {value} must be a non-negative number")]
    InvalidPriceBound {
        user_id: String,
        field: String,
        value: f64,
    },
    #[error("profile `{user_id}`: {field} has min {min} greater than max {max}")]
    InvertedPriceRange {
        user_id: String,
        field: String,
        min: f64,
        max: f64,
    },
    #[error("profile `{user_id}`: bad match term `{term}`: {source}")]
    InvalidMatchTerm {
        user_id: String,
        term: String,
        #[source]
        source: MatchTermError,
    },
    #[error("profile `{user_id}`: contact.email is required")]
    MissingEmail { user_id: String },
    #[error("profile `{user_id}`: `{email}` is not an email address")]
    InvalidEmail { user_id: String, email: String },
}

/// One user's validated taste, price and notification configuration.
#[derive(Debug, Clone)]
pub struct PreferenceProfile {
    pub user_id: String,
    pub description: String,
    pub types: Vec<String>,
    pub price_range: PriceRange,
    pub type_price_ranges: BTreeMap<String, PriceRange>,
    pub always_notify: Vec<MatchTerm>,
    pub never_notify: Vec<MatchTerm>,
    pub notify_threshold: u8,
    pub contact: Contact,
}

impl PreferenceProfile {
    pub fn from_file(user_id: impl Into<String>, file: ProfileFile) -> Result<Self, ProfileError> {
        let user_id = user_id.into();

        let threshold = file
            .notify_threshold
            .ok_or_else(|| ProfileError::MissingThreshold {
                user_id: user_id.clone(),
            })?;
        let notify_threshold = u8::try_from(threshold)
            .ok()
            .filter(|t| *t <= 100)
            .ok_or_else(|| ProfileError::ThresholdOutOfRange {
                user_id: user_id.clone(),
                value: threshold,
            })?;

        let price_range = file.price_range.unwrap_or_default();
        price_range.validate(&user_id, "price_range")?;
        for (wine_type, range) in &file.type_specific_price_ranges {
            range.validate(&user_id, &format!("type_specific_price_ranges.{wine_type}"))?;
        }

        let always_notify = parse_terms(&user_id, &file.always_notify_for)?;
        let never_notify = parse_terms(&user_id, &file.never_notify_for)?;

        let email = file
            .contact
            .and_then(|c| c.email)
            .or(file.email)
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .ok_or_else(|| ProfileError::MissingEmail {
                user_id: user_id.clone(),
            })?;
        if !looks_like_email(&email) {
            return Err(ProfileError::InvalidEmail { user_id, email });
        }

        Ok(Self {
            user_id,
            description: file.profile.trim().to_string(),
            types: file.types,
            price_range,
            type_price_ranges: file.type_specific_price_ranges,
            always_notify,
            never_notify,
            notify_threshold,
            contact: Contact { email },
        })
    }
}

fn parse_terms(user_id: &str, raw: &[String]) -> Result<Vec<MatchTerm>, ProfileError> {
    raw.iter()
        .map(|term| {
            MatchTerm::parse(term).map_err(|source| ProfileError::InvalidMatchTerm {
                user_id: user_id.to_string(),
                term: term.clone(),
                source,
            })
        })
        .collect()
}

fn looks_like_email(value: &str) -> bool {
    match value.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !value.contains(char::is_whitespace)
        }
        None => false,
    }
}
