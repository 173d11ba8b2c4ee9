//! Outbound adapters: the storefront scraper, the LLM scorer and the SMTP notifier.
//!
//! Each adapter sits behind a trait so the cycle can run against fakes in tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lbw_core::{Listing, PreferenceProfile};
use lbw_storage::HttpFetcher;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::debug;

mod scoring;
mod smtp;

pub use scoring::{
    parse_score_response, render_scoring_prompt, GeminiConfig, GeminiScorer, DEFAULT_GEMINI_MODEL,
};
pub use smtp::{SmtpConfig, SmtpNotifier};

pub const CRATE_NAME: &str = "lbw-adapters";

pub const LAST_BOTTLE_URL: &str = "https://lastbottlewines.com/";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("fetch failed: {0}")]
    FetchFailure(String),
    #[error("scoring unavailable: {0}")]
    ScoringUnavailable(String),
    #[error("delivery failed: {0}")]
    DeliveryFailed(String),
}

#[async_trait]
pub trait ListingScraper: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Fetch the page and return the single listing currently on offer.
    async fn fetch_current(&self) -> Result<Listing, AdapterError>;
}

#[async_trait]
pub trait Scorer: Send + Sync {
    /// Relevance of `listing` to `profile`, in `0..=100`.
    async fn score(&self, listing: &Listing, profile: &PreferenceProfile)
        -> Result<u8, AdapterError>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, to: &str, subject: &str, body: &str) -> Result<(), AdapterError>;
}

pub struct LastBottleScraper {
    http: HttpFetcher,
    url: String,
}

impl LastBottleScraper {
    pub fn new(http: HttpFetcher, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl ListingScraper for LastBottleScraper {
    fn source_id(&self) -> &'static str {
        "last-bottle"
    }

    async fn fetch_current(&self) -> Result<Listing, AdapterError> {
        let fetched = self
            .http
            .fetch_bytes(&self.url)
            .await
            .map_err(|e| AdapterError::FetchFailure(e.to_string()))?;
        let html = String::from_utf8_lossy(&fetched.body);
        debug!(bytes = fetched.body.len(), final_url = %fetched.final_url, "parsing listing page");
        parse_listing_page(&html, &self.url, Utc::now())
    }
}

/// Extract the featured wine from a Last Bottle product page.
///
/// The name is the first `main h1`; the price is the first `span` inside the
/// `div.product__price` block labelled "LAST BOTTLE".
pub fn parse_listing_page(
    html: &str,
    url: &str,
    scraped_at: DateTime<Utc>,
) -> Result<Listing, AdapterError> {
    let document = Html::parse_document(html);

    let wine_name = select_first_text(&document, "main h1")?
        .ok_or_else(|| AdapterError::FetchFailure("wine name not found (main h1)".into()))?;

    let price_sel = parse_selector("main div.product__price")?;
    let span_sel = parse_selector("span")?;
    let block = document
        .select(&price_sel)
        .find(|el| element_text(el).to_uppercase().contains("LAST BOTTLE"))
        .ok_or_else(|| AdapterError::FetchFailure("LAST BOTTLE price block not found".into()))?;
    let price_text = block
        .select(&span_sel)
        .next()
        .map(|el| element_text(&el))
        .ok_or_else(|| AdapterError::FetchFailure("LAST BOTTLE price has no value".into()))?;
    let price = parse_price(&price_text)?;

    let wine_type = infer_wine_type(&wine_name).map(str::to_string);
    Ok(Listing::new(wine_name, price, wine_type, url, scraped_at))
}

pub fn parse_price(text: &str) -> Result<f64, AdapterError> {
    let cleaned: String = text
        .chars()
        .filter(|c| !matches!(c, ',' | '$') && !c.is_whitespace())
        .collect();
    match cleaned.parse::<f64>() {
        Ok(price) if price.is_finite() && price >= 0.0 => Ok(price),
        _ => Err(AdapterError::FetchFailure(format!(
            "unparseable price {:?}",
            text.trim()
        ))),
    }
}

const WINE_TYPE_KEYWORDS: &[(&str, &[&str])] = &[
    (
        "sparkling",
        &[
            "champagne", "sparkling", "prosecco", "cava", "crémant", "cremant", "brut",
            "spumante", "franciacorta", "pét nat", "pet nat", "blanc de blancs", "blanc de noirs",
        ],
    ),
    (
        "dessert",
        &[
            "sauternes", "port", "tawny", "late harvest", "ice wine", "icewine", "tokaji",
            "madeira", "sherry", "vin santo", "moscato d asti",
        ],
    ),
    ("rosé", &["rosé", "rose", "rosato", "rosado"]),
    (
        "white",
        &[
            "white", "blanc", "bianco", "chardonnay", "sauvignon blanc", "riesling",
            "pinot grigio", "pinot gris", "chenin", "viognier", "albariño", "albarino",
            "gewürztraminer", "gewurztraminer", "grüner", "gruner", "sancerre", "chablis",
            "muscadet", "vermentino", "sémillon", "semillon", "marsanne", "roussanne",
        ],
    ),
    (
        "red",
        &[
            "red", "rouge", "rosso", "cabernet", "merlot", "pinot noir", "syrah", "shiraz",
            "zinfandel", "malbec", "grenache", "tempranillo", "sangiovese", "nebbiolo",
            "barolo", "barbaresco", "brunello", "chianti", "rioja", "petite sirah",
            "mourvèdre", "mourvedre", "carménère", "carmenere", "meritage", "bordeaux",
            "châteauneuf", "chateauneuf", "amarone", "gamay", "beaujolais",
        ],
    ),
];

/// Best-effort type guess from the wine name. Categories are checked in order,
/// so "Brut Rosé" is sparkling and "Pinot Noir Rosé" is rosé.
pub fn infer_wine_type(wine_name: &str) -> Option<&'static str> {
    let padded = format!(" {} ", lbw_core::normalize_wine_name(wine_name));
    WINE_TYPE_KEYWORDS
        .iter()
        .find(|(_, keywords)| {
            keywords.iter().any(|kw| {
                let kw = lbw_core::normalize_wine_name(kw);
                padded.contains(&format!(" {kw} "))
            })
        })
        .map(|(wine_type, _)| *wine_type)
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::FetchFailure(e.to_string()))
}

fn element_text(el: &ElementRef<'_>) -> String {
    el.text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn select_first_text(document: &Html, selector: &str) -> Result<Option<String>, AdapterError> {
    let sel = parse_selector(selector)?;
    Ok(document
        .select(&sel)
        .map(|el| element_text(&el))
        .find(|text| !text.is_empty()))
}
