//! LLM relevance scoring against the Gemini `generateContent` endpoint.

use std::fmt::Write as _;

use async_trait::async_trait;
use lbw_core::{Listing, PreferenceProfile};
use lbw_storage::HttpFetcher;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{AdapterError, Scorer};

pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash-lite";
const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Build the prompt sent to the scorer for one listing and one profile.
pub fn render_scoring_prompt(listing: &Listing, profile: &PreferenceProfile) -> String {
    let resolved = profile.resolve_price_range(listing);
    let mut out = String::new();

    out.push_str(
        "You are a sommelier deciding whether a wine deal is worth an alert for one customer.\n\
         Rate how well the wine below fits the customer's preferences on a scale from 0 to 100.\n\n",
    );

    out.push_str("## Customer taste profile\n");
    if profile.description.trim().is_empty() {
        out.push_str("No description given.\n");
    } else {
        let _ = writeln!(out, "{}", profile.description.trim());
    }

    out.push_str("\n## Preferred wine types\n");
    if profile.types.is_empty() {
        out.push_str("Any\n");
    } else {
        let _ = writeln!(out, "{}", profile.types.join(", "));
    }

    out.push_str("\n## Budget\n");
    match &resolved.matched_type {
        Some(wine_type) => {
            let _ = writeln!(out, "{} (budget for {wine_type})", resolved.range);
        }
        None => {
            let _ = writeln!(out, "{}", resolved.range);
        }
    }

    if !profile.never_notify.is_empty() {
        out.push_str("\n## Wines the customer dislikes\n");
        for term in &profile.never_notify {
            let _ = writeln!(out, "- {}", term.as_str());
        }
    }

    out.push_str("\n## Wine on offer\n");
    let _ = writeln!(out, "Name: {}", listing.wine_name);
    let _ = writeln!(out, "Price: ${:.2}", listing.price);
    if let Some(wine_type) = &listing.wine_type {
        let _ = writeln!(out, "Type: {wine_type}");
    }

    out.push_str(
        "\n## Scoring guide\n\
         - 90-100: exactly what the customer looks for, at a price they would welcome\n\
         - 70-89: a good match with minor reservations\n\
         - 40-69: partially relevant\n\
         - 0-39: poor fit\n\n\
         Respond with the integer score only. No words, no explanation.\n",
    );
    out
}

/// Accept a bare integer in `0..=100`, optionally followed by a period.
pub fn parse_score_response(text: &str) -> Result<u8, AdapterError> {
    let trimmed = text.trim();
    let digits = trimmed.strip_suffix('.').unwrap_or(trimmed).trim();
    let value: i64 = digits.parse().map_err(|_| {
        AdapterError::ScoringUnavailable(format!(
            "non-numeric scorer response {:?}",
            trimmed.chars().take(80).collect::<String>()
        ))
    })?;
    u8::try_from(value)
        .ok()
        .filter(|score| *score <= 100)
        .ok_or_else(|| AdapterError::ScoringUnavailable(format!("score {value} outside 0..=100")))
}

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
}

pub struct GeminiScorer {
    http: HttpFetcher,
    config: GeminiConfig,
}

impl GeminiScorer {
    pub fn new(http: HttpFetcher, config: GeminiConfig) -> Self {
        Self { http, config }
    }

    fn endpoint(&self) -> String {
        format!("{GEMINI_API_BASE}/models/{}:generateContent", self.config.model)
    }
}

#[async_trait]
impl Scorer for GeminiScorer {
    async fn score(
        &self,
        listing: &Listing,
        profile: &PreferenceProfile,
    ) -> Result<u8, AdapterError> {
        let prompt = render_scoring_prompt(listing, profile);
        let request = GenerateContentRequest::single_turn(&prompt);
        let response: GenerateContentResponse = self
            .http
            .post_json(
                &self.endpoint(),
                &[("x-goog-api-key", self.config.api_key.as_str())],
                &request,
            )
            .await
            .map_err(|e| AdapterError::ScoringUnavailable(e.to_string()))?;

        let text = response
            .text()
            .ok_or_else(|| AdapterError::ScoringUnavailable("empty scorer response".into()))?;
        debug!(user_id = %profile.user_id, raw = %text.trim(), "scorer replied");
        parse_score_response(&text)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
}

impl<'a> GenerateContentRequest<'a> {
    fn single_turn(prompt: &'a str) -> Self {
        Self {
            contents: vec![Content {
                role: "user",
                parts: vec![TextPart { text: prompt }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.0,
                candidate_count: 1,
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'a str,
    parts: Vec<TextPart<'a>>,
}

#[derive(Debug, Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    candidate_count: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

impl GenerateContentResponse {
    /// Concatenated text of the first candidate.
    fn text(&self) -> Option<String> {
        let parts = &self.candidates.first()?.content.as_ref()?.parts;
        let text: String = parts.iter().filter_map(|p| p.text.as_deref()).collect();
        (!text.trim().is_empty()).then_some(text)
    }
}
