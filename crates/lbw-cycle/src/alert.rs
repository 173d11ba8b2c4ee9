use std::fmt::Write as _;

use lbw_core::Listing;
use uuid::Uuid;

use crate::CycleFailure;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub subject: String,
    pub body: String,
}

/// Customer alert for one listing. `score` is `None` for always-notify matches.
pub fn render_alert(
    listing: &Listing,
    score: Option<u8>,
    matched_term: Option<&str>,
) -> RenderedMessage {
    let headline = match score {
        Some(score) => format!("Score {score}"),
        None => "Always-notify match".to_string(),
    };
    let subject = format!("Last Bottle Alert: {} — {headline}", listing.wine_name);

    let mut body = String::new();
    let _ = writeln!(body, "{}", listing.wine_name);
    let _ = writeln!(body);
    let _ = writeln!(body, "Price: ${:.2}", listing.price);
    if let Some(wine_type) = &listing.wine_type {
        let _ = writeln!(body, "Type: {wine_type}");
    }
    match (score, matched_term) {
        (Some(score), _) => {
            let _ = writeln!(body, "Match score: {score}/100");
        }
        (None, Some(term)) => {
            let _ = writeln!(body, "Matched your always-notify list: \"{term}\"");
        }
        (None, None) => {
            let _ = writeln!(body, "Matched your always-notify list");
        }
    }
    let _ = writeln!(body);
    let _ = writeln!(body, "Buy it here: {}", listing.url);
    let _ = writeln!(body);
    body.push_str("Last Bottle offers sell out fast. Cheers!\n");

    RenderedMessage { subject, body }
}

/// Operator digest summarising what went wrong in one cycle.
pub fn render_error_digest(
    run_id: Uuid,
    failures: &[CycleFailure],
    fatal: Option<&str>,
) -> RenderedMessage {
    let count = failures.len() + usize::from(fatal.is_some());
    let subject = format!(
        "Last Bottle Watch: {count} error{} in run {}",
        if count == 1 { "" } else { "s" },
        &run_id.to_string()[..8]
    );

    let mut body = String::new();
    let _ = writeln!(body, "Run: {run_id}");
    if let Some(fatal) = fatal {
        let _ = writeln!(body, "\nCycle aborted: {fatal}");
    }
    if !failures.is_empty() {
        let _ = writeln!(body, "\nFailures:");
        for failure in failures {
            let _ = writeln!(
                body,
                "- [{}] {}: {}",
                failure.kind,
                failure.subject.as_deref().unwrap_or("-"),
                failure.message
            );
        }
    }
    RenderedMessage { subject, body }
}
