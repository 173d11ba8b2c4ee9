//! Pre-scoring filter stage. Order: deny list, allow list, then price.

use serde::Serialize;

use crate::{normalize_wine_name, Listing, PreferenceProfile, PriceRange};

const COARSE_TYPES: &[&str] = &["red", "white", "rosé", "sparkling", "dessert"];

/// Price bounds that apply to a listing for one profile.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedPriceRange {
    pub range: PriceRange,
    /// Override key that supplied `range`; `None` means the global range applied.
    pub matched_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum FilterDecision {
    Pass { price: ResolvedPriceRange },
    FilteredPrice { price: ResolvedPriceRange },
    FilteredDeny { term: String },
    ForcedNotify { term: String },
}

impl PreferenceProfile {
    /// Override key for the listing's type, if exactly one applies.
    ///
    /// The scraped type is tried first; otherwise a key appearing as whole words in the
    /// wine name is used when it is the only one that does. Once the type is known, a
    /// coarse type key such as `red` can no longer match through the name.
    pub fn matched_type_override(&self, listing: &Listing) -> Option<(&str, &PriceRange)> {
        let known_type = listing.wine_type.as_deref().map(type_label);
        if let Some(wine_type) = &known_type {
            if let Some((key, range)) = self
                .type_price_ranges
                .iter()
                .find(|(key, _)| type_label(key) == *wine_type)
            {
                return Some((key.as_str(), range));
            }
        }

        let name = format!(" {} ", normalize_wine_name(&listing.wine_name));
        let mut in_name = self.type_price_ranges.iter().filter(|(key, _)| {
            let key = type_label(key);
            if key.is_empty() || (known_type.is_some() && COARSE_TYPES.contains(&key.as_str())) {
                return false;
            }
            name.contains(&format!(" {key} "))
        });
        match (in_name.next(), in_name.next()) {
            (Some((key, range)), None) => Some((key.as_str(), range)),
            _ => None,
        }
    }

    pub fn resolve_price_range(&self, listing: &Listing) -> ResolvedPriceRange {
        match self.matched_type_override(listing) {
            Some((key, range)) => ResolvedPriceRange {
                range: *range,
                matched_type: Some(key.to_string()),
            },
            None => ResolvedPriceRange {
                range: self.price_range,
                matched_type: None,
            },
        }
    }
}

fn type_label(label: &str) -> String {
    let label = normalize_wine_name(label);
    if label == "rose" {
        "rosé".to_string()
    } else {
        label
    }
}

pub fn evaluate_filters(listing: &Listing, profile: &PreferenceProfile) -> FilterDecision {
    if let Some(term) = profile
        .never_notify
        .iter()
        .find(|t| t.matches(&listing.wine_name))
    {
        return FilterDecision::FilteredDeny {
            term: term.as_str().to_string(),
        };
    }

    if let Some(term) = profile
        .always_notify
        .iter()
        .find(|t| t.matches(&listing.wine_name))
    {
        return FilterDecision::ForcedNotify {
            term: term.as_str().to_string(),
        };
    }

    let price = profile.resolve_price_range(listing);
    if price.range.contains(listing.price) {
        FilterDecision::Pass { price }
    } else {
        FilterDecision::FilteredPrice { price }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ContactFile, ProfileFile};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn profile(overrides: &[(&str, PriceRange)]) -> PreferenceProfile {
        let file = ProfileFile {
            profile: "Bold reds".into(),
            types: vec!["red".into(), "white".into()],
            price_range: Some(PriceRange::new(20.0, 100.0)),
            type_specific_price_ranges: overrides
                .iter()
                .map(|(k, r)| (k.to_string(), *r))
                .collect::<BTreeMap<_, _>>(),
            always_notify_for: vec!["Opus One".into()],
            never_notify_for: vec!["Yellow Tail".into()],
            notify_threshold: Some(85),
            contact: Some(ContactFile {
                email: Some("a@example.com".into()),
            }),
            email: None,
        };
        PreferenceProfile::from_file("alice", file).unwrap()
    }

    fn listing(name: &str, price: f64, wine_type: Option<&str>) -> Listing {
        Listing::new(name, price, wine_type.map(String::from), "https://x", Utc::now())
    }

    #[test]
    fn red_override_filters_expensive_red() {
        let p = profile(&[("red", PriceRange::new(20.0, 60.0))]);
        let decision = evaluate_filters(&listing("2019 Napa Cabernet", 80.0, Some("red")), &p);
        assert_eq!(
            decision,
            FilterDecision::FilteredPrice {
                price: ResolvedPriceRange {
                    range: PriceRange::new(20.0, 60.0),
                    matched_type: Some("red".into()),
                }
            }
        );
    }

    #[test]
    fn white_without_override_uses_global_range() {
        let p = profile(&[("red", PriceRange::new(20.0, 60.0))]);
        let decision = evaluate_filters(&listing("2021 Sancerre", 80.0, Some("white")), &p);
        assert!(matches!(
            decision,
            FilterDecision::Pass { price: ResolvedPriceRange { matched_type: None, .. } }
        ));
    }

    #[test]
    fn deny_wins_over_allow() {
        let p = profile(&[]);
        let decision = evaluate_filters(&listing("Opus One x Yellow Tail collab", 50.0, None), &p);
        assert_eq!(
            decision,
            FilterDecision::FilteredDeny {
                term: "Yellow Tail".into()
            }
        );
    }

    #[test]
    fn allow_bypasses_price_filter() {
        let p = profile(&[]);
        let decision = evaluate_filters(&listing("2018 Opus One", 450.0, Some("red")), &p);
        assert_eq!(
            decision,
            FilterDecision::ForcedNotify {
                term: "Opus One".into()
            }
        );
    }

    #[test]
    fn override_key_in_name_applies_when_unambiguous() {
        let p = profile(&[
            ("Cabernet Sauvignon", PriceRange::new(30.0, 80.0)),
            ("Chardonnay", PriceRange::new(20.0, 60.0)),
        ]);
        let resolved = p.resolve_price_range(&listing("2020 Stags Leap Chardonnay", 70.0, None));
        assert_eq!(resolved.matched_type.as_deref(), Some("Chardonnay"));
        assert!(!resolved.range.contains(70.0));
    }

    #[test]
    fn typed_white_ignores_red_override_found_in_name() {
        let p = profile(&[("red", PriceRange::new(20.0, 60.0))]);
        for name in [
            "2021 Red Tail Ridge Dry Riesling",
            "2020 Alfred Eames Chardonnay",
            "2019 Redwood Valley Sauvignon Blanc",
        ] {
            let decision = evaluate_filters(&listing(name, 80.0, Some("white")), &p);
            assert_eq!(
                decision,
                FilterDecision::Pass {
                    price: ResolvedPriceRange {
                        range: PriceRange::new(20.0, 100.0),
                        matched_type: None,
                    }
                },
                "{name}"
            );
        }
    }

    #[test]
    fn name_keys_match_whole_words_only() {
        let p = profile(&[("red", PriceRange::new(20.0, 60.0))]);
        let untyped = p.resolve_price_range(&listing("2020 Alfred Eames Reserve", 80.0, None));
        assert_eq!(untyped.matched_type, None);
        let untyped = p.resolve_price_range(&listing("NV House Red Blend", 80.0, None));
        assert_eq!(untyped.matched_type.as_deref(), Some("red"));
    }

    #[test]
    fn rose_spellings_are_equivalent() {
        let p = profile(&[("rose", PriceRange::new(15.0, 40.0))]);
        let resolved = p.resolve_price_range(&listing("2022 Tempier Bandol", 45.0, Some("rosé")));
        assert_eq!(resolved.matched_type.as_deref(), Some("rose"));
        assert!(!resolved.range.contains(45.0));
    }

    #[test]
    fn ambiguous_name_match_falls_back_to_global() {
        let p = profile(&[
            ("Cabernet", PriceRange::new(30.0, 80.0)),
            ("Merlot", PriceRange::new(20.0, 40.0)),
        ]);
        let resolved = p.resolve_price_range(&listing("Cabernet-Merlot Blend", 90.0, None));
        assert_eq!(resolved.matched_type, None);
        assert_eq!(resolved.range, PriceRange::new(20.0, 100.0));
    }

    #[test]
    fn boundaries_are_inclusive() {
        let p = profile(&[]);
        assert!(matches!(
            evaluate_filters(&listing("Plain", 20.0, None), &p),
            FilterDecision::Pass { .. }
        ));
        assert!(matches!(
            evaluate_filters(&listing("Plain", 100.0, None), &p),
            FilterDecision::Pass { .. }
        ));
        assert!(matches!(
            evaluate_filters(&listing("Plain", 100.01, None), &p),
            FilterDecision::FilteredPrice { .. }
        ));
    }
}
