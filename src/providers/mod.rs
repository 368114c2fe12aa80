//! Outbound provider capabilities used by the place processor.
//!
//! * [`DetailsProvider`]: exact lookup of structured place details by id.
//! * [`ListingMatcher`]: fuzzy search for the matching listing on the review site.
//! * [`ReviewHarvester`]: paginated review extraction from a resolved listing.

mod google;
mod http;
mod tripadvisor;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::errors::AppResult;

pub use google::GooglePlacesClient;
pub use http::PageFetcher;
pub use tripadvisor::TripAdvisorClient;

pub const MAX_SEARCH_CANDIDATES: usize = 5;

static STATE_PART: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Z]{2})(?:\s+\d{5}(?:-\d{4})?)?$").expect("state pattern compiles")
});

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaceDetails {
    pub place_id: String,
    pub name: String,
    pub formatted_address: Option<String>,
    pub lat: f64,
    pub lng: f64,
    pub website: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingQuery {
    pub name: String,
    pub address: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
}

impl ListingQuery {
    /// Name plus a best-effort "city ST" token pulled from the address.
    pub fn search_text(&self) -> String {
        match self.address.as_deref().and_then(city_state_token) {
            Some(location) => format!("{} {}", self.name.trim(), location),
            None => self.name.trim().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingMatch {
    pub url: Option<String>,
    pub location_id: Option<String>,
    /// False when the page title never confirmed the name.
    pub confirmed: bool,
}

impl ListingMatch {
    pub fn none() -> Self {
        Self {
            url: None,
            location_id: None,
            confirmed: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingRef {
    pub url: String,
    pub location_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HarvestedReview {
    pub provider_review_id: Option<String>,
    pub payload: serde_json::Value,
}

/// What the matcher returns when no candidate page confirms the name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MatchFallback {
    /// Take the first search result anyway; favours progress over precision.
    #[default]
    FirstCandidate,
    /// Report no listing.
    Strict,
}

impl MatchFallback {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchFallback::FirstCandidate => "first-candidate",
            MatchFallback::Strict => "strict",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "first-candidate" | "first" => Some(MatchFallback::FirstCandidate),
            "strict" => Some(MatchFallback::Strict),
            _ => None,
        }
    }
}

#[async_trait]
pub trait DetailsProvider: Send + Sync {
    /// `Ok(None)` means the provider authoritatively does not know the id.
    async fn fetch_details(&self, place_id: &str) -> AppResult<Option<PlaceDetails>>;
}

#[async_trait]
pub trait ListingMatcher: Send + Sync {
    async fn find_listing(&self, query: &ListingQuery) -> AppResult<ListingMatch>;
}

#[async_trait]
pub trait ReviewHarvester: Send + Sync {
    async fn harvest(
        &self,
        listing: &ListingRef,
        max_pages: u32,
    ) -> AppResult<Vec<HarvestedReview>>;
}

/// "Springfield IL" from "12 Main St, Springfield, IL 62701, USA".
pub fn city_state_token(address: &str) -> Option<String> {
    let parts: Vec<&str> = address.split(',').map(str::trim).collect();
    parts.iter().enumerate().skip(1).find_map(|(idx, part)| {
        let state = STATE_PART.captures(part)?.get(1)?.as_str();
        let city = parts[idx - 1];
        if city.is_empty() {
            Some(state.to_string())
        } else {
            Some(format!("{city} {state}"))
        }
    })
}

pub fn normalize_name(value: &str) -> String {
    value
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Case-insensitive containment in either direction.
pub fn names_match(wanted: &str, title: &str) -> bool {
    let wanted = normalize_name(wanted);
    let title = normalize_name(title);
    if wanted.is_empty() || title.is_empty() {
        return false;
    }
    title.contains(&wanted) || wanted.contains(&title)
}
