use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::json;
use tracing::{debug, info, warn};
use url::Url;

use super::{
    names_match, HarvestedReview, ListingMatch, ListingMatcher, ListingQuery, ListingRef,
    MatchFallback, PageFetcher, ReviewHarvester, MAX_SEARCH_CANDIDATES,
};
use crate::errors::{AppError, AppResult};
use crate::pacing::Pacer;

const REVIEWS_PER_PAGE: u32 = 10;
const LISTING_MARKER: &str = "/Restaurant_Review-";

static ANCHORS: Lazy<Selector> = Lazy::new(|| selector("a[href]"));
static HEADING: Lazy<Selector> = Lazy::new(|| selector("h1"));
static TITLE: Lazy<Selector> = Lazy::new(|| selector("title"));
static REVIEW_CARD: Lazy<Selector> = Lazy::new(|| selector("[data-reviewid]"));
static REVIEW_AUTHOR: Lazy<Selector> =
    Lazy::new(|| selector(".info_text div, .memberOverlayLink, [class*='username']"));
static REVIEW_RATING: Lazy<Selector> = Lazy::new(|| selector("[class*='bubble_']"));
static REVIEW_TITLE: Lazy<Selector> = Lazy::new(|| selector(".noQuotes, .title"));
static REVIEW_TEXT: Lazy<Selector> = Lazy::new(|| selector("p.partial_entry, q, .entry p"));
static REVIEW_DATE: Lazy<Selector> = Lazy::new(|| selector(".ratingDate"));
static NEXT_PAGE: Lazy<Selector> =
    Lazy::new(|| selector("a.nav.next, a.next, a[aria-label='Next page']"));
static LOCATION_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-d(\d+)(?:-|\.html|$)").expect("location pattern compiles"));
static RATING_CLASS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"bubble_(\d{1,2})\b").expect("rating pattern compiles"));

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("static selector parses")
}

/// Listing search, confirmation and review harvest for a
/// TripAdvisor-style review site.
pub struct TripAdvisorClient {
    fetcher: PageFetcher,
    base: Url,
    pacer: Pacer,
    fallback: MatchFallback,
    search_retries: u32,
    verify_retries: u32,
    page_retries: u32,
}

impl TripAdvisorClient {
    pub fn new(fetcher: PageFetcher, base: &str, pacer: Pacer) -> AppResult<Self> {
        let base = Url::parse(base)
            .map_err(|err| AppError::Config(format!("invalid listing site base {base}: {err}")))?;
        Ok(Self {
            fetcher,
            base,
            pacer,
            fallback: MatchFallback::default(),
            search_retries: 2,
            verify_retries: 1,
            page_retries: 1,
        })
    }

    pub fn with_fallback(mut self, fallback: MatchFallback) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn with_retries(mut self, search: u32, verify: u32, page: u32) -> Self {
        self.search_retries = search;
        self.verify_retries = verify;
        self.page_retries = page;
        self
    }

    fn search_url(&self, text: &str) -> AppResult<Url> {
        let mut url = self
            .base
            .join("Search")
            .map_err(|err| AppError::Config(format!("invalid search url: {err}")))?;
        url.query_pairs_mut().append_pair("q", text);
        Ok(url)
    }
}

#[async_trait]
impl ListingMatcher for TripAdvisorClient {
    async fn find_listing(&self, query: &ListingQuery) -> AppResult<ListingMatch> {
        let text = query.search_text();
        let search_url = self.search_url(&text)?;

        self.pacer.pause().await;
        let html = self
            .fetcher
            .fetch(search_url.as_str(), self.search_retries)
            .await?;
        let candidates = extract_candidates(&html, &self.base);
        debug!(query = %text, candidates = candidates.len(), "listing search finished");

        let Some(first) = candidates.first().cloned() else {
            return Ok(ListingMatch::none());
        };

        for candidate in &candidates {
            self.pacer.pause().await;
            let page = match self.fetcher.fetch(candidate, self.verify_retries).await {
                Ok(page) => page,
                Err(err @ AppError::Blocked { .. }) => return Err(err),
                Err(err) => {
                    warn!(url = %candidate, error = %err, "candidate page unavailable; skipping");
                    continue;
                }
            };
            let title = extract_title(&page).unwrap_or_default();
            if names_match(&query.name, &title) {
                info!(name = %query.name, url = %candidate, "listing confirmed by page title");
                return Ok(listing_from_url(candidate, true));
            }
        }

        match self.fallback {
            MatchFallback::FirstCandidate => {
                warn!(
                    name = %query.name,
                    url = %first,
                    "no candidate confirmed; using first search result"
                );
                Ok(listing_from_url(&first, false))
            }
            MatchFallback::Strict => Ok(ListingMatch::none()),
        }
    }
}

#[async_trait]
impl ReviewHarvester for TripAdvisorClient {
    async fn harvest(
        &self,
        listing: &ListingRef,
        max_pages: u32,
    ) -> AppResult<Vec<HarvestedReview>> {
        let mut harvested = Vec::new();
        for page in 0..max_pages {
            let Some(url) = page_url(&listing.url, page) else {
                break;
            };
            if page > 0 {
                self.pacer.pause().await;
            }
            let html = self.fetcher.fetch(&url, self.page_retries).await?;
            let (reviews, has_next) = parse_review_page(&html);
            debug!(url = %url, page, reviews = reviews.len(), "review page parsed");
            if reviews.is_empty() {
                break;
            }
            harvested.extend(reviews);
            if !has_next {
                break;
            }
        }
        Ok(harvested)
    }
}

/// Up to five distinct listing links from a search result page, in page order.
pub(crate) fn extract_candidates(html: &str, base: &Url) -> Vec<String> {
    let document = Html::parse_document(html);
    let mut candidates: Vec<String> = Vec::new();
    for element in document.select(&ANCHORS) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        if !href.contains(LISTING_MARKER) {
            continue;
        }
        let Ok(mut resolved) = base.join(href.trim()) else {
            continue;
        };
        resolved.set_query(None);
        resolved.set_fragment(None);
        let resolved = resolved.to_string();
        if !candidates.contains(&resolved) {
            candidates.push(resolved);
        }
        if candidates.len() == MAX_SEARCH_CANDIDATES {
            break;
        }
    }
    candidates
}

pub(crate) fn extract_title(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    document
        .select(&HEADING)
        .chain(document.select(&TITLE))
        .map(element_text)
        .find(|text| !text.is_empty())
}

pub(crate) fn location_id(url: &str) -> Option<String> {
    let path = Url::parse(url)
        .map(|parsed| parsed.path().to_string())
        .unwrap_or_else(|_| url.to_string());
    LOCATION_ID
        .captures(&path)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn listing_from_url(url: &str, confirmed: bool) -> ListingMatch {
    ListingMatch {
        url: Some(url.to_string()),
        location_id: location_id(url),
        confirmed,
    }
}

/// `...-Reviews-Name.html` becomes `...-Reviews-or10-Name.html` for page 1.
pub(crate) fn page_url(listing_url: &str, page: u32) -> Option<String> {
    if page == 0 {
        return Some(listing_url.to_string());
    }
    let offset = page * REVIEWS_PER_PAGE;
    listing_url
        .find("-Reviews")
        .map(|idx| {
            let split = idx + "-Reviews".len();
            format!("{}-or{}{}", &listing_url[..split], offset, &listing_url[split..])
        })
}

fn parse_review_page(html: &str) -> (Vec<HarvestedReview>, bool) {
    let document = Html::parse_document(html);
    let reviews = document.select(&REVIEW_CARD).filter_map(parse_review).collect();
    let has_next = document.select(&NEXT_PAGE).any(|link| {
        !link
            .value()
            .attr("class")
            .map(|class| class.contains("disabled"))
            .unwrap_or(false)
    });
    (reviews, has_next)
}

fn parse_review(card: ElementRef<'_>) -> Option<HarvestedReview> {
    let provider_review_id = card
        .value()
        .attr("data-reviewid")
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string);
    let text = first_text(card, &REVIEW_TEXT);
    let title = first_text(card, &REVIEW_TITLE);
    if text.is_none() && title.is_none() {
        return None;
    }
    let rating = card.select(&REVIEW_RATING).find_map(|el| {
        let class = el.value().attr("class")?;
        let raw: f64 = RATING_CLASS.captures(class)?.get(1)?.as_str().parse().ok()?;
        Some(raw / 10.0)
    });
    let date = card.select(&REVIEW_DATE).next().and_then(|el| {
        el.value()
            .attr("title")
            .map(str::to_string)
            .or_else(|| Some(element_text(el)).filter(|t| !t.is_empty()))
    });

    Some(HarvestedReview {
        provider_review_id,
        payload: json!({
            "author": first_text(card, &REVIEW_AUTHOR),
            "rating": rating,
            "title": title,
            "text": text,
            "date": date,
        }),
    })
}

fn first_text(scope: ElementRef<'_>, selector: &Selector) -> Option<String> {
    scope
        .select(selector)
        .map(element_text)
        .find(|text| !text.is_empty())
}

fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
