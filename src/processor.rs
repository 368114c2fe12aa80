//! Drives one place through details → mapping → harvest.
//!
//! Every stage commits its write before the next one starts. A failure in any
//! stage is persisted (status, error, attempts, next run) before it is handed
//! back to the caller.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::errors::{AppError, AppResult, FailureKind};
use crate::pacing::{backoff, Pacer};
use crate::providers::{
    DetailsProvider, ListingMatcher, ListingQuery, ListingRef, ReviewHarvester,
};
use crate::reviews::store_new_reviews;
use crate::store::{PlaceRecord, PlaceStatus, PlaceStore, StatusUpdate};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Details,
    Mapping,
    Harvest,
}

#[derive(Debug, Clone, Copy)]
pub struct ProcessorSettings {
    pub max_review_pages: u32,
    /// Failure count (after increment) at which a place parks in `error`.
    pub max_attempts: u32,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            max_review_pages: 5,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessReport {
    pub place_id: String,
    pub stages: Vec<Stage>,
    pub listing_url: Option<String>,
    pub listing_confirmed: Option<bool>,
    pub reviews_harvested: usize,
    pub reviews_inserted: usize,
    pub status: PlaceStatus,
}

#[derive(Clone)]
pub struct PlaceProcessor {
    store: PlaceStore,
    details: Arc<dyn DetailsProvider>,
    matcher: Arc<dyn ListingMatcher>,
    harvester: Arc<dyn ReviewHarvester>,
    pacer: Pacer,
    settings: ProcessorSettings,
}

impl PlaceProcessor {
    pub fn new(
        store: PlaceStore,
        details: Arc<dyn DetailsProvider>,
        matcher: Arc<dyn ListingMatcher>,
        harvester: Arc<dyn ReviewHarvester>,
        pacer: Pacer,
    ) -> Self {
        Self {
            store,
            details,
            matcher,
            harvester,
            pacer,
            settings: ProcessorSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: ProcessorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn store(&self) -> &PlaceStore {
        &self.store
    }

    pub fn details_provider(&self) -> Arc<dyn DetailsProvider> {
        self.details.clone()
    }

    /// Runs whichever stages the stored record still needs. An unknown id
    /// fails with `NotFound` and leaves the store untouched.
    pub async fn process_place(&self, place_id: &str) -> AppResult<ProcessReport> {
        let record = self
            .store
            .get_place(place_id)?
            .ok_or_else(|| AppError::NotFound(place_id.to_string()))?;
        let attempts_before = record.attempts;

        match self.run_stages(record).await {
            Ok(report) => Ok(report),
            Err(err) => {
                self.persist_failure(place_id, attempts_before, &err);
                Err(err)
            }
        }
    }

    async fn run_stages(&self, mut record: PlaceRecord) -> AppResult<ProcessReport> {
        let place_id = record.place_id.clone();
        let mut report = ProcessReport {
            place_id: place_id.clone(),
            stages: Vec::new(),
            listing_url: record.resolved_listing_url.clone(),
            listing_confirmed: None,
            reviews_harvested: 0,
            reviews_inserted: 0,
            status: record.status,
        };

        if !record.has_details() {
            report.stages.push(Stage::Details);
            debug!(target: "place_processor", place_id = %place_id, stage = "details", "fetching details");
            let fetched = self.details.fetch_details(&place_id).await;
            self.pacer.pause().await;
            let details = fetched?.ok_or_else(|| AppError::PlaceUnavailable(place_id.clone()))?;
            if details.place_id != place_id {
                warn!(
                    target: "place_processor",
                    place_id = %place_id,
                    provider_id = %details.place_id,
                    "details provider answered with a different id"
                );
            }
            self.store.insert_place(&place_id, &details)?;
            record = self.reload(&place_id)?;
            if !record.has_details() {
                return Err(AppError::Processing(format!(
                    "details for {place_id} were not stored"
                )));
            }
        }

        if record.status == PlaceStatus::Pending || record.resolved_listing_url.is_none() {
            report.stages.push(Stage::Mapping);
            let query = ListingQuery {
                name: record.provider_a_name.clone().unwrap_or_default(),
                address: record.provider_a_address.clone(),
                lat: record.provider_a_lat,
                lng: record.provider_a_lng,
            };
            debug!(
                target: "place_processor",
                place_id = %place_id,
                stage = "mapping",
                query = %query.search_text(),
                "resolving listing"
            );
            let found = self.matcher.find_listing(&query).await?;
            let Some(url) = found.url.as_deref() else {
                let not_found = AppError::ListingNotFound;
                self.store.update_place_status(
                    &place_id,
                    PlaceStatus::Error,
                    StatusUpdate {
                        error: Some(&not_found.to_string()),
                        ..Default::default()
                    },
                )?;
                return Err(not_found);
            };
            self.store.update_place_status(
                &place_id,
                PlaceStatus::Mapped,
                StatusUpdate {
                    listing_url: Some(url),
                    listing_id: found.location_id.as_deref(),
                    ..Default::default()
                },
            )?;
            if !found.confirmed {
                warn!(
                    target: "place_processor",
                    place_id = %place_id,
                    url,
                    "listing mapped from unconfirmed first search result"
                );
            }
            report.listing_url = Some(url.to_string());
            report.listing_confirmed = Some(found.confirmed);
            record = self.reload(&place_id)?;
        }

        let harvest_url = record
            .resolved_listing_url
            .clone()
            .filter(|_| record.status != PlaceStatus::Done);
        if let Some(url) = harvest_url {
            report.stages.push(Stage::Harvest);
            self.store
                .update_place_status(&place_id, PlaceStatus::Scraping, StatusUpdate::default())?;
            let listing = ListingRef {
                url,
                location_id: record.resolved_listing_id.clone(),
            };
            let harvested = self
                .harvester
                .harvest(&listing, self.settings.max_review_pages)
                .await?;
            let outcome = store_new_reviews(&self.store, &place_id, harvested)?;
            report.reviews_harvested = outcome.harvested;
            report.reviews_inserted = outcome.inserted;
        }

        if report.stages.is_empty() {
            debug!(target: "place_processor", place_id = %place_id, "nothing left to do");
            return Ok(report);
        }

        self.store.mark_done(&place_id, Utc::now())?;
        report.status = PlaceStatus::Done;
        info!(
            target: "place_processor",
            place_id = %place_id,
            stages = ?report.stages,
            reviews_inserted = report.reviews_inserted,
            "place enriched"
        );
        Ok(report)
    }

    fn reload(&self, place_id: &str) -> AppResult<PlaceRecord> {
        self.store
            .get_place(place_id)?
            .ok_or_else(|| AppError::NotFound(place_id.to_string()))
    }

    fn persist_failure(&self, place_id: &str, attempts_before: u32, err: &AppError) {
        let status = self.failure_status(attempts_before, err);
        let next_run_at = Utc::now() + backoff_interval(attempts_before);
        match self
            .store
            .record_failure(place_id, status, &err.to_string(), next_run_at)
        {
            Ok(attempts) => warn!(
                target: "place_processor",
                place_id,
                status = %status,
                attempts,
                error = %err,
                "place processing failed"
            ),
            Err(store_err) => warn!(
                target: "place_processor",
                place_id,
                error = %err,
                store_error = %store_err,
                "unable to persist processing failure"
            ),
        }
    }

    fn failure_status(&self, attempts_before: u32, err: &AppError) -> PlaceStatus {
        match err.failure_kind() {
            FailureKind::Blocked => PlaceStatus::Blocked,
            FailureKind::Terminal => PlaceStatus::Error,
            FailureKind::Transient if attempts_before + 1 >= self.settings.max_attempts => {
                PlaceStatus::Error
            }
            FailureKind::Transient => PlaceStatus::Retry,
        }
    }
}

fn backoff_interval(attempts: u32) -> ChronoDuration {
    ChronoDuration::from_std(backoff(attempts)).unwrap_or_else(|_| ChronoDuration::days(1))
}
