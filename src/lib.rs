pub mod batch;
pub mod config;
pub mod db;
pub mod errors;
pub mod journal;
pub mod pacing;
pub mod processor;
pub mod providers;
pub mod reviews;
pub mod secrets;
pub mod store;
pub mod worklist;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::db::{bootstrap, DatabaseContext};
use crate::journal::JournalSettings;
use crate::providers::{GooglePlacesClient, PageFetcher, TripAdvisorClient};
use crate::secrets::PLACES_KEY_ALIAS;

pub use crate::batch::{BatchDriver, BatchOptions, BatchReport, PlaceOutcome, SkipReason};
pub use crate::config::AppConfig;
pub use crate::errors::{AppError, AppResult, FailureKind};
pub use crate::journal::RunJournal;
pub use crate::pacing::{backoff, Pacer};
pub use crate::processor::{PlaceProcessor, ProcessReport, ProcessorSettings, Stage};
pub use crate::secrets::SecretVault;
pub use crate::store::{PlaceRecord, PlaceStatus, PlaceStore, ReviewRecord, StatusUpdate};

pub const VAULT_SERVICE_NAME: &str = "PlaceEnricher";
const LISTING_PROVIDER: &str = "tripadvisor";

/// Everything a run needs, built once at startup and passed down.
pub struct Pipeline {
    config: AppConfig,
    db_path: PathBuf,
    store: PlaceStore,
    driver: BatchDriver,
}

impl Pipeline {
    pub fn initialize(config: AppConfig, vault: &SecretVault) -> AppResult<Self> {
        let api_key = vault
            .resolve(PLACES_KEY_ALIAS, config.google_places_api_key.clone())?
            .ok_or_else(|| {
                AppError::Config(
                    "Google Places API key missing; set GOOGLE_PLACES_API_KEY or run `place-enricher store-key`"
                        .into(),
                )
            })?;

        let DatabaseContext { connection, path } = bootstrap(&config.database_path)?;
        let store = PlaceStore::new(Arc::new(Mutex::new(connection)));

        let details = GooglePlacesClient::new(
            &config.places_api_base,
            api_key,
            Duration::from_secs(config.lookup_timeout_secs),
        )?;
        let pacer = Pacer::new(config.pacing_min_ms, config.pacing_max_ms);
        let fetcher = PageFetcher::new(
            LISTING_PROVIDER,
            Duration::from_secs(config.page_timeout_secs),
        )?
        .with_referer(config.listing_site_base.clone());
        let listings = Arc::new(
            TripAdvisorClient::new(fetcher, &config.listing_site_base, pacer.clone())?
                .with_fallback(config.match_fallback)
                .with_retries(
                    config.search_retries,
                    config.verify_retries,
                    config.page_retries,
                ),
        );

        let processor = PlaceProcessor::new(
            store.clone(),
            Arc::new(details),
            listings.clone(),
            listings,
            pacer.clone(),
        )
        .with_settings(ProcessorSettings {
            max_review_pages: config.max_review_pages,
            ..Default::default()
        });

        let journal = if config.journal_enabled {
            RunJournal::new(&config.data_dir, JournalSettings::from_config(&config))?
        } else {
            RunJournal::disabled()
        };
        let driver = BatchDriver::new(processor, journal, pacer);

        info!(path = %path.display(), "pipeline ready");
        Ok(Self {
            config,
            db_path: path,
            store,
            driver,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn store(&self) -> &PlaceStore {
        &self.store
    }

    pub fn driver(&self) -> &BatchDriver {
        &self.driver
    }

    pub async fn process_place(&self, place_id: &str) -> AppResult<ProcessReport> {
        self.driver.processor().process_place(place_id).await
    }

    pub async fn run_worklist<P: AsRef<Path>>(
        &self,
        path: P,
        options: BatchOptions,
    ) -> AppResult<BatchReport> {
        let ids = worklist::load_worklist(path)?;
        Ok(self.driver.run(&ids, options).await)
    }
}

/// Store access for commands that never talk to a provider.
pub fn open_store(config: &AppConfig) -> AppResult<PlaceStore> {
    let DatabaseContext { connection, .. } = bootstrap(&config.database_path)?;
    Ok(PlaceStore::new(Arc::new(Mutex::new(connection))))
}

/// Enqueues bare `pending` rows; returns how many were new.
pub fn seed_places(store: &PlaceStore, ids: &[String]) -> AppResult<usize> {
    let mut created = 0;
    for id in ids {
        if store.enqueue_place(id)? {
            created += 1;
        }
    }
    info!(requested = ids.len(), created, "worklist seeded");
    Ok(created)
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSummary {
    pub total: i64,
    pub by_status: BTreeMap<&'static str, i64>,
}

pub fn status_summary(store: &PlaceStore) -> AppResult<StatusSummary> {
    let mut by_status: BTreeMap<&'static str, i64> = PlaceStatus::ALL
        .iter()
        .map(|status| (status.as_str(), 0))
        .collect();
    let mut total = 0;
    for (status, count) in store.status_counts()? {
        by_status.insert(status.as_str(), count);
        total += count;
    }
    Ok(StatusSummary { total, by_status })
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,place_enricher=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}
