use std::path::PathBuf;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::{debug, info};

use crate::providers::MatchFallback;

const DEFAULT_JOURNAL_MAX_BYTES: u64 = 5 * 1024 * 1024;
const DEFAULT_JOURNAL_MAX_FILES: usize = 5;
const DEFAULT_PLACES_API_BASE: &str = "https://places.googleapis.com/v1";
const DEFAULT_LISTING_SITE_BASE: &str = "https://www.tripadvisor.com";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_path: PathBuf,
    pub data_dir: PathBuf,
    pub google_places_api_key: Option<SecretString>,
    pub places_api_base: String,
    pub listing_site_base: String,
    pub lookup_timeout_secs: u64,
    pub page_timeout_secs: u64,
    pub search_retries: u32,
    pub verify_retries: u32,
    pub page_retries: u32,
    pub pacing_min_ms: u64,
    pub pacing_max_ms: u64,
    pub batch_concurrency: usize,
    pub max_review_pages: u32,
    pub match_fallback: MatchFallback,
    pub journal_enabled: bool,
    pub journal_batch_size: usize,
    pub journal_max_bytes: u64,
    pub journal_max_files: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub database_path: String,
    pub data_dir: String,
    pub places_api_base: String,
    pub listing_site_base: String,
    pub lookup_timeout_secs: u64,
    pub page_timeout_secs: u64,
    pub search_retries: u32,
    pub verify_retries: u32,
    pub page_retries: u32,
    pub pacing_min_ms: u64,
    pub pacing_max_ms: u64,
    pub batch_concurrency: usize,
    pub max_review_pages: u32,
    pub match_fallback: &'static str,
    pub journal_enabled: bool,
    pub has_google_places_key: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let pacing_min_ms = parse_u64("PACING_MIN_MS", 2_000);
        Self {
            database_path: PathBuf::from(
                env::var("ENRICHER_DATABASE_PATH")
                    .unwrap_or_else(|_| "place-enricher.db".to_string()),
            ),
            data_dir: PathBuf::from(env::var("ENRICHER_DATA_DIR").unwrap_or_else(|_| ".".into())),
            google_places_api_key: env::var("GOOGLE_PLACES_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            places_api_base: env::var("GOOGLE_PLACES_API_BASE")
                .unwrap_or_else(|_| DEFAULT_PLACES_API_BASE.to_string()),
            listing_site_base: env::var("LISTING_SITE_BASE")
                .unwrap_or_else(|_| DEFAULT_LISTING_SITE_BASE.to_string()),
            lookup_timeout_secs: parse_u64("LOOKUP_TIMEOUT_SECS", 30),
            page_timeout_secs: parse_u64("PAGE_TIMEOUT_SECS", 15),
            search_retries: parse_u32("SEARCH_RETRIES", 2),
            verify_retries: parse_u32("VERIFY_RETRIES", 1),
            page_retries: parse_u32("PAGE_RETRIES", 1),
            pacing_min_ms,
            pacing_max_ms: parse_u64("PACING_MAX_MS", 4_000).max(pacing_min_ms),
            batch_concurrency: parse_usize("BATCH_CONCURRENCY", 2).max(1),
            max_review_pages: parse_u32("MAX_REVIEW_PAGES", 5).max(1),
            match_fallback: env::var("MATCH_FALLBACK")
                .ok()
                .and_then(|v| MatchFallback::parse(&v))
                .unwrap_or_default(),
            journal_enabled: parse_bool("JOURNAL_ENABLED", true),
            journal_batch_size: parse_usize("JOURNAL_BATCH_SIZE", 25).max(1),
            journal_max_bytes: parse_u64("JOURNAL_MAX_BYTES", DEFAULT_JOURNAL_MAX_BYTES),
            journal_max_files: parse_usize("JOURNAL_MAX_FILES", DEFAULT_JOURNAL_MAX_FILES).max(1),
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            database_path: self.database_path.to_string_lossy().to_string(),
            data_dir: self.data_dir.to_string_lossy().to_string(),
            places_api_base: self.places_api_base.clone(),
            listing_site_base: self.listing_site_base.clone(),
            lookup_timeout_secs: self.lookup_timeout_secs,
            page_timeout_secs: self.page_timeout_secs,
            search_retries: self.search_retries,
            verify_retries: self.verify_retries,
            page_retries: self.page_retries,
            pacing_min_ms: self.pacing_min_ms,
            pacing_max_ms: self.pacing_max_ms,
            batch_concurrency: self.batch_concurrency,
            max_review_pages: self.max_review_pages,
            match_fallback: self.match_fallback.as_str(),
            journal_enabled: self.journal_enabled,
            has_google_places_key: self.google_places_api_key.is_some(),
        }
    }

    pub fn log_redacted(&self) {
        let profile = self.public_profile();
        info!(
            database = %profile.database_path,
            places_api_base = %profile.places_api_base,
            listing_site_base = %profile.listing_site_base,
            concurrency = profile.batch_concurrency,
            max_review_pages = profile.max_review_pages,
            match_fallback = profile.match_fallback,
            has_google_places_key = profile.has_google_places_key,
            "configuration loaded"
        );
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}
