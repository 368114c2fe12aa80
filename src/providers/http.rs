use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, REFERER, USER_AGENT};
use reqwest::StatusCode;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};

const BASE_RETRY_MS: u64 = 500;

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
];

const BLOCK_MARKERS: &[&str] = &[
    "px-captcha",
    "please verify you are a human",
    "access denied",
    "are you a robot",
];

/// HTML page client for the review site. Rotates browser identities and
/// tags anti-bot responses as `Blocked` where they are detected.
#[derive(Clone)]
pub struct PageFetcher {
    http: reqwest::Client,
    provider: String,
    referer: Option<String>,
    rng: Arc<Mutex<StdRng>>,
}

impl PageFetcher {
    pub fn new(provider: impl Into<String>, timeout: Duration) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            provider: provider.into(),
            referer: None,
            rng: Arc::new(Mutex::new(StdRng::from_entropy())),
        })
    }

    pub fn with_referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = Some(referer.into());
        self
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// GET with up to `retries` extra attempts on transient failures.
    /// Blocked and 404 responses are returned immediately.
    pub async fn fetch(&self, url: &str, retries: u32) -> AppResult<String> {
        let mut attempt = 0;
        loop {
            match self.fetch_once(url).await {
                Ok(body) => return Ok(body),
                Err(err @ AppError::Blocked { .. }) => return Err(err),
                Err(err) if attempt < retries && is_retryable(&err) => {
                    attempt += 1;
                    let delay = self.retry_delay(attempt);
                    warn!(
                        provider = %self.provider,
                        url,
                        attempt,
                        error = %err,
                        "page fetch failed; retrying after {:?}",
                        delay
                    );
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn fetch_once(&self, url: &str) -> AppResult<String> {
        let agent = {
            let mut rng = self.rng.lock();
            USER_AGENTS.choose(&mut *rng).copied().unwrap_or(USER_AGENTS[0])
        };
        let mut request = self
            .http
            .get(url)
            .header(USER_AGENT, agent)
            .header(
                ACCEPT,
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
            )
            .header(ACCEPT_LANGUAGE, "en-US,en;q=0.9");
        if let Some(referer) = &self.referer {
            request = request.header(REFERER, referer);
        }

        let response = request
            .send()
            .await
            .map_err(|err| AppError::provider(&self.provider, format!("request failed: {err}")))?;
        let status = response.status();
        if matches!(
            status,
            StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS
        ) {
            return Err(AppError::blocked(
                &self.provider,
                format!("HTTP {} for {url}", status.as_u16()),
            ));
        }
        if !status.is_success() {
            return Err(AppError::provider(
                &self.provider,
                format!("HTTP {} for {url}", status.as_u16()),
            ));
        }

        let body = response
            .text()
            .await
            .map_err(|err| AppError::provider(&self.provider, format!("unreadable body: {err}")))?;
        if let Some(marker) = block_marker(&body) {
            return Err(AppError::blocked(
                &self.provider,
                format!("challenge page ({marker}) at {url}"),
            ));
        }
        debug!(provider = %self.provider, url, bytes = body.len(), "page fetched");
        Ok(body)
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(4);
        let jitter = self.rng.lock().gen_range(0..BASE_RETRY_MS);
        Duration::from_millis(BASE_RETRY_MS * (1 << exponent) + jitter)
    }
}

fn is_retryable(err: &AppError) -> bool {
    match err {
        AppError::Provider { message, .. } => !message.starts_with("HTTP 404"),
        _ => false,
    }
}

fn block_marker(body: &str) -> Option<&'static str> {
    let lowered = body.to_lowercase();
    BLOCK_MARKERS
        .iter()
        .copied()
        .find(|marker| lowered.contains(marker))
}
