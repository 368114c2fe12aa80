use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use super::{DetailsProvider, PlaceDetails};
use crate::errors::{AppError, AppResult};

const PROVIDER: &str = "google-places";
const FIELD_MASK: &str = "id,displayName,formattedAddress,location,websiteUri";

/// Exact lookup against the Places Details endpoint.
pub struct GooglePlacesClient {
    http: reqwest::Client,
    api_base: String,
    api_key: SecretString,
}

impl GooglePlacesClient {
    pub fn new(api_base: &str, api_key: SecretString, timeout: Duration) -> AppResult<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Response {
    id: Option<String>,
    display_name: Option<ResponseText>,
    formatted_address: Option<String>,
    location: Option<ResponseLocation>,
    website_uri: Option<String>,
}

#[derive(Deserialize)]
struct ResponseText {
    text: Option<String>,
}

#[derive(Deserialize)]
struct ResponseLocation {
    latitude: Option<f64>,
    longitude: Option<f64>,
}

#[async_trait]
impl DetailsProvider for GooglePlacesClient {
    async fn fetch_details(&self, place_id: &str) -> AppResult<Option<PlaceDetails>> {
        let url = format!("{}/places/{}", self.api_base, place_id);
        let response = self
            .http
            .get(&url)
            .header("X-Goog-Api-Key", self.api_key.expose_secret())
            .header("X-Goog-FieldMask", FIELD_MASK)
            .send()
            .await
            .map_err(|err| AppError::provider(PROVIDER, format!("request failed: {err}")))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!(place_id, "details provider does not know place");
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            let message = format!("HTTP {}: {}", status.as_u16(), snippet.trim());
            return Err(match status {
                StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => {
                    AppError::blocked(PROVIDER, message)
                }
                _ => AppError::provider(PROVIDER, message),
            });
        }

        let parsed: Response = response
            .json()
            .await
            .map_err(|err| AppError::provider(PROVIDER, format!("malformed payload: {err}")))?;

        let name = parsed
            .display_name
            .and_then(|text| text.text)
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or_else(|| AppError::provider(PROVIDER, "malformed payload: missing displayName"))?;
        let location = parsed
            .location
            .ok_or_else(|| AppError::provider(PROVIDER, "malformed payload: missing location"))?;
        let (Some(lat), Some(lng)) = (location.latitude, location.longitude) else {
            return Err(AppError::provider(
                PROVIDER,
                "malformed payload: incomplete location",
            ));
        };

        Ok(Some(PlaceDetails {
            place_id: parsed.id.unwrap_or_else(|| place_id.to_string()),
            name,
            formatted_address: parsed.formatted_address,
            lat,
            lng,
            website: parsed.website_uri,
        }))
    }
}

#[cfg(test)]
mod tests {
    use httptest::matchers::{all_of, contains, request};
    use httptest::responders::{json_encoded, status_code};
    use httptest::{Expectation, Server};
    use serde_json::json;

    use super::*;

    fn client(server: &Server) -> GooglePlacesClient {
        GooglePlacesClient::new(
            &server.url("/v1").to_string(),
            SecretString::from("test-key".to_string()),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn parses_details_payload() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/v1/places/ChIJ123"),
                request::headers(contains(("x-goog-api-key", "test-key"))),
            ])
            .respond_with(json_encoded(json!({
                "id": "ChIJ123",
                "displayName": { "text": "Golden Dragon Buffet", "languageCode": "en" },
                "formattedAddress": "12 Main St, Springfield, IL 62701, USA",
                "location": { "latitude": 39.78, "longitude": -89.65 },
                "websiteUri": "https://goldendragon.example"
            }))),
        );

        let details = client(&server)
            .fetch_details("ChIJ123")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(details.name, "Golden Dragon Buffet");
        assert_eq!(details.lat, 39.78);
        assert_eq!(details.website.as_deref(), Some("https://goldendragon.example"));
    }

    #[tokio::test]
    async fn not_found_is_authoritative_none() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/v1/places/missing"))
                .respond_with(status_code(404)),
        );
        assert!(client(&server)
            .fetch_details("missing")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn server_error_and_bad_payload_are_provider_errors() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/v1/places/flaky"))
                .respond_with(status_code(503).body("backend unavailable")),
        );
        server.expect(
            Expectation::matching(request::method_path("GET", "/v1/places/odd"))
                .respond_with(json_encoded(json!({ "id": "odd" }))),
        );

        let client = client(&server);
        let err = client.fetch_details("flaky").await.unwrap_err();
        assert!(matches!(err, AppError::Provider { .. }));
        assert!(err.to_string().contains("503"));

        let err = client.fetch_details("odd").await.unwrap_err();
        assert!(err.to_string().contains("malformed payload"));
    }

    #[tokio::test]
    async fn denied_and_throttled_requests_are_blocked() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/v1/places/denied")).respond_with(
                status_code(403).body(r#"{"error":{"status":"PERMISSION_DENIED"}}"#),
            ),
        );
        server.expect(
            Expectation::matching(request::method_path("GET", "/v1/places/throttled"))
                .respond_with(status_code(429).body("RESOURCE_EXHAUSTED")),
        );

        let client = client(&server);
        let err = client.fetch_details("denied").await.unwrap_err();
        assert!(matches!(err, AppError::Blocked { .. }), "{err:?}");
        assert!(err.to_string().contains("403"));
        assert_eq!(err.failure_kind(), crate::errors::FailureKind::Blocked);

        let err = client.fetch_details("throttled").await.unwrap_err();
        assert!(matches!(err, AppError::Blocked { .. }), "{err:?}");
        assert!(err.to_string().contains("429"));
    }
}
