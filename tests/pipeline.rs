use std::fs;
use std::path::Path;

use httptest::matchers::request;
use httptest::responders::{json_encoded, status_code};
use httptest::{Expectation, Server};
use secrecy::SecretString;
use serde_json::json;
use tempfile::tempdir;

use place_enricher::providers::MatchFallback;
use place_enricher::{
    seed_places, status_summary, AppConfig, AppError, BatchOptions, PlaceOutcome, PlaceStatus,
    Pipeline, SecretVault, SkipReason,
};

const LISTING_PATH: &str = "/Restaurant_Review-g1-d200-Reviews-Golden_Dragon_Buffet-Springfield.html";

const LISTING_PAGE: &str = r#"
<html>
  <head><title>GOLDEN DRAGON BUFFET, Springfield - Tripadvisor</title></head>
  <body>
    <h1>Golden Dragon Buffet</h1>
    <div data-reviewid="r1">
      <span class="ui_bubble_rating bubble_50"></span>
      <span class="noQuotes">Best crab legs in town</span>
      <p class="partial_entry">Huge selection and always fresh.</p>
    </div>
    <div data-reviewid="r2">
      <span class="ui_bubble_rating bubble_30"></span>
      <p class="partial_entry">Fine for a quick lunch.</p>
    </div>
    <div data-reviewid="r1">
      <p class="partial_entry">Huge selection and always fresh.</p>
    </div>
  </body>
</html>
"#;

fn config(dir: &Path, places: &Server, listings: &Server) -> AppConfig {
    AppConfig {
        database_path: dir.join("enricher.db"),
        data_dir: dir.to_path_buf(),
        google_places_api_key: Some(SecretString::from("test-key".to_string())),
        places_api_base: places.url("/v1").to_string(),
        listing_site_base: listings.url("/").to_string(),
        lookup_timeout_secs: 5,
        page_timeout_secs: 5,
        search_retries: 0,
        verify_retries: 0,
        page_retries: 0,
        pacing_min_ms: 0,
        pacing_max_ms: 0,
        batch_concurrency: 2,
        max_review_pages: 3,
        match_fallback: MatchFallback::FirstCandidate,
        journal_enabled: true,
        journal_batch_size: 10,
        journal_max_bytes: 1024 * 1024,
        journal_max_files: 2,
    }
}

fn expect_details(server: &Server, place_id: &str, path: &'static str) {
    server.expect(
        Expectation::matching(request::method_path("GET", path))
            .respond_with(json_encoded(json!({
                "id": place_id,
                "displayName": { "text": "Golden Dragon Buffet" },
                "formattedAddress": "12 Main St, Springfield, IL 62701, USA",
                "location": { "latitude": 39.78, "longitude": -89.65 }
            }))),
    );
}

#[tokio::test]
async fn worklist_run_enriches_unknown_place_and_skips_it_afterwards() {
    let dir = tempdir().unwrap();
    let places = Server::run();
    let listings = Server::run();
    expect_details(&places, "ChIJ1", "/v1/places/ChIJ1");
    listings.expect(
        Expectation::matching(request::method_path("GET", "/Search")).respond_with(
            status_code(200).body(format!(
                r#"<html><body><a href="{LISTING_PATH}?from=search">Golden Dragon</a></body></html>"#
            )),
        ),
    );
    // Fetched once to confirm the title and once as the first review page.
    listings.expect(
        Expectation::matching(request::method_path("GET", LISTING_PATH))
            .times(2)
            .respond_with(status_code(200).body(LISTING_PAGE)),
    );

    let worklist = dir.path().join("ids.txt");
    fs::write(&worklist, "ChIJ1\n\nChIJ1\n").unwrap();

    let pipeline = Pipeline::initialize(
        config(dir.path(), &places, &listings),
        &SecretVault::in_memory(),
    )
    .unwrap();
    let options = BatchOptions {
        concurrency: 2,
        limit: None,
        register_unknown: true,
    };

    let report = pipeline.run_worklist(&worklist, options).await.unwrap();
    assert_eq!(report.completed, 1, "{report:?}");
    let PlaceOutcome::Completed(done) = &report.outcomes[0] else {
        panic!("expected completion, got {:?}", report.outcomes[0]);
    };
    assert_eq!(done.reviews_harvested, 3);
    assert_eq!(done.reviews_inserted, 2);
    assert_eq!(done.listing_confirmed, Some(true));

    let record = pipeline.store().get_place("ChIJ1").unwrap().unwrap();
    assert_eq!(record.status, PlaceStatus::Done);
    assert_eq!(record.resolved_listing_id.as_deref(), Some("200"));
    assert!(record.resolved_listing_url.unwrap().ends_with(LISTING_PATH));
    let reviews = pipeline.store().list_reviews("ChIJ1").unwrap();
    assert_eq!(reviews.len(), 2);
    assert_eq!(reviews[0].payload["rating"], 5.0);

    let again = pipeline.run_worklist(&worklist, options).await.unwrap();
    assert_eq!(again.completed, 0);
    assert!(matches!(
        &again.outcomes[0],
        PlaceOutcome::Skipped { reason: SkipReason::AlreadyDone, .. }
    ));

    let journal = fs::read_to_string(dir.path().join("run-journal.jsonl")).unwrap();
    assert!(journal.contains("place_completed"));
    assert!(journal.contains("place_skipped"));
}

#[tokio::test]
async fn unknown_id_fails_without_touching_the_store() {
    let dir = tempdir().unwrap();
    let places = Server::run();
    let listings = Server::run();
    let pipeline = Pipeline::initialize(
        config(dir.path(), &places, &listings),
        &SecretVault::in_memory(),
    )
    .unwrap();

    let err = pipeline.process_place("ChIJ123").await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
    assert_eq!(status_summary(pipeline.store()).unwrap().total, 0);
}

#[tokio::test]
async fn anti_bot_response_parks_place_as_blocked() {
    let dir = tempdir().unwrap();
    let places = Server::run();
    let listings = Server::run();
    expect_details(&places, "ChIJ9", "/v1/places/ChIJ9");
    listings.expect(
        Expectation::matching(request::method_path("GET", "/Search"))
            .times(1)
            .respond_with(status_code(403)),
    );

    let pipeline = Pipeline::initialize(
        config(dir.path(), &places, &listings),
        &SecretVault::in_memory(),
    )
    .unwrap();
    seed_places(pipeline.store(), &["ChIJ9".to_string()]).unwrap();

    let err = pipeline.process_place("ChIJ9").await.unwrap_err();
    assert!(matches!(err, AppError::Blocked { .. }));
    let record = pipeline.store().get_place("ChIJ9").unwrap().unwrap();
    assert_eq!(record.status, PlaceStatus::Blocked);
    assert_eq!(record.attempts, 1);
    assert_eq!(record.provider_a_name.as_deref(), Some("Golden Dragon Buffet"));
    assert!(record.last_error.unwrap().contains("403"));

    let report = pipeline
        .driver()
        .run(&["ChIJ9".to_string()], BatchOptions::default())
        .await;
    assert_eq!(report.skipped, 1);
    let summary = status_summary(pipeline.store()).unwrap();
    assert_eq!(summary.by_status["blocked"], 1);
    assert_eq!(summary.by_status["done"], 0);
}

#[test]
fn missing_api_key_is_a_config_error() {
    let dir = tempdir().unwrap();
    let places = Server::run();
    let listings = Server::run();
    let mut config = config(dir.path(), &places, &listings);
    config.google_places_api_key = None;

    let err = Pipeline::initialize(config, &SecretVault::in_memory())
        .err()
        .unwrap();
    assert!(matches!(err, AppError::Config(_)));
}
