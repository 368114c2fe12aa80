use std::collections::HashSet;

use tracing::debug;

use crate::errors::AppResult;
use crate::providers::HarvestedReview;
use crate::store::{PlaceStore, ReviewRecord};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupOutcome {
    pub harvested: usize,
    pub inserted: usize,
    pub skipped: usize,
}

/// Keeps reviews whose provider id is neither stored nor repeated earlier in
/// the batch. Reviews without an id are always kept.
pub fn select_new_reviews(
    place_id: &str,
    harvested: Vec<HarvestedReview>,
    existing_ids: &HashSet<String>,
) -> Vec<ReviewRecord> {
    let mut seen: HashSet<String> = HashSet::new();
    harvested
        .into_iter()
        .filter(|review| match review.provider_review_id.as_deref() {
            Some(id) => !existing_ids.contains(id) && seen.insert(id.to_string()),
            None => true,
        })
        .map(|review| ReviewRecord {
            place_id: place_id.to_string(),
            provider_review_id: review.provider_review_id,
            payload: review.payload,
        })
        .collect()
}

/// One id lookup for the place, one batch write for the survivors.
pub fn store_new_reviews(
    store: &PlaceStore,
    place_id: &str,
    harvested: Vec<HarvestedReview>,
) -> AppResult<DedupOutcome> {
    let total = harvested.len();
    let existing = if harvested.iter().any(|r| r.provider_review_id.is_some()) {
        store.existing_review_ids(place_id)?
    } else {
        HashSet::new()
    };
    let fresh = select_new_reviews(place_id, harvested, &existing);
    let inserted = store.insert_reviews(&fresh)?;
    debug!(
        place_id,
        harvested = total,
        inserted,
        known = existing.len(),
        "reviews deduplicated"
    );
    Ok(DedupOutcome {
        harvested: total,
        inserted,
        skipped: total - inserted,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::db;

    fn review(id: Option<&str>, text: &str) -> HarvestedReview {
        HarvestedReview {
            provider_review_id: id.map(str::to_string),
            payload: json!({ "text": text }),
        }
    }

    #[test]
    fn drops_known_and_repeated_ids_but_keeps_anonymous() {
        let existing = HashSet::from(["old".to_string()]);
        let kept = select_new_reviews(
            "p1",
            vec![
                review(Some("r1"), "a"),
                review(Some("old"), "b"),
                review(None, "c"),
                review(Some("r1"), "d"),
                review(None, "c"),
            ],
            &existing,
        );
        let ids: Vec<_> = kept.iter().map(|r| r.provider_review_id.clone()).collect();
        assert_eq!(ids, vec![Some("r1".to_string()), None, None]);
        assert_eq!(kept[0].payload["text"], "a");
        assert!(kept.iter().all(|r| r.place_id == "p1"));
    }

    #[test]
    fn repeated_harvest_persists_nothing_new() {
        let store = PlaceStore::from_connection(db::in_memory().unwrap());
        store.enqueue_place("p1").unwrap();
        let batch = || {
            vec![
                review(Some("r1"), "first"),
                review(Some("r2"), "second"),
                review(Some("r1"), "first again"),
            ]
        };

        let first = store_new_reviews(&store, "p1", batch()).unwrap();
        assert_eq!(first.inserted, 2);
        assert_eq!(first.skipped, 1);

        let second = store_new_reviews(&store, "p1", batch()).unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(store.get_review_count("p1").unwrap(), 2);
    }
}
