use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::db::{format_timestamp, parse_timestamp};
use crate::errors::{AppError, AppResult};
use crate::providers::PlaceDetails;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaceStatus {
    Pending,
    Mapped,
    Scraping,
    Done,
    Retry,
    Blocked,
    Error,
}

impl PlaceStatus {
    pub const ALL: [PlaceStatus; 7] = [
        PlaceStatus::Pending,
        PlaceStatus::Mapped,
        PlaceStatus::Scraping,
        PlaceStatus::Done,
        PlaceStatus::Retry,
        PlaceStatus::Blocked,
        PlaceStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PlaceStatus::Pending => "pending",
            PlaceStatus::Mapped => "mapped",
            PlaceStatus::Scraping => "scraping",
            PlaceStatus::Done => "done",
            PlaceStatus::Retry => "retry",
            PlaceStatus::Blocked => "blocked",
            PlaceStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> AppResult<Self> {
        PlaceStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == value)
            .ok_or_else(|| AppError::Parse(format!("place status {value:?}")))
    }

    /// Parked until an operator intervenes.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PlaceStatus::Blocked | PlaceStatus::Error)
    }
}

impl fmt::Display for PlaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlaceRecord {
    pub place_id: String,
    pub provider_a_name: Option<String>,
    pub provider_a_address: Option<String>,
    pub provider_a_lat: Option<f64>,
    pub provider_a_lng: Option<f64>,
    pub provider_a_website: Option<String>,
    pub resolved_listing_url: Option<String>,
    pub resolved_listing_id: Option<String>,
    pub status: PlaceStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
}

impl PlaceRecord {
    pub fn has_details(&self) -> bool {
        self.provider_a_name
            .as_deref()
            .map(|name| !name.trim().is_empty())
            .unwrap_or(false)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_run_at.map(|at| at <= now).unwrap_or(true)
    }
}

/// One harvested review. `payload` is passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewRecord {
    pub place_id: String,
    pub provider_review_id: Option<String>,
    pub payload: serde_json::Value,
}

/// Partial update: `None` leaves the column as it is.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate<'a> {
    pub error: Option<&'a str>,
    pub listing_url: Option<&'a str>,
    pub listing_id: Option<&'a str>,
}

#[derive(Clone)]
pub struct PlaceStore {
    db: Arc<Mutex<Connection>>,
}

impl PlaceStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    pub fn from_connection(connection: Connection) -> Self {
        Self::new(Arc::new(Mutex::new(connection)))
    }

    pub fn get_place(&self, place_id: &str) -> AppResult<Option<PlaceRecord>> {
        let conn = self.db.lock();
        conn.query_row(
            &format!("SELECT {PLACE_COLUMNS} FROM places WHERE place_id = ?1"),
            [place_id],
            parse_place_record,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn list_places(&self, status: Option<PlaceStatus>) -> AppResult<Vec<PlaceRecord>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PLACE_COLUMNS} FROM places
            WHERE (?1 IS NULL OR status = ?1)
            ORDER BY place_id ASC"
        ))?;
        let rows = stmt
            .query_map([status.map(|s| s.as_str())], parse_place_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Creates a bare `pending` row. Returns false when the id already exists.
    pub fn enqueue_place(&self, place_id: &str) -> AppResult<bool> {
        let conn = self.db.lock();
        let inserted = conn.execute(
            "INSERT INTO places (place_id, status) VALUES (?1, 'pending')
            ON CONFLICT(place_id) DO NOTHING",
            [place_id],
        )?;
        Ok(inserted > 0)
    }

    /// Create-or-replace for the provider-A fields only. The row is keyed on
    /// `place_id`, never on the id the provider echoes back.
    pub fn insert_place(&self, place_id: &str, details: &PlaceDetails) -> AppResult<()> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO places (
                place_id, provider_a_name, provider_a_address, provider_a_lat,
                provider_a_lng, provider_a_website, status, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7)
            ON CONFLICT(place_id) DO UPDATE SET
                provider_a_name = excluded.provider_a_name,
                provider_a_address = excluded.provider_a_address,
                provider_a_lat = excluded.provider_a_lat,
                provider_a_lng = excluded.provider_a_lng,
                provider_a_website = excluded.provider_a_website,
                updated_at = excluded.updated_at",
            params![
                place_id,
                details.name,
                details.formatted_address,
                details.lat,
                details.lng,
                details.website,
                format_timestamp(Utc::now()),
            ],
        )?;
        trace!(place_id, "provider-A details stored");
        Ok(())
    }

    pub fn update_place_status(
        &self,
        place_id: &str,
        status: PlaceStatus,
        update: StatusUpdate<'_>,
    ) -> AppResult<()> {
        let conn = self.db.lock();
        let changed = conn.execute(
            "UPDATE places SET
                status = ?2,
                last_error = COALESCE(?3, last_error),
                resolved_listing_url = COALESCE(?4, resolved_listing_url),
                resolved_listing_id = COALESCE(?5, resolved_listing_id),
                updated_at = ?6
            WHERE place_id = ?1",
            params![
                place_id,
                status.as_str(),
                update.error,
                update.listing_url,
                update.listing_id,
                format_timestamp(Utc::now()),
            ],
        )?;
        ensure_changed(changed, place_id)
    }

    pub fn update_next_run_at(
        &self,
        place_id: &str,
        next_run_at: Option<DateTime<Utc>>,
    ) -> AppResult<()> {
        let conn = self.db.lock();
        let changed = conn.execute(
            "UPDATE places SET next_run_at = ?2, updated_at = ?3 WHERE place_id = ?1",
            params![
                place_id,
                next_run_at.map(format_timestamp),
                format_timestamp(Utc::now()),
            ],
        )?;
        ensure_changed(changed, place_id)
    }

    /// Status, error, attempt counter and next run time move together in
    /// one statement. Returns the attempt count after the increment.
    pub fn record_failure(
        &self,
        place_id: &str,
        status: PlaceStatus,
        error: &str,
        next_run_at: DateTime<Utc>,
    ) -> AppResult<u32> {
        let conn = self.db.lock();
        conn.query_row(
            "UPDATE places SET
                status = ?2,
                last_error = ?3,
                attempts = attempts + 1,
                next_run_at = ?4,
                updated_at = ?5
            WHERE place_id = ?1
            RETURNING attempts",
            params![
                place_id,
                status.as_str(),
                error,
                format_timestamp(next_run_at),
                format_timestamp(Utc::now()),
            ],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| AppError::NotFound(place_id.to_string()))
    }

    pub fn mark_done(&self, place_id: &str, at: DateTime<Utc>) -> AppResult<()> {
        let conn = self.db.lock();
        let stamp = format_timestamp(at);
        let changed = conn.execute(
            "UPDATE places SET
                status = 'done',
                last_success_at = ?2,
                next_run_at = NULL,
                updated_at = ?2
            WHERE place_id = ?1",
            params![place_id, stamp],
        )?;
        ensure_changed(changed, place_id)
    }

    pub fn get_review_count(&self, place_id: &str) -> AppResult<i64> {
        let conn = self.db.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM reviews WHERE place_id = ?1",
            [place_id],
            |row| row.get(0),
        )
        .map_err(AppError::from)
    }

    pub fn has_review(&self, place_id: &str, provider_review_id: &str) -> AppResult<bool> {
        let conn = self.db.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM reviews WHERE place_id = ?1 AND provider_review_id = ?2 LIMIT 1",
                [place_id, provider_review_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn existing_review_ids(&self, place_id: &str) -> AppResult<HashSet<String>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT provider_review_id FROM reviews
            WHERE place_id = ?1 AND provider_review_id IS NOT NULL",
        )?;
        let ids = stmt
            .query_map([place_id], |row| row.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(ids)
    }

    /// Append-only batch write in a single transaction. Rows whose id is
    /// already stored for the place are ignored; returns rows written.
    pub fn insert_reviews(&self, reviews: &[ReviewRecord]) -> AppResult<usize> {
        if reviews.is_empty() {
            return Ok(0);
        }
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let mut written = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO reviews (place_id, provider_review_id, payload, harvested_at)
                VALUES (?1, ?2, ?3, ?4)",
            )?;
            let stamp = format_timestamp(Utc::now());
            for review in reviews {
                written += stmt.execute(params![
                    review.place_id,
                    review.provider_review_id,
                    serde_json::to_string(&review.payload)?,
                    stamp,
                ])?;
            }
        }
        tx.commit()?;
        Ok(written)
    }

    pub fn list_reviews(&self, place_id: &str) -> AppResult<Vec<ReviewRecord>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT place_id, provider_review_id, payload FROM reviews
            WHERE place_id = ?1 ORDER BY id ASC",
        )?;
        let raw = stmt
            .query_map([place_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter()
            .map(|(place_id, provider_review_id, payload)| {
                Ok(ReviewRecord {
                    place_id,
                    provider_review_id,
                    payload: serde_json::from_str(&payload)?,
                })
            })
            .collect()
    }

    pub fn status_counts(&self) -> AppResult<Vec<(PlaceStatus, i64)>> {
        let conn = self.db.lock();
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM places GROUP BY status ORDER BY status")?;
        let raw = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter()
            .map(|(status, count)| Ok((PlaceStatus::parse(&status)?, count)))
            .collect()
    }
}

const PLACE_COLUMNS: &str = "place_id, provider_a_name, provider_a_address, provider_a_lat,
    provider_a_lng, provider_a_website, resolved_listing_url, resolved_listing_id, status,
    attempts, last_error, last_success_at, next_run_at";

fn parse_place_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<PlaceRecord> {
    let status: String = row.get(8)?;
    let status = PlaceStatus::parse(&status).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, err.to_string().into())
    })?;
    let last_success_at: Option<String> = row.get(11)?;
    let next_run_at: Option<String> = row.get(12)?;
    Ok(PlaceRecord {
        place_id: row.get(0)?,
        provider_a_name: row.get(1)?,
        provider_a_address: row.get(2)?,
        provider_a_lat: row.get(3)?,
        provider_a_lng: row.get(4)?,
        provider_a_website: row.get(5)?,
        resolved_listing_url: row.get(6)?,
        resolved_listing_id: row.get(7)?,
        status,
        attempts: row.get(9)?,
        last_error: row.get(10)?,
        last_success_at: last_success_at.as_deref().and_then(parse_timestamp),
        next_run_at: next_run_at.as_deref().and_then(parse_timestamp),
    })
}

fn ensure_changed(changed: usize, place_id: &str) -> AppResult<()> {
    if changed == 0 {
        return Err(AppError::NotFound(place_id.to_string()));
    }
    Ok(())
}
