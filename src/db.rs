use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags};
use tracing::info;

use crate::errors::{AppError, AppResult};

pub struct DatabaseContext {
    pub connection: Connection,
    pub path: PathBuf,
}

pub fn bootstrap<P: AsRef<Path>>(db_path: P) -> AppResult<DatabaseContext> {
    let db_path = db_path.as_ref();
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
    let connection = Connection::open_with_flags(db_path, flags)?;
    configure(&connection)?;
    run_migrations(&connection)?;
    info!(
        target: "database_bootstrap",
        path = %db_path.display(),
        "SQLite store ready"
    );
    Ok(DatabaseContext {
        connection,
        path: db_path.to_path_buf(),
    })
}

/// Fresh schema in a private in-memory database.
pub fn in_memory() -> AppResult<Connection> {
    let connection = Connection::open_in_memory()?;
    configure(&connection)?;
    run_migrations(&connection)?;
    Ok(connection)
}

fn configure(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = FULL;
        PRAGMA foreign_keys = ON;
        "#,
    )?;
    Ok(())
}

fn run_migrations(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS places (
            place_id TEXT PRIMARY KEY,
            provider_a_name TEXT,
            provider_a_address TEXT,
            provider_a_lat REAL,
            provider_a_lng REAL,
            resolved_listing_url TEXT,
            resolved_listing_id TEXT,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending','mapped','scraping','done','retry','blocked','error')),
            attempts INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
            last_error TEXT,
            last_success_at TEXT,
            next_run_at TEXT,
            created_at TEXT NOT NULL DEFAULT (STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now')),
            updated_at TEXT NOT NULL DEFAULT (STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS reviews (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            place_id TEXT NOT NULL,
            provider_review_id TEXT,
            payload TEXT NOT NULL,
            harvested_at TEXT NOT NULL DEFAULT (STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now')),
            FOREIGN KEY (place_id) REFERENCES places(place_id)
        );

        CREATE INDEX IF NOT EXISTS idx_places_status ON places(status);
        CREATE INDEX IF NOT EXISTS idx_reviews_place ON reviews(place_id);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_reviews_place_provider_id
            ON reviews(place_id, provider_review_id)
            WHERE provider_review_id IS NOT NULL;
        "#,
    )?;

    ensure_column(connection, "places", "provider_a_website TEXT")?;
    Ok(())
}

fn ensure_column(connection: &Connection, table: &str, definition: &str) -> AppResult<()> {
    let column_name = definition
        .split_whitespace()
        .next()
        .ok_or_else(|| AppError::Config(format!("invalid column definition: {definition}")))?;
    if column_exists(connection, table, column_name)? {
        return Ok(());
    }
    let sql = format!("ALTER TABLE {table} ADD COLUMN {definition}");
    connection.execute(&sql, [])?;
    Ok(())
}

fn column_exists(connection: &Connection, table: &str, column: &str) -> AppResult<bool> {
    let pragma = format!("PRAGMA table_info({table})");
    let mut stmt = connection.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn runs_migrations_and_creates_tables() {
        let dir = tempdir().unwrap();
        let ctx = bootstrap(dir.path().join("nested").join("test.db")).unwrap();

        let mut stmt = ctx
            .connection
            .prepare(
                "SELECT name FROM sqlite_master WHERE type='table' AND name IN ('places','reviews')",
            )
            .unwrap();
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .unwrap()
            .count();
        assert_eq!(rows, 2);
        assert!(ctx.path.ends_with("test.db"));
        assert!(column_exists(&ctx.connection, "places", "provider_a_website").unwrap());
    }

    #[test]
    fn migrations_are_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("again.db");
        drop(bootstrap(&path).unwrap());
        let ctx = bootstrap(&path).unwrap();
        assert!(column_exists(&ctx.connection, "reviews", "provider_review_id").unwrap());
    }

    #[test]
    fn rejects_unknown_status() {
        let conn = in_memory().unwrap();
        let result = conn.execute(
            "INSERT INTO places (place_id, status) VALUES ('x', 'exploded')",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn timestamps_round_trip_through_text() {
        let now = Utc::now();
        let parsed = parse_timestamp(&format_timestamp(now)).unwrap();
        assert_eq!(parsed.timestamp_millis(), now.timestamp_millis());
    }
}
