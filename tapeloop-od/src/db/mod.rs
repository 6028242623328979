//! Durable track store
//!
//! One row per track, one row per approval request and one row per sync
//! manifest entry, all keyed by track id. Every transition is committed in a
//! single SQLite transaction together with the side records it implies
//! (opening/resolving an approval request, enqueueing a manifest entry), so
//! a crash never leaves the three tables disagreeing.

pub mod approvals;
pub mod manifest;
pub mod tracks;

pub use tracks::{StateCounts, TrackStore};

use sqlx::{Row, SqlitePool};
use tapeloop_common::Result;

/// Create tables and indexes if they don't exist
pub async fn init_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tracks (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            track_id TEXT NOT NULL UNIQUE,
            title TEXT NOT NULL,
            artist TEXT NOT NULL,
            album TEXT NOT NULL DEFAULT '',
            cover_art_url TEXT,
            duration_ms INTEGER,
            track_number INTEGER,
            added_at TEXT NOT NULL,
            state TEXT NOT NULL,
            approval TEXT NOT NULL DEFAULT 'unset',
            recording_attempts INTEGER NOT NULL DEFAULT 0,
            pipeline_attempts INTEGER NOT NULL DEFAULT 0,
            raw_capture_path TEXT,
            local_path TEXT,
            sync_state TEXT NOT NULL DEFAULT 'not_applicable',
            last_error TEXT,
            last_attempt_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tracks_state ON tracks(state)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS approval_requests (
            track_id TEXT NOT NULL REFERENCES tracks(track_id),
            seq INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            sent_at TEXT,
            message_ref TEXT,
            resolution TEXT NOT NULL DEFAULT 'pending',
            resolving_message TEXT,
            resolved_at TEXT,
            PRIMARY KEY (track_id, seq)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // At most one outstanding request per track
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_approval_one_pending
        ON approval_requests(track_id) WHERE resolution = 'pending'
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_manifest (
            track_id TEXT PRIMARY KEY REFERENCES tracks(track_id),
            local_path TEXT NOT NULL,
            target_name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'not_started',
            retry_count INTEGER NOT NULL DEFAULT 0,
            queued_seq INTEGER NOT NULL,
            last_error TEXT,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Databases created before retry backoff existed
    add_missing_column(pool, "tracks", "last_attempt_at", "TEXT").await?;

    tracing::info!("Database tables initialized (tracks, approval_requests, sync_manifest)");
    Ok(())
}

/// Add a nullable column to an existing table unless it is already there
async fn add_missing_column(pool: &SqlitePool, table: &str, column: &str, sql_type: &str) -> Result<()> {
    let rows = sqlx::query(&format!("PRAGMA table_info({})", table))
        .fetch_all(pool)
        .await?;
    let present = rows.iter().any(|row| row.get::<String, _>("name") == column);
    if !present {
        sqlx::query(&format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, sql_type))
            .execute(pool)
            .await?;
        tracing::info!(table, column, "Added missing column");
    }
    Ok(())
}

/// Parse an RFC3339 column
pub(crate) fn parse_timestamp(value: &str, column: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| tapeloop_common::Error::Internal(format!("Failed to parse {}: {}", column, e)))
}

/// Parse an enum column stored via `as_str()`
pub(crate) fn parse_column<T>(value: &str, column: &str) -> Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    value
        .parse::<T>()
        .map_err(|e| tapeloop_common::Error::Internal(format!("Bad {} column: {}", column, e)))
}
