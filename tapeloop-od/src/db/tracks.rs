//! Track records and transitions
//!
//! [`TrackStore::transition`] is the only path that changes a track's state.
//! It validates the event with [`Track::apply`], then commits the new row and
//! the side records the event implies in one transaction:
//!
//! | event | side record |
//! |---|---|
//! | `RequestApproval`, `Requeue` | open a pending approval request |
//! | `Approve`, `Reject` | resolve the pending approval request |
//! | `Abandon` | withdraw any pending approval request |
//! | `QueueForSync` | enqueue a sync manifest entry |
//! | `Synced` | mark the manifest entry done |

use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tapeloop_common::db::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};
use tapeloop_common::{Error, Result};

use super::{parse_column, parse_timestamp};
use crate::error::OrchestratorError;
use crate::models::{Resolution, Track, TrackEvent, TrackId, TrackMetadata, TrackState};
use crate::services::naming;

const TRACK_COLUMNS: &str = r#"
    track_id, title, artist, album, cover_art_url, duration_ms, track_number,
    added_at, state, approval, recording_attempts, pipeline_attempts,
    raw_capture_path, local_path, sync_state, last_error, last_attempt_at,
    created_at, updated_at
"#;

const LIST_SQL: &str = r#"
    SELECT track_id, title, artist, album, cover_art_url, duration_ms, track_number,
           added_at, state, approval, recording_attempts, pipeline_attempts,
           raw_capture_path, local_path, sync_state, last_error, last_attempt_at,
           created_at, updated_at
    FROM tracks
    WHERE (? IS NULL OR state = ?)
    ORDER BY seq
"#;

/// Per-state track counts, every state present (zero when empty)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateCounts(pub BTreeMap<&'static str, u64>);

impl StateCounts {
    pub fn get(&self, state: TrackState) -> u64 {
        self.0.get(state.as_str()).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }
}

/// Durable store for tracks, approval requests and the sync manifest
#[derive(Clone)]
pub struct TrackStore {
    pool: SqlitePool,
    max_lock_wait_ms: u64,
}

impl TrackStore {
    /// Open the database at `db_path`, creating tables as needed
    pub async fn open(db_path: &Path) -> Result<Self> {
        let pool = tapeloop_common::db::init_pool(db_path).await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        super::init_tables(&pool).await?;
        Ok(Self {
            pool,
            max_lock_wait_ms: DEFAULT_MAX_LOCK_WAIT_MS,
        })
    }

    /// Wrap a read-only pool (CLI tooling); tables are assumed to exist
    pub fn read_only(pool: SqlitePool) -> Self {
        Self {
            pool,
            max_lock_wait_ms: DEFAULT_MAX_LOCK_WAIT_MS,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub(crate) fn max_lock_wait_ms(&self) -> u64 {
        self.max_lock_wait_ms
    }

    /// Insert a `Discovered` track unless one with this id exists.
    ///
    /// Returns the stored snapshot and whether it was created by this call.
    /// Repeated discovery never touches an existing row.
    pub async fn create_if_absent(
        &self,
        track_id: &str,
        metadata: &TrackMetadata,
        added_at: DateTime<Utc>,
    ) -> Result<(Track, bool)> {
        let fresh = Track::discovered(track_id, metadata.clone(), added_at);
        let created_at = fresh.created_at.to_rfc3339();
        let added_at = fresh.added_at.to_rfc3339();
        let duration_ms = metadata.duration_ms.map(|d| d as i64);
        let track_number = metadata.track_number.map(|n| n as i64);

        let inserted = retry_on_lock("create_track", self.max_lock_wait_ms, || async {
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO tracks (
                    track_id, title, artist, album, cover_art_url, duration_ms,
                    track_number, added_at, state, approval, sync_state,
                    created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(track_id)
            .bind(&metadata.title)
            .bind(&metadata.artist)
            .bind(&metadata.album)
            .bind(&metadata.cover_art_url)
            .bind(duration_ms)
            .bind(track_number)
            .bind(&added_at)
            .bind(fresh.state.as_str())
            .bind(fresh.approval.as_str())
            .bind(fresh.sync_state.as_str())
            .bind(&created_at)
            .bind(&created_at)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await?;

        let track = self
            .get(track_id)
            .await?
            .ok_or_else(|| Error::Internal(format!("track {} vanished after insert", track_id)))?;
        Ok((track, inserted))
    }

    pub async fn get(&self, track_id: &str) -> Result<Option<Track>> {
        let sql = format!("SELECT {} FROM tracks WHERE track_id = ?", TRACK_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(track_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(track_from_row).transpose()
    }

    /// Like [`get`](Self::get) but a missing track is `Error::NotFound`
    pub async fn require(&self, track_id: &str) -> Result<Track> {
        self.get(track_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("track {}", track_id)))
    }

    /// Apply one event and commit it (with its side records) durably.
    pub async fn transition(
        &self,
        track_id: &str,
        event: TrackEvent,
    ) -> std::result::Result<Track, OrchestratorError> {
        self.transition_with_note(track_id, event, None).await
    }

    /// As [`transition`](Self::transition); `note` is stored as the resolving
    /// message when the event resolves an approval request.
    pub async fn transition_with_note(
        &self,
        track_id: &str,
        event: TrackEvent,
        note: Option<&str>,
    ) -> std::result::Result<Track, OrchestratorError> {
        let current = self.require(track_id).await?;
        let next = current.apply(&event)?;

        retry_on_lock("transition", self.max_lock_wait_ms, || {
            write_transition(&self.pool, current.state, &next, &event, note)
        })
        .await?;

        tracing::debug!(
            track_id = %track_id,
            from = %current.state,
            to = %next.state,
            event = event.name(),
            "Track transition committed"
        );
        Ok(next)
    }

    /// Lazy scan of tracks in insertion order, optionally filtered by state.
    ///
    /// Each call starts a fresh scan.
    pub fn list(&self, filter: Option<TrackState>) -> BoxStream<'_, Result<Track>> {
        let state = filter.map(|s| s.as_str());

        sqlx::query(LIST_SQL)
            .bind(state)
            .bind(state)
            .fetch(&self.pool)
            .map(|row| row.map_err(Error::from).and_then(|r| track_from_row(&r)))
            .boxed()
    }

    /// Collect [`list`](Self::list) into a vector
    pub async fn list_all(&self, filter: Option<TrackState>) -> Result<Vec<Track>> {
        let mut stream = self.list(filter);
        let mut tracks = Vec::new();
        while let Some(track) = stream.next().await {
            tracks.push(track?);
        }
        Ok(tracks)
    }

    pub async fn counts_by_state(&self) -> Result<StateCounts> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM tracks GROUP BY state")
            .fetch_all(&self.pool)
            .await?;

        let mut counts: BTreeMap<&'static str, u64> =
            TrackState::ALL.iter().map(|s| (s.as_str(), 0)).collect();
        for row in rows {
            let state: String = row.get("state");
            let state: TrackState = parse_column(&state, "state")?;
            counts.insert(state.as_str(), row.get::<i64, _>("n") as u64);
        }
        Ok(StateCounts(counts))
    }

    /// Tracks needing operator attention: failed recordings, recorded
    /// tracks whose pipeline keeps failing, and abandoned tracks.
    pub async fn stuck(&self) -> Result<Vec<Track>> {
        let sql = format!(
            r#"
            SELECT {} FROM tracks
            WHERE state IN ('recording_failed', 'abandoned')
               OR (state = 'recorded' AND pipeline_attempts > 0)
            ORDER BY seq
            "#,
            TRACK_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(track_from_row).collect()
    }
}

async fn write_transition(
    pool: &SqlitePool,
    from: TrackState,
    next: &Track,
    event: &TrackEvent,
    note: Option<&str>,
) -> Result<()> {
    let mut tx = pool.begin().await?;

    let updated = sqlx::query(
        r#"
        UPDATE tracks SET
            state = ?, approval = ?, recording_attempts = ?, pipeline_attempts = ?,
            raw_capture_path = ?, local_path = ?, sync_state = ?, last_error = ?,
            last_attempt_at = ?, updated_at = ?
        WHERE track_id = ? AND state = ?
        "#,
    )
    .bind(next.state.as_str())
    .bind(next.approval.as_str())
    .bind(next.recording_attempts as i64)
    .bind(next.pipeline_attempts as i64)
    .bind(path_column(next.raw_capture_path.as_deref()))
    .bind(path_column(next.local_path.as_deref()))
    .bind(next.sync_state.as_str())
    .bind(&next.last_error)
    .bind(next.last_attempt_at.map(|at| at.to_rfc3339()))
    .bind(next.updated_at.to_rfc3339())
    .bind(&next.id)
    .bind(from.as_str())
    .execute(&mut *tx)
    .await?;

    if updated.rows_affected() != 1 {
        return Err(Error::Internal(format!(
            "track {} changed state concurrently (expected {})",
            next.id, from
        )));
    }

    let now = next.updated_at.to_rfc3339();
    match event {
        TrackEvent::RequestApproval | TrackEvent::Requeue => {
            open_approval_request(&mut tx, &next.id, &now).await?;
        }
        TrackEvent::Approve => {
            resolve_pending_request(&mut tx, &next.id, Resolution::Approved, note, &now).await?;
        }
        TrackEvent::Reject => {
            resolve_pending_request(&mut tx, &next.id, Resolution::Rejected, note, &now).await?;
        }
        TrackEvent::Abandon { .. } => {
            resolve_pending_request(&mut tx, &next.id, Resolution::Withdrawn, note, &now).await?;
        }
        TrackEvent::QueueForSync => {
            let local_path = next.local_path.as_deref().ok_or_else(|| {
                Error::Internal(format!("track {} queued without a local file", next.id))
            })?;
            enqueue_manifest_entry(&mut tx, next, local_path, &now).await?;
        }
        TrackEvent::Synced => {
            sqlx::query(
                "UPDATE sync_manifest SET status = 'done', last_error = NULL, updated_at = ? WHERE track_id = ?",
            )
            .bind(&now)
            .bind(&next.id)
            .execute(&mut *tx)
            .await?;
        }
        _ => {}
    }

    tx.commit().await?;
    Ok(())
}

async fn open_approval_request(
    tx: &mut Transaction<'_, Sqlite>,
    track_id: &str,
    now: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO approval_requests (track_id, seq, created_at, resolution)
        SELECT ?, COALESCE(MAX(seq), 0) + 1, ?, 'pending'
        FROM approval_requests WHERE track_id = ?
        "#,
    )
    .bind(track_id)
    .bind(now)
    .bind(track_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn resolve_pending_request(
    tx: &mut Transaction<'_, Sqlite>,
    track_id: &str,
    resolution: Resolution,
    note: Option<&str>,
    now: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE approval_requests
        SET resolution = ?, resolving_message = ?, resolved_at = ?
        WHERE track_id = ? AND resolution = 'pending'
        "#,
    )
    .bind(resolution.as_str())
    .bind(note)
    .bind(now)
    .bind(track_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn enqueue_manifest_entry(
    tx: &mut Transaction<'_, Sqlite>,
    track: &Track,
    local_path: &Path,
    now: &str,
) -> Result<()> {
    let target_name = naming::target_name(&track.metadata);
    sqlx::query(
        r#"
        INSERT INTO sync_manifest (
            track_id, local_path, target_name, status, retry_count, queued_seq, updated_at
        )
        SELECT ?, ?, ?, 'not_started', 0, COALESCE(MAX(queued_seq), 0) + 1, ?
        FROM sync_manifest
        WHERE true
        ON CONFLICT(track_id) DO UPDATE SET
            local_path = excluded.local_path,
            target_name = excluded.target_name,
            status = 'not_started',
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&track.id)
    .bind(local_path.to_string_lossy().to_string())
    .bind(&target_name)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn path_column(path: Option<&Path>) -> Option<String> {
    path.map(|p| p.to_string_lossy().to_string())
}

pub(crate) fn track_from_row(row: &SqliteRow) -> Result<Track> {
    let track_id: TrackId = row.get("track_id");

    let state: String = row.get("state");
    let approval: String = row.get("approval");
    let sync_state: String = row.get("sync_state");
    let added_at: String = row.get("added_at");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    let raw_capture_path: Option<String> = row.get("raw_capture_path");
    let local_path: Option<String> = row.get("local_path");
    let last_attempt_at = match row.get::<Option<String>, _>("last_attempt_at") {
        Some(at) => Some(parse_timestamp(&at, "last_attempt_at")?),
        None => None,
    };

    Ok(Track {
        metadata: TrackMetadata {
            title: row.get("title"),
            artist: row.get("artist"),
            album: row.get("album"),
            cover_art_url: row.get("cover_art_url"),
            duration_ms: row.get::<Option<i64>, _>("duration_ms").map(|d| d as u64),
            track_number: row.get::<Option<i64>, _>("track_number").map(|n| n as u32),
        },
        added_at: parse_timestamp(&added_at, "added_at")?,
        state: parse_column(&state, "state")?,
        approval: parse_column(&approval, "approval")?,
        recording_attempts: row.get::<i64, _>("recording_attempts") as u32,
        pipeline_attempts: row.get::<i64, _>("pipeline_attempts") as u32,
        raw_capture_path: raw_capture_path.map(PathBuf::from),
        local_path: local_path.map(PathBuf::from),
        sync_state: parse_column(&sync_state, "sync_state")?,
        last_error: row.get("last_error"),
        last_attempt_at,
        created_at: parse_timestamp(&created_at, "created_at")?,
        updated_at: parse_timestamp(&updated_at, "updated_at")?,
        id: track_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{metadata, test_store};
    use crate::models::{ApprovalOutcome, CopyStatus};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_create_if_absent_is_idempotent() {
        let (store, _dir) = test_store().await;
        let meta = metadata("Song A", "Artist B");

        let (first, created) = store.create_if_absent("t1", &meta, Utc::now()).await.unwrap();
        assert!(created);
        assert_eq!(first.state, TrackState::Discovered);

        store.transition("t1", TrackEvent::RequestApproval).await.unwrap();

        // Re-discovery must not reset the advanced state
        let (again, created) = store.create_if_absent("t1", &meta, Utc::now()).await.unwrap();
        assert!(!created);
        assert_eq!(again.state, TrackState::PendingApproval);

        assert_eq!(store.list_all(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_transition_leaves_row_unchanged() {
        let (store, _dir) = test_store().await;
        store
            .create_if_absent("t1", &metadata("Song A", "Artist B"), Utc::now())
            .await
            .unwrap();

        let err = store.transition("t1", TrackEvent::Approve).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidTransition(_)));

        let track = store.require("t1").await.unwrap();
        assert_eq!(track.state, TrackState::Discovered);
    }

    #[tokio::test]
    async fn test_unknown_track_is_not_found() {
        let (store, _dir) = test_store().await;
        let err = store.transition("nope", TrackEvent::Approve).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Store(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_approval_round_trip_records_request() {
        let (store, _dir) = test_store().await;
        store
            .create_if_absent("t1", &metadata("Song A", "Artist B"), Utc::now())
            .await
            .unwrap();

        store.transition("t1", TrackEvent::RequestApproval).await.unwrap();
        let pending = store.pending_request_for("t1").await.unwrap().unwrap();
        assert_eq!(pending.seq, 1);
        assert!(pending.sent_at.is_none());

        let track = store
            .transition_with_note("t1", TrackEvent::Approve, Some("alice: yes"))
            .await
            .unwrap();
        assert_eq!(track.approval, ApprovalOutcome::Approved);
        assert!(store.pending_request_for("t1").await.unwrap().is_none());

        let history = store.requests_for("t1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].resolution, Resolution::Approved);
        assert_eq!(history[0].resolving_message.as_deref(), Some("alice: yes"));
    }

    #[tokio::test]
    async fn test_full_lifecycle_persists_paths_and_manifest() {
        let (store, _dir) = test_store().await;
        store
            .create_if_absent("t1", &metadata("Song A", "Artist B"), Utc::now())
            .await
            .unwrap();

        for event in [
            TrackEvent::RequestApproval,
            TrackEvent::Approve,
            TrackEvent::StartRecording,
            TrackEvent::RecordingSucceeded { raw_capture: PathBuf::from("/c/t1.wav") },
            TrackEvent::Tagged { local_path: PathBuf::from("/l/Artist B - Song A.mp3") },
            TrackEvent::QueueForSync,
        ] {
            store.transition("t1", event).await.unwrap();
        }

        let track = store.require("t1").await.unwrap();
        assert_eq!(track.state, TrackState::QueuedForSync);
        assert_eq!(track.local_path, Some(PathBuf::from("/l/Artist B - Song A.mp3")));
        assert!(track.raw_capture_path.is_none());
        assert_eq!(track.recording_attempts, 1);

        let queue = store.sync_queue().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].target_name, "Artist B - Song A.mp3");
        assert_eq!(queue[0].status, CopyStatus::NotStarted);

        store.transition("t1", TrackEvent::Synced).await.unwrap();
        assert!(store.sync_queue().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_abandon_withdraws_pending_request() {
        let (store, _dir) = test_store().await;
        store
            .create_if_absent("t1", &metadata("Song A", "Artist B"), Utc::now())
            .await
            .unwrap();
        store.transition("t1", TrackEvent::RequestApproval).await.unwrap();
        store
            .transition("t1", TrackEvent::Abandon { reason: "admin".into() })
            .await
            .unwrap();

        assert!(store.pending_request_for("t1").await.unwrap().is_none());
        let history = store.requests_for("t1").await.unwrap();
        assert_eq!(history[0].resolution, Resolution::Withdrawn);
    }

    #[tokio::test]
    async fn test_list_filters_in_insertion_order() {
        let (store, _dir) = test_store().await;
        for id in ["t3", "t1", "t2"] {
            store
                .create_if_absent(id, &metadata(id, "Artist"), Utc::now())
                .await
                .unwrap();
        }
        store.transition("t1", TrackEvent::RequestApproval).await.unwrap();

        let discovered: Vec<_> = store
            .list_all(Some(TrackState::Discovered))
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(discovered, vec!["t3".to_string(), "t2".to_string()]);

        // A second scan starts over
        let again = store.list_all(Some(TrackState::Discovered)).await.unwrap();
        assert_eq!(again.len(), 2);
    }

    #[tokio::test]
    async fn test_counts_cover_every_state() {
        let (store, _dir) = test_store().await;
        store
            .create_if_absent("t1", &metadata("Song A", "Artist B"), Utc::now())
            .await
            .unwrap();

        let counts = store.counts_by_state().await.unwrap();
        assert_eq!(counts.0.len(), TrackState::ALL.len());
        assert_eq!(counts.get(TrackState::Discovered), 1);
        assert_eq!(counts.get(TrackState::Synced), 0);
        assert_eq!(counts.total(), 1);
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("tapeloop.db");
        {
            let store = TrackStore::open(&db_path).await.unwrap();
            store
                .create_if_absent("t1", &metadata("Song A", "Artist B"), Utc::now())
                .await
                .unwrap();
            store.transition("t1", TrackEvent::RequestApproval).await.unwrap();
            store.pool().close().await;
        }

        let store = TrackStore::open(&db_path).await.unwrap();
        let track = store.require("t1").await.unwrap();
        assert_eq!(track.state, TrackState::PendingApproval);
        assert!(store.pending_request_for("t1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stuck_lists_failures() {
        let (store, _dir) = test_store().await;
        for id in ["ok", "bad"] {
            store
                .create_if_absent(id, &metadata(id, "Artist"), Utc::now())
                .await
                .unwrap();
        }
        store
            .transition("bad", TrackEvent::Abandon { reason: "gave up".into() })
            .await
            .unwrap();

        let stuck = store.stuck().await.unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].id, "bad");
        assert_eq!(stuck[0].last_error.as_deref(), Some("gave up"));
    }
}
