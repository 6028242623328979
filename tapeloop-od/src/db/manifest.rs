//! Sync manifest persistence
//!
//! Entries are created by the `QueueForSync` transition and completed by
//! `Synced`. Copy progress in between is written here by the dispatcher on
//! behalf of the sync worker.

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::path::PathBuf;
use tapeloop_common::db::retry_on_lock;
use tapeloop_common::Result;

use super::{parse_column, TrackStore};
use crate::models::{CopyStatus, SyncManifestEntry};

impl TrackStore {
    /// Entries still to be copied, in queue order
    pub async fn sync_queue(&self) -> Result<Vec<SyncManifestEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT m.track_id, m.local_path, m.target_name, m.status, m.retry_count,
                   m.queued_seq, m.last_error
            FROM sync_manifest m
            JOIN tracks t ON t.track_id = m.track_id
            WHERE m.status != 'done' AND t.state = 'queued_for_sync'
            ORDER BY m.queued_seq
            "#,
        )
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    pub async fn manifest_entry(&self, track_id: &str) -> Result<Option<SyncManifestEntry>> {
        let row = sqlx::query(
            r#"
            SELECT track_id, local_path, target_name, status, retry_count, queued_seq, last_error
            FROM sync_manifest WHERE track_id = ?
            "#,
        )
        .bind(track_id)
        .fetch_optional(self.pool())
        .await?;

        row.as_ref().map(entry_from_row).transpose()
    }

    /// Record copy progress for one entry.
    ///
    /// `Failed` also increments the retry count.
    pub async fn set_copy_status(
        &self,
        track_id: &str,
        status: CopyStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let bump = i64::from(status == CopyStatus::Failed);

        retry_on_lock("set_copy_status", self.max_lock_wait_ms(), || async {
            sqlx::query(
                r#"
                UPDATE sync_manifest
                SET status = ?, last_error = ?, retry_count = retry_count + ?, updated_at = ?
                WHERE track_id = ?
                "#,
            )
            .bind(status.as_str())
            .bind(error)
            .bind(bump)
            .bind(&now)
            .bind(track_id)
            .execute(self.pool())
            .await?;
            Ok(())
        })
        .await
    }

    /// Reset every `in_progress` entry to `not_started`; returns how many
    pub async fn reset_in_progress(&self) -> Result<u64> {
        let now = Utc::now().to_rfc3339();

        retry_on_lock("reset_in_progress", self.max_lock_wait_ms(), || async {
            let result = sqlx::query(
                "UPDATE sync_manifest SET status = 'not_started', updated_at = ? WHERE status = 'in_progress'",
            )
            .bind(&now)
            .execute(self.pool())
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }
}

fn entry_from_row(row: &SqliteRow) -> Result<SyncManifestEntry> {
    let status: String = row.get("status");
    let local_path: String = row.get("local_path");

    Ok(SyncManifestEntry {
        track_id: row.get("track_id"),
        local_path: PathBuf::from(local_path),
        target_name: row.get("target_name"),
        status: parse_column(&status, "status")?,
        retry_count: row.get::<i64, _>("retry_count") as u32,
        queued_seq: row.get("queued_seq"),
        last_error: row.get("last_error"),
    })
}
