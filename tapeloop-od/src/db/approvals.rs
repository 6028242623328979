//! Approval request queries
//!
//! Requests are opened and resolved only through track transitions
//! (see [`TrackStore::transition`]); this module reads them and records
//! delivery of the outbound notification.

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tapeloop_common::db::retry_on_lock;
use tapeloop_common::Result;

use super::{parse_column, parse_timestamp, TrackStore};
use crate::models::ApprovalRequest;

const REQUEST_COLUMNS: &str =
    "track_id, seq, created_at, sent_at, message_ref, resolution, resolving_message, resolved_at";

impl TrackStore {
    /// The outstanding request for a track, if any
    pub async fn pending_request_for(&self, track_id: &str) -> Result<Option<ApprovalRequest>> {
        let sql = format!(
            "SELECT {} FROM approval_requests WHERE track_id = ? AND resolution = 'pending'",
            REQUEST_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(track_id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(request_from_row).transpose()
    }

    /// All requests ever opened for a track, oldest first
    pub async fn requests_for(&self, track_id: &str) -> Result<Vec<ApprovalRequest>> {
        let sql = format!(
            "SELECT {} FROM approval_requests WHERE track_id = ? ORDER BY seq",
            REQUEST_COLUMNS
        );
        let rows = sqlx::query(&sql).bind(track_id).fetch_all(self.pool()).await?;
        rows.iter().map(request_from_row).collect()
    }

    /// Outstanding requests, oldest first
    pub async fn pending_requests(&self) -> Result<Vec<ApprovalRequest>> {
        let sql = format!(
            "SELECT {} FROM approval_requests WHERE resolution = 'pending' ORDER BY created_at, rowid",
            REQUEST_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(self.pool()).await?;
        rows.iter().map(request_from_row).collect()
    }

    /// Outstanding requests whose notification was never handed to the messenger
    pub async fn unsent_requests(&self) -> Result<Vec<ApprovalRequest>> {
        let sql = format!(
            "SELECT {} FROM approval_requests WHERE resolution = 'pending' AND sent_at IS NULL ORDER BY created_at, rowid",
            REQUEST_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(self.pool()).await?;
        rows.iter().map(request_from_row).collect()
    }

    /// The request (resolved or not) whose notification carried `message_ref`
    pub async fn request_by_ref(&self, message_ref: &str) -> Result<Option<ApprovalRequest>> {
        let sql = format!(
            "SELECT {} FROM approval_requests WHERE message_ref = ? ORDER BY seq DESC LIMIT 1",
            REQUEST_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(message_ref)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(request_from_row).transpose()
    }

    /// Record that the notification for a request was sent
    pub async fn mark_request_sent(
        &self,
        track_id: &str,
        seq: i64,
        message_ref: Option<&str>,
    ) -> Result<()> {
        let sent_at = Utc::now().to_rfc3339();
        retry_on_lock("mark_request_sent", self.max_lock_wait_ms(), || async {
            sqlx::query(
                "UPDATE approval_requests SET sent_at = ?, message_ref = ? WHERE track_id = ? AND seq = ?",
            )
            .bind(&sent_at)
            .bind(message_ref)
            .bind(track_id)
            .bind(seq)
            .execute(self.pool())
            .await?;
            Ok(())
        })
        .await
    }
}

fn request_from_row(row: &SqliteRow) -> Result<ApprovalRequest> {
    let created_at: String = row.get("created_at");
    let sent_at: Option<String> = row.get("sent_at");
    let resolved_at: Option<String> = row.get("resolved_at");
    let resolution: String = row.get("resolution");

    Ok(ApprovalRequest {
        track_id: row.get("track_id"),
        seq: row.get("seq"),
        created_at: parse_timestamp(&created_at, "created_at")?,
        sent_at: sent_at
            .map(|s| parse_timestamp(&s, "sent_at"))
            .transpose()?,
        message_ref: row.get("message_ref"),
        resolution: parse_column(&resolution, "resolution")?,
        resolving_message: row.get("resolving_message"),
        resolved_at: resolved_at
            .map(|s| parse_timestamp(&s, "resolved_at"))
            .transpose()?,
    })
}
