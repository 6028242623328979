//! Sync manifest entries: one per track queued for the player

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

use super::track::TrackId;

/// Copy progress of one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyStatus {
    NotStarted,
    /// Never persisted past a detach or a restart
    InProgress,
    Done,
    /// Retried on the next attach cycle, indefinitely
    Failed,
}

impl CopyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CopyStatus::NotStarted => "not_started",
            CopyStatus::InProgress => "in_progress",
            CopyStatus::Done => "done",
            CopyStatus::Failed => "failed",
        }
    }
}

impl FromStr for CopyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(CopyStatus::NotStarted),
            "in_progress" => Ok(CopyStatus::InProgress),
            "done" => Ok(CopyStatus::Done),
            "failed" => Ok(CopyStatus::Failed),
            other => Err(format!("unknown copy status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncManifestEntry {
    pub track_id: TrackId,
    pub local_path: PathBuf,
    /// File name on the device ("Artist - Title.mp3")
    pub target_name: String,
    pub status: CopyStatus,
    pub retry_count: u32,
    /// Insertion order of the queue; copies happen in this order
    pub queued_seq: i64,
    pub last_error: Option<String>,
}
