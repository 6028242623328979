//! Approval request records
//!
//! At most one request per track is unresolved at any time. A resolved
//! request is kept for audit; a fresh one is opened only by a requeue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::track::TrackId;

/// How an approval request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Pending,
    Approved,
    Rejected,
    /// Closed without a decision (track abandoned while waiting)
    Withdrawn,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Pending => "pending",
            Resolution::Approved => "approved",
            Resolution::Rejected => "rejected",
            Resolution::Withdrawn => "withdrawn",
        }
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Resolution::Pending),
            "approved" => Ok(Resolution::Approved),
            "rejected" => Ok(Resolution::Rejected),
            "withdrawn" => Ok(Resolution::Withdrawn),
            other => Err(format!("unknown resolution '{}'", other)),
        }
    }
}

/// Outstanding (or historical) human-confirmation gate for one track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub track_id: TrackId,
    /// Per-track request sequence number, starting at 1
    pub seq: i64,
    pub created_at: DateTime<Utc>,
    /// Set once the notification was handed to the messenger.
    /// Requests with a `sent_at` are never re-sent.
    pub sent_at: Option<DateTime<Utc>>,
    /// Transport reference of the notification, used to match threaded replies
    pub message_ref: Option<String>,
    pub resolution: Resolution,
    /// "sender: text" of the reply that resolved the request
    pub resolving_message: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    pub fn is_pending(&self) -> bool {
        self.resolution == Resolution::Pending
    }
}
