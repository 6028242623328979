//! Track lifecycle state machine
//!
//! ```text
//! Discovered → PendingApproval → {Approved, Rejected*}
//! Approved → Recording → {Recorded, RecordingFailed}
//! RecordingFailed → Recording            (automatic retry, bounded)
//! RecordingFailed → PendingApproval      (administrative requeue)
//! Recorded → Tagged → QueuedForSync → Synced*
//! any non-terminal → Abandoned*
//! ```
//!
//! [`Track::apply`] is pure: it validates one event against the current
//! snapshot and returns the next snapshot. Persisting it is the store's job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Stable external track identifier (the streaming service's id)
pub type TrackId = String;

/// Lifecycle state of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackState {
    /// Known, approval not yet requested
    Discovered,
    /// Approval request outstanding
    PendingApproval,
    /// User said yes, waiting for the recording slot
    Approved,
    /// User said no
    Rejected,
    /// Holding the recording slot (or crashed while holding it)
    Recording,
    /// Raw capture available, not yet encoded and tagged
    Recorded,
    /// Last recording attempt failed, retry pending
    RecordingFailed,
    /// Tagged MP3 present in the local library
    Tagged,
    /// Waiting for a removable device
    QueuedForSync,
    /// Copied to the player
    Synced,
    /// Retries exhausted or administratively stopped
    Abandoned,
}

impl TrackState {
    pub const ALL: [TrackState; 11] = [
        TrackState::Discovered,
        TrackState::PendingApproval,
        TrackState::Approved,
        TrackState::Rejected,
        TrackState::Recording,
        TrackState::Recorded,
        TrackState::RecordingFailed,
        TrackState::Tagged,
        TrackState::QueuedForSync,
        TrackState::Synced,
        TrackState::Abandoned,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TrackState::Discovered => "discovered",
            TrackState::PendingApproval => "pending_approval",
            TrackState::Approved => "approved",
            TrackState::Rejected => "rejected",
            TrackState::Recording => "recording",
            TrackState::Recorded => "recorded",
            TrackState::RecordingFailed => "recording_failed",
            TrackState::Tagged => "tagged",
            TrackState::QueuedForSync => "queued_for_sync",
            TrackState::Synced => "synced",
            TrackState::Abandoned => "abandoned",
        }
    }

    /// Terminal states never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TrackState::Rejected | TrackState::Synced | TrackState::Abandoned
        )
    }
}

impl fmt::Display for TrackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrackState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TrackState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown track state '{}'", s))
    }
}

/// Human decision recorded on the track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalOutcome {
    Unset,
    Approved,
    Rejected,
}

impl ApprovalOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalOutcome::Unset => "unset",
            ApprovalOutcome::Approved => "approved",
            ApprovalOutcome::Rejected => "rejected",
        }
    }
}

impl FromStr for ApprovalOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unset" => Ok(ApprovalOutcome::Unset),
            "approved" => Ok(ApprovalOutcome::Approved),
            "rejected" => Ok(ApprovalOutcome::Rejected),
            other => Err(format!("unknown approval outcome '{}'", other)),
        }
    }
}

/// Whether the track's file still has to reach the player
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    NotApplicable,
    Pending,
    Synced,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::NotApplicable => "not_applicable",
            SyncState::Pending => "pending",
            SyncState::Synced => "synced",
        }
    }
}

impl FromStr for SyncState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_applicable" => Ok(SyncState::NotApplicable),
            "pending" => Ok(SyncState::Pending),
            "synced" => Ok(SyncState::Synced),
            other => Err(format!("unknown sync state '{}'", other)),
        }
    }
}

/// Descriptive metadata delivered by discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackMetadata {
    pub title: String,
    pub artist: String,
    #[serde(default)]
    pub album: String,
    /// Cover art URL
    #[serde(default)]
    pub cover_art_url: Option<String>,
    /// Advertised duration; advisory only, bounds the recording safety timeout
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub track_number: Option<u32>,
}

/// Snapshot of one track's durable record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: TrackId,
    pub metadata: TrackMetadata,
    /// When the user liked the track
    pub added_at: DateTime<Utc>,
    pub state: TrackState,
    pub approval: ApprovalOutcome,
    /// Recording sessions started for this track (including the current one)
    pub recording_attempts: u32,
    /// Failed encode/tag attempts against the current raw capture
    pub pipeline_attempts: u32,
    /// Raw capture awaiting encode/tag
    pub raw_capture_path: Option<PathBuf>,
    /// Tagged MP3 in the local library
    pub local_path: Option<PathBuf>,
    pub sync_state: SyncState,
    pub last_error: Option<String>,
    /// When the latest recording or encode/tag attempt failed
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One event class applied to a single track
#[derive(Debug, Clone, PartialEq)]
pub enum TrackEvent {
    RequestApproval,
    Approve,
    Reject,
    StartRecording,
    RecordingSucceeded { raw_capture: PathBuf },
    RecordingFailed { reason: String },
    /// Encode or tag failed; the track stays `Recorded` with the capture kept
    PipelineFailed { reason: String },
    Tagged { local_path: PathBuf },
    QueueForSync,
    Synced,
    /// Administrative: send a failed track back for a fresh approval
    Requeue,
    /// Administrative or retry exhaustion
    Abandon { reason: String },
}

impl TrackEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TrackEvent::RequestApproval => "request_approval",
            TrackEvent::Approve => "approve",
            TrackEvent::Reject => "reject",
            TrackEvent::StartRecording => "start_recording",
            TrackEvent::RecordingSucceeded { .. } => "recording_succeeded",
            TrackEvent::RecordingFailed { .. } => "recording_failed",
            TrackEvent::PipelineFailed { .. } => "pipeline_failed",
            TrackEvent::Tagged { .. } => "tagged",
            TrackEvent::QueueForSync => "queue_for_sync",
            TrackEvent::Synced => "synced",
            TrackEvent::Requeue => "requeue",
            TrackEvent::Abandon { .. } => "abandon",
        }
    }
}

/// An event that is not legal in the track's current state
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition for track {track_id}: '{event}' not allowed in state {from}")]
pub struct InvalidTransition {
    pub track_id: TrackId,
    pub from: TrackState,
    pub event: &'static str,
}

impl Track {
    /// Fresh record for a newly discovered track
    pub fn discovered(id: impl Into<TrackId>, metadata: TrackMetadata, added_at: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            metadata,
            added_at,
            state: TrackState::Discovered,
            approval: ApprovalOutcome::Unset,
            recording_attempts: 0,
            pipeline_attempts: 0,
            raw_capture_path: None,
            local_path: None,
            sync_state: SyncState::NotApplicable,
            last_error: None,
            last_attempt_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Validate `event` against the current state and return the next snapshot.
    pub fn apply(&self, event: &TrackEvent) -> Result<Track, InvalidTransition> {
        use TrackState::*;

        let mut next = self.clone();
        match (self.state, event) {
            (Discovered, TrackEvent::RequestApproval) => {
                next.state = PendingApproval;
            }
            (PendingApproval, TrackEvent::Approve) => {
                next.state = Approved;
                next.approval = ApprovalOutcome::Approved;
            }
            (PendingApproval, TrackEvent::Reject) => {
                next.state = Rejected;
                next.approval = ApprovalOutcome::Rejected;
            }
            (Approved | RecordingFailed, TrackEvent::StartRecording) => {
                next.state = Recording;
                next.recording_attempts += 1;
            }
            (Recording, TrackEvent::RecordingSucceeded { raw_capture }) => {
                next.state = Recorded;
                next.raw_capture_path = Some(raw_capture.clone());
                next.pipeline_attempts = 0;
                next.last_error = None;
                next.last_attempt_at = None;
            }
            (Recording, TrackEvent::RecordingFailed { reason }) => {
                next.state = RecordingFailed;
                next.last_error = Some(reason.clone());
                next.last_attempt_at = Some(Utc::now());
            }
            (Recorded, TrackEvent::PipelineFailed { reason }) => {
                next.pipeline_attempts += 1;
                next.last_error = Some(reason.clone());
                next.last_attempt_at = Some(Utc::now());
            }
            (Recorded, TrackEvent::Tagged { local_path }) => {
                next.state = Tagged;
                next.local_path = Some(local_path.clone());
                next.raw_capture_path = None;
                next.last_error = None;
            }
            (Tagged, TrackEvent::QueueForSync) => {
                next.state = QueuedForSync;
                next.sync_state = SyncState::Pending;
            }
            (QueuedForSync, TrackEvent::Synced) => {
                next.state = Synced;
                next.sync_state = SyncState::Synced;
            }
            (RecordingFailed, TrackEvent::Requeue) => {
                next.state = PendingApproval;
                next.approval = ApprovalOutcome::Unset;
                next.recording_attempts = 0;
                next.last_error = None;
                next.last_attempt_at = None;
            }
            (state, TrackEvent::Abandon { reason }) if !state.is_terminal() => {
                next.state = Abandoned;
                next.last_error = Some(reason.clone());
            }
            (from, event) => {
                return Err(InvalidTransition {
                    track_id: self.id.clone(),
                    from,
                    event: event.name(),
                });
            }
        }

        next.updated_at = Utc::now();
        Ok(next)
    }

    /// "Artist - Title" for log lines and notifications
    pub fn display_name(&self) -> String {
        format!("{} - {}", self.metadata.artist, self.metadata.title)
    }
}
