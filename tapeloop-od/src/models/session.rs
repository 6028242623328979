//! Recording session model
//!
//! There is at most one session system-wide. The recording controller owns
//! the slot; everything else only ever sees snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use super::track::TrackId;

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationCause {
    /// End-of-track signal received
    NaturalEnd,
    /// Advertised duration plus grace elapsed without an end signal
    Timeout,
    /// Playback or capture fault
    Error,
}

/// The exclusive real-time capture bound to one track
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingSession {
    pub session_id: Uuid,
    pub track_id: TrackId,
    pub started_at: DateTime<Utc>,
    /// From discovery metadata; advisory only
    pub expected_duration: Option<Duration>,
    /// Monitoring only
    pub bytes_captured: u64,
    pub termination: Option<TerminationCause>,
}

impl RecordingSession {
    pub fn new(track_id: impl Into<TrackId>, expected_duration: Option<Duration>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            track_id: track_id.into(),
            started_at: Utc::now(),
            expected_duration,
            bytes_captured: 0,
            termination: None,
        }
    }
}

/// Result of driving one session to completion
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub session_id: Uuid,
    pub track_id: TrackId,
    pub cause: TerminationCause,
    /// Present only for [`TerminationCause::NaturalEnd`]
    pub raw_capture: Option<PathBuf>,
    pub error: Option<String>,
}

impl SessionOutcome {
    pub fn succeeded(&self) -> bool {
        self.cause == TerminationCause::NaturalEnd && self.raw_capture.is_some()
    }
}
