//! Events consumed by the dispatcher

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tapeloop_common::InboundMessage;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::collaborators::{DiscoveredTrack, RemovableDevice};
use crate::db::StateCounts;
use crate::error::Result;
use crate::models::{RecordingSession, SessionOutcome, Track, TrackId};
use crate::services::sync_coordinator::SyncProgress;

/// Everything that can advance a track arrives as one of these
pub enum OrchestratorEvent {
    /// Liked tracks from discovery, possibly already known
    Discovered(Vec<DiscoveredTrack>),
    /// Chat reply
    Inbound(InboundMessage),
    ConnectivityChanged { online: bool },
    /// Periodic retry/backlog pass
    Tick,
    RecordingFinished(SessionOutcome),
    PipelineFinished {
        track_id: TrackId,
        result: Result<PathBuf>,
    },
    DeviceAttached(Arc<dyn RemovableDevice>),
    /// `None` detaches whatever is attached
    DeviceDetached { name: Option<String> },
    ForceSync {
        reply: oneshot::Sender<Result<SyncTrigger>>,
    },
    Sync(SyncProgress),
    Status {
        reply: oneshot::Sender<Result<StatusReport>>,
    },
    Abandon {
        track_id: TrackId,
        reply: oneshot::Sender<Result<Track>>,
    },
    Requeue {
        track_id: TrackId,
        reply: oneshot::Sender<Result<Track>>,
    },
    /// Requeue every track whose recording failed
    RequeueAll {
        reply: oneshot::Sender<Result<Vec<Track>>>,
    },
    /// Delivery result of an approval notification
    ApprovalSent {
        track_id: TrackId,
        seq: i64,
        result: Result<Option<String>>,
    },
    /// External end-of-track signal for the running session
    RecordingEnded,
    Shutdown,
}

impl OrchestratorEvent {
    /// Short label for log lines
    pub fn name(&self) -> &'static str {
        match self {
            OrchestratorEvent::Discovered(_) => "discovered",
            OrchestratorEvent::Inbound(_) => "inbound",
            OrchestratorEvent::ConnectivityChanged { .. } => "connectivity_changed",
            OrchestratorEvent::Tick => "tick",
            OrchestratorEvent::RecordingFinished(_) => "recording_finished",
            OrchestratorEvent::PipelineFinished { .. } => "pipeline_finished",
            OrchestratorEvent::DeviceAttached(_) => "device_attached",
            OrchestratorEvent::DeviceDetached { .. } => "device_detached",
            OrchestratorEvent::ForceSync { .. } => "force_sync",
            OrchestratorEvent::Sync(_) => "sync",
            OrchestratorEvent::Status { .. } => "status",
            OrchestratorEvent::Abandon { .. } => "abandon",
            OrchestratorEvent::Requeue { .. } => "requeue",
            OrchestratorEvent::RequeueAll { .. } => "requeue_all",
            OrchestratorEvent::ApprovalSent { .. } => "approval_sent",
            OrchestratorEvent::RecordingEnded => "recording_ended",
            OrchestratorEvent::Shutdown => "shutdown",
        }
    }
}

/// Answer to a manual sync request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SyncTrigger {
    Started { pass_id: Uuid },
    AlreadyRunning,
    /// Starts once the interrupted pass has cleaned up
    Deferred,
    NoDevice,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub device: Option<String>,
    pub pass_running: bool,
}

/// Snapshot returned by the status query
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub counts: StateCounts,
    pub online: bool,
    pub recording: Option<RecordingSession>,
    pub sync: SyncStatus,
}
