//! Data models for the tapeloop orchestrator

pub mod approval;
pub mod manifest;
pub mod session;
pub mod track;

pub use approval::{ApprovalRequest, Resolution};
pub use manifest::{CopyStatus, SyncManifestEntry};
pub use session::{RecordingSession, SessionOutcome, TerminationCause};
pub use track::{
    ApprovalOutcome, InvalidTransition, SyncState, Track, TrackEvent, TrackId, TrackMetadata,
    TrackState,
};
