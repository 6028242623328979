//! Capability interfaces to the outside world
//!
//! The orchestrator never talks to the streaming service, the chat
//! transport, the audio stack or the filesystem of the player directly.
//! It calls these traits, and the daemon wires in the shipped adapters:
//!
//! | trait | adapter |
//! |---|---|
//! | [`DiscoverySource`] | [`discovery::FeedDiscovery`] |
//! | [`Messenger`] | [`webhook::WebhookMessenger`], [`webhook::LogMessenger`] |
//! | [`Recorder`] | [`command::CommandRecorder`] |
//! | [`Encoder`] | [`command::CommandEncoder`] |
//! | [`Tagger`] | [`id3_tagger::Id3Tagger`] |
//! | [`RemovableDevice`] | [`volume::VolumeDevice`] |
//! | [`ConnectivityProbe`] | [`connectivity::SsidProbe`] |

pub mod command;
pub mod connectivity;
pub mod discovery;
pub mod id3_tagger;
pub mod volume;
pub mod webhook;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tapeloop_common::OutboundMessage;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{TrackId, TrackMetadata};

/// One liked track as delivered by discovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredTrack {
    pub track_id: TrackId,
    #[serde(flatten)]
    pub metadata: TrackMetadata,
    pub added_at: DateTime<Utc>,
}

/// Source of liked tracks; repeated delivery of the same track is expected
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    /// Tracks liked after `cutoff`
    async fn fetch(&self, cutoff: DateTime<Utc>) -> Result<Vec<DiscoveredTrack>>;
}

/// Outbound chat channel
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Deliver one message; returns the transport's reference for it, if any,
    /// so threaded replies can be matched back.
    async fn notify(&self, message: &OutboundMessage) -> Result<Option<String>>;
}

/// A running capture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureHandle {
    pub id: Uuid,
    pub output: PathBuf,
}

/// Playback and capture of one track at a time
#[async_trait]
pub trait Recorder: Send + Sync {
    async fn start_playback(&self, track_id: &str) -> Result<()>;

    /// Begin capturing into `output` (overwritten if present)
    async fn start_capture(&self, output: &Path) -> Result<CaptureHandle>;

    /// Resolves when the end-of-track signal fires
    async fn wait_for_end(&self, handle: &CaptureHandle) -> Result<()>;

    /// Stop capture and playback; returns the finished capture file
    async fn stop_capture(&self, handle: CaptureHandle) -> Result<PathBuf>;

    /// Stop playback when no capture could be started
    async fn stop_playback(&self) -> Result<()> {
        Ok(())
    }

    /// External end-of-track signal (e.g. from the HTTP surface)
    fn signal_end(&self) {}
}

#[async_trait]
pub trait Encoder: Send + Sync {
    async fn encode(&self, raw: &Path, output: &Path) -> Result<()>;
}

#[async_trait]
pub trait Tagger: Send + Sync {
    async fn embed_tags(&self, mp3: &Path, metadata: &TrackMetadata) -> Result<()>;
}

/// A mounted player. Copies go to a temporary name and only appear under
/// their final name after [`flush`](RemovableDevice::flush).
#[async_trait]
pub trait RemovableDevice: Send + Sync {
    fn name(&self) -> &str;

    /// File names currently in the device's music folder
    async fn list(&self) -> Result<HashSet<String>>;

    /// Copy `source` to the temporary name for `target_name`
    async fn copy(&self, source: &Path, target_name: &str) -> Result<()>;

    /// Sync the temporary file to the medium and move it to `target_name`
    async fn flush(&self, target_name: &str) -> Result<()>;

    /// Remove the temporary file for `target_name`, if any
    async fn discard_partial(&self, target_name: &str) -> Result<()>;

    /// Remove every temporary file left by an earlier interrupted copy
    async fn discard_stale_partials(&self) -> Result<usize>;
}

#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_online(&self) -> bool;
}
