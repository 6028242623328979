//! Cloneable front door to the dispatcher
//!
//! Every producer (HTTP handlers, pollers, tests) talks to the orchestrator
//! through this handle. A closed channel means the dispatcher has stopped.

use std::sync::Arc;
use tapeloop_common::InboundMessage;
use tokio::sync::{mpsc, oneshot};

use super::events::{OrchestratorEvent, StatusReport, SyncTrigger};
use crate::collaborators::{DiscoveredTrack, RemovableDevice};
use crate::error::{OrchestratorError, Result};
use crate::models::{Track, TrackId};

#[derive(Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::Sender<OrchestratorEvent>,
}

impl OrchestratorHandle {
    pub(crate) fn new(tx: mpsc::Sender<OrchestratorEvent>) -> Self {
        Self { tx }
    }

    async fn send(&self, event: OrchestratorEvent) -> Result<()> {
        self.tx.send(event).await.map_err(|_| OrchestratorError::Stopped)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> OrchestratorEvent,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply)).await?;
        rx.await.map_err(|_| OrchestratorError::Stopped)?
    }

    pub async fn discovered(&self, tracks: Vec<DiscoveredTrack>) -> Result<()> {
        self.send(OrchestratorEvent::Discovered(tracks)).await
    }

    pub async fn inbound(&self, message: InboundMessage) -> Result<()> {
        self.send(OrchestratorEvent::Inbound(message)).await
    }

    pub async fn connectivity_changed(&self, online: bool) -> Result<()> {
        self.send(OrchestratorEvent::ConnectivityChanged { online }).await
    }

    pub async fn tick(&self) -> Result<()> {
        self.send(OrchestratorEvent::Tick).await
    }

    pub async fn device_attached(&self, device: Arc<dyn RemovableDevice>) -> Result<()> {
        self.send(OrchestratorEvent::DeviceAttached(device)).await
    }

    pub async fn device_detached(&self, name: Option<String>) -> Result<()> {
        self.send(OrchestratorEvent::DeviceDetached { name }).await
    }

    pub async fn force_sync(&self) -> Result<SyncTrigger> {
        self.request(|reply| OrchestratorEvent::ForceSync { reply }).await
    }

    pub async fn status(&self) -> Result<StatusReport> {
        self.request(|reply| OrchestratorEvent::Status { reply }).await
    }

    pub async fn abandon(&self, track_id: impl Into<TrackId>) -> Result<Track> {
        let track_id = track_id.into();
        self.request(|reply| OrchestratorEvent::Abandon { track_id, reply }).await
    }

    pub async fn requeue(&self, track_id: impl Into<TrackId>) -> Result<Track> {
        let track_id = track_id.into();
        self.request(|reply| OrchestratorEvent::Requeue { track_id, reply }).await
    }

    /// Requeue every track whose recording failed; returns the requeued tracks
    pub async fn requeue_all(&self) -> Result<Vec<Track>> {
        self.request(|reply| OrchestratorEvent::RequeueAll { reply }).await
    }

    pub async fn recording_ended(&self) -> Result<()> {
        self.send(OrchestratorEvent::RecordingEnded).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(OrchestratorEvent::Shutdown).await
    }
}
