//! Startup reconciliation of durable state
//!
//! Runs once, before the first event is dispatched. Each scan uses the
//! store's lazy listing; ids are collected before any transition so the
//! scan never observes its own writes.

use futures::TryStreamExt;
use tracing::{info, warn};

use super::Orchestrator;
use crate::error::Result;
use crate::models::{TrackEvent, TrackId, TrackState};

/// What recovery changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// `Recording` at startup: counted as failed attempts
    pub interrupted_recordings: usize,
    /// `Tagged` tracks moved on to the sync queue
    pub queued: usize,
    /// Manifest entries reset from `in_progress`
    pub copies_reset: u64,
    /// `Discovered` tracks that never got an approval request
    pub approvals_opened: usize,
    /// `Recorded` tracks handed back to the pipeline
    pub pipelines_resumed: usize,
}

impl Orchestrator {
    async fn ids_in(&self, state: TrackState) -> Result<Vec<TrackId>> {
        let ids: Vec<TrackId> = self
            .store
            .list(Some(state))
            .map_ok(|track| track.id)
            .try_collect()
            .await?;
        Ok(ids)
    }

    pub(super) async fn recover(&mut self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        // A capture cut off by process exit is unusable
        for track_id in self.ids_in(TrackState::Recording).await? {
            warn!(track_id = %track_id, "Recording interrupted by restart");
            self.record_recording_failure(&track_id, "interrupted by restart").await?;
            report.interrupted_recordings += 1;
        }

        for track_id in self.ids_in(TrackState::Tagged).await? {
            self.store.transition(&track_id, TrackEvent::QueueForSync).await?;
            info!(track_id = %track_id, "Tagged track queued for sync");
            report.queued += 1;
        }

        report.copies_reset = self.store.reset_in_progress().await?;

        for track_id in self.ids_in(TrackState::Discovered).await? {
            self.gateway.request_approval(&track_id, self.online).await?;
            report.approvals_opened += 1;
        }

        for track in self.store.list_all(Some(TrackState::Recorded)).await? {
            info!(track_id = %track.id, "Resuming encode/tag");
            self.start_pipeline(track);
            report.pipelines_resumed += 1;
        }

        Ok(report)
    }
}
