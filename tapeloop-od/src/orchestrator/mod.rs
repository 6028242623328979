//! Orchestrator core: the single dispatcher
//!
//! All track mutations happen here, one event at a time. Slow work
//! (recording sessions, encode/tag, device copies, notifications) runs on
//! spawned tasks and comes back as events, so no producer ever waits on
//! another track's I/O.
//!
//! Store failures that reach the loop are fatal; everything else is
//! logged and the event dropped.

pub mod events;
pub mod handle;
pub mod pollers;
mod recovery;

pub use events::{OrchestratorEvent, StatusReport, SyncStatus, SyncTrigger};
pub use handle::OrchestratorHandle;
pub use recovery::RecoveryReport;

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tapeloop_common::config::RootLayout;
use tapeloop_common::{InboundMessage, OutboundMessage};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collaborators::{DiscoveredTrack, Encoder, Messenger, Recorder, Tagger};
use crate::config::TomlConfig;
use crate::db::TrackStore;
use crate::error::{OrchestratorError, Result};
use crate::models::{CopyStatus, SessionOutcome, TerminationCause, Track, TrackEvent, TrackId, TrackState};
use crate::services::approval_gateway::{ApprovalGateway, Decision};
use crate::services::notifications;
use crate::services::pipeline::PipelineAdapter;
use crate::services::recording_controller::{run_session, RecordingController};
use crate::services::sync_coordinator::{
    select_entries, CopyOutcome, PassScope, SyncCoordinator, SyncProgress,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Adapters the dispatcher drives directly
pub struct Collaborators {
    pub messenger: Arc<dyn Messenger>,
    pub recorder: Arc<dyn Recorder>,
    pub encoder: Arc<dyn Encoder>,
    pub tagger: Arc<dyn Tagger>,
}

/// Policy knobs read once at startup
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Tracks liked at or before this instant are ignored
    pub cutoff: DateTime<Utc>,
    pub recording_max_attempts: u32,
    pub pipeline_max_attempts: u32,
    /// Attempt count that triggers the single retry warning
    pub retry_notify_threshold: u32,
    /// Wait after the first failure; doubles with each further attempt
    pub retry_backoff: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(config: &TomlConfig) -> Self {
        Self {
            cutoff: config.discovery.cutoff,
            recording_max_attempts: config.recording.max_attempts.max(1),
            pipeline_max_attempts: config.pipeline.max_attempts.max(1),
            retry_notify_threshold: config.scheduler.retry_notify_threshold,
            retry_backoff: config.scheduler.retry_backoff(),
        }
    }

    /// Whether a track that failed `attempts` times, last at
    /// `last_attempt_at`, may be tried again at `now`
    pub fn retry_due(&self, attempts: u32, last_attempt_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        let Some(last) = last_attempt_at.filter(|_| attempts > 0) else {
            return true;
        };
        let exponent = attempts.saturating_sub(1).min(16);
        let wait = self.retry_backoff.saturating_mul(1u32 << exponent);
        match chrono::Duration::from_std(wait).ok().and_then(|wait| last.checked_add_signed(wait)) {
            Some(due) => now >= due,
            None => false,
        }
    }
}

pub struct Orchestrator {
    store: TrackStore,
    gateway: ApprovalGateway,
    recording: RecordingController,
    pipeline: Arc<PipelineAdapter>,
    sync: SyncCoordinator,
    messenger: Arc<dyn Messenger>,
    settings: OrchestratorSettings,
    online: bool,
    /// Tracks with an encode/tag run in flight
    in_pipeline: HashSet<TrackId>,
    events_tx: mpsc::Sender<OrchestratorEvent>,
    events_rx: mpsc::Receiver<OrchestratorEvent>,
}

impl Orchestrator {
    pub fn new(
        store: TrackStore,
        collaborators: Collaborators,
        config: &TomlConfig,
        layout: &RootLayout,
    ) -> (Self, OrchestratorHandle) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let orchestrator = Self {
            gateway: ApprovalGateway::new(
                store.clone(),
                collaborators.messenger.clone(),
                &config.messaging,
                events_tx.clone(),
            ),
            recording: RecordingController::new(
                collaborators.recorder,
                layout.captures_dir(),
                &config.recording,
            ),
            pipeline: Arc::new(PipelineAdapter::new(
                collaborators.encoder,
                collaborators.tagger,
                layout.library_dir(),
            )),
            sync: SyncCoordinator::new(),
            messenger: collaborators.messenger,
            settings: OrchestratorSettings::from_config(config),
            online: true,
            in_pipeline: HashSet::new(),
            store,
            events_tx: events_tx.clone(),
            events_rx,
        };

        (orchestrator, OrchestratorHandle::new(events_tx))
    }

    pub fn handle(&self) -> OrchestratorHandle {
        OrchestratorHandle::new(self.events_tx.clone())
    }

    /// Recover from the previous run, then dispatch events until shutdown.
    ///
    /// Returns an error only when the track store becomes unusable.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let report = self.recover().await?;
        info!(
            interrupted_recordings = report.interrupted_recordings,
            queued = report.queued,
            copies_reset = report.copies_reset,
            approvals_opened = report.approvals_opened,
            pipelines_resumed = report.pipelines_resumed,
            "Startup recovery complete"
        );

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = self.events_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            if matches!(event, OrchestratorEvent::Shutdown) {
                break;
            }

            let name = event.name();
            if let Err(e) = self.dispatch(event).await {
                if e.is_fatal() {
                    error!(event = name, "Track store unavailable, stopping: {}", e);
                    self.sync.detach(None);
                    return Err(e);
                }
                match e {
                    OrchestratorError::InvalidTransition(e) => {
                        info!(event = name, "Stale event dropped: {}", e)
                    }
                    e => warn!(event = name, "Event handling failed: {}", e),
                }
            }
        }

        self.sync.detach(None);
        info!("Orchestrator stopped");
        Ok(())
    }

    async fn dispatch(&mut self, event: OrchestratorEvent) -> Result<()> {
        match event {
            OrchestratorEvent::Discovered(tracks) => self.on_discovered(tracks).await,
            OrchestratorEvent::Inbound(message) => self.on_inbound(message).await,
            OrchestratorEvent::ConnectivityChanged { online } => self.on_connectivity(online).await,
            OrchestratorEvent::Tick => self.on_tick().await,
            OrchestratorEvent::RecordingFinished(outcome) => self.on_recording_finished(outcome).await,
            OrchestratorEvent::PipelineFinished { track_id, result } => {
                self.on_pipeline_finished(track_id, result).await
            }
            OrchestratorEvent::DeviceAttached(device) => {
                let replaced_running = self.sync.is_running();
                self.sync.attach(device);
                if replaced_running {
                    self.store.reset_in_progress().await?;
                }
                let trigger = self.start_full_pass().await?;
                debug!(?trigger, "Pass on attach");
                Ok(())
            }
            OrchestratorEvent::DeviceDetached { name } => self.on_device_detached(name).await,
            OrchestratorEvent::ForceSync { reply } => {
                let result = self.start_full_pass().await;
                answer(reply, result)
            }
            OrchestratorEvent::Sync(progress) => self.on_sync_progress(progress).await,
            OrchestratorEvent::Status { reply } => {
                let result = self.status_report().await;
                answer(reply, result)
            }
            OrchestratorEvent::Abandon { track_id, reply } => {
                let result = self.abandon_by_operator(&track_id).await;
                answer(reply, result)
            }
            OrchestratorEvent::Requeue { track_id, reply } => {
                let result = self.gateway.requeue(&track_id, self.online).await;
                answer(reply, result)
            }
            OrchestratorEvent::RequeueAll { reply } => {
                let result = self.requeue_all().await;
                answer(reply, result)
            }
            OrchestratorEvent::ApprovalSent { track_id, seq, result } => {
                self.gateway.on_sent(&track_id, seq, result).await
            }
            OrchestratorEvent::RecordingEnded => {
                if self.recording.is_busy() {
                    self.recording.signal_end();
                } else {
                    debug!("End-of-track signal with no session running; ignored");
                }
                Ok(())
            }
            OrchestratorEvent::Shutdown => Ok(()),
        }
    }

    async fn on_discovered(&mut self, tracks: Vec<DiscoveredTrack>) -> Result<()> {
        for discovered in tracks {
            if discovered.added_at <= self.settings.cutoff {
                debug!(track_id = %discovered.track_id, "Liked before cutoff; ignored");
                continue;
            }

            let (track, created) = self
                .store
                .create_if_absent(&discovered.track_id, &discovered.metadata, discovered.added_at)
                .await?;
            if created {
                info!(track_id = %track.id, "Discovered {}", track.display_name());
            }

            // Also covers a crash between creation and the approval request
            if track.state == TrackState::Discovered {
                self.gateway.request_approval(&track.id, self.online).await?;
            }
        }
        Ok(())
    }

    async fn on_inbound(&mut self, message: InboundMessage) -> Result<()> {
        if let Some(resolved) = self.gateway.on_inbound(&message).await? {
            match resolved.decision {
                Decision::Approve => {
                    self.notify(notifications::approval_ack(&resolved.track));
                    self.schedule_recording(false).await?;
                }
                Decision::Reject => self.notify(notifications::rejected(&resolved.track)),
            }
        }
        Ok(())
    }

    async fn on_connectivity(&mut self, online: bool) -> Result<()> {
        if online == self.online {
            return Ok(());
        }
        self.online = online;
        info!(online, "Connectivity changed");

        if online {
            self.on_tick().await?;
        }
        Ok(())
    }

    /// Deferred notifications, pipeline retries, then the recording backlog
    async fn on_tick(&mut self) -> Result<()> {
        if self.online {
            let started = self.gateway.send_unsent().await?;
            if started > 0 {
                info!(started, "Sending deferred approval requests");
            }
        }

        self.retry_pipeline().await?;
        self.schedule_recording(true).await
    }

    /// Claim the slot for the next approved track. Failed recordings are
    /// only retried when `include_failed` is set (tick) and their backoff
    /// has elapsed.
    async fn schedule_recording(&mut self, include_failed: bool) -> Result<()> {
        if !self.online || self.recording.is_busy() {
            return Ok(());
        }

        let mut next = self
            .store
            .list_all(Some(TrackState::Approved))
            .await?
            .into_iter()
            .next();
        if next.is_none() && include_failed {
            let max = self.settings.recording_max_attempts;
            let now = Utc::now();
            next = self
                .store
                .list_all(Some(TrackState::RecordingFailed))
                .await?
                .into_iter()
                .find(|t| {
                    t.recording_attempts < max
                        && self.settings.retry_due(t.recording_attempts, t.last_attempt_at, now)
                });
        }

        match next {
            Some(track) => self.start_recording(track).await,
            None => Ok(()),
        }
    }

    async fn start_recording(&mut self, track: Track) -> Result<()> {
        let session = self.recording.try_claim(&track)?;

        // Committed before capture starts so a crash here is seen on restart
        let track = match self.store.transition(&track.id, TrackEvent::StartRecording).await {
            Ok(track) => track,
            Err(e) => {
                self.recording.release(session.session_id);
                return Err(e);
            }
        };

        info!(
            track_id = %track.id,
            attempt = track.recording_attempts,
            max = self.settings.recording_max_attempts,
            "Recording {}",
            track.display_name()
        );

        let output = self.recording.capture_path(&track.id);
        let limit = self.recording.safety_timeout(session.expected_duration);
        let recorder = self.recording.recorder();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let outcome = run_session(recorder, session, output, limit).await;
            if events.send(OrchestratorEvent::RecordingFinished(outcome)).await.is_err() {
                debug!("Dispatcher gone; recording outcome dropped");
            }
        });
        Ok(())
    }

    async fn on_recording_finished(&mut self, outcome: SessionOutcome) -> Result<()> {
        if self.recording.release(outcome.session_id).is_none() {
            warn!(track_id = %outcome.track_id, "Outcome for a session that no longer holds the slot");
            return Ok(());
        }

        let applied = self.apply_recording_outcome(outcome).await;
        let scheduled = self.schedule_recording(false).await;
        applied.and(scheduled)
    }

    async fn apply_recording_outcome(&mut self, outcome: SessionOutcome) -> Result<()> {
        let SessionOutcome {
            track_id,
            cause,
            raw_capture,
            error,
            ..
        } = outcome;

        match (cause, raw_capture) {
            (TerminationCause::NaturalEnd, Some(raw_capture)) => {
                let track = self
                    .store
                    .transition(&track_id, TrackEvent::RecordingSucceeded { raw_capture })
                    .await?;
                info!(track_id = %track.id, attempt = track.recording_attempts, "Recording captured");
                self.start_pipeline(track);
                Ok(())
            }
            (cause, _) => {
                let reason = error.unwrap_or_else(|| format!("session ended without capture ({:?})", cause));
                self.record_recording_failure(&track_id, &reason).await
            }
        }
    }

    /// Count a failed attempt; abandon at the limit, warn once at the threshold
    async fn record_recording_failure(&mut self, track_id: &str, reason: &str) -> Result<()> {
        let track = self
            .store
            .transition(
                track_id,
                TrackEvent::RecordingFailed {
                    reason: reason.to_string(),
                },
            )
            .await?;

        let max = self.settings.recording_max_attempts;
        warn!(
            track_id = %track_id,
            attempt = track.recording_attempts,
            max,
            "Recording failed: {}",
            reason
        );

        if track.recording_attempts >= max {
            let reason = format!("recording failed {} times: {}", track.recording_attempts, reason);
            self.abandon_with_notice(track_id, reason).await?;
        } else if track.recording_attempts == self.settings.retry_notify_threshold {
            self.notify(notifications::retry_warning(
                &track,
                "recording",
                track.recording_attempts,
                max,
            ));
        }
        Ok(())
    }

    fn start_pipeline(&mut self, track: Track) {
        if !self.in_pipeline.insert(track.id.clone()) {
            return;
        }

        let pipeline = self.pipeline.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = match &track.raw_capture_path {
                Some(raw) => pipeline.process(&track, raw).await,
                None => Err(OrchestratorError::Encode("no raw capture recorded".to_string())),
            };
            let event = OrchestratorEvent::PipelineFinished {
                track_id: track.id.clone(),
                result,
            };
            if events.send(event).await.is_err() {
                debug!(track_id = %track.id, "Dispatcher gone; pipeline result dropped");
            }
        });
    }

    async fn retry_pipeline(&mut self) -> Result<()> {
        let now = Utc::now();
        for track in self.store.list_all(Some(TrackState::Recorded)).await? {
            if self.in_pipeline.contains(&track.id) {
                continue;
            }
            if self.settings.retry_due(track.pipeline_attempts, track.last_attempt_at, now) {
                debug!(track_id = %track.id, attempts = track.pipeline_attempts, "Processing recorded track");
                self.start_pipeline(track);
            }
        }
        Ok(())
    }

    async fn on_pipeline_finished(&mut self, track_id: TrackId, result: Result<PathBuf>) -> Result<()> {
        self.in_pipeline.remove(&track_id);
        match result {
            Ok(local_path) => self.commit_tagged(&track_id, local_path).await,
            Err(e) => self.record_pipeline_failure(&track_id, &e.to_string()).await,
        }
    }

    async fn commit_tagged(&mut self, track_id: &str, local_path: PathBuf) -> Result<()> {
        let raw_capture = self.store.require(track_id).await?.raw_capture_path;
        self.store
            .transition(track_id, TrackEvent::Tagged { local_path })
            .await?;

        // Only now is the capture no longer needed for a retry
        if let Some(raw) = raw_capture {
            if let Err(e) = tokio::fs::remove_file(&raw).await {
                debug!(track_id = %track_id, path = %raw.display(), "Raw capture not removed: {}", e);
            }
        }

        let track = self.store.transition(track_id, TrackEvent::QueueForSync).await?;
        info!(track_id = %track_id, "Queued for sync: {}", track.display_name());
        self.notify(notifications::recorded(&track));

        self.auto_sync().await
    }

    async fn record_pipeline_failure(&mut self, track_id: &str, reason: &str) -> Result<()> {
        let track = self
            .store
            .transition(
                track_id,
                TrackEvent::PipelineFailed {
                    reason: reason.to_string(),
                },
            )
            .await?;

        let max = self.settings.pipeline_max_attempts;
        warn!(
            track_id = %track_id,
            attempt = track.pipeline_attempts,
            max,
            "Encode/tag failed: {}",
            reason
        );

        if track.pipeline_attempts >= max {
            let reason = format!("processing failed {} times: {}", track.pipeline_attempts, reason);
            self.abandon_with_notice(track_id, reason).await?;
        } else if track.pipeline_attempts == self.settings.retry_notify_threshold {
            self.notify(notifications::retry_warning(
                &track,
                "processing",
                track.pipeline_attempts,
                max,
            ));
        }
        Ok(())
    }

    async fn abandon_with_notice(&mut self, track_id: &str, reason: String) -> Result<()> {
        let track = self
            .store
            .transition(track_id, TrackEvent::Abandon { reason })
            .await?;
        warn!(track_id = %track_id, "Abandoned {}", track.display_name());
        self.notify(notifications::abandoned(&track));
        Ok(())
    }

    /// Requeue every failed recording; tracks that cannot move are skipped
    async fn requeue_all(&mut self) -> Result<Vec<Track>> {
        let mut requeued = Vec::new();
        for track in self.store.list_all(Some(TrackState::RecordingFailed)).await? {
            match self.gateway.requeue(&track.id, self.online).await {
                Ok(track) => requeued.push(track),
                Err(OrchestratorError::InvalidTransition(e)) => {
                    debug!(track_id = %track.id, "Not requeued: {}", e)
                }
                Err(e) => return Err(e),
            }
        }
        info!(count = requeued.len(), "Requeued failed recordings");
        Ok(requeued)
    }

    async fn abandon_by_operator(&mut self, track_id: &str) -> Result<Track> {
        let track = self
            .store
            .transition(
                track_id,
                TrackEvent::Abandon {
                    reason: "abandoned by operator".to_string(),
                },
            )
            .await?;
        info!(track_id = %track_id, "Abandoned by operator: {}", track.display_name());
        Ok(track)
    }

    /// Pass over every unfinished entry, failed ones included
    async fn start_full_pass(&mut self) -> Result<SyncTrigger> {
        if self.sync.device_name().is_none() {
            return Ok(SyncTrigger::NoDevice);
        }
        if self.sync.is_running() {
            return Ok(SyncTrigger::AlreadyRunning);
        }
        if self.sync.is_draining() {
            self.sync.defer_full_pass();
            info!("Full pass deferred until the interrupted pass stops");
            return Ok(SyncTrigger::Deferred);
        }

        let entries = select_entries(self.store.sync_queue().await?, PassScope::All);
        Ok(match self.sync.start_pass(entries, self.events_tx.clone()) {
            Some(pass_id) => SyncTrigger::Started { pass_id },
            None => SyncTrigger::AlreadyRunning,
        })
    }

    /// Copy newly queued tracks to an idle attached device
    async fn auto_sync(&mut self) -> Result<()> {
        if self.sync.device_name().is_none() || self.sync.is_running() || self.sync.is_draining() {
            return Ok(());
        }

        let entries = select_entries(self.store.sync_queue().await?, PassScope::NotStarted);
        if !entries.is_empty() {
            self.sync.start_pass(entries, self.events_tx.clone());
        }
        Ok(())
    }

    async fn on_device_detached(&mut self, name: Option<String>) -> Result<()> {
        if !self.sync.detach(name.as_deref()) {
            debug!(device = ?name, "Detach for a device that is not attached");
            return Ok(());
        }

        let reset = self.store.reset_in_progress().await?;
        if reset > 0 {
            info!(reset, "Interrupted copies reset to not started");
        }
        Ok(())
    }

    async fn on_sync_progress(&mut self, progress: SyncProgress) -> Result<()> {
        match progress {
            SyncProgress::CopyStarting {
                pass_id,
                track_id,
                ack,
            } => {
                if !self.sync.is_current(pass_id) {
                    let _ = ack.send(false);
                    return Ok(());
                }
                self.store
                    .set_copy_status(&track_id, CopyStatus::InProgress, None)
                    .await?;
                if ack.send(true).is_err() {
                    debug!(track_id = %track_id, "Sync worker gone before copy started");
                }
            }
            SyncProgress::CopyFinished {
                pass_id,
                track_id,
                outcome,
            } => {
                if !self.sync.is_current(pass_id) {
                    debug!(pass_id = %pass_id, track_id = %track_id, "Result from a finished pass ignored");
                    return Ok(());
                }
                self.sync.record(pass_id, &outcome);

                match outcome {
                    CopyOutcome::Copied | CopyOutcome::AlreadyPresent => {
                        self.store.transition(&track_id, TrackEvent::Synced).await?;
                        info!(track_id = %track_id, pass_id = %pass_id, "Synced");
                    }
                    CopyOutcome::Failed(reason) => {
                        self.store
                            .set_copy_status(&track_id, CopyStatus::Failed, Some(&reason))
                            .await?;
                    }
                }
            }
            SyncProgress::PassFinished {
                pass_id,
                interrupted,
            } => {
                let Some(summary) = self.sync.finish(pass_id) else {
                    // A cancelled pass has cleaned up; run what waited for it
                    if self.sync.drained(pass_id) {
                        if self.sync.take_deferred_full_pass() {
                            self.start_full_pass().await?;
                        } else {
                            self.auto_sync().await?;
                        }
                    }
                    return Ok(());
                };

                if interrupted {
                    self.store.reset_in_progress().await?;
                }
                info!(
                    pass_id = %pass_id,
                    copied = summary.copied,
                    failed = summary.failed,
                    skipped = summary.skipped,
                    interrupted,
                    "Sync pass finished"
                );

                if !interrupted {
                    if summary.copied + summary.failed > 0 {
                        self.notify(notifications::sync_complete(summary.copied, summary.failed));
                    }
                    self.auto_sync().await?;
                }
            }
        }
        Ok(())
    }

    async fn status_report(&self) -> Result<StatusReport> {
        Ok(StatusReport {
            counts: self.store.counts_by_state().await?,
            online: self.online,
            recording: self.recording.current().cloned(),
            sync: SyncStatus {
                device: self.sync.device_name().map(str::to_string),
                pass_running: self.sync.is_running(),
            },
        })
    }

    /// Fire-and-forget delivery; a lost notification never blocks dispatch
    fn notify(&self, message: OutboundMessage) {
        let messenger = self.messenger.clone();
        tokio::spawn(async move {
            if let Err(e) = messenger.notify(&message).await {
                warn!(kind = ?message.kind, "Notification not sent: {}", e);
            }
        });
    }
}

/// Reply to a requester. Fatal errors still stop the dispatcher; the
/// requester sees `Stopped`.
fn answer<T>(reply: oneshot::Sender<Result<T>>, result: Result<T>) -> Result<()> {
    match result {
        Err(e) if e.is_fatal() => {
            let _ = reply.send(Err(OrchestratorError::Stopped));
            Err(e)
        }
        result => {
            if reply.send(result).is_err() {
                debug!("Requester went away before the reply");
            }
            Ok(())
        }
    }
}
