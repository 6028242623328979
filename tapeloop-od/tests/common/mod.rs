//! Shared fakes and a running-daemon harness for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tapeloop_common::config::RootLayout;
use tapeloop_common::{MessageKind, OutboundMessage};
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tapeloop_od::collaborators::volume::VolumeDevice;
use tapeloop_od::collaborators::{
    CaptureHandle, DiscoveredTrack, Encoder, Messenger, Recorder, RemovableDevice, Tagger,
};
use tapeloop_od::config::TomlConfig;
use tapeloop_od::db::TrackStore;
use tapeloop_od::error::{OrchestratorError, Result};
use tapeloop_od::models::{Track, TrackMetadata, TrackState};
use tapeloop_od::{Collaborators, Orchestrator, OrchestratorHandle};

pub const WAIT: Duration = Duration::from_secs(5);

/// Records every notification; references are "msg-1", "msg-2", ...
#[derive(Default)]
pub struct FakeMessenger {
    sent: Mutex<Vec<OutboundMessage>>,
    /// Time each delivery takes
    delay: Duration,
}

impl FakeMessenger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every delivery takes `delay`
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count(&self, kind: MessageKind) -> usize {
        self.sent.lock().unwrap().iter().filter(|m| m.kind == kind).count()
    }

    /// Wait until at least `n` messages of `kind` went out
    pub async fn wait_for(&self, kind: MessageKind, n: usize) {
        eventually(&format!("{} {:?} notification(s)", n, kind), || self.count(kind) >= n).await;
    }
}

#[async_trait]
impl Messenger for FakeMessenger {
    async fn notify(&self, message: &OutboundMessage) -> Result<Option<String>> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push(message.clone());
        Ok(Some(format!("msg-{}", sent.len())))
    }
}

/// What the next capture does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Take {
    /// Writes a capture and ends immediately
    Succeed,
    /// `start_capture` fails
    CaptureFault,
    /// Never signals end-of-track on its own
    Hang,
}

/// Plays a script of takes; `Succeed` once the script runs out
pub struct ScriptedRecorder {
    script: Mutex<VecDeque<Take>>,
    current: Mutex<Option<Take>>,
    playbacks: Mutex<Vec<String>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    end: Notify,
}

impl ScriptedRecorder {
    pub fn new(script: impl IntoIterator<Item = Take>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            current: Mutex::new(None),
            playbacks: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            end: Notify::new(),
        })
    }

    pub fn playbacks(&self) -> Vec<String> {
        self.playbacks.lock().unwrap().clone()
    }

    /// Highest number of captures ever running at once
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Recorder for ScriptedRecorder {
    async fn start_playback(&self, track_id: &str) -> Result<()> {
        self.playbacks.lock().unwrap().push(track_id.to_string());
        Ok(())
    }

    async fn start_capture(&self, output: &Path) -> Result<CaptureHandle> {
        let take = self.script.lock().unwrap().pop_front().unwrap_or(Take::Succeed);
        if take == Take::CaptureFault {
            return Err(OrchestratorError::RecordingFailed(
                "simulated capture fault".to_string(),
            ));
        }

        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(output, b"RIFF fake pcm").await?;

        *self.current.lock().unwrap() = Some(take);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        Ok(CaptureHandle {
            id: Uuid::new_v4(),
            output: output.to_path_buf(),
        })
    }

    async fn wait_for_end(&self, _handle: &CaptureHandle) -> Result<()> {
        let take = *self.current.lock().unwrap();
        if take == Some(Take::Hang) {
            self.end.notified().await;
        }
        Ok(())
    }

    async fn stop_capture(&self, handle: CaptureHandle) -> Result<PathBuf> {
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(handle.output)
    }

    fn signal_end(&self) {
        self.end.notify_one();
    }
}

/// "Encodes" by copying the capture
pub struct CopyEncoder;

#[async_trait]
impl Encoder for CopyEncoder {
    async fn encode(&self, raw: &Path, output: &Path) -> Result<()> {
        tokio::fs::copy(raw, output).await?;
        Ok(())
    }
}

pub struct NoopTagger;

#[async_trait]
impl Tagger for NoopTagger {
    async fn embed_tags(&self, _mp3: &Path, _metadata: &TrackMetadata) -> Result<()> {
        Ok(())
    }
}

/// Tag embedding that always fails
pub struct FailingTagger;

#[async_trait]
impl Tagger for FailingTagger {
    async fn embed_tags(&self, _mp3: &Path, _metadata: &TrackMetadata) -> Result<()> {
        Err(OrchestratorError::Tag("simulated tag fault".to_string()))
    }
}

/// Volume device whose copies stall after writing the temp file until
/// `release` is called
pub struct GatedDevice {
    inner: VolumeDevice,
    gate: Notify,
    pub copy_started: Notify,
}

impl GatedDevice {
    pub fn new(inner: VolumeDevice) -> Arc<Self> {
        Arc::new(Self {
            inner,
            gate: Notify::new(),
            copy_started: Notify::new(),
        })
    }

    pub fn release(&self) {
        self.gate.notify_one();
    }
}

#[async_trait]
impl RemovableDevice for GatedDevice {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn list(&self) -> Result<HashSet<String>> {
        self.inner.list().await
    }

    async fn copy(&self, source: &Path, target_name: &str) -> Result<()> {
        self.inner.copy(source, target_name).await?;
        self.copy_started.notify_one();
        self.gate.notified().await;
        Ok(())
    }

    async fn flush(&self, target_name: &str) -> Result<()> {
        self.inner.flush(target_name).await
    }

    async fn discard_partial(&self, target_name: &str) -> Result<()> {
        self.inner.discard_partial(target_name).await
    }

    async fn discard_stale_partials(&self) -> Result<usize> {
        self.inner.discard_stale_partials().await
    }
}

pub fn liked(id: &str, title: &str, artist: &str) -> DiscoveredTrack {
    DiscoveredTrack {
        track_id: id.to_string(),
        metadata: TrackMetadata {
            title: title.to_string(),
            artist: artist.to_string(),
            album: String::new(),
            cover_art_url: None,
            duration_ms: Some(180_000),
            track_number: None,
        },
        added_at: Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap(),
    }
}

pub fn test_config() -> TomlConfig {
    let mut config = TomlConfig::default();
    config.messaging.authorized_senders = vec!["alice".to_string()];
    // Failed tracks are retried on the very next tick
    config.scheduler.retry_backoff_secs = 0;
    config
}

/// A player mount point with an existing Music folder
pub fn player_mount(root: &Path, label: &str) -> PathBuf {
    let mount = root.join(label);
    std::fs::create_dir_all(mount.join("Music")).unwrap();
    mount
}

pub fn open_player(mount: &Path) -> VolumeDevice {
    VolumeDevice::open(mount, &["Music".to_string()]).unwrap()
}

/// A dispatcher running over a temporary root folder
pub struct Harness {
    pub store: TrackStore,
    pub handle: OrchestratorHandle,
    pub messenger: Arc<FakeMessenger>,
    pub recorder: Arc<ScriptedRecorder>,
    pub layout: RootLayout,
    root: TempDir,
    cancel: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl Harness {
    pub async fn start(recorder: Arc<ScriptedRecorder>) -> Self {
        Self::start_in(tempfile::tempdir().unwrap(), test_config(), recorder).await
    }

    pub async fn start_in(root: TempDir, config: TomlConfig, recorder: Arc<ScriptedRecorder>) -> Self {
        Self::start_with(root, config, recorder, FakeMessenger::new(), Arc::new(NoopTagger)).await
    }

    pub async fn start_with(
        root: TempDir,
        config: TomlConfig,
        recorder: Arc<ScriptedRecorder>,
        messenger: Arc<FakeMessenger>,
        tagger: Arc<dyn Tagger>,
    ) -> Self {
        let layout = RootLayout::new(root.path());
        layout.ensure_directories().unwrap();
        let store = TrackStore::open(&layout.database_path()).await.unwrap();

        let collaborators = Collaborators {
            messenger: messenger.clone(),
            recorder: recorder.clone(),
            encoder: Arc::new(CopyEncoder),
            tagger,
        };
        let (orchestrator, handle) =
            Orchestrator::new(store.clone(), collaborators, &config, &layout);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(orchestrator.run(cancel.clone()));

        Self {
            store,
            handle,
            messenger,
            recorder,
            layout,
            root,
            cancel,
            task,
        }
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Wait until every event sent so far has been dispatched
    pub async fn settle(&self) {
        self.handle.status().await.unwrap();
    }

    /// Stop the dispatcher, keeping the root folder for a restart
    pub async fn stop(self) -> TempDir {
        self.cancel.cancel();
        self.task.await.unwrap().unwrap();
        self.store.pool().close().await;
        self.root
    }

    pub async fn track(&self, id: &str) -> Track {
        self.store.get(id).await.unwrap().unwrap()
    }

    pub async fn wait_for_state(&self, id: &str, state: TrackState) -> Track {
        let deadline = Instant::now() + WAIT;
        loop {
            if let Some(track) = self.store.get(id).await.unwrap() {
                if track.state == state {
                    return track;
                }
                assert!(
                    Instant::now() < deadline,
                    "track {} stuck in {:?}, expected {:?}",
                    id,
                    track.state,
                    state
                );
            }
            assert!(Instant::now() < deadline, "track {} never created", id);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until the open approval request for `id` is recorded as sent
    pub async fn wait_for_request_sent(&self, id: &str) {
        let deadline = Instant::now() + WAIT;
        loop {
            let request = self.store.pending_request_for(id).await.unwrap();
            if request.as_ref().map(|r| r.sent_at.is_some()).unwrap_or(false) {
                return;
            }
            assert!(Instant::now() < deadline, "approval request for {} never marked sent", id);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait for failed encode/tag attempt number `attempts` to be recorded
    pub async fn wait_for_pipeline_attempts(&self, id: &str, attempts: u32) -> Track {
        let deadline = Instant::now() + WAIT;
        loop {
            let track = self.track(id).await;
            if track.pipeline_attempts == attempts {
                return track;
            }
            assert!(
                Instant::now() < deadline,
                "track {} at {:?} with {} processing attempts, expected {}",
                id,
                track.state,
                track.pipeline_attempts,
                attempts
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait for a failed attempt number `attempts` to be recorded
    pub async fn wait_for_failed_attempt(&self, id: &str, attempts: u32) -> Track {
        let deadline = Instant::now() + WAIT;
        loop {
            let track = self.track(id).await;
            if track.state == TrackState::RecordingFailed && track.recording_attempts == attempts {
                return track;
            }
            assert!(
                Instant::now() < deadline,
                "track {} at {:?} attempt {}, expected failed attempt {}",
                id,
                track.state,
                track.recording_attempts,
                attempts
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
