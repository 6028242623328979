//! Sync coordinator: copy queued tracks to an attached player
//!
//! A pass is a worker task over a snapshot of the sync queue. The worker
//! never touches the track store. Before each copy it asks the dispatcher
//! to persist `in_progress` and waits for the acknowledgement; after each
//! copy it reports the outcome, and the dispatcher commits `Synced` or
//! `failed`. Detaching the device cancels the pass, and the dispatcher
//! resets whatever was `in_progress` to `not_started`. A cancelled worker
//! still removes its partial file, so no new pass starts until it reports
//! `PassFinished`.

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::collaborators::RemovableDevice;
use crate::models::{SyncManifestEntry, TrackId};
use crate::orchestrator::OrchestratorEvent;

/// Result of one entry in a pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyOutcome {
    Copied,
    /// A file with the target name already exists on the device
    AlreadyPresent,
    Failed(String),
}

/// Worker → dispatcher messages
#[derive(Debug)]
pub enum SyncProgress {
    /// Persist `in_progress` for this entry, then answer `true` to proceed
    CopyStarting {
        pass_id: Uuid,
        track_id: TrackId,
        ack: oneshot::Sender<bool>,
    },
    CopyFinished {
        pass_id: Uuid,
        track_id: TrackId,
        outcome: CopyOutcome,
    },
    PassFinished {
        pass_id: Uuid,
        interrupted: bool,
    },
}

/// Counts for the completion notification
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub copied: u32,
    pub failed: u32,
    pub skipped: u32,
}

struct ActivePass {
    pass_id: Uuid,
    cancel: CancellationToken,
    summary: PassSummary,
}

/// Which queue entries a pass includes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassScope {
    /// Everything not yet done, including entries that failed before
    All,
    /// Only entries never attempted on this attach
    NotStarted,
}

#[derive(Default)]
pub struct SyncCoordinator {
    device: Option<Arc<dyn RemovableDevice>>,
    pass: Option<ActivePass>,
    /// Cancelled passes whose worker has not finished cleaning up
    draining: HashSet<Uuid>,
    /// A full pass was requested while draining
    full_pass_deferred: bool,
}

impl SyncCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `device` for subsequent passes, cancelling any pass on a previous one
    pub fn attach(&mut self, device: Arc<dyn RemovableDevice>) {
        if let Some(previous) = &self.device {
            warn!(previous = previous.name(), new = device.name(), "Replacing attached device");
            self.cancel_pass();
        }
        info!(device = device.name(), "Device attached");
        self.device = Some(device);
    }

    /// Forget the device (only if `name` matches, when given) and cancel any
    /// pass. Returns whether a device was detached.
    pub fn detach(&mut self, name: Option<&str>) -> bool {
        let matches = match (&self.device, name) {
            (Some(device), Some(name)) => device.name() == name,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !matches {
            return false;
        }

        self.cancel_pass();
        if let Some(device) = self.device.take() {
            info!(device = device.name(), "Device detached");
        }
        true
    }

    fn cancel_pass(&mut self) {
        if let Some(pass) = self.pass.take() {
            info!(pass_id = %pass.pass_id, "Sync pass interrupted");
            pass.cancel.cancel();
            self.draining.insert(pass.pass_id);
        }
    }

    /// A cancelled worker is still running
    pub fn is_draining(&self) -> bool {
        !self.draining.is_empty()
    }

    /// Start a full pass once draining completes
    pub fn defer_full_pass(&mut self) {
        self.full_pass_deferred = true;
    }

    pub fn take_deferred_full_pass(&mut self) -> bool {
        std::mem::take(&mut self.full_pass_deferred)
    }

    /// Account for a cancelled worker's `PassFinished`. Returns true when it
    /// was the last one draining.
    pub fn drained(&mut self, pass_id: Uuid) -> bool {
        self.draining.remove(&pass_id) && self.draining.is_empty()
    }

    pub fn device_name(&self) -> Option<&str> {
        self.device.as_deref().map(|d| d.name())
    }

    pub fn is_running(&self) -> bool {
        self.pass.is_some()
    }

    pub fn is_current(&self, pass_id: Uuid) -> bool {
        self.pass.as_ref().map(|p| p.pass_id == pass_id).unwrap_or(false)
    }

    /// Spawn a pass over `entries` on the attached device.
    ///
    /// Returns `None` when no device is attached, a pass is already running,
    /// or a cancelled pass is still draining.
    pub fn start_pass(
        &mut self,
        entries: Vec<SyncManifestEntry>,
        events: mpsc::Sender<OrchestratorEvent>,
    ) -> Option<Uuid> {
        if self.pass.is_some() || self.is_draining() {
            return None;
        }
        let device = self.device.clone()?;

        let pass_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        info!(pass_id = %pass_id, device = device.name(), entries = entries.len(), "Sync pass started");

        tokio::spawn(run_pass(device, entries, pass_id, cancel.clone(), events));

        self.pass = Some(ActivePass {
            pass_id,
            cancel,
            summary: PassSummary::default(),
        });
        Some(pass_id)
    }

    /// Count an outcome against the running pass
    pub fn record(&mut self, pass_id: Uuid, outcome: &CopyOutcome) {
        if let Some(pass) = self.pass.as_mut().filter(|p| p.pass_id == pass_id) {
            match outcome {
                CopyOutcome::Copied => pass.summary.copied += 1,
                CopyOutcome::AlreadyPresent => pass.summary.skipped += 1,
                CopyOutcome::Failed(_) => pass.summary.failed += 1,
            }
        }
    }

    /// Close the running pass; `None` if `pass_id` is not the running pass
    pub fn finish(&mut self, pass_id: Uuid) -> Option<PassSummary> {
        if !self.is_current(pass_id) {
            return None;
        }
        self.pass.take().map(|pass| pass.summary)
    }
}

/// Keep the entries a pass of `scope` should copy
pub fn select_entries(entries: Vec<SyncManifestEntry>, scope: PassScope) -> Vec<SyncManifestEntry> {
    use crate::models::CopyStatus;

    entries
        .into_iter()
        .filter(|e| match scope {
            PassScope::All => e.status != CopyStatus::Done,
            PassScope::NotStarted => e.status == CopyStatus::NotStarted,
        })
        .collect()
}

async fn send(events: &mpsc::Sender<OrchestratorEvent>, progress: SyncProgress) -> bool {
    events.send(OrchestratorEvent::Sync(progress)).await.is_ok()
}

/// Worker body of one pass
pub async fn run_pass(
    device: Arc<dyn RemovableDevice>,
    entries: Vec<SyncManifestEntry>,
    pass_id: Uuid,
    cancel: CancellationToken,
    events: mpsc::Sender<OrchestratorEvent>,
) {
    let interrupted = copy_entries(device.as_ref(), entries, pass_id, &cancel, &events).await;
    send(&events, SyncProgress::PassFinished { pass_id, interrupted }).await;
}

/// Returns `true` when the pass stopped early
async fn copy_entries(
    device: &dyn RemovableDevice,
    entries: Vec<SyncManifestEntry>,
    pass_id: Uuid,
    cancel: &CancellationToken,
    events: &mpsc::Sender<OrchestratorEvent>,
) -> bool {
    if let Err(e) = device.discard_stale_partials().await {
        warn!(device = device.name(), "Could not clean partial copies: {}", e);
    }

    let present = match device.list().await {
        Ok(names) => names,
        Err(e) => {
            warn!(device = device.name(), "Could not list device: {}", e);
            return true;
        }
    };

    for entry in entries {
        if cancel.is_cancelled() {
            return true;
        }

        if present.contains(&entry.target_name) {
            debug!(track_id = %entry.track_id, name = %entry.target_name, "Already on device");
            let progress = SyncProgress::CopyFinished {
                pass_id,
                track_id: entry.track_id.clone(),
                outcome: CopyOutcome::AlreadyPresent,
            };
            if !send(events, progress).await {
                return true;
            }
            continue;
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        let starting = SyncProgress::CopyStarting {
            pass_id,
            track_id: entry.track_id.clone(),
            ack: ack_tx,
        };
        if !send(events, starting).await || !matches!(ack_rx.await, Ok(true)) {
            return true;
        }

        let copied = tokio::select! {
            _ = cancel.cancelled() => None,
            result = async {
                device.copy(&entry.local_path, &entry.target_name).await?;
                device.flush(&entry.target_name).await
            } => Some(result),
        };

        let outcome = match copied {
            None => {
                if let Err(e) = device.discard_partial(&entry.target_name).await {
                    debug!(track_id = %entry.track_id, "Partial copy left behind: {}", e);
                }
                return true;
            }
            Some(Ok(())) => {
                info!(track_id = %entry.track_id, name = %entry.target_name, "Copied to device");
                CopyOutcome::Copied
            }
            Some(Err(e)) => {
                warn!(track_id = %entry.track_id, "Copy failed: {}", e);
                if let Err(e) = device.discard_partial(&entry.target_name).await {
                    debug!(track_id = %entry.track_id, "Partial copy left behind: {}", e);
                }
                CopyOutcome::Failed(e.to_string())
            }
        };

        let finished = SyncProgress::CopyFinished {
            pass_id,
            track_id: entry.track_id.clone(),
            outcome,
        };
        if !send(events, finished).await {
            return true;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::volume::VolumeDevice;
    use crate::models::CopyStatus;
    use std::path::PathBuf;

    fn entry(id: &str, source: PathBuf, name: &str, status: CopyStatus) -> SyncManifestEntry {
        SyncManifestEntry {
            track_id: id.to_string(),
            local_path: source,
            target_name: name.to_string(),
            status,
            retry_count: 0,
            queued_seq: 1,
            last_error: None,
        }
    }

    #[test]
    fn test_scope_filters_entries() {
        let entries = vec![
            entry("a", PathBuf::from("/a"), "A.mp3", CopyStatus::NotStarted),
            entry("b", PathBuf::from("/b"), "B.mp3", CopyStatus::Failed),
        ];
        assert_eq!(select_entries(entries.clone(), PassScope::All).len(), 2);
        let fresh = select_entries(entries, PassScope::NotStarted);
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].track_id, "a");
    }

    #[tokio::test]
    async fn test_pass_copies_and_skips_existing() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("song.mp3");
        std::fs::write(&source, b"mp3").unwrap();
        let mount = dir.path().join("PLAYER");
        std::fs::create_dir_all(mount.join("Music")).unwrap();
        std::fs::write(mount.join("Music").join("Old - Song.mp3"), b"old").unwrap();

        let device: Arc<dyn RemovableDevice> =
            Arc::new(VolumeDevice::open(&mount, &["Music".to_string()]).unwrap());
        let entries = vec![
            entry("old", source.clone(), "Old - Song.mp3", CopyStatus::NotStarted),
            entry("new", source.clone(), "Artist B - Song A.mp3", CopyStatus::NotStarted),
        ];

        let (tx, mut rx) = mpsc::channel(16);
        let pass_id = Uuid::new_v4();
        let worker = tokio::spawn(run_pass(device, entries, pass_id, CancellationToken::new(), tx));

        let mut outcomes = Vec::new();
        while let Some(OrchestratorEvent::Sync(progress)) = rx.recv().await {
            match progress {
                SyncProgress::CopyStarting { ack, .. } => {
                    ack.send(true).unwrap();
                }
                SyncProgress::CopyFinished { track_id, outcome, .. } => {
                    outcomes.push((track_id, outcome));
                }
                SyncProgress::PassFinished { interrupted, .. } => {
                    assert!(!interrupted);
                    break;
                }
            }
        }
        worker.await.unwrap();

        assert_eq!(
            outcomes,
            vec![
                ("old".to_string(), CopyOutcome::AlreadyPresent),
                ("new".to_string(), CopyOutcome::Copied),
            ]
        );
        assert!(mount.join("Music").join("Artist B - Song A.mp3").exists());
    }

    #[tokio::test]
    async fn test_replacement_waits_for_cancelled_pass() {
        let dir = tempfile::tempdir().unwrap();
        let mount = dir.path().join("PLAYER");
        std::fs::create_dir(&mount).unwrap();
        let open = || -> Arc<dyn RemovableDevice> {
            Arc::new(VolumeDevice::open(&mount, &["Music".to_string()]).unwrap())
        };

        let (tx, _rx) = mpsc::channel(16);
        let mut sync = SyncCoordinator::new();
        sync.attach(open());
        let first = sync.start_pass(Vec::new(), tx.clone()).unwrap();

        sync.attach(open());
        assert!(!sync.is_running());
        assert!(sync.is_draining());
        assert!(!sync.is_current(first));
        assert!(sync.start_pass(Vec::new(), tx.clone()).is_none());
        sync.defer_full_pass();

        assert!(!sync.drained(Uuid::new_v4()));
        assert!(sync.drained(first));
        assert!(!sync.is_draining());
        assert!(sync.take_deferred_full_pass());
        assert!(!sync.take_deferred_full_pass());

        let second = sync.start_pass(Vec::new(), tx).unwrap();
        assert!(sync.is_current(second));
    }

    #[tokio::test]
    async fn test_refused_ack_stops_pass() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("song.mp3");
        std::fs::write(&source, b"mp3").unwrap();
        let mount = dir.path().join("PLAYER");
        std::fs::create_dir(&mount).unwrap();

        let device: Arc<dyn RemovableDevice> =
            Arc::new(VolumeDevice::open(&mount, &["Music".to_string()]).unwrap());
        let entries = vec![entry("t1", source, "A - B.mp3", CopyStatus::NotStarted)];

        let (tx, mut rx) = mpsc::channel(16);
        tokio::spawn(run_pass(device, entries, Uuid::new_v4(), CancellationToken::new(), tx));

        match rx.recv().await {
            Some(OrchestratorEvent::Sync(SyncProgress::CopyStarting { ack, .. })) => {
                ack.send(false).unwrap()
            }
            other => panic!("unexpected {:?}", other.is_some()),
        }
        match rx.recv().await {
            Some(OrchestratorEvent::Sync(SyncProgress::PassFinished { interrupted, .. })) => {
                assert!(interrupted)
            }
            other => panic!("unexpected {:?}", other.is_some()),
        }
        assert!(!mount.join("Music").join("A - B.mp3").exists());
    }
}
