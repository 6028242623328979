//! Background producers feeding the dispatcher
//!
//! Each poller is a task that owns its collaborator, polls on an interval
//! and forwards what it sees through the handle. All of them stop on the
//! shared cancellation token or when the dispatcher goes away.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::OrchestratorHandle;
use crate::collaborators::volume::{volume_name, VolumeChange, VolumeDevice, VolumeWatcher};
use crate::collaborators::{ConnectivityProbe, DiscoverySource};

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Periodic retry/backlog tick
pub fn spawn_ticker(
    handle: OrchestratorHandle,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = ticker(period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticks.tick() => {
                    if handle.tick().await.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("Tick poller stopped");
    })
}

/// Poll the discovery source while online
pub fn spawn_discovery(
    source: Arc<dyn DiscoverySource>,
    cutoff: DateTime<Utc>,
    period: Duration,
    online: watch::Receiver<bool>,
    handle: OrchestratorHandle,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = ticker(period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticks.tick() => {}
            }

            if !*online.borrow() {
                debug!("Offline; discovery poll skipped");
                continue;
            }

            match source.fetch(cutoff).await {
                Ok(tracks) if tracks.is_empty() => {}
                Ok(tracks) => {
                    debug!(count = tracks.len(), "Discovery poll returned tracks");
                    if handle.discovered(tracks).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Discovery poll failed: {}", e),
            }
        }
        debug!("Discovery poller stopped");
    })
}

/// Probe connectivity; changes go to the dispatcher and to `online_tx`
pub fn spawn_connectivity(
    probe: Arc<dyn ConnectivityProbe>,
    period: Duration,
    online_tx: watch::Sender<bool>,
    handle: OrchestratorHandle,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = ticker(period);
        let mut last = None;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticks.tick() => {}
            }

            let online = probe.is_online().await;
            if last == Some(online) {
                continue;
            }
            last = Some(online);
            online_tx.send_replace(online);
            if handle.connectivity_changed(online).await.is_err() {
                break;
            }
        }
        debug!("Connectivity poller stopped");
    })
}

/// Turn mount/unmount of volumes below the configured roots into device events
pub fn spawn_volume_watcher(
    mut watcher: VolumeWatcher,
    folder_names: Vec<String>,
    period: Duration,
    handle: OrchestratorHandle,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = ticker(period);
        'poll: loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticks.tick() => {}
            }

            for change in watcher.poll() {
                let sent = match change {
                    VolumeChange::Attached(path) => match VolumeDevice::open(&path, &folder_names) {
                        Ok(device) => {
                            info!(mount = %path.display(), "Volume mounted");
                            handle.device_attached(Arc::new(device)).await
                        }
                        Err(e) => {
                            warn!(mount = %path.display(), "Volume not usable as a player: {}", e);
                            Ok(())
                        }
                    },
                    VolumeChange::Detached(path) => {
                        info!(mount = %path.display(), "Volume removed");
                        handle.device_detached(Some(volume_name(&path))).await
                    }
                };
                if sent.is_err() {
                    break 'poll;
                }
            }
        }
        debug!("Volume watcher stopped");
    })
}
