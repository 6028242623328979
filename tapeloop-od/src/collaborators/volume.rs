//! Filesystem-backed removable storage
//!
//! A player shows up as a mounted directory. [`VolumeWatcher`] notices
//! directories appearing and disappearing under the configured roots
//! (`/media/<user>/<label>` and `/mnt/<label>` layouts both work);
//! [`VolumeDevice`] is the device handle handed to the sync coordinator.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::RemovableDevice;
use crate::error::{OrchestratorError, Result};
use crate::services::naming;

/// A mounted player's music folder
#[derive(Debug, Clone)]
pub struct VolumeDevice {
    name: String,
    mount_point: PathBuf,
    music_dir: PathBuf,
}

impl VolumeDevice {
    /// Open `mount_point`, using the first existing folder from
    /// `folder_names` or creating the first one.
    pub fn open(mount_point: &Path, folder_names: &[String]) -> Result<Self> {
        if !mount_point.is_dir() {
            return Err(OrchestratorError::SyncCopyFailed(format!(
                "{} is not a directory",
                mount_point.display()
            )));
        }

        let existing = folder_names
            .iter()
            .map(|name| mount_point.join(name))
            .find(|candidate| candidate.is_dir());

        let music_dir = match existing {
            Some(dir) => dir,
            None => {
                let default = folder_names.first().map(String::as_str).unwrap_or("Music");
                let dir = mount_point.join(default);
                std::fs::create_dir_all(&dir)?;
                info!(dir = %dir.display(), "Created music folder on device");
                dir
            }
        };

        Ok(Self {
            name: volume_name(mount_point),
            mount_point: mount_point.to_path_buf(),
            music_dir,
        })
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    pub fn music_dir(&self) -> &Path {
        &self.music_dir
    }

    fn copy_error(&self, what: &str, e: std::io::Error) -> OrchestratorError {
        OrchestratorError::SyncCopyFailed(format!("{} on {}: {}", what, self.name, e))
    }
}

#[async_trait]
impl RemovableDevice for VolumeDevice {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list(&self) -> Result<HashSet<String>> {
        let mut entries = tokio::fs::read_dir(&self.music_dir)
            .await
            .map_err(|e| self.copy_error("listing", e))?;

        let mut names = HashSet::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| self.copy_error("listing", e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.to_lowercase().ends_with(".mp3") && !naming::is_partial_name(&name) {
                names.insert(name);
            }
        }
        Ok(names)
    }

    async fn copy(&self, source: &Path, target_name: &str) -> Result<()> {
        let partial = self.music_dir.join(naming::partial_name(target_name));

        let mut reader = tokio::fs::File::open(source)
            .await
            .map_err(|e| self.copy_error(&format!("opening {}", source.display()), e))?;
        let mut writer = tokio::fs::File::create(&partial)
            .await
            .map_err(|e| self.copy_error("creating temp file", e))?;

        tokio::io::copy(&mut reader, &mut writer)
            .await
            .map_err(|e| self.copy_error("copying", e))?;
        writer.flush().await.map_err(|e| self.copy_error("copying", e))?;
        Ok(())
    }

    async fn flush(&self, target_name: &str) -> Result<()> {
        let partial = self.music_dir.join(naming::partial_name(target_name));
        let target = self.music_dir.join(target_name);

        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&partial)
            .await
            .map_err(|e| self.copy_error("reopening temp file", e))?;
        file.sync_all().await.map_err(|e| self.copy_error("syncing", e))?;
        drop(file);

        tokio::fs::rename(&partial, &target)
            .await
            .map_err(|e| self.copy_error("renaming", e))?;

        // Persist the rename itself
        if let Ok(dir) = tokio::fs::File::open(&self.music_dir).await {
            let _ = dir.sync_all().await;
        }
        Ok(())
    }

    async fn discard_partial(&self, target_name: &str) -> Result<()> {
        let partial = self.music_dir.join(naming::partial_name(target_name));
        match tokio::fs::remove_file(&partial).await {
            Ok(()) => {
                debug!(file = %partial.display(), "Discarded partial copy");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.copy_error("removing temp file", e)),
        }
    }

    async fn discard_stale_partials(&self) -> Result<usize> {
        let mut entries = tokio::fs::read_dir(&self.music_dir)
            .await
            .map_err(|e| self.copy_error("listing", e))?;

        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| self.copy_error("listing", e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if naming::is_partial_name(&name) {
                match tokio::fs::remove_file(entry.path()).await {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(file = %name, "Failed to remove stale partial copy: {}", e),
                }
            }
        }

        if removed > 0 {
            info!(device = %self.name, removed, "Discarded stale partial copies");
        }
        Ok(removed)
    }
}

/// Device name of a mount point: its last path component
pub fn volume_name(mount_point: &Path) -> String {
    mount_point
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| mount_point.display().to_string())
}

/// Attach/detach observed between two polls
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeChange {
    Attached(PathBuf),
    Detached(PathBuf),
}

/// Polls volume roots for mounted directories.
///
/// Directories present at the first poll are reported as attached too.
pub struct VolumeWatcher {
    roots: Vec<PathBuf>,
    known: BTreeSet<PathBuf>,
}

impl VolumeWatcher {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self {
            roots,
            known: BTreeSet::new(),
        }
    }

    pub fn poll(&mut self) -> Vec<VolumeChange> {
        let current: BTreeSet<PathBuf> = self.roots.iter().flat_map(|r| scan_root(r)).collect();

        let mut changes: Vec<VolumeChange> = self
            .known
            .difference(&current)
            .cloned()
            .map(VolumeChange::Detached)
            .collect();
        changes.extend(
            current
                .difference(&self.known)
                .cloned()
                .map(VolumeChange::Attached),
        );

        self.known = current;
        changes
    }
}

/// Mount points below `root`: its subdirectories, or for a per-user layout
/// (`/media/<user>/<label>`) the subdirectories of those.
fn scan_root(root: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(root) else {
        return Vec::new();
    };

    let mut mounts = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() || is_hidden(&path) {
            continue;
        }
        if is_user_dir(root, &path) {
            if let Ok(inner) = std::fs::read_dir(&path) {
                mounts.extend(
                    inner
                        .flatten()
                        .map(|e| e.path())
                        .filter(|p| p.is_dir() && !is_hidden(p)),
                );
            }
        } else {
            mounts.push(path);
        }
    }
    mounts
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().starts_with('.'))
        .unwrap_or(false)
}

/// `/media/<current user>` holds mounts rather than being one
fn is_user_dir(root: &Path, path: &Path) -> bool {
    if root != Path::new("/media") && root != Path::new("/run/media") {
        return false;
    }
    match std::env::var("USER") {
        Ok(user) => path.file_name().map(|n| n == user.as_str()).unwrap_or(false),
        Err(_) => false,
    }
}
