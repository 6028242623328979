//! Bootstrap configuration loading and root folder resolution
//!
//! Every setting follows the same priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file
//! 4. OS-dependent compiled default (fallback)

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable naming the root folder
pub const ROOT_FOLDER_ENV: &str = "TAPELOOP_ROOT_FOLDER";

/// Environment variable naming the TOML config file
pub const CONFIG_FILE_ENV: &str = "TAPELOOP_CONFIG";

/// Logging configuration shared by every binary
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is unset (e.g. "info", "tapeloop_od=debug")
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolve the root folder holding the database, captures and library.
///
/// `toml_value` is the `root_folder` entry of an already-parsed config file.
pub fn resolve_root_folder(cli_arg: Option<&Path>, toml_value: Option<&Path>) -> PathBuf {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        debug!("Root folder from command line: {}", path.display());
        return path.to_path_buf();
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(ROOT_FOLDER_ENV) {
        if !path.trim().is_empty() {
            debug!("Root folder from {}: {}", ROOT_FOLDER_ENV, path);
            return PathBuf::from(path);
        }
    }

    // Priority 3: TOML config file
    if let Some(path) = toml_value {
        debug!("Root folder from config file: {}", path.display());
        return path.to_path_buf();
    }

    // Priority 4: OS-dependent compiled default
    default_root_folder()
}

/// Resolve which TOML file to read (CLI > env > per-user default).
///
/// The returned path may not exist; [`load_toml_or_default`] treats a
/// missing file as "all defaults".
pub fn resolve_config_path(cli_arg: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    default_config_path()
}

/// Per-user config file location (~/.config/tapeloop/config.toml on Linux)
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("tapeloop").join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("/etc/tapeloop/config.toml"))
}

/// Get OS-dependent default root folder path
pub fn default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        // ~/.local/share/tapeloop (or /var/lib/tapeloop for system-wide)
        dirs::data_local_dir()
            .map(|d| d.join("tapeloop"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/tapeloop"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("tapeloop"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/tapeloop"))
    } else {
        dirs::data_local_dir()
            .map(|d| d.join("tapeloop"))
            .unwrap_or_else(|| PathBuf::from("./tapeloop_data"))
    }
}

/// Parse a TOML config file, returning `T::default()` when the file is absent.
///
/// A file that exists but does not parse is an error: silently running with
/// defaults would hide a typo in e.g. the authorised sender list.
pub fn load_toml_or_default<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    if !path.exists() {
        info!("No config file at {}, using built-in defaults", path.display());
        return Ok(T::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;

    let config = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?;

    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

/// Standard layout below the root folder
#[derive(Debug, Clone)]
pub struct RootLayout {
    pub root: PathBuf,
}

impl RootLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// SQLite database holding the track store
    pub fn database_path(&self) -> PathBuf {
        self.root.join("tapeloop.db")
    }

    /// Raw captures, one file per track id
    pub fn captures_dir(&self) -> PathBuf {
        self.root.join("captures")
    }

    /// Encoded and tagged MP3 files awaiting or done with sync
    pub fn library_dir(&self) -> PathBuf {
        self.root.join("library")
    }

    /// Create the root folder and its subdirectories if missing
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [self.root.clone(), self.captures_dir(), self.library_dir()] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_log_level() {
        assert_eq!(LoggingConfig::default().level, "info");
    }

    #[test]
    fn test_root_layout_paths() {
        let layout = RootLayout::new("/data/tapeloop");
        assert_eq!(layout.database_path(), PathBuf::from("/data/tapeloop/tapeloop.db"));
        assert_eq!(layout.captures_dir(), PathBuf::from("/data/tapeloop/captures"));
        assert_eq!(layout.library_dir(), PathBuf::from("/data/tapeloop/library"));
    }

    #[test]
    fn test_default_root_folder_not_empty() {
        assert!(!default_root_folder().as_os_str().is_empty());
    }
}
