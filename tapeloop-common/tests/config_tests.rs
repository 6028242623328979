//! Configuration resolution tests
//!
//! Environment variables are process-global, so every test touching them
//! runs under `#[serial]`.

use serde::Deserialize;
use serial_test::serial;
use std::path::{Path, PathBuf};
use tapeloop_common::config::{
    load_toml_or_default, resolve_config_path, resolve_root_folder, LoggingConfig,
    CONFIG_FILE_ENV, ROOT_FOLDER_ENV,
};
use tempfile::TempDir;

#[derive(Debug, Default, Deserialize)]
struct SampleConfig {
    root_folder: Option<PathBuf>,
    #[serde(default)]
    logging: LoggingConfig,
}

#[test]
#[serial]
fn test_cli_argument_wins_over_env_and_toml() {
    std::env::set_var(ROOT_FOLDER_ENV, "/from/env");

    let resolved = resolve_root_folder(Some(Path::new("/from/cli")), Some(Path::new("/from/toml")));
    assert_eq!(resolved, PathBuf::from("/from/cli"));

    std::env::remove_var(ROOT_FOLDER_ENV);
}

#[test]
#[serial]
fn test_env_wins_over_toml() {
    std::env::set_var(ROOT_FOLDER_ENV, "/from/env");

    let resolved = resolve_root_folder(None, Some(Path::new("/from/toml")));
    assert_eq!(resolved, PathBuf::from("/from/env"));

    std::env::remove_var(ROOT_FOLDER_ENV);
}

#[test]
#[serial]
fn test_toml_used_when_no_cli_or_env() {
    std::env::remove_var(ROOT_FOLDER_ENV);

    let resolved = resolve_root_folder(None, Some(Path::new("/from/toml")));
    assert_eq!(resolved, PathBuf::from("/from/toml"));
}

#[test]
#[serial]
fn test_falls_back_to_os_default() {
    std::env::remove_var(ROOT_FOLDER_ENV);

    let resolved = resolve_root_folder(None, None);
    assert!(resolved.ends_with("tapeloop") || resolved.ends_with("tapeloop_data"));
}

#[test]
#[serial]
fn test_config_path_from_env() {
    std::env::set_var(CONFIG_FILE_ENV, "/etc/custom.toml");
    assert_eq!(resolve_config_path(None), PathBuf::from("/etc/custom.toml"));
    std::env::remove_var(CONFIG_FILE_ENV);
}

#[test]
fn test_missing_file_yields_defaults() {
    let dir = TempDir::new().unwrap();
    let config: SampleConfig = load_toml_or_default(&dir.path().join("absent.toml")).unwrap();

    assert!(config.root_folder.is_none());
    assert_eq!(config.logging.level, "info");
}

#[test]
fn test_file_values_are_parsed() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        "root_folder = \"/srv/tapeloop\"\n\n[logging]\nlevel = \"debug\"\n",
    )
    .unwrap();

    let config: SampleConfig = load_toml_or_default(&path).unwrap();
    assert_eq!(config.root_folder, Some(PathBuf::from("/srv/tapeloop")));
    assert_eq!(config.logging.level, "debug");
}

#[test]
fn test_malformed_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "root_folder = [unterminated").unwrap();

    let result: tapeloop_common::Result<SampleConfig> = load_toml_or_default(&path);
    let err = result.unwrap_err().to_string();
    assert!(err.contains("Configuration error"));
}
