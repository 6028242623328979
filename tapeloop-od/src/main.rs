//! tapeloop-od - Main entry point
//!
//! `run` starts the dispatcher, the background pollers and the HTTP
//! surface. `status` and `stuck` open the database read-only and print.
//! `retry` and `retry-all` ask the running daemon to requeue failed
//! recordings over its HTTP surface.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use tokio::signal;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tapeloop_common::config::{
    load_toml_or_default, resolve_config_path, resolve_root_folder, LoggingConfig, RootLayout,
};
use tapeloop_od::collaborators::command::{CommandEncoder, CommandRecorder};
use tapeloop_od::collaborators::connectivity::SsidProbe;
use tapeloop_od::collaborators::discovery::FeedDiscovery;
use tapeloop_od::collaborators::id3_tagger::Id3Tagger;
use tapeloop_od::collaborators::volume::VolumeWatcher;
use tapeloop_od::collaborators::webhook::{LogMessenger, WebhookMessenger};
use tapeloop_od::collaborators::Messenger;
use tapeloop_od::config::TomlConfig;
use tapeloop_od::db::TrackStore;
use tapeloop_od::models::{Track, TrackState};
use tapeloop_od::orchestrator::pollers;
use tapeloop_od::{build_router, AppState, Collaborators, Orchestrator};

/// Command-line arguments for tapeloop-od
#[derive(Parser, Debug)]
#[command(name = "tapeloop-od")]
#[command(about = "Records liked tracks after chat approval and syncs them to an MP3 player")]
#[command(version)]
struct Cli {
    /// TOML config file (overrides TAPELOOP_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Folder holding the database, captures and library (overrides TAPELOOP_ROOT_FOLDER)
    #[arg(long, global = true)]
    root_folder: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon (default)
    Run {
        /// Address for the HTTP surface
        #[arg(long, env = "TAPELOOP_BIND")]
        bind: Option<String>,
    },
    /// Print per-state track counts
    Status,
    /// List tracks that need attention
    Stuck,
    /// Send one failed recording back for approval
    Retry {
        track_id: String,

        /// Address of the running daemon
        #[arg(long, env = "TAPELOOP_BIND")]
        bind: Option<String>,
    },
    /// Send every failed recording back for approval
    RetryAll {
        /// Address of the running daemon
        #[arg(long, env = "TAPELOOP_BIND")]
        bind: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = resolve_config_path(cli.config.as_deref());
    let config: TomlConfig =
        load_toml_or_default(&config_path).context("Failed to load configuration")?;
    init_tracing(&config.logging);

    let root = resolve_root_folder(cli.root_folder.as_deref(), config.root_folder.as_deref());
    let layout = RootLayout::new(root);

    match cli.command.unwrap_or(Command::Run { bind: None }) {
        Command::Run { bind } => run_daemon(config, layout, bind).await,
        Command::Status => print_status(&layout).await,
        Command::Stuck => print_stuck(&layout).await,
        Command::Retry { track_id, bind } => {
            let bind = bind.unwrap_or_else(|| config.server.bind.clone());
            let track: Track = post_to_daemon(&bind, &["tracks", &track_id, "requeue"]).await?;
            println!("{:<18} {}  {}", track.state.as_str(), track.id, track.display_name());
            Ok(())
        }
        Command::RetryAll { bind } => {
            let bind = bind.unwrap_or_else(|| config.server.bind.clone());
            let tracks: Vec<Track> = post_to_daemon(&bind, &["tracks", "retry-all"]).await?;
            if tracks.is_empty() {
                println!("No failed recordings to retry.");
            }
            for track in tracks {
                println!("{:<18} {}  {}", track.state.as_str(), track.id, track.display_name());
            }
            Ok(())
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run_daemon(config: TomlConfig, layout: RootLayout, bind: Option<String>) -> Result<()> {
    info!("Starting tapeloop-od v{}", env!("CARGO_PKG_VERSION"));
    info!("Root folder: {}", layout.root.display());

    layout
        .ensure_directories()
        .context("Failed to initialize root folder")?;
    let store = TrackStore::open(&layout.database_path())
        .await
        .context("Failed to open track store")?;

    let messenger: Arc<dyn Messenger> = match &config.messaging.webhook_url {
        Some(url) => Arc::new(
            WebhookMessenger::new(url.clone()).context("Failed to build webhook messenger")?,
        ),
        None => {
            warn!("No messaging.webhook_url configured; notifications are only logged");
            Arc::new(LogMessenger)
        }
    };
    let collaborators = Collaborators {
        messenger,
        recorder: Arc::new(CommandRecorder::new(&config.recording)),
        encoder: Arc::new(CommandEncoder::new(&config.pipeline)),
        tagger: Arc::new(Id3Tagger::new().context("Failed to build tagger")?),
    };

    let (orchestrator, handle) = Orchestrator::new(store, collaborators, &config, &layout);
    let cancel = CancellationToken::new();

    let (online_tx, online_rx) = watch::channel(true);
    let mut background = vec![
        pollers::spawn_ticker(handle.clone(), config.scheduler.tick_interval(), cancel.clone()),
        pollers::spawn_connectivity(
            Arc::new(SsidProbe::new(config.network.target_ssid.clone())),
            config.network.probe_interval(),
            online_tx,
            handle.clone(),
            cancel.clone(),
        ),
        pollers::spawn_volume_watcher(
            VolumeWatcher::new(config.sync.volume_roots.clone()),
            config.sync.music_folder_names.clone(),
            config.sync.volume_poll_interval(),
            handle.clone(),
            cancel.clone(),
        ),
    ];
    match &config.discovery.feed_url {
        Some(url) => {
            let source = FeedDiscovery::new(url.clone()).context("Failed to build discovery client")?;
            background.push(pollers::spawn_discovery(
                Arc::new(source),
                config.discovery.cutoff,
                config.discovery.poll_interval(),
                online_rx,
                handle.clone(),
                cancel.clone(),
            ));
        }
        None => info!("No discovery.feed_url configured; tracks arrive via POST /tracks only"),
    }

    // A fatal store error stops the dispatcher, which takes the server down too
    let dispatcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let result = orchestrator.run(cancel.clone()).await;
            cancel.cancel();
            result
        })
    };

    let app = build_router(AppState::new(handle, config.sync.music_folder_names.clone()));
    let bind = bind.unwrap_or_else(|| config.server.bind.clone());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind to {}", bind))?;
    info!("Listening on http://{}", bind);

    let server_cancel = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown_signal() => {}
                _ = server_cancel.cancelled() => {}
            }
        })
        .await
        .context("Server error")?;

    cancel.cancel();
    for task in background {
        let _ = task.await;
    }
    dispatcher
        .await
        .context("Dispatcher task failed")?
        .context("Orchestrator stopped on a track store failure")?;

    info!("Shutdown complete");
    Ok(())
}

async fn print_status(layout: &RootLayout) -> Result<()> {
    let pool = tapeloop_common::db::open_existing(&layout.database_path())
        .await
        .context("Failed to open database")?;
    let store = TrackStore::read_only(pool);
    let counts = store.counts_by_state().await.context("Failed to read track counts")?;

    for state in TrackState::ALL {
        println!("{:<18} {}", state.as_str(), counts.get(state));
    }
    println!("{:<18} {}", "total", counts.total());
    Ok(())
}

async fn print_stuck(layout: &RootLayout) -> Result<()> {
    let pool = tapeloop_common::db::open_existing(&layout.database_path())
        .await
        .context("Failed to open database")?;
    let store = TrackStore::read_only(pool);
    let stuck = store.stuck().await.context("Failed to list stuck tracks")?;

    if stuck.is_empty() {
        println!("Nothing stuck.");
        return Ok(());
    }
    for track in stuck {
        println!(
            "{:<18} {}  {}  (recording attempts {}, processing attempts {})",
            track.state.as_str(),
            track.id,
            track.display_name(),
            track.recording_attempts,
            track.pipeline_attempts
        );
        if let Some(error) = &track.last_error {
            println!("{:<18} last error: {}", "", error);
        }
    }
    Ok(())
}

/// POST to the running daemon and decode its JSON answer
async fn post_to_daemon<T: DeserializeOwned>(bind: &str, segments: &[&str]) -> Result<T> {
    let mut url = reqwest::Url::parse(&format!("http://{}/", bind))
        .with_context(|| format!("Invalid daemon address {}", bind))?;
    url.path_segments_mut()
        .map_err(|_| anyhow!("Invalid daemon address {}", bind))?
        .pop_if_empty()
        .extend(segments);

    let response = reqwest::Client::new()
        .post(url.clone())
        .send()
        .await
        .with_context(|| format!("Daemon not reachable at {}", url))?;

    let status = response.status();
    if !status.is_success() {
        let body: serde_json::Value = response.json().await.unwrap_or_default();
        let message = body["error"]["message"].as_str().unwrap_or("request failed");
        bail!("{}: {}", status, message);
    }
    response.json().await.context("Unreadable daemon response")
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Ctrl+C handler unavailable: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
