//! Control endpoints: status, sync, discovery push, chat replies, devices

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tapeloop_common::InboundMessage;
use tracing::info;

use super::AppState;
use crate::collaborators::volume::VolumeDevice;
use crate::collaborators::{DiscoveredTrack, RemovableDevice};
use crate::error::{ApiError, ApiResult};
use crate::models::Track;
use crate::orchestrator::{StatusReport, SyncTrigger};

#[derive(Debug, Serialize)]
pub struct Accepted {
    pub accepted: usize,
}

#[derive(Debug, Deserialize)]
pub struct AttachRequest {
    /// Mount point of the player
    pub path: PathBuf,
}

#[derive(Debug, Serialize)]
pub struct AttachResponse {
    pub device: String,
    pub music_dir: PathBuf,
}

/// GET /status
pub async fn get_status(State(state): State<AppState>) -> ApiResult<Json<StatusReport>> {
    Ok(Json(state.handle.status().await?))
}

/// POST /sync
///
/// Starts a pass over every unfinished manifest entry. Answers 409 while a
/// pass is running and 404 when no device is attached.
pub async fn force_sync(
    State(state): State<AppState>,
) -> ApiResult<(StatusCode, Json<SyncTrigger>)> {
    let trigger = state.handle.force_sync().await?;
    let status = match trigger {
        SyncTrigger::Started { .. } | SyncTrigger::Deferred => StatusCode::ACCEPTED,
        SyncTrigger::AlreadyRunning => StatusCode::CONFLICT,
        SyncTrigger::NoDevice => StatusCode::NOT_FOUND,
    };
    Ok((status, Json(trigger)))
}

/// POST /messages
pub async fn post_message(
    State(state): State<AppState>,
    Json(message): Json<InboundMessage>,
) -> ApiResult<(StatusCode, Json<Accepted>)> {
    state.handle.inbound(message).await?;
    Ok((StatusCode::ACCEPTED, Json(Accepted { accepted: 1 })))
}

/// POST /devices
pub async fn attach_device(
    State(state): State<AppState>,
    Json(request): Json<AttachRequest>,
) -> ApiResult<(StatusCode, Json<AttachResponse>)> {
    let device = VolumeDevice::open(&request.path, &state.music_folder_names)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let response = AttachResponse {
        device: device.name().to_string(),
        music_dir: device.music_dir().to_path_buf(),
    };
    info!(device = %response.device, "Device attached over HTTP");

    state.handle.device_attached(Arc::new(device)).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// DELETE /devices
pub async fn detach_device(State(state): State<AppState>) -> ApiResult<StatusCode> {
    state.handle.device_detached(None).await?;
    Ok(StatusCode::ACCEPTED)
}

/// POST /recording/ended
pub async fn recording_ended(State(state): State<AppState>) -> ApiResult<StatusCode> {
    state.handle.recording_ended().await?;
    Ok(StatusCode::ACCEPTED)
}

pub fn control_routes() -> Router<AppState> {
    Router::new()
        .route("/status", get(get_status))
        .route("/sync", post(force_sync))
        .route("/messages", post(post_message))
        .route("/devices", post(attach_device).delete(detach_device))
        .route("/recording/ended", post(recording_ended))
}

/// POST /tracks
pub async fn post_tracks(
    State(state): State<AppState>,
    Json(tracks): Json<Vec<DiscoveredTrack>>,
) -> ApiResult<(StatusCode, Json<Accepted>)> {
    let accepted = tracks.len();
    state.handle.discovered(tracks).await?;
    Ok((StatusCode::ACCEPTED, Json(Accepted { accepted })))
}

/// POST /tracks/:id/abandon
pub async fn abandon_track(
    State(state): State<AppState>,
    Path(track_id): Path<String>,
) -> ApiResult<Json<Track>> {
    Ok(Json(state.handle.abandon(track_id).await?))
}

/// POST /tracks/:id/requeue
pub async fn requeue_track(
    State(state): State<AppState>,
    Path(track_id): Path<String>,
) -> ApiResult<Json<Track>> {
    Ok(Json(state.handle.requeue(track_id).await?))
}

/// POST /tracks/retry-all
pub async fn requeue_failed(State(state): State<AppState>) -> ApiResult<Json<Vec<Track>>> {
    Ok(Json(state.handle.requeue_all().await?))
}

pub fn track_routes() -> Router<AppState> {
    Router::new()
        .route("/tracks", post(post_tracks))
        .route("/tracks/retry-all", post(requeue_failed))
        .route("/tracks/:id/abandon", post(abandon_track))
        .route("/tracks/:id/requeue", post(requeue_track))
}
