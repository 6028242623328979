//! ID3v2.4 tag embedding
//!
//! Writes title, artist, album, track number and a front-cover picture.
//! A cover that cannot be fetched is skipped; the text frames are still
//! written.

use async_trait::async_trait;
use id3::frame::{Picture, PictureType};
use id3::{Tag, TagLike, Version};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

use super::Tagger;
use crate::error::{OrchestratorError, Result};
use crate::models::TrackMetadata;

const COVER_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Id3Tagger {
    client: reqwest::Client,
}

impl Id3Tagger {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(COVER_FETCH_TIMEOUT)
            .build()
            .map_err(|e| OrchestratorError::Collaborator(format!("HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// Fetch cover art; `None` on any failure
    async fn fetch_cover(&self, url: &str) -> Option<Picture> {
        let response = match self.client.get(url).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                warn!(url, status = %r.status(), "Cover art fetch failed");
                return None;
            }
            Err(e) => {
                warn!(url, "Cover art fetch failed: {}", e);
                return None;
            }
        };

        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .filter(|v| v.starts_with("image/"))
            .unwrap_or("image/jpeg")
            .to_string();

        match response.bytes().await {
            Ok(data) if !data.is_empty() => Some(Picture {
                mime_type,
                picture_type: PictureType::CoverFront,
                description: "Cover".to_string(),
                data: data.to_vec(),
            }),
            Ok(_) => None,
            Err(e) => {
                warn!(url, "Cover art download failed: {}", e);
                None
            }
        }
    }
}

/// Build the tag for `metadata`, with an optional cover picture
pub fn build_tag(metadata: &TrackMetadata, cover: Option<Picture>) -> Tag {
    let mut tag = Tag::new();
    tag.set_title(metadata.title.as_str());
    tag.set_artist(metadata.artist.as_str());
    if !metadata.album.is_empty() {
        tag.set_album(metadata.album.as_str());
    }
    if let Some(number) = metadata.track_number {
        tag.set_track(number);
    }
    if let Some(picture) = cover {
        tag.add_frame(picture);
    }
    tag
}

#[async_trait]
impl Tagger for Id3Tagger {
    async fn embed_tags(&self, mp3: &Path, metadata: &TrackMetadata) -> Result<()> {
        let cover = match &metadata.cover_art_url {
            Some(url) => self.fetch_cover(url).await,
            None => None,
        };
        debug!(path = %mp3.display(), has_cover = cover.is_some(), "Writing ID3 tag");

        let tag = build_tag(metadata, cover);
        let path = mp3.to_path_buf();

        tokio::task::spawn_blocking(move || tag.write_to_path(&path, Version::Id3v24))
            .await
            .map_err(|e| OrchestratorError::Tag(format!("tag task failed: {}", e)))?
            .map_err(|e| OrchestratorError::Tag(e.to_string()))
    }
}
