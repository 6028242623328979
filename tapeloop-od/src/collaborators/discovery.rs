//! Liked-track discovery from a JSON feed
//!
//! The streaming-service client (and its token refresh) runs elsewhere and
//! publishes liked tracks as a JSON array of [`DiscoveredTrack`]. This
//! adapter polls that feed. Delivering the same tracks on every poll is
//! fine: the track store ignores ids it already knows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::debug;

use super::{DiscoveredTrack, DiscoverySource};
use crate::error::{OrchestratorError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct FeedDiscovery {
    client: reqwest::Client,
    url: String,
}

impl FeedDiscovery {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| OrchestratorError::Collaborator(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

/// Keep tracks liked strictly after `cutoff`
pub fn after_cutoff(tracks: Vec<DiscoveredTrack>, cutoff: DateTime<Utc>) -> Vec<DiscoveredTrack> {
    tracks.into_iter().filter(|t| t.added_at > cutoff).collect()
}

#[async_trait]
impl DiscoverySource for FeedDiscovery {
    async fn fetch(&self, cutoff: DateTime<Utc>) -> Result<Vec<DiscoveredTrack>> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| OrchestratorError::Collaborator(format!("discovery feed unreachable: {}", e)))?;

        if !response.status().is_success() {
            return Err(OrchestratorError::Collaborator(format!(
                "discovery feed returned {}",
                response.status()
            )));
        }

        let tracks: Vec<DiscoveredTrack> = response
            .json()
            .await
            .map_err(|e| OrchestratorError::Collaborator(format!("discovery feed malformed: {}", e)))?;

        let total = tracks.len();
        let fresh = after_cutoff(tracks, cutoff);
        debug!(total, after_cutoff = fresh.len(), "Discovery feed polled");
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_feed_entries_parse_with_flattened_metadata() {
        let json = r#"[
            {
                "track_id": "spotify:1",
                "title": "Song A",
                "artist": "Artist B",
                "album": "Album C",
                "duration_ms": 180000,
                "added_at": "2025-11-05T10:00:00Z"
            },
            {
                "track_id": "spotify:2",
                "title": "Old Song",
                "artist": "Artist B",
                "added_at": "2025-10-01T10:00:00Z"
            }
        ]"#;

        let tracks: Vec<DiscoveredTrack> = serde_json::from_str(json).unwrap();
        assert_eq!(tracks[0].metadata.duration_ms, Some(180_000));
        assert_eq!(tracks[1].metadata.album, "");

        let cutoff = Utc.with_ymd_and_hms(2025, 11, 1, 0, 0, 0).unwrap();
        let fresh = after_cutoff(tracks, cutoff);
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].track_id, "spotify:1");
    }
}
