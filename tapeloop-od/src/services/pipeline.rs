//! Post-processing: raw capture to tagged MP3 in the local library
//!
//! Each step's output is checked (exists, non-empty) before the next runs.
//! The raw capture is never touched here; the dispatcher deletes it only
//! after the `Tagged` transition is committed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use super::naming;
use crate::collaborators::{Encoder, Tagger};
use crate::error::{OrchestratorError, Result};
use crate::models::Track;

pub struct PipelineAdapter {
    encoder: Arc<dyn Encoder>,
    tagger: Arc<dyn Tagger>,
    library_dir: PathBuf,
}

impl PipelineAdapter {
    pub fn new(encoder: Arc<dyn Encoder>, tagger: Arc<dyn Tagger>, library_dir: PathBuf) -> Self {
        Self {
            encoder,
            tagger,
            library_dir,
        }
    }

    /// Library path the track's MP3 is written to
    pub fn output_path(&self, track: &Track) -> PathBuf {
        self.library_dir.join(naming::target_name(&track.metadata))
    }

    /// Encode then tag; returns the finished library file
    pub async fn process(&self, track: &Track, raw_capture: &Path) -> Result<PathBuf> {
        non_empty(raw_capture)
            .await
            .map_err(|e| OrchestratorError::Encode(format!("raw capture unusable: {}", e)))?;

        tokio::fs::create_dir_all(&self.library_dir).await?;
        let output = self.output_path(track);

        self.encoder.encode(raw_capture, &output).await?;
        non_empty(&output)
            .await
            .map_err(|e| OrchestratorError::Encode(format!("encoder output unusable: {}", e)))?;

        self.tagger.embed_tags(&output, &track.metadata).await?;
        non_empty(&output)
            .await
            .map_err(|e| OrchestratorError::Tag(format!("tagged file unusable: {}", e)))?;

        info!(track_id = %track.id, path = %output.display(), "Track encoded and tagged");
        Ok(output)
    }
}

async fn non_empty(path: &Path) -> std::result::Result<(), String> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(()),
        Ok(_) => Err(format!("{} is empty", path.display())),
        Err(e) => Err(format!("{}: {}", path.display(), e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TrackMetadata;
    use async_trait::async_trait;
    use chrono::Utc;

    /// Copies input to output, or writes nothing when `empty` is set
    struct CopyEncoder {
        empty: bool,
    }

    #[async_trait]
    impl Encoder for CopyEncoder {
        async fn encode(&self, raw: &Path, output: &Path) -> Result<()> {
            if self.empty {
                tokio::fs::write(output, b"").await?;
            } else {
                tokio::fs::copy(raw, output).await?;
            }
            Ok(())
        }
    }

    struct FlakyTagger {
        fail: bool,
    }

    #[async_trait]
    impl Tagger for FlakyTagger {
        async fn embed_tags(&self, _mp3: &Path, _metadata: &crate::models::TrackMetadata) -> Result<()> {
            if self.fail {
                Err(OrchestratorError::Tag("disk full".into()))
            } else {
                Ok(())
            }
        }
    }

    fn track() -> Track {
        Track::discovered(
            "t1",
            TrackMetadata {
                title: "Song A".to_string(),
                artist: "Artist B".to_string(),
                album: String::new(),
                cover_art_url: None,
                duration_ms: None,
                track_number: None,
            },
            Utc::now(),
        )
    }

    fn adapter(dir: &Path, empty: bool, fail_tag: bool) -> PipelineAdapter {
        PipelineAdapter::new(
            Arc::new(CopyEncoder { empty }),
            Arc::new(FlakyTagger { fail: fail_tag }),
            dir.join("library"),
        )
    }

    #[tokio::test]
    async fn test_process_produces_named_library_file() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("t1.wav");
        std::fs::write(&raw, b"pcm").unwrap();

        let output = adapter(dir.path(), false, false)
            .process(&track(), &raw)
            .await
            .unwrap();

        assert_eq!(output, dir.path().join("library").join("Artist B - Song A.mp3"));
        assert!(raw.exists());
    }

    #[tokio::test]
    async fn test_empty_encoder_output_is_encode_error() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("t1.wav");
        std::fs::write(&raw, b"pcm").unwrap();

        let err = adapter(dir.path(), true, false)
            .process(&track(), &raw)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Encode(_)));
    }

    #[tokio::test]
    async fn test_tag_failure_keeps_raw_capture() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("t1.wav");
        std::fs::write(&raw, b"pcm").unwrap();

        let err = adapter(dir.path(), false, true)
            .process(&track(), &raw)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Tag(_)));
        assert!(raw.exists());
    }

    #[tokio::test]
    async fn test_missing_capture_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = adapter(dir.path(), false, false)
            .process(&track(), &dir.path().join("absent.wav"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Encode(_)));
    }
}
