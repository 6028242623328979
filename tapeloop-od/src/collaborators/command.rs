//! External-process adapters for recording and encoding
//!
//! Command lines come from configuration as templates. A template is split
//! on whitespace first and placeholders are substituted per argument, so
//! substituted paths containing spaces stay a single argument. No shell is
//! involved.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{CaptureHandle, Encoder, Recorder};
use crate::config::{PipelineConfig, RecordingConfig};
use crate::error::{OrchestratorError, Result};

/// Split `template` into program and arguments, substituting `{name}` placeholders
pub fn render_command(template: &str, vars: &[(&str, String)]) -> Option<(String, Vec<String>)> {
    let mut parts = template.split_whitespace().map(|token| {
        vars.iter().fold(token.to_string(), |acc, (name, value)| {
            acc.replace(&format!("{{{}}}", name), value)
        })
    });

    let program = parts.next()?;
    Some((program, parts.collect()))
}

fn spawn(program: &str, args: &[String]) -> std::io::Result<Child> {
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
}

async fn terminate(child: &mut Child) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }
    if let Err(e) = child.start_kill() {
        warn!("Failed to kill child process: {}", e);
        return;
    }
    let _ = child.wait().await;
}

struct ActiveCapture {
    id: Uuid,
    child: Child,
    ended: Arc<Notify>,
}

/// Records by running a playback command and a capture command.
///
/// End of track is the capture process exiting on its own (its silence
/// detection) or [`Recorder::signal_end`].
pub struct CommandRecorder {
    playback_template: Option<String>,
    capture_template: Option<String>,
    silence_db: f32,
    silence_secs: f32,
    playback: Mutex<Option<Child>>,
    capture: Mutex<Option<ActiveCapture>>,
    /// End signal of the running capture; a fresh one per capture
    end_signal: std::sync::Mutex<Option<Arc<Notify>>>,
}

impl CommandRecorder {
    pub fn new(config: &RecordingConfig) -> Self {
        Self {
            playback_template: config.playback_command.clone(),
            capture_template: config.capture_command.clone(),
            silence_db: config.silence_threshold_db,
            silence_secs: config.silence_duration_secs,
            playback: Mutex::new(None),
            capture: Mutex::new(None),
            end_signal: std::sync::Mutex::new(None),
        }
    }
}

#[async_trait]
impl Recorder for CommandRecorder {
    async fn start_playback(&self, track_id: &str) -> Result<()> {
        let Some(template) = &self.playback_template else {
            debug!(track_id = %track_id, "No playback command configured; assuming external playback");
            return Ok(());
        };

        let (program, args) = render_command(template, &[("track_id", track_id.to_string())])
            .ok_or_else(|| OrchestratorError::RecordingFailed("empty playback command".into()))?;

        let child = spawn(&program, &args).map_err(|e| {
            OrchestratorError::RecordingFailed(format!("failed to start playback ({}): {}", program, e))
        })?;

        let mut slot = self.playback.lock().await;
        if let Some(mut previous) = slot.replace(child) {
            terminate(&mut previous).await;
        }
        info!(track_id = %track_id, "Playback started");
        Ok(())
    }

    async fn start_capture(&self, output: &Path) -> Result<CaptureHandle> {
        let template = self.capture_template.as_deref().ok_or_else(|| {
            OrchestratorError::RecordingFailed("no capture_command configured".into())
        })?;

        let vars = [
            ("output", output.to_string_lossy().to_string()),
            ("silence_db", format!("{}", self.silence_db)),
            ("silence_secs", format!("{}", self.silence_secs)),
        ];
        let (program, args) = render_command(template, &vars)
            .ok_or_else(|| OrchestratorError::RecordingFailed("empty capture command".into()))?;

        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let child = spawn(&program, &args).map_err(|e| {
            OrchestratorError::RecordingFailed(format!("failed to start capture ({}): {}", program, e))
        })?;

        let handle = CaptureHandle {
            id: Uuid::new_v4(),
            output: output.to_path_buf(),
        };

        let ended = Arc::new(Notify::new());
        let mut slot = self.capture.lock().await;
        if let Some(mut stale) = slot.replace(ActiveCapture {
            id: handle.id,
            child,
            ended: ended.clone(),
        }) {
            terminate(&mut stale.child).await;
        }
        if let Ok(mut signal) = self.end_signal.lock() {
            *signal = Some(ended);
        }

        info!(output = %output.display(), "Capture started");
        Ok(handle)
    }

    async fn wait_for_end(&self, handle: &CaptureHandle) -> Result<()> {
        let mut slot = self.capture.lock().await;
        let capture = slot
            .as_mut()
            .filter(|c| c.id == handle.id)
            .ok_or_else(|| OrchestratorError::RecordingFailed("capture is not running".into()))?;
        let ended = capture.ended.clone();

        tokio::select! {
            status = capture.child.wait() => {
                let status = status.map_err(|e| {
                    OrchestratorError::RecordingFailed(format!("capture wait failed: {}", e))
                })?;
                if status.success() {
                    debug!("Capture process ended on its own");
                    Ok(())
                } else {
                    Err(OrchestratorError::RecordingFailed(format!("capture exited with {}", status)))
                }
            }
            _ = ended.notified() => {
                debug!("End-of-track signalled externally");
                Ok(())
            }
        }
    }

    async fn stop_capture(&self, handle: CaptureHandle) -> Result<PathBuf> {
        if let Ok(mut signal) = self.end_signal.lock() {
            signal.take();
        }

        if let Some(mut capture) = self.capture.lock().await.take() {
            terminate(&mut capture.child).await;
        }
        self.stop_playback().await?;

        match tokio::fs::metadata(&handle.output).await {
            Ok(meta) if meta.len() > 0 => Ok(handle.output),
            Ok(_) => Err(OrchestratorError::RecordingFailed("capture file is empty".into())),
            Err(e) => Err(OrchestratorError::RecordingFailed(format!(
                "capture file missing ({}): {}",
                handle.output.display(),
                e
            ))),
        }
    }

    async fn stop_playback(&self) -> Result<()> {
        if let Some(mut playback) = self.playback.lock().await.take() {
            terminate(&mut playback).await;
            info!("Playback stopped");
        }
        Ok(())
    }

    fn signal_end(&self) {
        let current = self.end_signal.lock().ok().and_then(|signal| signal.clone());
        match current {
            Some(ended) => ended.notify_one(),
            None => debug!("End-of-track signal ignored: no capture running"),
        }
    }
}

/// Encodes by running the configured encoder command (ffmpeg by default)
pub struct CommandEncoder {
    template: String,
    bitrate: String,
}

impl CommandEncoder {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            template: config.encode_command.clone(),
            bitrate: config.bitrate.clone(),
        }
    }
}

#[async_trait]
impl Encoder for CommandEncoder {
    async fn encode(&self, raw: &Path, output: &Path) -> Result<()> {
        let vars = [
            ("input", raw.to_string_lossy().to_string()),
            ("output", output.to_string_lossy().to_string()),
            ("bitrate", self.bitrate.clone()),
        ];
        let (program, args) = render_command(&self.template, &vars)
            .ok_or_else(|| OrchestratorError::Encode("empty encode command".into()))?;

        let result = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| OrchestratorError::Encode(format!("failed to run {}: {}", program, e)))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let tail: String = stderr.lines().rev().take(3).collect::<Vec<_>>().join(" | ");
            return Err(OrchestratorError::Encode(format!(
                "{} exited with {}: {}",
                program, result.status, tail
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_keeps_paths_with_spaces_intact() {
        let (program, args) = render_command(
            "ffmpeg -i {input} -b:a {bitrate} {output}",
            &[
                ("input", "/captures/My Track.wav".to_string()),
                ("output", "/library/Artist - Title.mp3".to_string()),
                ("bitrate", "192k".to_string()),
            ],
        )
        .unwrap();

        assert_eq!(program, "ffmpeg");
        assert_eq!(
            args,
            vec![
                "-i",
                "/captures/My Track.wav",
                "-b:a",
                "192k",
                "/library/Artist - Title.mp3"
            ]
        );
    }

    #[test]
    fn test_render_empty_template() {
        assert!(render_command("   ", &[]).is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_encoder_reports_failing_command() {
        let encoder = CommandEncoder {
            template: "false {input} {output}".to_string(),
            bitrate: "192k".to_string(),
        };
        let err = encoder
            .encode(Path::new("/tmp/in.wav"), Path::new("/tmp/out.mp3"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Encode(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_capture_start_stops_playback() {
        use crate::models::{RecordingSession, TerminationCause};
        use crate::services::recording_controller::run_session;
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(CommandRecorder::new(&RecordingConfig {
            playback_command: Some("sleep 30".to_string()),
            capture_command: Some("/nonexistent/tapeloop-capture {output}".to_string()),
            ..RecordingConfig::default()
        }));
        let session = RecordingSession::new("t1", None);

        let outcome = run_session(
            recorder.clone(),
            session,
            dir.path().join("t1.wav"),
            Duration::from_secs(5),
        )
        .await;

        assert_eq!(outcome.cause, TerminationCause::Error);
        assert!(recorder.playback.lock().await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_capture_process_exit_is_end_of_track() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("t1.wav");

        let source = dir.path().join("source.wav");
        std::fs::write(&source, b"RIFF....WAVE").unwrap();

        let recorder = CommandRecorder::new(&RecordingConfig {
            capture_command: Some(format!("cp {} {{output}}", source.display())),
            ..RecordingConfig::default()
        });

        let handle = recorder.start_capture(&output).await.unwrap();
        recorder.wait_for_end(&handle).await.unwrap();
        assert_eq!(recorder.stop_capture(handle).await.unwrap(), output);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_external_end_signal_stops_long_capture() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("t1.wav");
        std::fs::write(&output, b"RIFF").unwrap();

        let recorder = CommandRecorder::new(&RecordingConfig {
            capture_command: Some("sleep 30".to_string()),
            ..RecordingConfig::default()
        });

        let handle = recorder.start_capture(&output).await.unwrap();
        recorder.signal_end();
        tokio::time::timeout(std::time::Duration::from_secs(5), recorder.wait_for_end(&handle))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(recorder.stop_capture(handle).await.unwrap(), output);
    }
}
