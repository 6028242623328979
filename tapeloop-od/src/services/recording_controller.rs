//! Recording controller: the single playback+capture slot
//!
//! The slot is plain owned state. Only the dispatcher holds the controller
//! (`&mut self`), so [`RecordingController::try_claim`] cannot race with
//! itself: two tracks never observe a free slot at the same time.
//!
//! Driving a session ([`run_session`]) happens on a spawned task; the
//! dispatcher releases the slot when the outcome comes back.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use super::naming;
use crate::collaborators::Recorder;
use crate::config::RecordingConfig;
use crate::error::{OrchestratorError, Result};
use crate::models::{RecordingSession, SessionOutcome, TerminationCause, Track};

pub struct RecordingController {
    slot: Option<RecordingSession>,
    recorder: Arc<dyn Recorder>,
    captures_dir: PathBuf,
    grace: Duration,
    unknown_duration: Duration,
}

impl RecordingController {
    pub fn new(recorder: Arc<dyn Recorder>, captures_dir: PathBuf, config: &RecordingConfig) -> Self {
        Self {
            slot: None,
            recorder,
            captures_dir,
            grace: config.grace(),
            unknown_duration: config.unknown_duration(),
        }
    }

    /// Bind the slot to `track`, or fail with `SlotBusy` without waiting
    pub fn try_claim(&mut self, track: &Track) -> Result<RecordingSession> {
        if let Some(current) = &self.slot {
            return Err(OrchestratorError::SlotBusy {
                holder: current.track_id.clone(),
            });
        }

        let expected = track.metadata.duration_ms.map(Duration::from_millis);
        let session = RecordingSession::new(track.id.clone(), expected);
        self.slot = Some(session.clone());
        Ok(session)
    }

    /// Free the slot if `session_id` holds it
    pub fn release(&mut self, session_id: Uuid) -> Option<RecordingSession> {
        match &self.slot {
            Some(current) if current.session_id == session_id => self.slot.take(),
            Some(current) => {
                warn!(
                    session_id = %session_id,
                    holder = %current.session_id,
                    "Release for a session that does not hold the slot"
                );
                None
            }
            None => None,
        }
    }

    pub fn current(&self) -> Option<&RecordingSession> {
        self.slot.as_ref()
    }

    pub fn is_busy(&self) -> bool {
        self.slot.is_some()
    }

    pub fn recorder(&self) -> Arc<dyn Recorder> {
        self.recorder.clone()
    }

    /// Raw capture location; one file per track so a retry overwrites it
    pub fn capture_path(&self, track_id: &str) -> PathBuf {
        self.captures_dir.join(format!("{}.wav", naming::capture_stem(track_id)))
    }

    /// Upper bound on a session: advertised duration plus grace. Never
    /// shorter than the advertised duration.
    pub fn safety_timeout(&self, expected: Option<Duration>) -> Duration {
        expected.unwrap_or(self.unknown_duration) + self.grace
    }

    /// Forward an external end-of-track signal to the recorder
    pub fn signal_end(&self) {
        self.recorder.signal_end();
    }
}

/// Drive one session: playback, capture, wait for the end signal (bounded
/// by `limit`), stop. Always stops the capture it started.
pub async fn run_session(
    recorder: Arc<dyn Recorder>,
    session: RecordingSession,
    output: PathBuf,
    limit: Duration,
) -> SessionOutcome {
    let outcome = |cause, raw_capture, error: Option<String>| SessionOutcome {
        session_id: session.session_id,
        track_id: session.track_id.clone(),
        cause,
        raw_capture,
        error,
    };

    info!(
        track_id = %session.track_id,
        session_id = %session.session_id,
        limit_secs = limit.as_secs(),
        "Recording session started"
    );

    if let Err(e) = recorder.start_playback(&session.track_id).await {
        return outcome(TerminationCause::Error, None, Some(e.to_string()));
    }

    let handle = match recorder.start_capture(&output).await {
        Ok(handle) => handle,
        Err(e) => {
            if let Err(stop) = recorder.stop_playback().await {
                warn!(track_id = %session.track_id, "Playback not stopped: {}", stop);
            }
            return outcome(TerminationCause::Error, None, Some(e.to_string()));
        }
    };

    let ended = tokio::time::timeout(limit, recorder.wait_for_end(&handle)).await;
    let stopped = recorder.stop_capture(handle).await;

    match (ended, stopped) {
        (Ok(Ok(())), Ok(path)) => {
            info!(track_id = %session.track_id, path = %path.display(), "Recording session ended");
            outcome(TerminationCause::NaturalEnd, Some(path), None)
        }
        (Ok(Ok(())), Err(e)) => outcome(TerminationCause::Error, None, Some(e.to_string())),
        (Ok(Err(e)), _) => outcome(TerminationCause::Error, None, Some(e.to_string())),
        (Err(_), _) => {
            warn!(
                track_id = %session.track_id,
                limit_secs = limit.as_secs(),
                "No end-of-track signal before safety timeout; capture stopped"
            );
            outcome(
                TerminationCause::Timeout,
                None,
                Some(format!("no end-of-track signal within {}s", limit.as_secs())),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::CaptureHandle;
    use crate::models::TrackMetadata;
    use async_trait::async_trait;
    use chrono::Utc;
    use proptest::prelude::*;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Ends immediately, or never when `hang` is set
    #[derive(Default)]
    struct ScriptedRecorder {
        hang: bool,
        capture_fails: bool,
        playback_stopped: AtomicBool,
    }

    impl ScriptedRecorder {
        fn ending() -> Self {
            Self::default()
        }

        fn hanging() -> Self {
            Self {
                hang: true,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl Recorder for ScriptedRecorder {
        async fn start_playback(&self, _track_id: &str) -> Result<()> {
            Ok(())
        }

        async fn start_capture(&self, output: &Path) -> Result<CaptureHandle> {
            if self.capture_fails {
                return Err(OrchestratorError::RecordingFailed("no input device".into()));
            }
            Ok(CaptureHandle {
                id: Uuid::new_v4(),
                output: output.to_path_buf(),
            })
        }

        async fn wait_for_end(&self, _handle: &CaptureHandle) -> Result<()> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        async fn stop_capture(&self, handle: CaptureHandle) -> Result<PathBuf> {
            Ok(handle.output)
        }

        async fn stop_playback(&self) -> Result<()> {
            self.playback_stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn track(id: &str, duration_ms: Option<u64>) -> Track {
        Track::discovered(
            id,
            TrackMetadata {
                title: format!("Title {}", id),
                artist: "Artist".to_string(),
                album: String::new(),
                cover_art_url: None,
                duration_ms,
                track_number: None,
            },
            Utc::now(),
        )
    }

    fn controller() -> RecordingController {
        RecordingController::new(
            Arc::new(ScriptedRecorder::ending()),
            PathBuf::from("/captures"),
            &RecordingConfig::default(),
        )
    }

    #[test]
    fn test_second_claim_is_busy() {
        let mut controller = controller();
        let session = controller.try_claim(&track("t1", None)).unwrap();

        match controller.try_claim(&track("t2", None)) {
            Err(OrchestratorError::SlotBusy { holder }) => assert_eq!(holder, "t1"),
            other => panic!("expected SlotBusy, got {:?}", other.map(|s| s.track_id)),
        }

        assert!(controller.release(session.session_id).is_some());
        assert!(controller.try_claim(&track("t2", None)).is_ok());
    }

    #[test]
    fn test_capture_path_keyed_by_track() {
        let controller = controller();
        assert_eq!(
            controller.capture_path("spotify:track:1"),
            PathBuf::from("/captures/spotify%3Atrack%3A1.wav")
        );
        assert_eq!(controller.capture_path("x"), controller.capture_path("x"));
        assert_ne!(controller.capture_path("a:b"), controller.capture_path("a_b"));
    }

    #[test]
    fn test_safety_timeout_never_below_advertised_duration() {
        let controller = controller();
        let advertised = Duration::from_secs(240);
        assert_eq!(controller.safety_timeout(Some(advertised)), Duration::from_secs(250));
        assert_eq!(controller.safety_timeout(None), Duration::from_secs(910));
    }

    #[tokio::test]
    async fn test_hung_end_signal_times_out() {
        let session = RecordingSession::new("t1", Some(Duration::from_millis(20)));
        let outcome = run_session(
            Arc::new(ScriptedRecorder::hanging()),
            session,
            PathBuf::from("/captures/t1.wav"),
            Duration::from_millis(50),
        )
        .await;

        assert_eq!(outcome.cause, TerminationCause::Timeout);
        assert!(outcome.raw_capture.is_none());
        assert!(!outcome.succeeded());
    }

    #[tokio::test]
    async fn test_natural_end_yields_capture() {
        let session = RecordingSession::new("t1", None);
        let outcome = run_session(
            Arc::new(ScriptedRecorder::ending()),
            session,
            PathBuf::from("/captures/t1.wav"),
            Duration::from_secs(5),
        )
        .await;

        assert!(outcome.succeeded());
        assert_eq!(outcome.raw_capture, Some(PathBuf::from("/captures/t1.wav")));
    }

    #[tokio::test]
    async fn test_capture_start_failure_stops_playback() {
        let recorder = Arc::new(ScriptedRecorder {
            capture_fails: true,
            ..ScriptedRecorder::default()
        });
        let outcome = run_session(
            recorder.clone(),
            RecordingSession::new("t1", None),
            PathBuf::from("/captures/t1.wav"),
            Duration::from_secs(5),
        )
        .await;

        assert_eq!(outcome.cause, TerminationCause::Error);
        assert_eq!(outcome.error.as_deref(), Some("recording failed: no input device"));
        assert!(recorder.playback_stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_natural_end_leaves_playback_to_stop_capture() {
        let recorder = Arc::new(ScriptedRecorder::ending());
        let outcome = run_session(
            recorder.clone(),
            RecordingSession::new("t1", None),
            PathBuf::from("/captures/t1.wav"),
            Duration::from_secs(5),
        )
        .await;

        assert!(outcome.succeeded());
        assert!(!recorder.playback_stopped.load(Ordering::SeqCst));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Claim(usize),
        Release(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..5usize).prop_map(Op::Claim),
            (0..5usize).prop_map(Op::Release),
        ]
    }

    proptest! {
        /// Interleaved claims and releases from several tracks never leave
        /// more than one session bound, and a claim succeeds exactly when
        /// the slot is free.
        #[test]
        fn prop_at_most_one_session(ops in proptest::collection::vec(op(), 1..64)) {
            let mut controller = controller();
            let tracks: Vec<Track> = (0..5).map(|i| track(&format!("t{}", i), None)).collect();
            let mut held: Vec<Option<Uuid>> = vec![None; tracks.len()];

            for op in ops {
                match op {
                    Op::Claim(i) => {
                        let was_free = !controller.is_busy();
                        let result = controller.try_claim(&tracks[i]);
                        prop_assert_eq!(result.is_ok(), was_free);
                        if let Ok(session) = result {
                            held[i] = Some(session.session_id);
                        }
                    }
                    Op::Release(i) => {
                        if let Some(session_id) = held[i].take() {
                            prop_assert!(controller.release(session_id).is_some());
                        }
                    }
                }

                let active = held.iter().filter(|h| h.is_some()).count();
                prop_assert!(active <= 1);
                prop_assert_eq!(active == 1, controller.is_busy());
                if let Some(current) = controller.current() {
                    let holder = held.iter().position(|h| *h == Some(current.session_id));
                    prop_assert!(holder.is_some());
                }
            }
        }
    }
}
