//! Text of every outbound notification

use tapeloop_common::{MessageKind, OutboundMessage};

use crate::models::Track;

fn quoted(track: &Track) -> String {
    format!("**{}** by {}", track.metadata.title, track.metadata.artist)
}

pub fn approval_request(track: &Track) -> OutboundMessage {
    let album = if track.metadata.album.is_empty() {
        String::new()
    } else {
        format!(" ({})", track.metadata.album)
    };
    OutboundMessage::new(
        MessageKind::ApprovalRequest,
        format!(
            "Found new song! {}{}. Reply **yes** or **no** to this message.",
            quoted(track),
            album
        ),
    )
}

pub fn approval_ack(track: &Track) -> OutboundMessage {
    OutboundMessage::new(
        MessageKind::ApprovalAck,
        format!("Approved {}. Will record soon.", quoted(track)),
    )
}

pub fn rejected(track: &Track) -> OutboundMessage {
    OutboundMessage::new(MessageKind::Rejected, format!("Skipped {}.", quoted(track)))
}

pub fn recorded(track: &Track) -> OutboundMessage {
    OutboundMessage::new(
        MessageKind::Recorded,
        format!("Recorded {}. Ready for sync.", quoted(track)),
    )
}

pub fn abandoned(track: &Track) -> OutboundMessage {
    let reason = track.last_error.as_deref().unwrap_or("no reason recorded");
    OutboundMessage::new(
        MessageKind::Abandoned,
        format!("Gave up on {}: {}", quoted(track), reason),
    )
}

/// `attempt` of `max` failed; further retries happen quietly
pub fn retry_warning(track: &Track, stage: &str, attempt: u32, max: u32) -> OutboundMessage {
    let reason = track.last_error.as_deref().unwrap_or("unknown error");
    OutboundMessage::new(
        MessageKind::RetryWarning,
        format!(
            "Having trouble with {} ({} attempt {} of {} failed: {}). Still retrying.",
            quoted(track),
            stage,
            attempt,
            max,
            reason
        ),
    )
}

pub fn sync_complete(copied: u32, failed: u32) -> OutboundMessage {
    let mut text = format!("Synced {} track(s) to your MP3 player.", copied);
    if failed > 0 {
        text.push_str(&format!(" {} failed and will be retried next time.", failed));
    }
    OutboundMessage::new(MessageKind::SyncComplete, text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TrackMetadata;
    use chrono::Utc;

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

    #[test]
    fn test_approval_request_text() {
        let msg = approval_request(&track());
        assert_eq!(msg.kind, MessageKind::ApprovalRequest);
        assert_eq!(
            msg.text,
            "Found new song! **Song A** by Artist B. Reply **yes** or **no** to this message."
        );
    }

    #[test]
    fn test_sync_complete_mentions_failures_only_when_present() {
        assert_eq!(sync_complete(2, 0).text, "Synced 2 track(s) to your MP3 player.");
        assert!(sync_complete(1, 1).text.contains("1 failed"));
    }
}
