//! Library and device file naming
//!
//! The same name is used in the local library and on the player, so the
//! device diff can match files by name alone.

use crate::models::TrackMetadata;

const RESERVED: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Replace characters that are not allowed in FAT/exFAT file names
pub fn sanitize(part: &str) -> String {
    part.trim()
        .chars()
        .map(|c| if RESERVED.contains(&c) || c.is_control() { '_' } else { c })
        .collect()
}

/// File stem for a track's raw capture. Bytes other than ASCII
/// alphanumerics, `-` and `_` are percent-encoded, so distinct ids never
/// share a file.
pub fn capture_stem(track_id: &str) -> String {
    let mut stem = String::with_capacity(track_id.len());
    for byte in track_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            stem.push(byte as char);
        } else {
            stem.push_str(&format!("%{:02X}", byte));
        }
    }
    stem
}

/// "Artist - Title.mp3"
pub fn target_name(metadata: &TrackMetadata) -> String {
    format!("{} - {}.mp3", sanitize(&metadata.artist), sanitize(&metadata.title))
}

/// Hidden temporary name used while a copy is in flight
pub fn partial_name(target_name: &str) -> String {
    format!(".{}.part", target_name)
}

/// Inverse of [`partial_name`]
pub fn is_partial_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(".part")
}
