use std::path::Path;
use log::debug;
use crate::error::{RenderError, RenderResult};

/// Frames per second of the game being replayed
pub const FPS: i64 = 60;

/// Games at or under this many frames (30 seconds) count as short
pub const MIN_GAME_LENGTH: i64 = 30 * FPS;

/// Replay frames are indexed from -123 (pre-game countdown)
const FIRST_FRAME_INDEX: i64 = -123;

/// UBJSON key for the last frame index inside the replay's `metadata` object
const LAST_FRAME_KEY: &[u8] = b"U\x09lastFrame";

/// Source of the total frame count of a replay
pub trait ReplayMetadata: Send + Sync {
    fn frame_count(&self, path: &Path) -> RenderResult<i64>;
}

/// Reads `metadata.lastFrame` straight out of a `.slp` file
#[derive(Debug, Clone, Copy, Default)]
pub struct SlippiMetadataReader;

impl ReplayMetadata for SlippiMetadataReader {
    fn frame_count(&self, path: &Path) -> RenderResult<i64> {
        let bytes = std::fs::read(path).map_err(|e| RenderError::io(path, e))?;
        let last_frame = find_last_frame(&bytes).ok_or_else(|| RenderError::Replay {
            path: path.to_path_buf(),
            reason: "metadata.lastFrame not found".to_string(),
        })?;

        let frames = frames_from_last_frame(last_frame).ok_or_else(|| RenderError::Replay {
            path: path.to_path_buf(),
            reason: format!("metadata.lastFrame out of range: {}", last_frame),
        })?;
        debug!("Replay {}: lastFrame {} -> {} frames", path.display(), last_frame, frames);
        Ok(frames)
    }
}

/// Total frames for a `lastFrame` index. Replays store it as an int32, so
/// anything wider is corrupt.
fn frames_from_last_frame(last_frame: i64) -> Option<i64> {
    if last_frame < i32::MIN as i64 || last_frame > i32::MAX as i64 {
        return None;
    }
    last_frame.checked_sub(FIRST_FRAME_INDEX)?.checked_add(1)
}

/// Locate the last `lastFrame` key and decode the UBJSON integer after it.
/// The metadata block trails the raw event stream, so search from the end.
fn find_last_frame(bytes: &[u8]) -> Option<i64> {
    let key_start = bytes
        .windows(LAST_FRAME_KEY.len())
        .rposition(|w| w == LAST_FRAME_KEY)?;
    let value = &bytes[key_start + LAST_FRAME_KEY.len()..];
    let (marker, rest) = value.split_first()?;

    match marker {
        b'i' => rest.first().map(|b| *b as i8 as i64),
        b'U' => rest.first().map(|b| *b as i64),
        b'I' => rest.get(..2).map(|b| i16::from_be_bytes([b[0], b[1]]) as i64),
        b'l' => rest
            .get(..4)
            .map(|b| i32::from_be_bytes([b[0], b[1], b[2], b[3]]) as i64),
        b'L' => rest.get(..8).map(|b| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(b);
            i64::from_be_bytes(buf)
        }),
        _ => None,
    }
}

/// Whether a game should be dropped under the `remove_short` setting
pub fn is_game_too_short(num_frames: i64, remove_short: bool) -> bool {
    remove_short && num_frames <= MIN_GAME_LENGTH
}
