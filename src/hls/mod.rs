//! Low-latency HLS fallback feed.
//!
//! For clients that cannot speak the native streaming protocol, raw H.264 is
//! pulled from the session's desktop container over the tunnel
//! ([`ingest`]), re-packaged into fMP4 LL-HLS ([`muxer`], [`fmp4`]) and served
//! per session by [`session::HlsSessionManager`]. Video is never re-encoded.

pub mod fmp4;
pub mod ingest;
pub mod muxer;
pub mod nal;
pub mod session;

pub use muxer::{HlsRequest, LiveMuxer, MuxerConfig, MuxerError};
pub use session::{HlsSessionManager, MuxerState, StreamingSession};

const DEFAULT_WIDTH: u32 = 1280;
const DEFAULT_HEIGHT: u32 = 720;
const DEFAULT_BITRATE_KBPS: u32 = 2000;
const DEFAULT_FPS: u32 = 30;

const MAX_WIDTH: u32 = 3840;
const MAX_HEIGHT: u32 = 2160;
const MAX_BITRATE_KBPS: u32 = 50_000;
const MAX_FPS: u32 = 120;

/// Encoding parameters requested from the video source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParams {
    pub width: u32,
    pub height: u32,
    pub bitrate_kbps: u32,
    pub fps: u32,
}

impl Default for StreamParams {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            bitrate_kbps: DEFAULT_BITRATE_KBPS,
            fps: DEFAULT_FPS,
        }
    }
}

impl StreamParams {
    /// Build from raw query values. Anything missing, non-numeric, zero or
    /// above the limit keeps its default.
    pub fn from_query(
        width: Option<&str>,
        height: Option<&str>,
        bitrate: Option<&str>,
        fps: Option<&str>,
    ) -> Self {
        Self {
            width: bounded(width, MAX_WIDTH).unwrap_or(DEFAULT_WIDTH),
            height: bounded(height, MAX_HEIGHT).unwrap_or(DEFAULT_HEIGHT),
            bitrate_kbps: bounded(bitrate, MAX_BITRATE_KBPS).unwrap_or(DEFAULT_BITRATE_KBPS),
            fps: bounded(fps, MAX_FPS).unwrap_or(DEFAULT_FPS),
        }
    }

    /// Keyframe interval asked of the encoder: one second, at least 30 frames.
    pub fn gop_size(&self) -> u32 {
        self.fps.max(30)
    }
}

fn bounded(raw: Option<&str>, max: u32) -> Option<u32> {
    raw?.trim().parse::<u32>().ok().filter(|v| (1..=max).contains(v))
}
