//! Video ingest from a session's desktop container.
//!
//! The container runs a screen-capture server reachable at
//! `ws://localhost:9876/ws/stream` on the far side of the tunnel. After a
//! JSON init message it pushes binary frames:
//!
//! ```text
//! [type:1][reserved:1][keyframe:1][pts:8 BE µs][width:2 BE][height:2 BE][Annex-B ...]
//! ```
//!
//! Only type `0x01` (video) is consumed. The worker reconnects after any
//! failure until its session is cancelled; its clock and frame counter carry
//! over between connections so muxer timestamps keep increasing.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Buf;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

use super::muxer::MuxerError;
use super::nal::{self, split_nal_units};
use super::session::StreamingSession;
use super::StreamParams;
use crate::config::HlsConfig;
use crate::tunnel::{desktop_runner_id, dial_with_timeout, DialError, TunnelDialer};

/// URL of the capture server inside the desktop container.
pub const STREAM_URL: &str = "ws://localhost:9876/ws/stream";

pub const FRAME_HEADER_LEN: usize = 15;
pub const FRAME_TYPE_VIDEO: u8 = 0x01;

/// Frames logged at debug level: the first few, then every Nth.
const LOG_FIRST_FRAMES: u64 = 3;
const LOG_EVERY_FRAMES: u64 = 60;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame of {0} bytes is shorter than the {FRAME_HEADER_LEN}-byte header")]
    TooShort(usize),
    #[error("frame type {0:#04x} is not video")]
    NotVideo(u8),
}

/// One parsed video frame. `payload` borrows the Annex-B bytes.
#[derive(Debug)]
pub struct VideoFrame<'a> {
    pub keyframe: bool,
    pub pts_us: u64,
    pub width: u16,
    pub height: u16,
    pub payload: &'a [u8],
}

impl<'a> VideoFrame<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, FrameError> {
        if data.len() < FRAME_HEADER_LEN {
            return Err(FrameError::TooShort(data.len()));
        }
        let mut header = &data[..FRAME_HEADER_LEN];
        let kind = header.get_u8();
        if kind != FRAME_TYPE_VIDEO {
            return Err(FrameError::NotVideo(kind));
        }
        header.advance(1);
        let keyframe = header.get_u8() != 0;
        let pts_us = header.get_u64();
        let width = header.get_u16();
        let height = header.get_u16();
        Ok(Self {
            keyframe,
            pts_us,
            width,
            height,
            payload: &data[FRAME_HEADER_LEN..],
        })
    }
}

/// Convert a source timestamp in microseconds into 90 kHz ticks relative to
/// `base_us`. Timestamps before the base fall back to a frame-count clock.
pub fn to_90khz(pts_us: u64, base_us: u64, frame_index: u64, fps: u32) -> i64 {
    let ticks = match pts_us.checked_sub(base_us) {
        Some(delta) => u128::from(delta) * 90_000 / 1_000_000,
        None => u128::from(frame_index) * 90_000 / u128::from(fps.max(1)),
    };
    i64::try_from(ticks).unwrap_or(i64::MAX)
}

/// Text init message asking the capture server for a stream.
pub fn init_message(params: &StreamParams) -> String {
    json!({
        "type": "init",
        "width": params.width,
        "height": params.height,
        "fps": params.fps,
        "bitrate": params.bitrate_kbps,
        "gop_size": params.gop_size(),
    })
    .to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Dial(#[from] DialError),
    #[error("WebSocket handshake failed: {0}")]
    Handshake(#[source] tungstenite::Error),
    #[error("WebSocket error: {0}")]
    Socket(#[from] tungstenite::Error),
    #[error("HLS muxer: {0}")]
    Muxer(#[from] MuxerError),
}

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub stream_url: String,
    pub dial_timeout: Duration,
    pub reconnect_delay: Duration,
}

impl IngestSettings {
    pub fn from_config(hls: &HlsConfig) -> Self {
        Self {
            stream_url: STREAM_URL.to_string(),
            dial_timeout: hls.dial_timeout(),
            reconnect_delay: hls.reconnect_delay(),
        }
    }
}

/// Pulls frames for one session and feeds its muxer.
pub struct VideoIngestWorker {
    session: Arc<StreamingSession>,
    dialer: Arc<dyn TunnelDialer>,
    settings: IngestSettings,
    /// Wall-clock start, in µs since the Unix epoch.
    base_us: u64,
    frame_index: u64,
}

impl VideoIngestWorker {
    pub fn new(
        session: Arc<StreamingSession>,
        dialer: Arc<dyn TunnelDialer>,
        settings: IngestSettings,
    ) -> Self {
        let base_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        Self {
            session,
            dialer,
            settings,
            base_us,
            frame_index: 0,
        }
    }

    /// Connect, stream, and reconnect until the session is cancelled.
    pub async fn run(mut self) {
        let cancel = self.session.cancel_token().clone();
        let params = self.session.params();
        info!(
            runner_id = %desktop_runner_id(self.session.session_id()),
            width = params.width,
            height = params.height,
            bitrate = params.bitrate_kbps,
            fps = params.fps,
            "Starting HLS video feed"
        );

        loop {
            let result = tokio::select! {
                () = cancel.cancelled() => break,
                result = self.connect_and_stream() => result,
            };
            match result {
                Ok(()) => info!("Video source closed the stream, reconnecting"),
                Err(e) => warn!(error = %e, "HLS stream error, reconnecting"),
            }
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.settings.reconnect_delay) => {}
            }
        }

        info!("HLS video feed stopped");
    }

    async fn connect_and_stream(&mut self) -> Result<(), IngestError> {
        let runner_id = desktop_runner_id(self.session.session_id());
        let stream = dial_with_timeout(
            self.dialer.as_ref(),
            &runner_id,
            Some(self.settings.dial_timeout),
        )
        .await?;

        let (mut ws, _) = tokio_tungstenite::client_async(self.settings.stream_url.as_str(), stream)
            .await
            .map_err(IngestError::Handshake)?;

        let init = init_message(&self.session.params());
        debug!(init = %init, "Sending stream init");
        ws.send(Message::Text(init.into())).await?;

        while let Some(message) = ws.next().await {
            match message? {
                Message::Binary(data) => self.handle_frame(&data).await?,
                Message::Close(_) => break,
                _ => {}
            }
        }
        Ok(())
    }

    /// Parse one wire frame and write its access unit. Malformed frames are
    /// skipped; only a muxer failure that ends the stream is returned.
    async fn handle_frame(&mut self, data: &[u8]) -> Result<(), IngestError> {
        let frame = match VideoFrame::parse(data) {
            Ok(frame) => frame,
            Err(FrameError::NotVideo(_)) => return Ok(()),
            Err(e) => {
                debug!(error = %e, "Skipping frame");
                return Ok(());
            }
        };

        let nalus = split_nal_units(frame.payload);
        if nalus.is_empty() {
            return Ok(());
        }

        let Some(muxer) = self
            .session
            .observe_parameter_sets(&nalus, frame.width, frame.height)
            .await?
        else {
            return Ok(());
        };

        let access_unit: Vec<&[u8]> = nalus
            .into_iter()
            .filter(|n| !nal::is_parameter_set(n))
            .collect();
        if access_unit.is_empty() {
            return Ok(());
        }

        self.frame_index += 1;
        let pts = to_90khz(
            frame.pts_us,
            self.base_us,
            self.frame_index,
            self.session.params().fps,
        );

        match muxer.write_access_unit(pts, &access_unit) {
            Ok(()) => {}
            Err(MuxerError::Closed) => return Err(MuxerError::Closed.into()),
            Err(e) => {
                warn!(error = %e, frame = self.frame_index, "Failed to write access unit");
                return Ok(());
            }
        }

        if self.frame_index <= LOG_FIRST_FRAMES || self.frame_index % LOG_EVERY_FRAMES == 0 {
            debug!(
                frame = self.frame_index,
                keyframe = frame.keyframe,
                nalus = access_unit.len(),
                pts,
                "HLS frame written"
            );
        }
        Ok(())
    }
}
