//! Low-latency HLS muxer.
//!
//! Access units go in through [`LiveMuxer::write_access_unit`] and come out as
//! fMP4 parts and segments served by [`LiveMuxer::handle`]. The layout follows
//! the LL-HLS rules the players care about:
//!
//! - a segment always starts on an IDR and closes at the first IDR after
//!   `segment_min_duration`;
//! - parts close once they reach `part_min_duration`;
//! - only the last `segment_count` complete segments stay addressable.
//!
//! A sample's duration is only known once the next one arrives, so the
//! newest access unit is held back until its successor is written. Blocked
//! requests (`_HLS_msn`/`_HLS_part` reloads, preload-hint parts) wait on a
//! version counter bumped whenever a part is published.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use axum::http::header;
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use tokio::sync::watch;
use tracing::debug;

use super::fmp4::{self, H264Track, Sample, TIMESCALE};
use super::nal;
use crate::config::HlsConfig;
use crate::error::ProxyError;

const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
const MP4_CONTENT_TYPE: &str = "video/mp4";

/// Muxer tuning.
#[derive(Debug, Clone)]
pub struct MuxerConfig {
    pub segment_count: usize,
    pub segment_min_duration: Duration,
    pub part_min_duration: Duration,
    /// Upper bound for blocking playlist and part requests.
    pub blocking_timeout: Duration,
}

impl MuxerConfig {
    pub fn from_config(hls: &HlsConfig) -> Self {
        Self {
            segment_count: hls.segment_count.max(1),
            segment_min_duration: Duration::from_millis(hls.segment_min_duration_ms),
            part_min_duration: Duration::from_millis(hls.part_min_duration_ms.max(1)),
            blocking_timeout: hls.blocking_timeout(),
        }
    }

    fn segment_min_ticks(&self) -> u64 {
        ticks(self.segment_min_duration)
    }

    fn part_min_ticks(&self) -> u64 {
        ticks(self.part_min_duration)
    }
}

fn ticks(d: Duration) -> u64 {
    (d.as_micros() * u128::from(TIMESCALE) / 1_000_000) as u64
}

#[allow(clippy::cast_precision_loss)]
fn seconds(ticks: u64) -> f64 {
    ticks as f64 / f64::from(TIMESCALE)
}

#[derive(Debug, thiserror::Error)]
pub enum MuxerError {
    #[error("muxer is closed")]
    Closed,
    #[error("track is missing SPS or PPS")]
    MissingParameterSets,
    #[error("access unit has no NAL units")]
    EmptyAccessUnit,
    #[error("NAL unit too large for a 32-bit length prefix")]
    OversizedNalUnit,
}

/// Options carried by a single HLS request.
#[derive(Debug, Clone, Default)]
pub struct HlsRequest {
    /// `_HLS_msn` blocking reload target.
    pub msn: Option<u64>,
    /// `_HLS_part` blocking reload target.
    pub part: Option<u64>,
    /// Query string appended to every URI in the playlist, so players that
    /// authenticate through the query keep doing so for media requests.
    pub uri_query: Option<String>,
}

/// Build the init segment and start accepting access units.
pub fn start(config: MuxerConfig, track: &H264Track) -> Result<LiveMuxer, MuxerError> {
    if track.sps.is_empty() || track.pps.is_empty() {
        return Err(MuxerError::MissingParameterSets);
    }
    let (version, _) = watch::channel(0u64);
    Ok(LiveMuxer {
        inner: Arc::new(Inner {
            init: fmp4::init_segment(track),
            timeline: Mutex::new(Timeline::default()),
            version,
            closed: AtomicBool::new(false),
            config,
        }),
    })
}

/// Handle to a started muxer. Clones share the same timeline.
#[derive(Clone)]
pub struct LiveMuxer {
    inner: Arc<Inner>,
}

struct Inner {
    config: MuxerConfig,
    init: Bytes,
    timeline: Mutex<Timeline>,
    version: watch::Sender<u64>,
    closed: AtomicBool,
}

struct Part {
    data: Bytes,
    duration: u64,
    independent: bool,
}

struct Segment {
    msn: u64,
    parts: Vec<Part>,
    duration: u64,
    data: Bytes,
}

struct OpenSegment {
    msn: u64,
    parts: Vec<Part>,
    duration: u64,
    samples: Vec<Sample>,
    part_start: u64,
    part_duration: u64,
}

impl OpenSegment {
    fn new(msn: u64) -> Self {
        Self {
            msn,
            parts: Vec::new(),
            duration: 0,
            samples: Vec::new(),
            part_start: 0,
            part_duration: 0,
        }
    }
}

/// Newest access unit, held until its duration is known.
struct Pending {
    dts: i64,
    data: Bytes,
    keyframe: bool,
}

#[derive(Default)]
struct Timeline {
    segments: VecDeque<Segment>,
    open: Option<OpenSegment>,
    pending: Option<Pending>,
    next_msn: u64,
    next_sequence: u32,
    /// DTS of the first IDR; decode times are relative to it.
    origin: Option<i64>,
    last_dts: Option<i64>,
    max_part_duration: u64,
    max_segment_duration: u64,
}

impl Timeline {
    /// Returns `true` if a part was published.
    fn write(&mut self, pts: i64, data: Bytes, keyframe: bool, config: &MuxerConfig) -> bool {
        if self.origin.is_none() && !keyframe {
            return false;
        }

        let dts = match self.last_dts {
            Some(last) if pts <= last => last + 1,
            _ => pts,
        };
        self.last_dts = Some(dts);
        let origin = *self.origin.get_or_insert(dts);

        let mut published = false;
        if let Some(prev) = self.pending.take() {
            let duration = u32::try_from(dts - prev.dts).unwrap_or(u32::MAX).max(1);
            let decode_time = u64::try_from(prev.dts - origin).unwrap_or(0);
            let sample = Sample {
                data: prev.data,
                duration,
                keyframe: prev.keyframe,
            };
            published = self.push(sample, decode_time, keyframe, config);
        }
        self.pending = Some(Pending {
            dts,
            data,
            keyframe,
        });
        published
    }

    fn push(
        &mut self,
        sample: Sample,
        decode_time: u64,
        next_is_keyframe: bool,
        config: &MuxerConfig,
    ) -> bool {
        if self.open.is_none() {
            self.open = Some(OpenSegment::new(self.next_msn));
            self.next_msn += 1;
        }
        let Some(open) = self.open.as_mut() else {
            return false;
        };

        if open.samples.is_empty() {
            open.part_start = decode_time;
        }
        open.part_duration += u64::from(sample.duration);
        open.duration += u64::from(sample.duration);
        open.samples.push(sample);

        let close_segment = next_is_keyframe && open.duration >= config.segment_min_ticks();
        if !close_segment && open.part_duration < config.part_min_ticks() {
            return false;
        }

        let samples = std::mem::take(&mut open.samples);
        let part = Part {
            data: fmp4::fragment(self.next_sequence, open.part_start, &samples),
            duration: open.part_duration,
            independent: samples.first().is_some_and(|s| s.keyframe),
        };
        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.max_part_duration = self.max_part_duration.max(part.duration);
        open.parts.push(part);
        open.part_duration = 0;

        if close_segment {
            if let Some(open) = self.open.take() {
                self.close_segment(open, config.segment_count);
            }
        }
        true
    }

    fn close_segment(&mut self, open: OpenSegment, segment_count: usize) {
        let mut data = BytesMut::with_capacity(open.parts.iter().map(|p| p.data.len()).sum());
        for part in &open.parts {
            data.extend_from_slice(&part.data);
        }
        self.max_segment_duration = self.max_segment_duration.max(open.duration);
        self.segments.push_back(Segment {
            msn: open.msn,
            parts: open.parts,
            duration: open.duration,
            data: data.freeze(),
        });
        while self.segments.len() > segment_count {
            self.segments.pop_front();
        }
    }

    /// Media sequence number currently being built.
    fn building_msn(&self) -> u64 {
        self.open.as_ref().map_or(self.next_msn, |o| o.msn)
    }

    fn last_complete_msn(&self) -> Option<u64> {
        self.segments.back().map(|s| s.msn)
    }

    fn playlist_ready(&self, msn: Option<u64>, part: Option<u64>) -> bool {
        if self.segments.is_empty() {
            return false;
        }
        let Some(msn) = msn else {
            return true;
        };
        if self.last_complete_msn().is_some_and(|last| last >= msn) {
            return true;
        }
        match (part, &self.open) {
            (Some(part), Some(open)) => {
                open.msn > msn || (open.msn == msn && open.parts.len() as u64 > part)
            }
            _ => false,
        }
    }

    fn segment(&self, msn: u64) -> Option<Bytes> {
        self.segments
            .iter()
            .find(|s| s.msn == msn)
            .map(|s| s.data.clone())
    }

    fn part(&self, msn: u64, index: usize) -> Option<Bytes> {
        let parts = match &self.open {
            Some(open) if open.msn == msn => &open.parts,
            _ => &self.segments.iter().find(|s| s.msn == msn)?.parts,
        };
        parts.get(index).map(|p| p.data.clone())
    }

    /// Whether a missing part is the next one to be published (the preload
    /// hint) or the first part of the segment after it.
    fn part_is_upcoming(&self, msn: u64, index: usize) -> bool {
        let building = self.building_msn();
        let published = self
            .open
            .as_ref()
            .filter(|o| o.msn == msn)
            .map_or(0, |o| o.parts.len());
        (msn == building && index >= published) || (msn == building + 1 && index == 0)
    }

    fn render(&self, config: &MuxerConfig, uri_query: Option<&str>) -> String {
        let uri = |name: String| match uri_query {
            Some(q) => format!("{name}?{q}"),
            None => name,
        };
        let part_target = seconds(self.max_part_duration.max(config.part_min_ticks()));
        let target_duration = seconds(self.max_segment_duration.max(config.segment_min_ticks()))
            .round()
            .max(1.0);
        let media_sequence = self
            .segments
            .front()
            .map_or(self.building_msn(), |s| s.msn);

        let mut out = String::with_capacity(1024);
        out.push_str("#EXTM3U\n#EXT-X-VERSION:9\n");
        let _ = writeln!(out, "#EXT-X-TARGETDURATION:{target_duration}");
        let _ = writeln!(
            out,
            "#EXT-X-SERVER-CONTROL:CAN-BLOCK-RELOAD=YES,PART-HOLD-BACK={:.5}",
            part_target * 3.0
        );
        let _ = writeln!(out, "#EXT-X-PART-INF:PART-TARGET={part_target:.5}");
        let _ = writeln!(out, "#EXT-X-MEDIA-SEQUENCE:{media_sequence}");
        let _ = writeln!(out, "#EXT-X-MAP:URI=\"{}\"", uri("init.mp4".into()));

        let write_parts = |out: &mut String, msn: u64, parts: &[Part]| {
            for (i, part) in parts.iter().enumerate() {
                let _ = write!(
                    out,
                    "#EXT-X-PART:DURATION={:.5},URI=\"{}\"",
                    seconds(part.duration),
                    uri(format!("part{msn}.{i}.mp4"))
                );
                if part.independent {
                    out.push_str(",INDEPENDENT=YES");
                }
                out.push('\n');
            }
        };

        for segment in &self.segments {
            write_parts(&mut out, segment.msn, &segment.parts);
            let _ = writeln!(out, "#EXTINF:{:.5},", seconds(segment.duration));
            let _ = writeln!(out, "{}", uri(format!("seg{}.mp4", segment.msn)));
        }

        let (hint_msn, hint_index) = match &self.open {
            Some(open) => {
                write_parts(&mut out, open.msn, &open.parts);
                (open.msn, open.parts.len())
            }
            None => (self.next_msn, 0),
        };
        let _ = writeln!(
            out,
            "#EXT-X-PRELOAD-HINT:TYPE=PART,URI=\"{}\"",
            uri(format!("part{hint_msn}.{hint_index}.mp4"))
        );
        out
    }
}

impl LiveMuxer {
    /// Feed one access unit. `pts` is in 90 kHz ticks. Access units before
    /// the first IDR are dropped.
    pub fn write_access_unit(&self, pts: i64, nalus: &[&[u8]]) -> Result<(), MuxerError> {
        if self.is_closed() {
            return Err(MuxerError::Closed);
        }
        let frame: Vec<&[u8]> = nalus.iter().copied().filter(|n| !n.is_empty()).collect();
        if frame.is_empty() {
            return Err(MuxerError::EmptyAccessUnit);
        }
        let keyframe = nal::contains_idr(&frame);
        let data = fmp4::avcc_payload(&frame).ok_or(MuxerError::OversizedNalUnit)?;

        let published = self
            .timeline()
            .write(pts, data, keyframe, &self.inner.config);
        if published {
            self.inner.version.send_modify(|v| *v += 1);
        }
        Ok(())
    }

    /// Stop the muxer: drop buffered media, fail every later request with
    /// 404 and release requests blocked on new media.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.timeline() = Timeline::default();
        self.inner.version.send_modify(|v| *v += 1);
        debug!("HLS muxer closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn init_segment(&self) -> Bytes {
        self.inner.init.clone()
    }

    /// Serve `path` relative to the stream root (`/stream.m3u8`, `/init.mp4`,
    /// `/seg{msn}.mp4`, `/part{msn}.{index}.mp4`).
    pub async fn handle(&self, path: &str, request: &HlsRequest) -> Response {
        if self.is_closed() {
            return not_found();
        }
        let name = path.trim_start_matches('/');
        match name {
            "stream.m3u8" | "index.m3u8" => self.serve_playlist(request).await,
            "init.mp4" => mp4_response(self.inner.init.clone()),
            _ => {
                if let Some(msn) = parse_segment_name(name) {
                    let segment = self.timeline().segment(msn);
                    segment.map_or_else(not_found, mp4_response)
                } else if let Some((msn, index)) = parse_part_name(name) {
                    self.serve_part(msn, index).await
                } else {
                    not_found()
                }
            }
        }
    }

    async fn serve_playlist(&self, request: &HlsRequest) -> Response {
        if request.part.is_some() && request.msn.is_none() {
            return ProxyError::BadRequest("_HLS_part requires _HLS_msn".into()).into_response();
        }
        if let Some(msn) = request.msn {
            let building = self.timeline().building_msn();
            if msn > building + 2 {
                return ProxyError::BadRequest(format!(
                    "_HLS_msn {msn} is too far ahead of the live edge"
                ))
                .into_response();
            }
        }

        let (msn, part) = (request.msn, request.part);
        let ready = self.wait_until(|t| t.playlist_ready(msn, part)).await;
        if self.is_closed() {
            return not_found();
        }

        let playlist = {
            let timeline = self.timeline();
            if !ready && timeline.segments.is_empty() {
                None
            } else {
                Some(timeline.render(&self.inner.config, request.uri_query.as_deref()))
            }
        };
        match playlist {
            Some(body) => (
                [
                    (header::CONTENT_TYPE, PLAYLIST_CONTENT_TYPE),
                    (header::CACHE_CONTROL, "no-cache"),
                ],
                body,
            )
                .into_response(),
            None => ProxyError::NotReady("HLS stream has no segments yet".into()).into_response(),
        }
    }

    async fn serve_part(&self, msn: u64, index: usize) -> Response {
        let (part, upcoming) = {
            let timeline = self.timeline();
            (
                timeline.part(msn, index),
                timeline.part_is_upcoming(msn, index),
            )
        };
        if let Some(data) = part {
            return mp4_response(data);
        }
        if !upcoming {
            return not_found();
        }
        if self.wait_until(|t| t.part(msn, index).is_some()).await {
            if let Some(data) = self.timeline().part(msn, index) {
                return mp4_response(data);
            }
        }
        not_found()
    }

    /// Wait until `ready` holds, the muxer closes, or the blocking timeout
    /// elapses. Returns whether `ready` held.
    async fn wait_until<F>(&self, mut ready: F) -> bool
    where
        F: FnMut(&Timeline) -> bool,
    {
        let mut version = self.inner.version.subscribe();
        let deadline = tokio::time::sleep(self.inner.config.blocking_timeout);
        tokio::pin!(deadline);
        loop {
            if self.is_closed() {
                return false;
            }
            let satisfied = {
                let timeline = self.timeline();
                ready(&timeline)
            };
            if satisfied {
                return true;
            }
            tokio::select! {
                changed = version.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
                () = &mut deadline => return false,
            }
        }
    }

    fn timeline(&self) -> MutexGuard<'_, Timeline> {
        self.inner
            .timeline
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn parse_segment_name(name: &str) -> Option<u64> {
    name.strip_prefix("seg")?.strip_suffix(".mp4")?.parse().ok()
}

fn parse_part_name(name: &str) -> Option<(u64, usize)> {
    let rest = name.strip_prefix("part")?.strip_suffix(".mp4")?;
    let (msn, index) = rest.split_once('.')?;
    Some((msn.parse().ok()?, index.parse().ok()?))
}

fn mp4_response(data: Bytes) -> Response {
    (
        [
            (header::CONTENT_TYPE, MP4_CONTENT_TYPE),
            (header::CACHE_CONTROL, "max-age=60"),
        ],
        data,
    )
        .into_response()
}

fn not_found() -> Response {
    ProxyError::NotFound("HLS resource not found".into()).into_response()
}
