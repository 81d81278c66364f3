//! Per-session HLS state and its registry.
//!
//! A [`StreamingSession`] exists from the first manifest request until the
//! idle reaper or server shutdown removes it. Its ingest worker fills in the
//! SPS/PPS and starts the muxer; HTTP handlers only read.
//!
//! ## Concurrency
//!
//! The registry is behind a `tokio::sync::RwLock`. Lookups take the read
//! lock; creation, sweep and shutdown take the write lock. Creation re-checks
//! under the write lock so two concurrent first requests spawn one worker.
//! Per-session media state is behind a `tokio::sync::Mutex`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, Instrument};

use super::fmp4::H264Track;
use super::ingest::{IngestSettings, VideoIngestWorker};
use super::muxer::{self, LiveMuxer, MuxerConfig, MuxerError};
use super::nal::{self, NAL_PPS, NAL_SPS};
use super::StreamParams;
use crate::config::HlsConfig;
use crate::tunnel::TunnelDialer;

/// Interval between `started` checks while a request waits for the muxer.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lifecycle of a session's muxer. Closing is only defined on `Started`, so a
/// muxer whose start never succeeded is never closed.
pub enum MuxerState {
    Uninitialized(MuxerConfig),
    Started(LiveMuxer),
}

impl MuxerState {
    /// Start the muxer for `track`. Starting an already started muxer returns
    /// the existing handle.
    pub fn start(&mut self, track: &H264Track) -> Result<LiveMuxer, MuxerError> {
        match self {
            Self::Started(muxer) => Ok(muxer.clone()),
            Self::Uninitialized(config) => {
                let muxer = muxer::start(config.clone(), track)?;
                *self = Self::Started(muxer.clone());
                Ok(muxer)
            }
        }
    }

    pub fn started(&self) -> Option<&LiveMuxer> {
        match self {
            Self::Started(muxer) => Some(muxer),
            Self::Uninitialized(_) => None,
        }
    }

    /// Close the muxer if it was started.
    pub fn close(&self) {
        if let Self::Started(muxer) = self {
            muxer.close();
        }
    }
}

struct SessionMedia {
    sps: Option<Bytes>,
    pps: Option<Bytes>,
    muxer: MuxerState,
}

/// HLS state for one sandbox session.
pub struct StreamingSession {
    session_id: String,
    params: StreamParams,
    media: Mutex<SessionMedia>,
    /// Shared with the registry so idle time is a single subtraction.
    epoch: Instant,
    last_access_ms: AtomicU64,
    cancel: CancellationToken,
}

impl StreamingSession {
    pub(crate) fn new(
        session_id: &str,
        params: StreamParams,
        config: MuxerConfig,
        epoch: Instant,
        cancel: CancellationToken,
    ) -> Self {
        let session = Self {
            session_id: session_id.to_string(),
            params,
            media: Mutex::new(SessionMedia {
                sps: None,
                pps: None,
                muxer: MuxerState::Uninitialized(config),
            }),
            epoch,
            last_access_ms: AtomicU64::new(0),
            cancel,
        };
        session.touch();
        session
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn params(&self) -> StreamParams {
        self.params
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Record a client request.
    pub fn touch(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_access_ms.store(now, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        let last = self.last_access_ms.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last))
    }

    pub async fn muxer(&self) -> Option<LiveMuxer> {
        self.media.lock().await.muxer.started().cloned()
    }

    pub async fn is_started(&self) -> bool {
        self.muxer().await.is_some()
    }

    /// Poll for the muxer to start, up to `timeout`.
    pub async fn wait_started(&self, timeout: Duration) -> Option<LiveMuxer> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(muxer) = self.muxer().await {
                return Some(muxer);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    /// Capture the first SPS and PPS seen in `nalus` and start the muxer once
    /// both are known. Returns the muxer when it is running.
    pub async fn observe_parameter_sets(
        &self,
        nalus: &[&[u8]],
        width: u16,
        height: u16,
    ) -> Result<Option<LiveMuxer>, MuxerError> {
        let mut media = self.media.lock().await;
        for nalu in nalus {
            match nal::nal_type(nalu) {
                Some(NAL_SPS) if media.sps.is_none() => {
                    media.sps = Some(Bytes::copy_from_slice(nalu));
                }
                Some(NAL_PPS) if media.pps.is_none() => {
                    media.pps = Some(Bytes::copy_from_slice(nalu));
                }
                _ => {}
            }
        }

        if let Some(muxer) = media.muxer.started() {
            return Ok(Some(muxer.clone()));
        }
        let (Some(sps), Some(pps)) = (media.sps.clone(), media.pps.clone()) else {
            return Ok(None);
        };

        let track = H264Track {
            sps,
            pps,
            width: if width > 0 { width } else { clamp_u16(self.params.width) },
            height: if height > 0 { height } else { clamp_u16(self.params.height) },
        };
        let muxer = media.muxer.start(&track)?;
        info!(
            session_id = %self.session_id,
            codec = %track.codec(),
            width = track.width,
            height = track.height,
            "HLS muxer started"
        );
        Ok(Some(muxer))
    }

    /// Stop the ingest worker and close the muxer if it started.
    pub(crate) async fn close(&self) {
        self.cancel.cancel();
        self.media.lock().await.muxer.close();
    }
}

fn clamp_u16(v: u32) -> u16 {
    u16::try_from(v).unwrap_or(u16::MAX)
}

/// Registry of HLS sessions.
///
/// Cloneable; all clones share the same registry.
#[derive(Clone)]
pub struct HlsSessionManager {
    sessions: Arc<RwLock<HashMap<String, Arc<StreamingSession>>>>,
    config: Arc<HlsConfig>,
    dialer: Arc<dyn TunnelDialer>,
    /// Parent of every session's cancellation token.
    root: CancellationToken,
    epoch: Instant,
}

impl HlsSessionManager {
    pub fn new(config: HlsConfig, dialer: Arc<dyn TunnelDialer>) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            config: Arc::new(config),
            dialer,
            root: CancellationToken::new(),
            epoch: Instant::now(),
        }
    }

    pub fn config(&self) -> &HlsConfig {
        &self.config
    }

    /// Return the session for `session_id`, creating it and spawning its
    /// ingest worker on first use. Refreshes the idle clock either way.
    /// `params` only apply when the session is created.
    pub async fn get_or_create(&self, session_id: &str, params: StreamParams) -> Arc<StreamingSession> {
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(session_id) {
                session.touch();
                return Arc::clone(session);
            }
        }

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(session_id) {
            session.touch();
            return Arc::clone(session);
        }

        let session = Arc::new(StreamingSession::new(
            session_id,
            params,
            MuxerConfig::from_config(&self.config),
            self.epoch,
            self.root.child_token(),
        ));
        let worker = VideoIngestWorker::new(
            Arc::clone(&session),
            Arc::clone(&self.dialer),
            IngestSettings::from_config(&self.config),
        );
        tokio::spawn(
            worker
                .run()
                .instrument(info_span!("hls_ingest", session_id = %session_id)),
        );
        sessions.insert(session_id.to_string(), Arc::clone(&session));

        info!(
            session_id,
            width = params.width,
            height = params.height,
            bitrate = params.bitrate_kbps,
            fps = params.fps,
            "HLS session created"
        );
        session
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<StreamingSession>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Remove sessions idle for longer than the configured timeout. Returns
    /// how many were removed.
    pub async fn sweep_idle(&self) -> usize {
        let idle_timeout = self.config.idle_timeout();
        let expired: Vec<Arc<StreamingSession>> = {
            let mut sessions = self.sessions.write().await;
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| s.idle_for() > idle_timeout)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        for session in &expired {
            info!(
                session_id = %session.session_id(),
                idle_secs = session.idle_for().as_secs(),
                "Cleaning up idle HLS session"
            );
            session.close().await;
        }
        expired.len()
    }

    /// Run [`Self::sweep_idle`] periodically until `shutdown` is cancelled.
    pub fn spawn_reaper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        let period = self.config.sweep_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        manager.sweep_idle().await;
                    }
                }
            }
        })
    }

    /// Tear down every session.
    pub async fn shutdown(&self) {
        self.root.cancel();
        let drained: Vec<Arc<StreamingSession>> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, s)| s).collect()
        };
        if drained.is_empty() {
            return;
        }
        for session in &drained {
            session.close().await;
        }
        info!("Shut down {} HLS session(s)", drained.len());
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hls::muxer::HlsRequest;
    use crate::tunnel::testing::{DuplexDialer, NoPeers};
    use axum::http::StatusCode;
    use futures::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    const SPS: &[u8] = &[0x67, 0x42, 0xC0, 0x1F, 0x8C, 0x8D];
    const PPS: &[u8] = &[0x68, 0xCE, 0x3C, 0x80];

    fn test_config() -> HlsConfig {
        HlsConfig {
            idle_timeout_secs: 0,
            reconnect_delay_ms: 20,
            blocking_timeout_ms: 2000,
            ..HlsConfig::default()
        }
    }

    fn track() -> H264Track {
        H264Track {
            sps: Bytes::from_static(SPS),
            pps: Bytes::from_static(PPS),
            width: 640,
            height: 360,
        }
    }

    #[test]
    fn test_muxer_state_start_is_idempotent() {
        let mut state = MuxerState::Uninitialized(MuxerConfig::from_config(&HlsConfig::default()));
        assert!(state.started().is_none());
        let first = state.start(&track()).unwrap();
        let second = state.start(&track()).unwrap();
        second.close();
        assert!(first.is_closed());
    }

    #[test]
    fn test_uninitialized_close_is_a_no_op() {
        let state = MuxerState::Uninitialized(MuxerConfig::from_config(&HlsConfig::default()));
        state.close();
        assert!(state.started().is_none());
    }

    #[tokio::test]
    async fn test_get_or_create_reuses_session() {
        let manager = HlsSessionManager::new(test_config(), Arc::new(NoPeers));
        let a = manager.get_or_create("ses_1", StreamParams::default()).await;
        let b = manager
            .get_or_create(
                "ses_1",
                StreamParams::from_query(Some("640"), None, None, None),
            )
            .await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.params().width, 1280);
        assert_eq!(manager.session_count().await, 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_parameter_sets_start_muxer_once() {
        let session = StreamingSession::new(
            "ses_p",
            StreamParams::default(),
            MuxerConfig::from_config(&HlsConfig::default()),
            Instant::now(),
            CancellationToken::new(),
        );
        assert!(session.observe_parameter_sets(&[SPS], 0, 0).await.unwrap().is_none());
        let other_sps: &[u8] = &[0x67, 0x64, 0x00, 0x28];
        let muxer = session
            .observe_parameter_sets(&[other_sps, PPS], 0, 0)
            .await
            .unwrap()
            .unwrap();
        assert!(session.is_started().await);

        // The first SPS wins.
        let init = muxer.init_segment();
        assert!(init.windows(SPS.len()).any(|w| w == SPS));
        assert!(!init.windows(other_sps.len()).any(|w| w == other_sps));
    }

    #[tokio::test]
    async fn test_sweep_closes_started_muxer_and_skips_unstarted() {
        let manager = HlsSessionManager::new(test_config(), Arc::new(NoPeers));
        let started = manager.get_or_create("ses_started", StreamParams::default()).await;
        let pending = manager.get_or_create("ses_pending", StreamParams::default()).await;
        let muxer = started
            .observe_parameter_sets(&[SPS, PPS], 640, 360)
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.sweep_idle().await, 2);

        assert!(muxer.is_closed());
        assert!(started.cancel_token().is_cancelled());
        assert!(pending.cancel_token().is_cancelled());
        assert!(!pending.is_started().await);
        assert_eq!(manager.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_sweep_keeps_recently_used_sessions() {
        let config = HlsConfig {
            idle_timeout_secs: 300,
            ..test_config()
        };
        let manager = HlsSessionManager::new(config, Arc::new(NoPeers));
        manager.get_or_create("ses_1", StreamParams::default()).await;
        assert_eq!(manager.sweep_idle().await, 0);
        assert_eq!(manager.session_count().await, 1);
        manager.shutdown().await;
        assert_eq!(manager.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_reaper_stops_on_shutdown() {
        let manager = HlsSessionManager::new(test_config(), Arc::new(NoPeers));
        let shutdown = CancellationToken::new();
        let reaper = manager.spawn_reaper(shutdown.clone());
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), reaper)
            .await
            .unwrap()
            .unwrap();
    }

    /// Encode one frame in the private video wire format.
    fn wire_frame(keyframe: bool, pts_us: u64, nalus: &[&[u8]]) -> Vec<u8> {
        let mut frame = vec![0x01, 0x00, u8::from(keyframe)];
        frame.extend_from_slice(&pts_us.to_be_bytes());
        frame.extend_from_slice(&640u16.to_be_bytes());
        frame.extend_from_slice(&360u16.to_be_bytes());
        for nalu in nalus {
            frame.extend_from_slice(&[0, 0, 0, 1]);
            frame.extend_from_slice(nalu);
        }
        frame
    }

    #[tokio::test]
    async fn test_synthetic_source_produces_playlist() {
        let dialer = Arc::new(DuplexDialer::new());
        let mut peers = dialer.register("desktop-ses_demo");

        tokio::spawn(async move {
            let Some(stream) = peers.recv().await else {
                return;
            };
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            let Some(Ok(Message::Text(init))) = ws.next().await else {
                panic!("expected init message");
            };
            let init: serde_json::Value = serde_json::from_str(init.as_str()).unwrap();
            assert_eq!(init["type"], "init");
            assert_eq!(init["width"], 640);
            assert_eq!(init["gop_size"], 30);

            let idr: &[u8] = &[0x65, 0x88, 0x84, 0x21];
            let slice: &[u8] = &[0x41, 0x9A, 0x02];
            for i in 0..75u64 {
                // Small timestamps sit before the worker's start time, so
                // the frame-index clock is used.
                let frame = if i % 30 == 0 {
                    wire_frame(true, i, &[SPS, PPS, idr])
                } else {
                    wire_frame(false, i, &[slice])
                };
                ws.send(Message::Binary(frame.into())).await.unwrap();
            }
            // Non-video messages are ignored.
            ws.send(Message::Binary(vec![0x02; 20].into())).await.unwrap();
            while ws.next().await.is_some() {}
        });

        let manager = HlsSessionManager::new(test_config(), dialer);
        let params = StreamParams::from_query(Some("640"), Some("360"), None, None);
        let session = manager.get_or_create("ses_demo", params).await;

        let muxer = session
            .wait_started(Duration::from_secs(5))
            .await
            .expect("muxer should start");
        let resp = muxer
            .handle("/stream.m3u8", &HlsRequest { msn: Some(1), ..HlsRequest::default() })
            .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let playlist = String::from_utf8(body.to_vec()).unwrap();
        assert!(playlist.contains("#EXT-X-MAP:URI=\"init.mp4\""));
        assert!(playlist.contains("seg0.mp4"));
        assert!(playlist.contains("seg1.mp4"));
        assert!(playlist.contains("#EXT-X-PRELOAD-HINT"));

        let segment = muxer.handle("/seg1.mp4", &HlsRequest::default()).await;
        assert_eq!(segment.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(segment.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(!bytes.windows(SPS.len()).any(|w| w == SPS));

        manager.shutdown().await;
        assert!(muxer.is_closed());
    }
}
