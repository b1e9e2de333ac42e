//! HLS muxer registry
//!
//! One muxer per path, created lazily on the first playlist request. A
//! muxer is an ordinary reader on the path's stream; segment packaging
//! happens outside the core behind [`SegmentSink`]. Muxers that receive
//! no requests for a linger window are closed by a periodic sweep.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::auth::{AuthProtocol, Credentials};
use crate::error::RelayError;
use crate::media::{track_ids, TrackId, Unit};
use crate::path::{PathAuthor, PathHandle, PathManagerHandle};
use crate::stream::Stream;

use super::{unix_seconds, ByteCounters, SessionId, SessionKind};

/// How often idle muxers are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Where the muxer hands units for segment packaging.
pub trait SegmentSink: Send + Sync {
    fn write_unit(&self, track: TrackId, unit: &Unit);
}

/// Listing entry for `/v1/hlsmuxers/list`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HlsMuxerInfo {
    pub path: String,
    pub created: u64,
    pub last_request: u64,
    pub bytes_sent: u64,
}

pub struct HlsMuxer {
    pub id: SessionId,
    pub path_name: String,
    pub created: SystemTime,
    pub bytes: ByteCounters,

    path: PathHandle,
    stream: Arc<Stream>,
    last_request: Mutex<Instant>,
    last_request_wall: Mutex<SystemTime>,
    closed: Mutex<bool>,
}

impl HlsMuxer {
    pub fn kind(&self) -> SessionKind {
        SessionKind::HlsMuxer
    }

    /// Bump the idle clock; called by the wire layer per playlist or
    /// segment request.
    pub fn on_request(&self) {
        *self.last_request.lock().unwrap() = Instant::now();
        *self.last_request_wall.lock().unwrap() = SystemTime::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_request.lock().unwrap().elapsed()
    }

    fn on_close(&self, reason: &str) {
        {
            let mut closed = self.closed.lock().unwrap();
            if *closed {
                return;
            }
            *closed = true;
        }
        self.stream.reader_remove(self.id);
        self.path.reader_remove(self.id);
        tracing::info!(muxer = %self.id.short(), path = %self.path_name, "destroyed ({reason})");
    }
}

/// HLS server facade: muxer registry plus the idle sweep.
pub struct HlsServer {
    path_manager: PathManagerHandle,
    cancel: CancellationToken,
    /// Muxers idle longer than this are closed.
    linger: Duration,
    muxers: Arc<Mutex<HashMap<String, Arc<HlsMuxer>>>>,
}

impl HlsServer {
    pub fn new(
        linger: Duration,
        path_manager: PathManagerHandle,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let server = Arc::new(Self {
            path_manager,
            cancel,
            linger,
            muxers: Arc::new(Mutex::new(HashMap::new())),
        });
        server.spawn_sweep_task();
        server
    }

    /// Get or create the muxer for `path_name`. Creating one joins the
    /// path as a reader, which may wait for an on-demand source.
    pub async fn muxer_request(
        &self,
        path_name: &str,
        query: &str,
        remote_ip: IpAddr,
        sink: Arc<dyn SegmentSink>,
    ) -> Result<Arc<HlsMuxer>, RelayError> {
        if let Some(muxer) = self.muxers.lock().unwrap().get(path_name) {
            muxer.on_request();
            return Ok(Arc::clone(muxer));
        }

        let id = SessionId::new();
        let muxers = Arc::clone(&self.muxers);
        let close_path_name = path_name.to_string();
        let author = PathAuthor::new(
            id,
            SessionKind::HlsMuxer,
            Arc::new(move || {
                let muxer = muxers.lock().unwrap().remove(&close_path_name);
                if let Some(muxer) = muxer {
                    muxer.on_close("closed by path");
                }
            }),
        );

        let mut credentials = Credentials::anonymous(remote_ip, AuthProtocol::Hls);
        credentials.query = query.to_string();
        if let Some(user) = crate::auth::query_param(query, "user") {
            credentials.user = user.to_string();
        }
        if let Some(pass) = crate::auth::query_param(query, "pass") {
            credentials.pass = pass.to_string();
        }

        let (path, stream) = self
            .path_manager
            .reader_add(path_name, author, credentials)
            .await?;

        let muxer = Arc::new(HlsMuxer {
            id,
            path_name: path_name.to_string(),
            created: SystemTime::now(),
            bytes: ByteCounters::default(),
            path,
            stream: Arc::clone(&stream),
            last_request: Mutex::new(Instant::now()),
            last_request_wall: Mutex::new(SystemTime::now()),
            closed: Mutex::new(false),
        });

        for track in track_ids(stream.medias()) {
            let sink = Arc::clone(&sink);
            let muxer_ref = Arc::downgrade(&muxer);
            stream.reader_add(
                id,
                track,
                Arc::new(move |unit: Arc<Unit>| {
                    sink.write_unit(track, &unit);
                    if let Some(muxer) = muxer_ref.upgrade() {
                        muxer.bytes.add_sent(unit.size() as u64);
                    }
                }),
            );
        }

        // a concurrent request may have won the race while we awaited
        {
            let mut muxers = self.muxers.lock().unwrap();
            if let Some(existing) = muxers.get(path_name) {
                let existing = Arc::clone(existing);
                drop(muxers);
                muxer.on_close("superseded");
                existing.on_request();
                return Ok(existing);
            }
            muxers.insert(path_name.to_string(), Arc::clone(&muxer));
        }
        tracing::info!(muxer = %muxer.id.short(), path = %path_name, "created");
        Ok(muxer)
    }

    fn spawn_sweep_task(&self) {
        let muxers = Arc::clone(&self.muxers);
        let linger = self.linger;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        for (_, muxer) in muxers.lock().unwrap().drain() {
                            muxer.on_close("terminated");
                        }
                        return;
                    }
                    _ = ticker.tick() => {
                        let idle: Vec<Arc<HlsMuxer>> = muxers
                            .lock()
                            .unwrap()
                            .values()
                            .filter(|m| m.idle_for() > linger)
                            .map(Arc::clone)
                            .collect();
                        for muxer in idle {
                            muxers.lock().unwrap().remove(&muxer.path_name);
                            muxer.on_close("not requested anymore");
                        }
                    }
                }
            }
        });
    }

    pub fn api_muxers_list(&self) -> Vec<HlsMuxerInfo> {
        self.muxers
            .lock()
            .unwrap()
            .values()
            .map(|m| HlsMuxerInfo {
                path: m.path_name.clone(),
                created: unix_seconds(m.created),
                last_request: unix_seconds(*m.last_request_wall.lock().unwrap()),
                bytes_sent: m.bytes.sent(),
            })
            .collect()
    }
}
