//! RTMP connection wrappers
//!
//! An RTMP connection runs in one of two modes, decided by the first
//! command the wire layer sees: `publish` makes it a publisher (track
//! list derived from stream metadata), `play` makes it a reader.
//! Credentials travel in the connection's query string.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::SystemTime;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::auth::{self, AuthProtocol, Credentials};
use crate::error::RelayError;
use crate::media::{summarize_medias, Media, RtpPacket, TrackId, Unit};
use crate::path::{HookCmd, PathAuthor, PathHandle, PathManagerHandle};
use crate::stream::Stream;

use super::{unix_seconds, ByteCounters, PacketSink, SessionId, SessionKind};

/// Listing entry for `/v1/rtmp{,s}conns/list`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RtmpConnInfo {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub id: String,
    pub remote_addr: String,
    pub created: u64,
    pub state: &'static str,
    pub path: Option<String>,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtmpConnState {
    Idle,
    Publish,
    Read,
}

impl RtmpConnState {
    fn api_str(&self) -> &'static str {
        match self {
            RtmpConnState::Idle => "idle",
            RtmpConnState::Publish => "publish",
            RtmpConnState::Read => "read",
        }
    }
}

pub struct RtmpConn {
    pub id: SessionId,
    pub remote_addr: SocketAddr,
    pub created: SystemTime,
    pub bytes: ByteCounters,
    pub cancel: CancellationToken,

    is_tls: bool,
    path_manager: PathManagerHandle,
    state: Mutex<RtmpConnState>,
    path: Mutex<Option<PathHandle>>,
    stream: Mutex<Option<Arc<Stream>>>,
    first_ts: Mutex<HashMap<TrackId, u32>>,
    on_read_cmd: Mutex<Option<HookCmd>>,
    closed: Mutex<bool>,
    weak_self: Weak<RtmpConn>,
}

impl RtmpConn {
    pub fn kind(&self) -> SessionKind {
        if self.is_tls {
            SessionKind::RtmpsConn
        } else {
            SessionKind::RtmpConn
        }
    }

    pub fn safe_state(&self) -> RtmpConnState {
        *self.state.lock().unwrap()
    }

    pub fn path_name(&self) -> Option<String> {
        self.path
            .lock()
            .unwrap()
            .as_ref()
            .map(|p| p.name().to_string())
    }

    fn author(&self) -> PathAuthor {
        let weak = self.weak_self.clone();
        PathAuthor::new(
            self.id,
            self.kind(),
            Arc::new(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.on_close("closed by path");
                }
            }),
        )
    }

    fn credentials(&self, query: &str) -> Credentials {
        Credentials {
            user: auth::query_param(query, "user").unwrap_or_default().to_string(),
            pass: auth::query_param(query, "pass").unwrap_or_default().to_string(),
            query: query.to_string(),
            ip: self.remote_addr.ip(),
            proto: AuthProtocol::Rtmp,
            rtsp: None,
        }
    }

    /// `publish` command: reserve the slot and immediately finalize the
    /// metadata-derived track list (RTMP has no separate start step).
    pub async fn on_publish(
        &self,
        path_name: &str,
        query: &str,
        medias: Vec<Media>,
    ) -> Result<(), RelayError> {
        if self.safe_state() != RtmpConnState::Idle {
            return Err(RelayError::BadRequest("already publishing or playing".into()));
        }

        let path = self
            .path_manager
            .publisher_add(path_name, self.author(), self.credentials(query))
            .await?;
        // RTMP sources hand over demuxed payloads; readers re-packetize
        let stream = path.publisher_start(self.id, medias.clone(), true).await?;

        *self.path.lock().unwrap() = Some(path.clone());
        *self.stream.lock().unwrap() = Some(stream);
        *self.state.lock().unwrap() = RtmpConnState::Publish;

        tracing::info!(
            conn = %self.id.short(),
            "is publishing to path '{}', {}",
            path.name(),
            summarize_medias(&medias)
        );
        Ok(())
    }

    /// `play` command: join as a reader and re-emit every track through
    /// `sink`. Returns the track list so the wire layer can announce it.
    pub async fn on_play(
        &self,
        path_name: &str,
        query: &str,
        sink: Arc<dyn PacketSink>,
    ) -> Result<Vec<Media>, RelayError> {
        if self.safe_state() != RtmpConnState::Idle {
            return Err(RelayError::BadRequest("already publishing or playing".into()));
        }

        let (path, stream) = self
            .path_manager
            .reader_add(path_name, self.author(), self.credentials(query))
            .await?;

        for track in crate::media::track_ids(stream.medias()) {
            let sink = Arc::clone(&sink);
            let weak: Weak<RtmpConn> = self.weak_self.clone();
            stream.reader_add(
                self.id,
                track,
                Arc::new(move |unit: Arc<Unit>| {
                    for packet in &unit.rtp_packets {
                        let ok = sink.write_rtp(track, packet);
                        if let Some(conn) = weak.upgrade() {
                            if ok {
                                conn.bytes.add_sent(packet.size() as u64);
                            } else {
                                conn.on_close("write error");
                                return;
                            }
                        }
                    }
                }),
            );
        }

        let medias = stream.medias().to_vec();
        tracing::info!(
            conn = %self.id.short(),
            "is reading from path '{}', {}",
            path.name(),
            summarize_medias(&medias)
        );

        let conf = path.safe_conf();
        if !conf.run_on_read.is_empty() {
            *self.on_read_cmd.lock().unwrap() = Some(HookCmd::spawn(
                "runOnRead",
                &conf.run_on_read,
                conf.run_on_read_restart,
                path.name(),
                query,
            ));
        }

        *self.path.lock().unwrap() = Some(path);
        *self.stream.lock().unwrap() = Some(stream);
        *self.state.lock().unwrap() = RtmpConnState::Read;
        Ok(medias)
    }

    /// Incoming media while publishing.
    pub fn write_packet(&self, track: TrackId, packet: RtpPacket) {
        if self.safe_state() != RtmpConnState::Publish {
            return;
        }
        let stream = match self.stream.lock().unwrap().as_ref() {
            Some(stream) => Arc::clone(stream),
            None => return,
        };
        let format = match stream
            .medias()
            .get(track.media)
            .and_then(|m| m.formats.get(track.format))
        {
            Some(format) => format.clone(),
            None => return,
        };

        self.bytes.add_received(packet.size() as u64);
        let pts = {
            let mut first = self.first_ts.lock().unwrap();
            let base = *first.entry(track).or_insert(packet.timestamp);
            let elapsed = packet.timestamp.wrapping_sub(base);
            std::time::Duration::from_secs_f64(
                f64::from(elapsed) / f64::from(format.clock_rate.max(1)),
            )
        };
        stream.write_unit(track, Unit::from_rtp(format.codec, pts, packet));
    }

    /// Detach from the path. Idempotent.
    pub fn on_close(&self, reason: &str) {
        {
            let mut closed = self.closed.lock().unwrap();
            if *closed {
                return;
            }
            *closed = true;
        }

        if self.on_read_cmd.lock().unwrap().take().is_some() {
            tracing::info!(conn = %self.id.short(), "runOnRead command stopped");
        }

        let path = self.path.lock().unwrap().take();
        let stream = self.stream.lock().unwrap().take();
        match self.safe_state() {
            RtmpConnState::Read => {
                if let Some(stream) = &stream {
                    stream.reader_remove(self.id);
                }
                if let Some(path) = &path {
                    path.reader_remove(self.id);
                }
            }
            RtmpConnState::Publish => {
                if let Some(path) = &path {
                    path.publisher_remove(self.id);
                }
            }
            RtmpConnState::Idle => {}
        }

        self.cancel.cancel();
        tracing::info!(conn = %self.id.short(), "destroyed ({reason})");
    }
}

/// RTMP (or RTMPS) server facade.
pub struct RtmpServer {
    is_tls: bool,
    path_manager: PathManagerHandle,
    cancel: CancellationToken,
    conns: Mutex<HashMap<SessionId, Arc<RtmpConn>>>,
}

impl RtmpServer {
    pub fn new(
        is_tls: bool,
        path_manager: PathManagerHandle,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            is_tls,
            path_manager,
            cancel,
            conns: Mutex::new(HashMap::new()),
        })
    }

    pub fn conn_new(&self, remote_addr: SocketAddr) -> Arc<RtmpConn> {
        let conn = Arc::new_cyclic(|weak| RtmpConn {
            id: SessionId::new(),
            remote_addr,
            created: SystemTime::now(),
            bytes: ByteCounters::default(),
            cancel: self.cancel.child_token(),
            is_tls: self.is_tls,
            path_manager: self.path_manager.clone(),
            state: Mutex::new(RtmpConnState::Idle),
            path: Mutex::new(None),
            stream: Mutex::new(None),
            first_ts: Mutex::new(HashMap::new()),
            on_read_cmd: Mutex::new(None),
            closed: Mutex::new(false),
            weak_self: weak.clone(),
        });
        self.conns.lock().unwrap().insert(conn.id, Arc::clone(&conn));
        tracing::info!(conn = %conn.id.short(), "created by {}", remote_addr);
        conn
    }

    pub fn conn_close(&self, id: SessionId, reason: &str) {
        let conn = self.conns.lock().unwrap().remove(&id);
        if let Some(conn) = conn {
            conn.on_close(reason);
        }
    }

    pub fn api_conns_list(&self) -> Vec<RtmpConnInfo> {
        self.conns
            .lock()
            .unwrap()
            .values()
            .map(|c| RtmpConnInfo {
                kind: c.kind().as_str(),
                id: c.id.to_string(),
                remote_addr: c.remote_addr.to_string(),
                created: unix_seconds(c.created),
                state: c.safe_state().api_str(),
                path: c.path_name(),
                bytes_received: c.bytes.received(),
                bytes_sent: c.bytes.sent(),
            })
            .collect()
    }

    pub fn api_conn_kick(&self, id: &str) -> bool {
        let conn = self
            .conns
            .lock()
            .unwrap()
            .values()
            .find(|c| c.id.to_string() == id)
            .map(Arc::clone);
        match conn {
            Some(conn) => {
                self.conn_close(conn.id, "kicked");
                true
            }
            None => false,
        }
    }
}
