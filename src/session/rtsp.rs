//! RTSP server and session wrappers
//!
//! A connection record carries the digest nonce and byte counters; a
//! session drives the four-state machine (`initial`, `prePlay`/`play`,
//! `preRecord`/`record`) against the path interface. The RTSP wire
//! protocol itself lives outside the core: it calls into these methods
//! with parsed requests and moves RTP through [`PacketSink`] /
//! [`RtspSession::write_packet`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::SystemTime;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::auth::{self, AuthProtocol, Credentials, RtspAuthorization, RtspCredentials};
use crate::error::RelayError;
use crate::media::{summarize_medias, Media, RtpPacket, TrackId, Unit};
use crate::path::{HookCmd, PathAuthor, PathHandle, PathManagerHandle};
use crate::stream::Stream;

use super::{unix_seconds, ByteCounters, PacketSink, SessionId, SessionKind};

/// Listing entry for `/v1/rtsp{,s}conns/list`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RtspConnInfo {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub id: String,
    pub remote_addr: String,
    pub created: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

/// Listing entry for `/v1/rtsp{,s}sessions/list`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RtspSessionInfo {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub id: String,
    pub remote_addr: String,
    pub created: u64,
    pub state: &'static str,
    pub path: Option<String>,
}

/// One RTSP control connection. Sessions are layered on top by the wire
/// protocol; the connection owns the digest nonce.
pub struct RtspConn {
    pub id: SessionId,
    pub remote_addr: SocketAddr,
    pub created: SystemTime,
    pub bytes: ByteCounters,
    is_tls: bool,
    nonce: Mutex<Option<String>>,
}

impl RtspConn {
    pub fn kind(&self) -> SessionKind {
        if self.is_tls {
            SessionKind::RtspsConn
        } else {
            SessionKind::RtspConn
        }
    }

    /// Nonce for digest challenges, generated lazily and kept for the
    /// connection's lifetime.
    pub fn nonce(&self) -> String {
        let mut nonce = self.nonce.lock().unwrap();
        nonce
            .get_or_insert_with(auth::generate_nonce)
            .clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtspSessionState {
    Initial,
    PrePlay,
    Play,
    PreRecord,
    Record,
}

impl RtspSessionState {
    fn api_str(&self) -> &'static str {
        match self {
            RtspSessionState::Initial => "idle",
            RtspSessionState::PrePlay | RtspSessionState::Play => "read",
            RtspSessionState::PreRecord | RtspSessionState::Record => "publish",
        }
    }
}

pub struct RtspSession {
    pub id: SessionId,
    pub remote_addr: SocketAddr,
    pub created: SystemTime,
    pub bytes: ByteCounters,
    /// Cancelled on kick or path-driven teardown; the wire layer watches
    /// it and closes the transport.
    pub cancel: CancellationToken,

    is_tls: bool,
    path_manager: PathManagerHandle,
    state: Mutex<RtspSessionState>,
    path: Mutex<Option<PathHandle>>,
    stream: Mutex<Option<Arc<Stream>>>,
    announced_medias: Mutex<Vec<Media>>,
    setup_tracks: Mutex<Vec<TrackId>>,
    first_ts: Mutex<HashMap<TrackId, u32>>,
    on_read_cmd: Mutex<Option<HookCmd>>,
    closed: Mutex<bool>,
    weak_self: Weak<RtspSession>,
}

impl RtspSession {
    pub fn kind(&self) -> SessionKind {
        if self.is_tls {
            SessionKind::RtspsSession
        } else {
            SessionKind::RtspSession
        }
    }

    pub fn safe_state(&self) -> RtspSessionState {
        *self.state.lock().unwrap()
    }

    pub fn path_name(&self) -> Option<String> {
        self.path
            .lock()
            .unwrap()
            .as_ref()
            .map(|p| p.name().to_string())
    }

    fn set_state(&self, state: RtspSessionState) {
        *self.state.lock().unwrap() = state;
    }

    fn author(&self) -> PathAuthor {
        let weak = self.weak_self.clone();
        PathAuthor::new(
            self.id,
            self.kind(),
            Arc::new(move || {
                if let Some(session) = weak.upgrade() {
                    session.on_close("closed by path");
                }
            }),
        )
    }

    fn credentials(
        &self,
        conn: &RtspConn,
        method: &str,
        query: &str,
        authorization: Option<RtspAuthorization>,
    ) -> Credentials {
        Credentials {
            user: auth::query_param(query, "user").unwrap_or_default().to_string(),
            pass: auth::query_param(query, "pass").unwrap_or_default().to_string(),
            query: query.to_string(),
            ip: self.remote_addr.ip(),
            proto: AuthProtocol::Rtsp,
            rtsp: Some(RtspCredentials {
                method: method.to_string(),
                authorization,
                nonce: conn.nonce(),
            }),
        }
    }

    /// ANNOUNCE: reserve the path's publisher slot.
    pub async fn on_announce(
        &self,
        conn: &RtspConn,
        path_name: &str,
        query: &str,
        medias: Vec<Media>,
        authorization: Option<RtspAuthorization>,
    ) -> Result<(), RelayError> {
        let credentials = self.credentials(conn, "ANNOUNCE", query, authorization);
        let path = self
            .path_manager
            .publisher_add(path_name, self.author(), credentials)
            .await?;

        *self.path.lock().unwrap() = Some(path);
        *self.announced_medias.lock().unwrap() = medias;
        self.set_state(RtspSessionState::PreRecord);
        Ok(())
    }

    /// SETUP in play direction: the first call joins the path as a reader
    /// (possibly waiting for an on-demand source), later calls only add
    /// tracks.
    pub async fn on_setup_play(
        &self,
        conn: &RtspConn,
        path_name: &str,
        query: &str,
        track: TrackId,
        authorization: Option<RtspAuthorization>,
    ) -> Result<Arc<Stream>, RelayError> {
        match self.safe_state() {
            RtspSessionState::Initial => {
                let credentials = self.credentials(conn, "SETUP", query, authorization);
                let (path, stream) = self
                    .path_manager
                    .reader_add(path_name, self.author(), credentials)
                    .await?;
                *self.path.lock().unwrap() = Some(path);
                *self.stream.lock().unwrap() = Some(Arc::clone(&stream));
                self.setup_tracks.lock().unwrap().push(track);
                self.set_state(RtspSessionState::PrePlay);
                Ok(stream)
            }
            RtspSessionState::PrePlay => {
                let stream = self
                    .stream
                    .lock()
                    .unwrap()
                    .as_ref()
                    .map(Arc::clone)
                    .ok_or_else(|| RelayError::Internal("no stream in prePlay".into()))?;
                self.setup_tracks.lock().unwrap().push(track);
                Ok(stream)
            }
            _ => Err(RelayError::BadRequest(
                "SETUP not allowed in this state".into(),
            )),
        }
    }

    /// PLAY: attach the SETUP'd tracks to the stream, re-encoding units
    /// back into RTP through `sink`.
    pub fn on_play(&self, sink: Arc<dyn PacketSink>) -> Result<(), RelayError> {
        if self.safe_state() != RtspSessionState::PrePlay {
            return Err(RelayError::BadRequest("PLAY before SETUP".into()));
        }
        let path = self
            .path
            .lock()
            .unwrap()
            .as_ref()
            .cloned()
            .ok_or_else(|| RelayError::Internal("no path in prePlay".into()))?;
        let stream = self
            .stream
            .lock()
            .unwrap()
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| RelayError::Internal("no stream in prePlay".into()))?;

        for track in self.setup_tracks.lock().unwrap().iter().copied() {
            let sink = Arc::clone(&sink);
            let weak: Weak<RtspSession> = self.weak_self.clone();
            stream.reader_add(
                self.id,
                track,
                Arc::new(move |unit: Arc<Unit>| {
                    for packet in &unit.rtp_packets {
                        let ok = sink.write_rtp(track, packet);
                        if let Some(session) = weak.upgrade() {
                            if ok {
                                session.bytes.add_sent(packet.size() as u64);
                            } else {
                                session.on_close("write error");
                                return;
                            }
                        }
                    }
                }),
            );
        }

        tracing::info!(
            session = %self.id.short(),
            "is reading from path '{}', {}",
            path.name(),
            summarize_medias(stream.medias())
        );

        let conf = path.safe_conf();
        if !conf.run_on_read.is_empty() {
            *self.on_read_cmd.lock().unwrap() = Some(HookCmd::spawn(
                "runOnRead",
                &conf.run_on_read,
                conf.run_on_read_restart,
                path.name(),
                "",
            ));
        }

        self.set_state(RtspSessionState::Play);
        Ok(())
    }

    /// RECORD: finalize the announced track list and create the stream.
    pub async fn on_record(&self) -> Result<Arc<Stream>, RelayError> {
        if self.safe_state() != RtspSessionState::PreRecord {
            return Err(RelayError::BadRequest("RECORD before ANNOUNCE".into()));
        }
        let path = self
            .path
            .lock()
            .unwrap()
            .as_ref()
            .cloned()
            .ok_or_else(|| RelayError::Internal("no path in preRecord".into()))?;
        let medias = self.announced_medias.lock().unwrap().clone();

        let stream = path.publisher_start(self.id, medias.clone(), false).await?;
        *self.stream.lock().unwrap() = Some(Arc::clone(&stream));

        tracing::info!(
            session = %self.id.short(),
            "is publishing to path '{}', {}",
            path.name(),
            summarize_medias(&medias)
        );

        self.set_state(RtspSessionState::Record);
        Ok(stream)
    }

    /// Incoming RTP from the wire while recording: wrap into a unit and
    /// fan out.
    pub fn write_packet(&self, track: TrackId, packet: RtpPacket) {
        if self.safe_state() != RtspSessionState::Record {
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
        let pts = self.normalized_pts(track, packet.timestamp, format.clock_rate);
        stream.write_unit(track, Unit::from_rtp(format.codec, pts, packet));
    }

    fn normalized_pts(&self, track: TrackId, ts: u32, clock_rate: u32) -> std::time::Duration {
        let mut first = self.first_ts.lock().unwrap();
        let base = *first.entry(track).or_insert(ts);
        let elapsed = ts.wrapping_sub(base);
        std::time::Duration::from_secs_f64(f64::from(elapsed) / f64::from(clock_rate.max(1)))
    }

    /// PAUSE: a playing session returns to prePlay, a recording one closes
    /// its stream and returns to preRecord.
    pub fn on_pause(&self) {
        match self.safe_state() {
            RtspSessionState::Play => {
                if self.on_read_cmd.lock().unwrap().take().is_some() {
                    tracing::info!(session = %self.id.short(), "runOnRead command stopped");
                }
                if let Some(stream) = self.stream.lock().unwrap().as_ref() {
                    stream.reader_remove(self.id);
                }
                self.set_state(RtspSessionState::PrePlay);
            }
            RtspSessionState::Record => {
                if let Some(path) = self.path.lock().unwrap().as_ref() {
                    path.publisher_stop(self.id);
                }
                self.set_state(RtspSessionState::PreRecord);
            }
            _ => {}
        }
    }

    /// Detach from the path and stop hooks. Idempotent; called by the wire
    /// layer on transport close and by the path on teardown.
    pub fn on_close(&self, reason: &str) {
        {
            let mut closed = self.closed.lock().unwrap();
            if *closed {
                return;
            }
            *closed = true;
        }

        if self.on_read_cmd.lock().unwrap().take().is_some() {
            tracing::info!(session = %self.id.short(), "runOnRead command stopped");
        }

        let path = self.path.lock().unwrap().take();
        let stream = self.stream.lock().unwrap().take();
        match self.safe_state() {
            RtspSessionState::PrePlay | RtspSessionState::Play => {
                if let Some(stream) = &stream {
                    stream.reader_remove(self.id);
                }
                if let Some(path) = &path {
                    path.reader_remove(self.id);
                }
            }
            RtspSessionState::PreRecord | RtspSessionState::Record => {
                if let Some(path) = &path {
                    path.publisher_remove(self.id);
                }
            }
            RtspSessionState::Initial => {}
        }

        self.cancel.cancel();
        tracing::info!(session = %self.id.short(), "destroyed ({reason})");
    }

}

/// Sleep applied by the wire layer before answering a failed
/// authentication with 401.
pub async fn pause_after_auth_failure(err: &RelayError) {
    if matches!(
        err,
        RelayError::Auth(crate::error::AuthFailure::CredentialsWrong)
    ) {
        tokio::time::sleep(auth::PAUSE_AFTER_FAILURE).await;
    }
}

/// RTSP (or RTSPS) server facade: owns the connection and session
/// registries and answers the control API.
pub struct RtspServer {
    is_tls: bool,
    path_manager: PathManagerHandle,
    cancel: CancellationToken,
    conns: Mutex<HashMap<SessionId, Arc<RtspConn>>>,
    sessions: Mutex<HashMap<SessionId, Arc<RtspSession>>>,
}

impl RtspServer {
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
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn conn_new(&self, remote_addr: SocketAddr) -> Arc<RtspConn> {
        let conn = Arc::new(RtspConn {
            id: SessionId::new(),
            remote_addr,
            created: SystemTime::now(),
            bytes: ByteCounters::default(),
            is_tls: self.is_tls,
            nonce: Mutex::new(None),
        });
        self.conns.lock().unwrap().insert(conn.id, Arc::clone(&conn));
        tracing::info!(conn = %conn.id.short(), "created by {}", remote_addr);
        conn
    }

    pub fn conn_close(&self, id: SessionId) {
        self.conns.lock().unwrap().remove(&id);
    }

    pub fn session_new(&self, remote_addr: SocketAddr) -> Arc<RtspSession> {
        let session = Arc::new_cyclic(|weak| RtspSession {
            id: SessionId::new(),
            remote_addr,
            created: SystemTime::now(),
            bytes: ByteCounters::default(),
            cancel: self.cancel.child_token(),
            is_tls: self.is_tls,
            path_manager: self.path_manager.clone(),
            state: Mutex::new(RtspSessionState::Initial),
            path: Mutex::new(None),
            stream: Mutex::new(None),
            announced_medias: Mutex::new(Vec::new()),
            setup_tracks: Mutex::new(Vec::new()),
            first_ts: Mutex::new(HashMap::new()),
            on_read_cmd: Mutex::new(None),
            closed: Mutex::new(false),
            weak_self: weak.clone(),
        });
        self.sessions
            .lock()
            .unwrap()
            .insert(session.id, Arc::clone(&session));
        tracing::info!(session = %session.id.short(), "created by {}", remote_addr);
        session
    }

    pub fn session_close(&self, id: SessionId, reason: &str) {
        let session = self.sessions.lock().unwrap().remove(&id);
        if let Some(session) = session {
            session.on_close(reason);
        }
    }

    pub fn api_conns_list(&self) -> Vec<RtspConnInfo> {
        self.conns
            .lock()
            .unwrap()
            .values()
            .map(|c| RtspConnInfo {
                kind: c.kind().as_str(),
                id: c.id.to_string(),
                remote_addr: c.remote_addr.to_string(),
                created: unix_seconds(c.created),
                bytes_received: c.bytes.received(),
                bytes_sent: c.bytes.sent(),
            })
            .collect()
    }

    pub fn api_sessions_list(&self) -> Vec<RtspSessionInfo> {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .map(|s| RtspSessionInfo {
                kind: s.kind().as_str(),
                id: s.id.to_string(),
                remote_addr: s.remote_addr.to_string(),
                created: unix_seconds(s.created),
                state: s.safe_state().api_str(),
                path: s.path_name(),
            })
            .collect()
    }

    /// Terminate a session by its full id. Returns false when unknown.
    pub fn api_session_kick(&self, id: &str) -> bool {
        let session = self
            .sessions
            .lock()
            .unwrap()
            .values()
            .find(|s| s.id.to_string() == id)
            .map(Arc::clone);
        match session {
            Some(session) => {
                self.session_close(session.id, "kicked");
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicU64, Ordering};

    use bytes::Bytes;

    use super::*;
    use crate::conf::{Conf, PathConf};
    use crate::media::{Codec, Format, MediaKind};

    fn remote() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 55000)
    }

    fn test_medias() -> Vec<Media> {
        vec![Media::new(
            MediaKind::Video,
            vec![Format::new(Codec::H264, 96, 90000)],
        )]
    }

    fn packet(seq: u16) -> RtpPacket {
        RtpPacket {
            payload_type: 96,
            sequence_number: seq,
            timestamp: u32::from(seq) * 3000,
            ssrc: 7,
            marker: true,
            payload: Bytes::from_static(&[0x65]),
        }
    }

    struct CountingSink {
        delivered: AtomicU64,
    }

    impl PacketSink for CountingSink {
        fn write_rtp(&self, _track: TrackId, _packet: &RtpPacket) -> bool {
            self.delivered.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    fn manager() -> PathManagerHandle {
        let mut conf = Conf::default();
        conf.paths.insert("cam1".into(), PathConf::default());
        PathManagerHandle::spawn(conf, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_publish_then_read() {
        let pm = manager();
        let server = RtspServer::new(false, pm, CancellationToken::new());

        // publisher side
        let pub_conn = server.conn_new(remote());
        let publisher = server.session_new(remote());
        publisher
            .on_announce(&pub_conn, "cam1", "", test_medias(), None)
            .await
            .unwrap();
        assert_eq!(publisher.safe_state(), RtspSessionState::PreRecord);
        publisher.on_record().await.unwrap();
        assert_eq!(publisher.safe_state(), RtspSessionState::Record);

        // reader side
        let read_conn = server.conn_new(remote());
        let reader = server.session_new(remote());
        reader
            .on_setup_play(&read_conn, "cam1", "", TrackId::new(0, 0), None)
            .await
            .unwrap();
        let sink = Arc::new(CountingSink {
            delivered: AtomicU64::new(0),
        });
        reader.on_play(Arc::clone(&sink) as Arc<dyn PacketSink>).unwrap();
        assert_eq!(reader.safe_state(), RtspSessionState::Play);

        for seq in 0..10 {
            publisher.write_packet(TrackId::new(0, 0), packet(seq));
        }
        for _ in 0..100 {
            if sink.delivered.load(Ordering::SeqCst) == 10 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(sink.delivered.load(Ordering::SeqCst), 10);

        // teardown is symmetric
        server.session_close(reader.id, "test over");
        server.session_close(publisher.id, "test over");
        assert!(server.api_sessions_list().is_empty());
    }

    #[tokio::test]
    async fn test_record_requires_announce() {
        let server = RtspServer::new(false, manager(), CancellationToken::new());
        let session = server.session_new(remote());
        assert!(matches!(
            session.on_record().await,
            Err(RelayError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_kick() {
        let pm = manager();
        let server = RtspServer::new(false, pm, CancellationToken::new());
        let conn = server.conn_new(remote());
        let session = server.session_new(remote());
        session
            .on_announce(&conn, "cam1", "", test_medias(), None)
            .await
            .unwrap();

        let id = session.id.to_string();
        assert!(server.api_session_kick(&id));
        assert!(!server.api_session_kick(&id));
        assert!(session.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_conn_nonce_is_stable() {
        let server = RtspServer::new(false, manager(), CancellationToken::new());
        let conn = server.conn_new(remote());
        assert_eq!(conn.nonce(), conn.nonce());
    }

    #[tokio::test]
    async fn test_api_lists() {
        let server = RtspServer::new(false, manager(), CancellationToken::new());
        let _conn = server.conn_new(remote());
        let session = server.session_new(remote());

        assert_eq!(server.api_conns_list().len(), 1);
        let sessions = server.api_sessions_list();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].state, "idle");
        assert_eq!(sessions[0].kind, "rtspSession");
        assert_eq!(sessions[0].id, session.id.to_string());
    }
}
