//! WebRTC connection wrappers
//!
//! The signaling handshake runs over a provided message channel: offer
//! in, answer out, then trickle ICE until the peer connection reports
//! connected, all under a fixed deadline. SDP negotiation and the actual
//! peer transport live outside the core behind [`PeerLink`]; this module
//! owns the sequencing, the deadlines, ICE server generation and the
//! reader/publisher wiring against the path layer.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::auth::{self, AuthProtocol, Credentials};
use crate::error::RelayError;
use crate::media::{summarize_medias, Media, RtpPacket, TrackId, Unit};
use crate::path::{PathAuthor, PathHandle, PathManagerHandle};
use crate::stream::Stream;

use super::{unix_seconds, ByteCounters, SessionId, SessionKind};

/// The whole signaling exchange must finish within this window.
pub const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(10);
/// Per-message deadline when writing to the signaling channel.
pub const SIGNALING_WRITE_DEADLINE: Duration = Duration::from_secs(2);
/// Max RTP payload size towards WebRTC peers: 1200 bytes MTU minus the
/// 12-byte RTP header.
pub const PAYLOAD_MAX_SIZE: usize = 1188;

/// Lifetime of generated TURN ephemeral credentials.
const TURN_CREDENTIAL_LIFETIME: Duration = Duration::from_secs(24 * 3600);

/// Messages exchanged over the signaling channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SignalMessage {
    IceServers { servers: Vec<IceServer> },
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Events reported by the peer transport.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    LocalCandidate(String),
    Connected,
    Disconnected,
}

/// Seam to the out-of-core WebRTC engine: produces the SDP answer,
/// absorbs remote candidates and writes RTP towards the peer.
pub trait PeerLink: Send + Sync {
    fn answer(&self, offer: &str) -> Result<String, RelayError>;
    fn add_remote_candidate(&self, candidate: &str) -> Result<(), RelayError>;
    /// Returns false when the transport is gone.
    fn write_rtp(&self, track: TrackId, packet: &RtpPacket) -> bool;
}

/// Expand configured ICE server entries. `scheme:AUTH_SECRET:secret:host:
/// port` yields ephemeral HMAC-SHA1 credentials, `scheme:user:pass:host:
/// port` passes through, anything else is a bare URL.
pub fn generate_ice_servers(entries: &[String]) -> Vec<IceServer> {
    entries
        .iter()
        .map(|entry| {
            let parts: Vec<&str> = entry.split(':').collect();
            if parts.len() == 5 {
                let url = format!("{}:{}:{}", parts[0], parts[3], parts[4]);
                if parts[1] == "AUTH_SECRET" {
                    let expiry = SystemTime::now() + TURN_CREDENTIAL_LIFETIME;
                    let expiry = expiry
                        .duration_since(UNIX_EPOCH)
                        .map(|d| d.as_secs())
                        .unwrap_or(0);
                    let username = format!("{}:{}", expiry, random_turn_user());
                    let credential = turn_credential(parts[2], &username);
                    IceServer {
                        urls: vec![url],
                        username: Some(username),
                        credential: Some(credential),
                    }
                } else {
                    IceServer {
                        urls: vec![url],
                        username: Some(parts[1].to_string()),
                        credential: Some(parts[2].to_string()),
                    }
                }
            } else {
                IceServer {
                    urls: vec![entry.clone()],
                    username: None,
                    credential: None,
                }
            }
        })
        .collect()
}

fn random_turn_user() -> String {
    use rand::Rng;
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz1234567890";
    let mut rng = rand::thread_rng();
    (0..20)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

fn turn_credential(secret: &str, username: &str) -> String {
    let mut mac = Hmac::<Sha1>::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(username.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebRtcConnState {
    Handshaking,
    Read,
    Publish,
    Closed,
}

pub struct WebRtcConn {
    pub id: SessionId,
    pub remote_addr: SocketAddr,
    pub created: SystemTime,
    pub bytes: ByteCounters,
    pub cancel: CancellationToken,

    path_manager: PathManagerHandle,
    ice_servers: Vec<String>,
    state: Mutex<WebRtcConnState>,
    path: Mutex<Option<PathHandle>>,
    stream: Mutex<Option<Arc<Stream>>>,
    path_name: Mutex<Option<String>>,
    closed: Mutex<bool>,
    weak_self: Weak<WebRtcConn>,
}

/// Channel bundle connecting a conn to its signaling transport and peer
/// engine.
pub struct SignalingChannels {
    pub incoming: mpsc::Receiver<SignalMessage>,
    pub outgoing: mpsc::Sender<SignalMessage>,
    pub peer_events: mpsc::Receiver<PeerEvent>,
}

impl WebRtcConn {
    pub fn kind(&self) -> SessionKind {
        SessionKind::WebRtcConn
    }

    pub fn safe_state(&self) -> WebRtcConnState {
        *self.state.lock().unwrap()
    }

    pub fn path_name(&self) -> Option<String> {
        self.path_name.lock().unwrap().clone()
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
            proto: AuthProtocol::WebRtc,
            rtsp: None,
        }
    }

    /// Reader mode: join the path, run the handshake, then re-emit the
    /// selected tracks until the peer disconnects.
    pub async fn run_read(
        &self,
        path_name: &str,
        query: &str,
        link: Arc<dyn PeerLink>,
        mut channels: SignalingChannels,
    ) -> Result<(), RelayError> {
        *self.path_name.lock().unwrap() = Some(path_name.to_string());
        let (path, stream) = self
            .path_manager
            .reader_add(path_name, self.author(), self.credentials(query))
            .await?;
        *self.path.lock().unwrap() = Some(path.clone());
        *self.stream.lock().unwrap() = Some(Arc::clone(&stream));

        let handshake = self.handshake(&link, &mut channels);
        match tokio::time::timeout(HANDSHAKE_DEADLINE, handshake).await {
            Ok(result) => result?,
            Err(_) => {
                self.on_close("handshake deadline exceeded");
                return Err(RelayError::BadRequest("handshake deadline exceeded".into()));
            }
        }

        let tracks = select_tracks(stream.medias());
        if tracks.is_empty() {
            self.on_close("no compatible track");
            return Err(RelayError::BadRequest(
                "the stream has no WebRTC-compatible track".into(),
            ));
        }
        for track in tracks {
            let link = Arc::clone(&link);
            let weak: Weak<WebRtcConn> = self.weak_self.clone();
            stream.reader_add(
                self.id,
                track,
                Arc::new(move |unit: Arc<Unit>| {
                    for packet in &unit.rtp_packets {
                        if packet.payload.len() > PAYLOAD_MAX_SIZE {
                            tracing::warn!("discarding RTP packet larger than the peer MTU");
                            continue;
                        }
                        let ok = link.write_rtp(track, packet);
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

        *self.state.lock().unwrap() = WebRtcConnState::Read;
        tracing::info!(
            conn = %self.id.short(),
            "is reading from path '{}', {}",
            path.name(),
            summarize_medias(stream.medias())
        );

        let reason = self.wait_disconnect(&link, &mut channels).await;
        self.on_close(reason);
        Ok(())
    }

    /// Publisher mode: handshake first, then feed the negotiated tracks
    /// into the path. The wire layer pushes packets via
    /// [`WebRtcConn::write_packet`].
    pub async fn run_publish(
        &self,
        path_name: &str,
        query: &str,
        medias: Vec<Media>,
        link: Arc<dyn PeerLink>,
        mut channels: SignalingChannels,
    ) -> Result<(), RelayError> {
        *self.path_name.lock().unwrap() = Some(path_name.to_string());
        let path = self
            .path_manager
            .publisher_add(path_name, self.author(), self.credentials(query))
            .await?;
        *self.path.lock().unwrap() = Some(path.clone());

        let handshake = self.handshake(&link, &mut channels);
        match tokio::time::timeout(HANDSHAKE_DEADLINE, handshake).await {
            Ok(result) => result?,
            Err(_) => {
                self.on_close("handshake deadline exceeded");
                return Err(RelayError::BadRequest("handshake deadline exceeded".into()));
            }
        }

        let stream = path.publisher_start(self.id, medias.clone(), false).await?;
        *self.stream.lock().unwrap() = Some(stream);
        *self.state.lock().unwrap() = WebRtcConnState::Publish;
        tracing::info!(
            conn = %self.id.short(),
            "is publishing to path '{}', {}",
            path.name(),
            summarize_medias(&medias)
        );

        let reason = self.wait_disconnect(&link, &mut channels).await;
        self.on_close(reason);
        Ok(())
    }

    /// Offer in, answer out, trickle ICE until connected.
    async fn handshake(
        &self,
        link: &Arc<dyn PeerLink>,
        channels: &mut SignalingChannels,
    ) -> Result<(), RelayError> {
        self.send_signal(
            &channels.outgoing,
            SignalMessage::IceServers {
                servers: generate_ice_servers(&self.ice_servers),
            },
        )
        .await?;

        let offer = match channels.incoming.recv().await {
            Some(SignalMessage::Offer { sdp }) => sdp,
            Some(_) => return Err(RelayError::BadRequest("expected an SDP offer".into())),
            None => return Err(RelayError::Terminated),
        };

        let answer = link.answer(&offer)?;
        self.send_signal(&channels.outgoing, SignalMessage::Answer { sdp: answer })
            .await?;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(RelayError::Terminated),
                msg = channels.incoming.recv() => match msg {
                    Some(SignalMessage::Candidate { candidate }) => {
                        tracing::debug!(conn = %self.id.short(), "remote candidate: {candidate}");
                        link.add_remote_candidate(&candidate)?;
                    }
                    Some(_) => {
                        return Err(RelayError::BadRequest(
                            "unexpected signaling message".into(),
                        ))
                    }
                    None => return Err(RelayError::Terminated),
                },
                event = channels.peer_events.recv() => match event {
                    Some(PeerEvent::LocalCandidate(candidate)) => {
                        tracing::debug!(conn = %self.id.short(), "local candidate: {candidate}");
                        self.send_signal(
                            &channels.outgoing,
                            SignalMessage::Candidate { candidate },
                        )
                        .await?;
                    }
                    Some(PeerEvent::Connected) => {
                        tracing::info!(conn = %self.id.short(), "peer connection established");
                        return Ok(());
                    }
                    Some(PeerEvent::Disconnected) | None => {
                        return Err(RelayError::BadRequest("peer connection closed".into()))
                    }
                },
            }
        }
    }

    async fn send_signal(
        &self,
        outgoing: &mpsc::Sender<SignalMessage>,
        msg: SignalMessage,
    ) -> Result<(), RelayError> {
        outgoing
            .send_timeout(msg, SIGNALING_WRITE_DEADLINE)
            .await
            .map_err(|_| RelayError::Terminated)
    }

    /// After the handshake: keep draining signaling and peer events until
    /// the peer goes away or the conn is cancelled.
    async fn wait_disconnect(
        &self,
        link: &Arc<dyn PeerLink>,
        channels: &mut SignalingChannels,
    ) -> &'static str {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return "terminated",
                msg = channels.incoming.recv() => match msg {
                    Some(SignalMessage::Candidate { candidate }) => {
                        let _ = link.add_remote_candidate(&candidate);
                    }
                    Some(_) => {}
                    None => return "signaling channel closed",
                },
                event = channels.peer_events.recv() => match event {
                    Some(PeerEvent::Disconnected) | None => return "peer connection closed",
                    Some(_) => {}
                },
            }
        }
    }

    /// Incoming RTP while publishing.
    pub fn write_packet(&self, track: TrackId, packet: RtpPacket) {
        if self.safe_state() != WebRtcConnState::Publish {
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
        stream.write_unit(
            track,
            Unit::from_rtp(format.codec, Duration::ZERO, packet),
        );
    }

    pub fn on_close(&self, reason: &str) {
        {
            let mut closed = self.closed.lock().unwrap();
            if *closed {
                return;
            }
            *closed = true;
        }

        let path = self.path.lock().unwrap().take();
        let stream = self.stream.lock().unwrap().take();
        match self.safe_state() {
            WebRtcConnState::Read => {
                if let Some(stream) = &stream {
                    stream.reader_remove(self.id);
                }
                if let Some(path) = &path {
                    path.reader_remove(self.id);
                }
            }
            WebRtcConnState::Publish => {
                if let Some(path) = &path {
                    path.publisher_remove(self.id);
                }
            }
            WebRtcConnState::Handshaking => {
                if let Some(path) = &path {
                    path.reader_remove(self.id);
                    path.publisher_remove(self.id);
                }
            }
            WebRtcConnState::Closed => {}
        }
        *self.state.lock().unwrap() = WebRtcConnState::Closed;

        self.cancel.cancel();
        tracing::info!(conn = %self.id.short(), "closed ({reason})");
    }
}

/// One video and one audio track, WebRTC-compatible codecs only.
fn select_tracks(medias: &[Media]) -> Vec<TrackId> {
    use crate::media::Codec;

    let mut out = Vec::new();
    let mut video = None;
    let mut audio = None;
    for (mi, media) in medias.iter().enumerate() {
        for (fi, format) in media.formats.iter().enumerate() {
            let id = TrackId::new(mi, fi);
            match format.codec {
                Codec::Av1 | Codec::Vp9 | Codec::Vp8 | Codec::H264 if video.is_none() => {
                    video = Some(id)
                }
                Codec::Opus | Codec::G722 | Codec::G711 if audio.is_none() => audio = Some(id),
                _ => {}
            }
        }
    }
    out.extend(video);
    out.extend(audio);
    out
}

/// WebRTC server facade.
pub struct WebRtcServer {
    path_manager: PathManagerHandle,
    ice_servers: Vec<String>,
    cancel: CancellationToken,
    conns: Mutex<std::collections::HashMap<SessionId, Arc<WebRtcConn>>>,
}

impl WebRtcServer {
    pub fn new(
        ice_servers: Vec<String>,
        path_manager: PathManagerHandle,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            path_manager,
            ice_servers,
            cancel,
            conns: Mutex::new(std::collections::HashMap::new()),
        })
    }

    pub fn conn_new(&self, remote_addr: SocketAddr) -> Arc<WebRtcConn> {
        let conn = Arc::new_cyclic(|weak| WebRtcConn {
            id: SessionId::new(),
            remote_addr,
            created: SystemTime::now(),
            bytes: ByteCounters::default(),
            cancel: self.cancel.child_token(),
            path_manager: self.path_manager.clone(),
            ice_servers: self.ice_servers.clone(),
            state: Mutex::new(WebRtcConnState::Handshaking),
            path: Mutex::new(None),
            stream: Mutex::new(None),
            path_name: Mutex::new(None),
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

    pub fn api_conns_list(&self) -> Vec<WebRtcConnInfo> {
        self.conns
            .lock()
            .unwrap()
            .values()
            .map(|c| WebRtcConnInfo {
                kind: c.kind().as_str(),
                id: c.id.to_string(),
                remote_addr: c.remote_addr.to_string(),
                created: unix_seconds(c.created),
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

/// Listing entry for `/v1/webrtcconns/list`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebRtcConnInfo {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub id: String,
    pub remote_addr: String,
    pub created: u64,
    pub path: Option<String>,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}
