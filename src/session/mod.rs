//! Session and connection wrappers
//!
//! One module per protocol. Every wrapper has the same shape: it is
//! created on accept, drives the path manager's publisher/reader
//! interface, moves units between its transport and the stream fan-out,
//! and removes itself symmetrically on close.

pub mod hls;
pub mod rtmp;
pub mod rtsp;
pub mod webrtc;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use uuid::Uuid;

use crate::media::{RtpPacket, TrackId};

/// Opaque 128-bit identity of a session, connection or muxer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Short form used as log prefix: first 4 bytes, hex.
    pub fn short(&self) -> String {
        let b = self.0.as_bytes();
        format!("{:02x}{:02x}{:02x}{:02x}", b[0], b[1], b[2], b[3])
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Protocol tag of a wrapper, also the `type` field in API listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    RtspConn,
    RtspsConn,
    RtspSession,
    RtspsSession,
    RtmpConn,
    RtmpsConn,
    WebRtcConn,
    HlsMuxer,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::RtspConn => "rtspConn",
            SessionKind::RtspsConn => "rtspsConn",
            SessionKind::RtspSession => "rtspSession",
            SessionKind::RtspsSession => "rtspsSession",
            SessionKind::RtmpConn => "rtmpConn",
            SessionKind::RtmpsConn => "rtmpsConn",
            SessionKind::WebRtcConn => "webRTCConn",
            SessionKind::HlsMuxer => "hlsMuxer",
        }
    }
}

/// Byte counters updated by the wire layer, readable without locking.
#[derive(Debug, Default)]
pub struct ByteCounters {
    received: AtomicU64,
    sent: AtomicU64,
}

impl ByteCounters {
    pub fn add_received(&self, n: u64) {
        self.received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_sent(&self, n: u64) {
        self.sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

/// Where a reader-side wrapper hands re-encoded RTP back to its transport.
/// Implemented by the wire layer; invoked on the reader's delivery task.
/// Returning false reports a dead transport and tears the session down.
pub trait PacketSink: Send + Sync {
    fn write_rtp(&self, track: TrackId, packet: &RtpPacket) -> bool;
}

/// Seconds since the Unix epoch, for API listings.
pub(crate) fn unix_seconds(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_id() {
        let id = SessionId::new();
        assert_eq!(id.short().len(), 8);
        assert!(id.to_string().len() > 8);
    }

    #[test]
    fn test_byte_counters() {
        let c = ByteCounters::default();
        c.add_received(10);
        c.add_received(5);
        c.add_sent(3);
        assert_eq!(c.received(), 15);
        assert_eq!(c.sent(), 3);
    }
}
