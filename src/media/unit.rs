//! Codec-tagged media units
//!
//! A unit is the element distributed by the stream fan-out: the original
//! RTP packets (possibly none), the assembled codec payload (possibly not
//! yet assembled), a presentation timestamp and an NTP wall-clock stamp.
//! Payloads are `Bytes` so cloning a unit for N readers is cheap.

use std::time::{Duration, SystemTime};

use bytes::Bytes;

use super::Codec;

/// RTP header size in bytes, without extensions or CSRCs.
const RTP_HEADER_SIZE: usize = 12;

/// A parsed RTP packet as handed over by the wire layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub marker: bool,
    pub payload: Bytes,
}

impl RtpPacket {
    /// Wire size of the packet, header included.
    pub fn size(&self) -> usize {
        RTP_HEADER_SIZE + self.payload.len()
    }
}

/// Assembled payload of one unit, tagged by codec.
///
/// Fields are empty when the wire layer hands over raw RTP without
/// reassembling (the relay never transcodes, so an empty payload simply
/// means readers re-emit the original packets).
#[derive(Debug, Clone)]
pub enum UnitPayload {
    H264 { access_unit: Vec<Bytes> },
    H265 { access_unit: Vec<Bytes> },
    Vp8 { frame: Option<Bytes> },
    Vp9 { frame: Option<Bytes> },
    Av1 { obus: Vec<Bytes> },
    Mpeg2Audio { frames: Vec<Bytes> },
    Mpeg4Audio { aus: Vec<Bytes> },
    Opus { packets: Vec<Bytes> },
    G711 { samples: Option<Bytes> },
    G722 { samples: Option<Bytes> },
    Generic,
}

impl UnitPayload {
    /// An empty payload of the given codec.
    pub fn empty(codec: Codec) -> Self {
        match codec {
            Codec::H264 => UnitPayload::H264 {
                access_unit: Vec::new(),
            },
            Codec::H265 => UnitPayload::H265 {
                access_unit: Vec::new(),
            },
            Codec::Vp8 => UnitPayload::Vp8 { frame: None },
            Codec::Vp9 => UnitPayload::Vp9 { frame: None },
            Codec::Av1 => UnitPayload::Av1 { obus: Vec::new() },
            Codec::Mpeg2Audio => UnitPayload::Mpeg2Audio { frames: Vec::new() },
            Codec::Mpeg4Audio => UnitPayload::Mpeg4Audio { aus: Vec::new() },
            Codec::Opus => UnitPayload::Opus {
                packets: Vec::new(),
            },
            Codec::G711 => UnitPayload::G711 { samples: None },
            Codec::G722 => UnitPayload::G722 { samples: None },
            Codec::Generic => UnitPayload::Generic,
        }
    }

    pub fn codec(&self) -> Codec {
        match self {
            UnitPayload::H264 { .. } => Codec::H264,
            UnitPayload::H265 { .. } => Codec::H265,
            UnitPayload::Vp8 { .. } => Codec::Vp8,
            UnitPayload::Vp9 { .. } => Codec::Vp9,
            UnitPayload::Av1 { .. } => Codec::Av1,
            UnitPayload::Mpeg2Audio { .. } => Codec::Mpeg2Audio,
            UnitPayload::Mpeg4Audio { .. } => Codec::Mpeg4Audio,
            UnitPayload::Opus { .. } => Codec::Opus,
            UnitPayload::G711 { .. } => Codec::G711,
            UnitPayload::G722 { .. } => Codec::G722,
            UnitPayload::Generic => Codec::Generic,
        }
    }
}

/// One timestamped chunk of media flowing through a stream.
#[derive(Debug, Clone)]
pub struct Unit {
    pub payload: UnitPayload,
    pub rtp_packets: Vec<RtpPacket>,
    /// Presentation timestamp, relative to the stream start.
    pub pts: Duration,
    /// Wall-clock time the unit entered the relay.
    pub ntp: SystemTime,
}

impl Unit {
    /// Wrap a single RTP packet into a unit of the given codec, stamped
    /// with the current wall-clock time. This is what publisher-side
    /// wrappers do per incoming packet; payload assembly stays with the
    /// wire layer.
    pub fn from_rtp(codec: Codec, pts: Duration, packet: RtpPacket) -> Self {
        Self {
            payload: UnitPayload::empty(codec),
            rtp_packets: vec![packet],
            pts,
            ntp: SystemTime::now(),
        }
    }

    pub fn codec(&self) -> Codec {
        self.payload.codec()
    }

    /// Total wire size of the carried RTP packets.
    pub fn size(&self) -> usize {
        self.rtp_packets.iter().map(|p| p.size()).sum()
    }
}
