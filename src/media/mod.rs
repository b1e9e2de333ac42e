//! Media track descriptors
//!
//! A media is one logical track announced by a publisher; a format is the
//! codec/RTP profile carried by it. Most medias have exactly one format.

mod unit;

pub use unit::{RtpPacket, Unit, UnitPayload};

/// Kind of a media track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
    Application,
}

/// Codec identifier, closed over the formats the relay understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    H264,
    H265,
    Vp8,
    Vp9,
    Av1,
    Mpeg2Audio,
    Mpeg4Audio,
    Opus,
    G711,
    G722,
    Generic,
}

impl Codec {
    pub fn name(&self) -> &'static str {
        match self {
            Codec::H264 => "H264",
            Codec::H265 => "H265",
            Codec::Vp8 => "VP8",
            Codec::Vp9 => "VP9",
            Codec::Av1 => "AV1",
            Codec::Mpeg2Audio => "MPEG-2 audio",
            Codec::Mpeg4Audio => "MPEG-4 audio",
            Codec::Opus => "Opus",
            Codec::G711 => "G711",
            Codec::G722 => "G722",
            Codec::Generic => "generic",
        }
    }

    pub fn is_video(&self) -> bool {
        matches!(
            self,
            Codec::H264 | Codec::H265 | Codec::Vp8 | Codec::Vp9 | Codec::Av1
        )
    }

    pub fn is_audio(&self) -> bool {
        matches!(
            self,
            Codec::Mpeg2Audio | Codec::Mpeg4Audio | Codec::Opus | Codec::G711 | Codec::G722
        )
    }
}

/// One codec/RTP profile of a media.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    pub codec: Codec,
    pub payload_type: u8,
    pub clock_rate: u32,
}

impl Format {
    pub fn new(codec: Codec, payload_type: u8, clock_rate: u32) -> Self {
        Self {
            codec,
            payload_type,
            clock_rate,
        }
    }
}

/// One logical track with one or more formats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Media {
    pub kind: MediaKind,
    pub formats: Vec<Format>,
}

impl Media {
    pub fn new(kind: MediaKind, formats: Vec<Format>) -> Self {
        Self { kind, formats }
    }
}

/// Index of a (media, format) pair within a publisher's announced list.
/// Stable for the lifetime of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackId {
    pub media: usize,
    pub format: usize,
}

impl TrackId {
    pub fn new(media: usize, format: usize) -> Self {
        Self { media, format }
    }
}

/// Enumerate every (media, format) pair of an announced media list.
pub fn track_ids(medias: &[Media]) -> Vec<TrackId> {
    let mut out = Vec::new();
    for (mi, media) in medias.iter().enumerate() {
        for fi in 0..media.formats.len() {
            out.push(TrackId::new(mi, fi));
        }
    }
    out
}

/// Human summary of a media list, for session logs.
pub fn summarize_medias(medias: &[Media]) -> String {
    let codecs: Vec<&str> = medias
        .iter()
        .flat_map(|m| m.formats.iter().map(|f| f.codec.name()))
        .collect();
    let tracks = if medias.len() == 1 { "track" } else { "tracks" };
    format!("{} {} ({})", medias.len(), tracks, codecs.join(", "))
}
