//! # switchboard
//!
//! A multi-protocol live media relay. Publishers push streams over RTSP,
//! RTMP or WebRTC into named paths; any number of readers pull the same
//! streams back out over RTSP, RTMP, HLS or WebRTC. Nothing is
//! transcoded: codec units are reassembled from one wire format and
//! re-emitted over another, with bounded memory per reader.
//!
//! ## Components
//!
//! - [`stream`]: per-publisher fan-out. One drop-oldest ring and one
//!   delivery task per reader, so a slow reader loses its own oldest
//!   units instead of backpressuring anyone else.
//! - [`path`]: the named rendezvous. Each path is a task with a typed
//!   inbox arbitrating a single publisher, many readers, pending readers,
//!   on-demand sources and lifecycle hooks.
//! - [`path::manager`]: the registry mapping names to paths, resolving
//!   configured patterns, authenticating admissions and applying live
//!   configuration diffs.
//! - [`session`]: per-protocol wrappers driving the path interface; the
//!   wire formats themselves stay outside this crate behind narrow seams.
//! - [`auth`]: per-path publish/read ACLs, CIDR allow-lists and RTSP
//!   digest challenges.
//! - [`api`]: the HTTP/JSON control surface.
//!
//! The [`core`] module wires everything together; the binary adds
//! configuration loading, logging and signal handling on top.

pub mod api;
pub mod auth;
pub mod conf;
pub mod core;
pub mod error;
pub mod media;
pub mod path;
pub mod session;
pub mod stream;

pub use conf::{Conf, PathConf};
pub use error::{AuthFailure, RelayError};
pub use media::{Codec, Format, Media, MediaKind, RtpPacket, TrackId, Unit, UnitPayload};
pub use path::{PathHandle, PathManagerHandle};
pub use stream::Stream;
