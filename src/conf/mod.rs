//! Configuration document
//!
//! The whole server configuration is one JSON document: global settings
//! plus the `paths` table. It is read once at startup and re-applied live
//! through the control API; every mutation validates the full resulting
//! document before committing.

mod path;

pub use path::{valid_path_name, PathConf, PathConfMap, PathPattern, SOURCE_PUBLISHER};

use std::path::Path as FsPath;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfError {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("invalid path '{0}': {1}")]
    InvalidPath(String, String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct Conf {
    /// One of `error`, `warn`, `info`, `debug`.
    pub log_level: String,

    pub api: bool,
    pub api_address: String,

    /// Seconds, applied to reads on every protocol and as the teardown
    /// grace period.
    pub read_timeout: f64,
    pub write_timeout: f64,
    /// Per-reader ring depth.
    pub read_buffer_count: usize,

    pub rtsp: bool,
    pub rtsp_address: String,
    pub rtsp_encryption: bool,
    pub rtmp: bool,
    pub rtmp_address: String,
    pub rtmp_encryption: bool,
    pub hls: bool,
    pub hls_address: String,
    pub webrtc: bool,
    pub webrtc_address: String,
    /// Entries of the form `url`, `scheme:user:pass:host:port` or
    /// `scheme:AUTH_SECRET:secret:host:port`.
    pub webrtc_ice_servers: Vec<String>,

    pub paths: PathConfMap,
}

impl Default for Conf {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            api: true,
            api_address: "127.0.0.1:9997".into(),
            read_timeout: 10.0,
            write_timeout: 10.0,
            read_buffer_count: 512,
            rtsp: true,
            rtsp_address: ":8554".into(),
            rtsp_encryption: false,
            rtmp: true,
            rtmp_address: ":1935".into(),
            rtmp_encryption: false,
            hls: true,
            hls_address: ":8888".into(),
            webrtc: true,
            webrtc_address: ":8889".into(),
            webrtc_ice_servers: vec!["stun:stun.l.google.com:19302".into()],
            paths: PathConfMap::default(),
        }
    }
}

impl Conf {
    /// Load and validate a configuration file. A missing file yields the
    /// defaults, matching a server started without any configuration.
    pub fn load(path: Option<&FsPath>) -> Result<Self, ConfError> {
        let conf = match path {
            Some(path) => {
                let data = std::fs::read_to_string(path)?;
                serde_json::from_str(&data)?
            }
            None => Conf::default(),
        };
        conf.check()?;
        Ok(conf)
    }

    /// Validate the whole document.
    pub fn check(&self) -> Result<(), ConfError> {
        if !matches!(self.log_level.as_str(), "error" | "warn" | "info" | "debug") {
            return Err(ConfError::Invalid(format!(
                "unknown log level '{}'",
                self.log_level
            )));
        }
        for (value, field) in [
            (self.read_timeout, "readTimeout"),
            (self.write_timeout, "writeTimeout"),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfError::Invalid(format!("{field} must be positive")));
            }
        }
        if self.read_buffer_count == 0 {
            return Err(ConfError::Invalid(
                "readBufferCount must be positive".into(),
            ));
        }
        for server in &self.webrtc_ice_servers {
            if server.is_empty() {
                return Err(ConfError::Invalid("empty ICE server entry".into()));
            }
        }
        for (address, field) in [
            (&self.api_address, "apiAddress"),
            (&self.rtsp_address, "rtspAddress"),
            (&self.rtmp_address, "rtmpAddress"),
            (&self.hls_address, "hlsAddress"),
            (&self.webrtc_address, "webrtcAddress"),
        ] {
            if parse_listen_addr(address).is_none() {
                return Err(ConfError::Invalid(format!(
                    "invalid {field} '{address}'"
                )));
            }
        }
        for (name, conf) in self.paths.iter() {
            PathPattern::parse(name)?;
            conf.check(name)?;
        }
        Ok(())
    }

    /// Apply a shallow field-wise patch: fields present in `patch`
    /// override, absent fields stay. Unknown fields are rejected. The
    /// result is validated.
    pub fn patched(&self, patch: &serde_json::Value) -> Result<Conf, ConfError> {
        let obj = patch
            .as_object()
            .ok_or_else(|| ConfError::Invalid("body must be a JSON object".into()))?;
        let mut doc = serde_json::to_value(self)?;
        for (key, value) in obj {
            doc[key.as_str()] = value.clone();
        }
        let conf: Conf = serde_json::from_value(doc)?;
        conf.check()?;
        Ok(conf)
    }

    /// Same shallow patching for a single path policy.
    pub fn patched_path(
        base: &PathConf,
        patch: &serde_json::Value,
    ) -> Result<PathConf, ConfError> {
        let obj = patch
            .as_object()
            .ok_or_else(|| ConfError::Invalid("body must be a JSON object".into()))?;
        let mut doc = serde_json::to_value(base)?;
        for (key, value) in obj {
            doc[key.as_str()] = value.clone();
        }
        Ok(serde_json::from_value(doc)?)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.read_timeout)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.write_timeout)
    }
}

/// `:8554` binds every interface, anything else must be a full socket
/// address.
pub fn parse_listen_addr(address: &str) -> Option<std::net::SocketAddr> {
    if let Some(port) = address.strip_prefix(':') {
        return format!("0.0.0.0:{port}").parse().ok();
    }
    address.parse().ok()
}
