//! Credential evaluation
//!
//! Stateless over a request: the path manager hands in the request's
//! credentials plus the matched path's publish or read ACL and gets back
//! ok / missing (challenge) / wrong / ip-rejected. RTSP digest nonces are
//! owned by the connection; hashed stored credentials use the
//! `sha256:<base64>` form.

use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use base64::Engine;
use md5::{Digest as _, Md5};
use sha2::Sha256;

use crate::conf::PathConf;
use crate::error::AuthFailure;

/// Realm announced in RTSP digest challenges.
pub const REALM: &str = "switchboard";

/// Uniform pause applied by session wrappers after wrong credentials,
/// so failures cannot be used to enumerate users.
pub const PAUSE_AFTER_FAILURE: Duration = Duration::from_secs(2);

/// Protocol a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthProtocol {
    Rtsp,
    Rtmp,
    WebRtc,
    Hls,
}

/// Parsed RTSP `Authorization` header, as provided by the wire layer.
#[derive(Debug, Clone)]
pub enum RtspAuthorization {
    Basic { user: String, pass: String },
    Digest(DigestParams),
}

#[derive(Debug, Clone)]
pub struct DigestParams {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
}

/// RTSP-specific credential material.
#[derive(Debug, Clone)]
pub struct RtspCredentials {
    pub method: String,
    pub authorization: Option<RtspAuthorization>,
    /// Nonce previously issued on this connection.
    pub nonce: String,
}

/// Everything a request carries that can authenticate it.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// User/pass from query parameters, RTMP connect arguments or the
    /// WebRTC URL. Empty when absent.
    pub user: String,
    pub pass: String,
    pub query: String,
    pub ip: IpAddr,
    pub proto: AuthProtocol,
    pub rtsp: Option<RtspCredentials>,
}

impl Credentials {
    /// Anonymous credentials, useful for internal readers (HLS muxers).
    pub fn anonymous(ip: IpAddr, proto: AuthProtocol) -> Self {
        Self {
            user: String::new(),
            pass: String::new(),
            query: String::new(),
            ip,
            proto,
            rtsp: None,
        }
    }
}

/// One side (publish or read) of a path's ACL.
#[derive(Debug, Clone, Default)]
pub struct Acl {
    pub user: String,
    pub pass: String,
    pub ips: Vec<IpRange>,
}

impl Acl {
    pub fn publish(conf: &PathConf) -> Self {
        Self {
            user: conf.publish_user.clone(),
            pass: conf.publish_pass.clone(),
            ips: parse_ranges(&conf.publish_ips),
        }
    }

    pub fn read(conf: &PathConf) -> Self {
        Self {
            user: conf.read_user.clone(),
            pass: conf.read_pass.clone(),
            ips: parse_ranges(&conf.read_ips),
        }
    }
}

fn parse_ranges(ranges: &[String]) -> Vec<IpRange> {
    // invalid entries are rejected by Conf::check before getting here
    ranges.iter().filter_map(|r| r.parse().ok()).collect()
}

/// Evaluate `credentials` against `acl`.
pub fn authenticate(acl: &Acl, credentials: &Credentials) -> Result<(), AuthFailure> {
    if !acl.ips.is_empty() && !acl.ips.iter().any(|r| r.contains(credentials.ip)) {
        return Err(AuthFailure::IpRejected);
    }

    if acl.user.is_empty() {
        return Ok(());
    }

    if let Some(rtsp) = &credentials.rtsp {
        if let Some(authorization) = &rtsp.authorization {
            return match authorization {
                RtspAuthorization::Basic { user, pass } => {
                    check_pair(acl, user, pass)
                }
                RtspAuthorization::Digest(params) => check_digest(acl, rtsp, params),
            };
        }
    }

    if !credentials.user.is_empty() || !credentials.pass.is_empty() {
        return check_pair(acl, &credentials.user, &credentials.pass);
    }

    Err(AuthFailure::CredentialsMissing)
}

fn check_pair(acl: &Acl, user: &str, pass: &str) -> Result<(), AuthFailure> {
    if credential_matches(&acl.user, user) && credential_matches(&acl.pass, pass) {
        Ok(())
    } else {
        Err(AuthFailure::CredentialsWrong)
    }
}

fn check_digest(
    acl: &Acl,
    rtsp: &RtspCredentials,
    params: &DigestParams,
) -> Result<(), AuthFailure> {
    // digest needs the plaintext password on our side
    if is_hashed(&acl.user) || is_hashed(&acl.pass) {
        return Err(AuthFailure::CredentialsWrong);
    }
    if params.realm != REALM || params.nonce != rtsp.nonce || params.username != acl.user {
        return Err(AuthFailure::CredentialsWrong);
    }

    let expected = digest_response(&acl.user, &acl.pass, &rtsp.nonce, &rtsp.method, &params.uri);
    if expected == params.response.to_lowercase() {
        Ok(())
    } else {
        Err(AuthFailure::CredentialsWrong)
    }
}

/// RFC 2069 digest response: MD5(HA1:nonce:HA2), lowercase hex.
pub fn digest_response(user: &str, pass: &str, nonce: &str, method: &str, uri: &str) -> String {
    let ha1 = md5_hex(format!("{user}:{REALM}:{pass}").as_bytes());
    let ha2 = md5_hex(format!("{method}:{uri}").as_bytes());
    md5_hex(format!("{ha1}:{nonce}:{ha2}").as_bytes())
}

fn md5_hex(data: &[u8]) -> String {
    let digest = Md5::digest(data);
    hex_string(&digest)
}

fn hex_string(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}

fn is_hashed(credential: &str) -> bool {
    credential.starts_with("sha256:")
}

/// Compare a presented credential with a stored one, which may be either
/// plaintext or `sha256:<base64 of sha256(presented)>`.
pub fn credential_matches(stored: &str, presented: &str) -> bool {
    match stored.strip_prefix("sha256:") {
        Some(encoded) => {
            let hashed = Sha256::digest(presented.as_bytes());
            base64::engine::general_purpose::STANDARD.encode(hashed) == encoded
        }
        None => stored == presented,
    }
}

/// Random nonce for an RTSP connection, issued once and kept for its
/// lifetime.
pub fn generate_nonce() -> String {
    use rand::Rng;
    let bytes: [u8; 16] = rand::thread_rng().gen();
    hex_string(&bytes)
}

/// Extract a query parameter from a raw query string.
pub fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then_some(v)
    })
}

/// An allow-list entry: a plain address or a CIDR range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpRange {
    addr: IpAddr,
    prefix: u8,
}

impl IpRange {
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = prefix_mask_v4(self.prefix);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = prefix_mask_v6(self.prefix);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

fn prefix_mask_v4(prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        p => u32::MAX << (32 - u32::from(p.min(32))),
    }
}

fn prefix_mask_v6(prefix: u8) -> u128 {
    match prefix {
        0 => 0,
        p => u128::MAX << (128 - u32::from(p.min(128))),
    }
}

/// Error parsing an [`IpRange`] from its string form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid IP or CIDR range '{0}'")]
pub struct IpRangeError(String);

impl FromStr for IpRange {
    type Err = IpRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || IpRangeError(s.to_string());
        match s.split_once('/') {
            Some((addr, prefix)) => {
                let addr: IpAddr = addr.parse().map_err(|_| err())?;
                let max = if addr.is_ipv4() { 32 } else { 128 };
                let prefix: u8 = prefix.parse().map_err(|_| err())?;
                if prefix > max {
                    return Err(err());
                }
                Ok(Self { addr, prefix })
            }
            None => {
                let addr: IpAddr = s.parse().map_err(|_| err())?;
                let prefix = if addr.is_ipv4() { 32 } else { 128 };
                Ok(Self { addr, prefix })
            }
        }
    }
}
