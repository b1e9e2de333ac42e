//! Relay error taxonomy
//!
//! Errors produced by the path layer and surfaced by session wrappers.
//! Each protocol maps these to its own wire-level status; the core only
//! distinguishes the cases below.

use thiserror::Error;

/// Reason an authentication attempt was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// No usable credentials were presented; the protocol should emit a
    /// challenge (401 + WWW-Authenticate for RTSP).
    CredentialsMissing,
    /// Credentials were presented but do not match.
    CredentialsWrong,
    /// The client IP is not in the allow-list.
    IpRejected,
}

impl std::fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthFailure::CredentialsMissing => write!(f, "credentials are missing"),
            AuthFailure::CredentialsWrong => write!(f, "credentials are wrong"),
            AuthFailure::IpRejected => write!(f, "IP is not allowed"),
        }
    }
}

/// Error type shared by the path manager, paths and session wrappers.
#[derive(Error, Debug, Clone)]
pub enum RelayError {
    #[error("authentication failed: {0}")]
    Auth(AuthFailure),

    #[error("no one is publishing to path '{0}'")]
    NoOnePublishing(String),

    /// The path is not ready but has a configured fallback; protocols
    /// that can redirect send the client there.
    #[error("redirect to '{0}'")]
    Redirect(String),

    #[error("someone is already publishing to path '{0}'")]
    AlreadyInUse(String),

    /// Cancellation or shutdown. Never surfaced to clients as an error.
    #[error("terminated")]
    Terminated,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Internal(String),
}

impl RelayError {
    /// Whether this error should be reported as a client fault (4xx-class)
    /// rather than logged as a server defect.
    pub fn is_client_fault(&self) -> bool {
        !matches!(self, RelayError::Internal(_))
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
