use thiserror::Error;

use crate::session::LinkState;

/// Errors surfaced to callers of the voice link.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// The operator has not granted microphone (or speaker) access.
    #[error("audio device access denied: {0}")]
    PermissionDenied(String),

    /// No usable capture or output hardware.
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The transport failed to open or dropped mid-session.
    #[error("connection error: {0}")]
    Connection(String),

    #[error("voice link cannot start while {0:?}")]
    InvalidState(LinkState),
}

/// A malformed inbound audio chunk. Never fatal to the session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("PCM16 payload has odd length ({0} bytes)")]
    OddLength(usize),

    #[error("invalid base64 audio payload: {0}")]
    Base64(String),
}

impl From<base64::DecodeError> for DecodeError {
    fn from(e: base64::DecodeError) -> Self {
        DecodeError::Base64(e.to_string())
    }
}
