//! Wire codec errors.

use std::fmt;

/// Errors produced while encoding or decoding wire envelopes.
///
/// A decode failure is fatal for the call that produced it, but never for the
/// channel: the caller reports the error locally and the transport stays open.
#[derive(Debug)]
pub enum Error {
    /// The bytes are not a well-formed envelope of the expected shape.
    InvalidFrame(String),
    /// JSON (de)serialization failed.
    Json(serde_json::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidFrame(msg) => write!(f, "invalid frame: {}", msg),
            Self::Json(e) => write!(f, "json error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
