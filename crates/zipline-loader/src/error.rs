//! Loader errors.
//!
//! Loader errors trigger the fallback path in `load_or_fall_back`; otherwise
//! they propagate to the caller.

use std::fmt;

use zipline_core::BridgeError;

/// Errors produced while loading an application.
#[derive(Debug)]
pub enum LoaderError {
    /// The manifest bytes are not valid JSON of the expected shape.
    ManifestParse(serde_json::Error),
    /// The manifest decoded but violates an invariant: unknown dependency
    /// id, dependency cycle, or malformed hash.
    ManifestInvalid(String),
    /// No fetcher in the chain yielded bytes for this module.
    ModuleUnavailable(String),
    /// Fetched bytes do not hash to the manifest's sha256.
    Sha256Mismatch {
        id: String,
        expected: String,
        actual: String,
    },
    /// The module container carries an unsupported version.
    VersionMismatch { expected: u32, actual: u32 },
    /// The module container is truncated or malformed.
    ModuleCorrupt(String),
    /// HTTP transport failure.
    Http { url: String, error: HttpError },
    /// Filesystem failure in the embedded fetcher or a receiver.
    Io(std::io::Error),
    /// A module URL did not resolve against the manifest URL.
    Url(url::ParseError),
    /// The loading scope was cancelled; in-flight fetches were dropped.
    Cancelled,
    /// Installing a module into the engine failed.
    Bridge(BridgeError),
}

impl fmt::Display for LoaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ManifestParse(e) => write!(f, "manifest parse failed: {}", e),
            Self::ManifestInvalid(msg) => write!(f, "manifest invalid: {}", msg),
            Self::ModuleUnavailable(id) => write!(f, "module unavailable: {}", id),
            Self::Sha256Mismatch { id, expected, actual } => {
                write!(f, "sha256 mismatch for {}: expected {}, got {}", id, expected, actual)
            }
            Self::VersionMismatch { expected, actual } => {
                write!(f, "module version mismatch: expected {}, got {}", expected, actual)
            }
            Self::ModuleCorrupt(msg) => write!(f, "module corrupt: {}", msg),
            Self::Http { url, error } => write!(f, "http fetch of {} failed: {}", url, error),
            Self::Io(e) => write!(f, "i/o error: {}", e),
            Self::Url(e) => write!(f, "url resolution failed: {}", e),
            Self::Cancelled => write!(f, "load cancelled"),
            Self::Bridge(e) => write!(f, "bridge error: {}", e),
        }
    }
}

impl std::error::Error for LoaderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ManifestParse(e) => Some(e),
            Self::Http { error, .. } => Some(error),
            Self::Io(e) => Some(e),
            Self::Url(e) => Some(e),
            Self::Bridge(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for LoaderError {
    fn from(e: serde_json::Error) -> Self {
        Self::ManifestParse(e)
    }
}

impl From<std::io::Error> for LoaderError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<url::ParseError> for LoaderError {
    fn from(e: url::ParseError) -> Self {
        Self::Url(e)
    }
}

impl From<BridgeError> for LoaderError {
    fn from(e: BridgeError) -> Self {
        Self::Bridge(e)
    }
}

pub type Result<T> = std::result::Result<T, LoaderError>;

/// Transport-level failure reported by an [`HttpClient`](crate::HttpClient)
/// implementation, e.g. a connection error or a non-success status.
#[derive(Debug, Clone)]
pub struct HttpError(pub String);

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for HttpError {}
