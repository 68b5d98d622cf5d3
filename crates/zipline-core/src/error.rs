//! Bridge error taxonomy.
//!
//! Application errors cross the boundary verbatim as serialized throwables and
//! are re-thrown on the caller side. Transport and protocol errors are fatal
//! for the endpoint and fail all pending continuations. Cancellation is
//! cooperative and is not a failure for logging purposes.

use std::fmt;

use zipline_wire::SerializedThrowable;

/// Errors raised by bridge operations.
#[derive(Debug)]
pub enum BridgeError {
    /// The channel is unreachable or produced malformed frames.
    Channel(String),
    /// Unknown service name, bad ordinal, or invalid envelope.
    Protocol(String),
    /// Thrown by user code on either side; re-thrown here verbatim.
    Application(SerializedThrowable),
    /// The named service was closed; further calls fail fatally.
    ServiceClosed(String),
    /// The endpoint was closed; no future call returns success.
    EndpointClosed,
    /// The scope owning this proxy was closed.
    ScopeClosed,
    /// The suspending call was cancelled cooperatively.
    Cancelled,
    /// Envelope (de)serialization failed.
    Wire(zipline_wire::Error),
}

impl BridgeError {
    /// Converts this error to the throwable that crosses the boundary.
    pub fn to_throwable(&self) -> SerializedThrowable {
        match self {
            Self::Application(throwable) => throwable.clone(),
            Self::Cancelled => SerializedThrowable::cancellation(),
            Self::Channel(msg) => SerializedThrowable::new("ChannelError", msg.clone()),
            Self::Protocol(msg) => SerializedThrowable::new("ProtocolError", msg.clone()),
            Self::ServiceClosed(name) => {
                SerializedThrowable::new("ServiceClosed", format!("service closed: {}", name))
            }
            Self::EndpointClosed => SerializedThrowable::new("EndpointClosed", "endpoint closed"),
            Self::ScopeClosed => SerializedThrowable::new("ScopeClosed", "scope closed"),
            Self::Wire(e) => SerializedThrowable::new("ProtocolError", e.to_string()),
        }
    }

    /// Maps a throwable received from the peer back to a local error.
    pub fn from_throwable(throwable: SerializedThrowable) -> Self {
        if throwable.is_cancellation() {
            Self::Cancelled
        } else {
            Self::Application(throwable)
        }
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channel(msg) => write!(f, "channel error: {}", msg),
            Self::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Self::Application(throwable) => write!(f, "application error: {}", throwable),
            Self::ServiceClosed(name) => write!(f, "service closed: {}", name),
            Self::EndpointClosed => write!(f, "endpoint closed"),
            Self::ScopeClosed => write!(f, "scope closed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Wire(e) => write!(f, "wire error: {}", e),
        }
    }
}

impl std::error::Error for BridgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Application(throwable) => Some(throwable),
            Self::Wire(e) => Some(e),
            _ => None,
        }
    }
}

impl From<zipline_wire::Error> for BridgeError {
    fn from(e: zipline_wire::Error) -> Self {
        Self::Wire(e)
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Aggregate of failures collected while closing a scope. Reported, never
/// re-thrown.
#[derive(Debug)]
pub struct MultiError(pub Vec<BridgeError>);

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} close failure(s):", self.0.len())?;
        for error in &self.0 {
            write!(f, " [{}]", error)?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}
