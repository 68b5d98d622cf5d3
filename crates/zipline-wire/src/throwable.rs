//! # Serialized Throwables
//!
//! Application errors cross the boundary as data: class name, message, stack,
//! and cause chain, preserved verbatim and re-thrown on the caller side.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Class name used for cooperative cancellation outcomes. Cancellation
/// propagates through suspending calls but is not a failure for logging
/// purposes.
pub const CANCELLATION_CLASS: &str = "CancellationException";

/// A throwable in transit between the host and the JavaScript engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedThrowable {
    /// Class name on the throwing side, e.g. `IllegalStateException`.
    #[serde(rename = "type")]
    pub class_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Stack frames as opaque strings, top-most first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stack: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<SerializedThrowable>>,
}

impl SerializedThrowable {
    pub fn new(class_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            message: Some(message.into()),
            stack: Vec::new(),
            cause: None,
        }
    }

    /// A cancellation outcome for a suspending call.
    pub fn cancellation() -> Self {
        Self {
            class_name: CANCELLATION_CLASS.into(),
            message: None,
            stack: Vec::new(),
            cause: None,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        self.class_name == CANCELLATION_CLASS
    }

    /// Captures an error and its `source()` chain.
    pub fn from_error(error: &(dyn std::error::Error)) -> Self {
        Self {
            class_name: "Exception".into(),
            message: Some(error.to_string()),
            stack: Vec::new(),
            cause: error.source().map(|cause| Box::new(Self::from_error(cause))),
        }
    }

    pub fn with_cause(mut self, cause: SerializedThrowable) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }
}

impl fmt::Display for SerializedThrowable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {}", self.class_name, message),
            None => write!(f, "{}", self.class_name),
        }
    }
}

impl std::error::Error for SerializedThrowable {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_ref().map(|c| c.as_ref() as &(dyn std::error::Error + 'static))
    }
}
