//! # Call and Result Envelopes
//!
//! The envelope is a JSON object with short, stable keys:
//!
//! - Call: `{ "s": service, "f": ordinal, "a": [args...], "c": callback? }`
//! - Result: `{ "v": value }` on success, `{ "e": throwable }` on failure.
//!
//! A suspending invocation replies immediately with
//! `{ "v": { "cancelCallback": "<name>" } }`; the eventual result arrives as a
//! later call to the named suspend callback.
//!
//! Decoding matches on keys rather than position, so peers are free to emit
//! fields in any order and to add fields this version does not know about.

use serde_json::Map;
use serde_json::Value;

use crate::error::Error;
use crate::error::Result;
use crate::throwable::SerializedThrowable;

const KEY_SERVICE: &str = "s";
const KEY_FUNCTION: &str = "f";
const KEY_ARGS: &str = "a";
const KEY_CALLBACK: &str = "c";
const KEY_VALUE: &str = "v";
const KEY_ERROR: &str = "e";

/// The key of the suspend-initial reply value naming the peer-side
/// cancellation service.
const KEY_CANCEL_CALLBACK: &str = "cancelCallback";

/// One call crossing the boundary, in either direction.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    /// Name of the target service on the receiving side.
    pub service: String,
    /// Ordinal of the function within the target's adapter.
    pub function: usize,
    /// Pre-encoded argument values. Null is a legal argument.
    pub args: Vec<Value>,
    /// For suspending calls, the caller-side service that receives the
    /// eventual result.
    pub suspend_callback: Option<String>,
}

/// The outcome of one call, as it travels back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum CallResult {
    /// The call returned normally. Null is a legal value.
    Success { value: Value },
    /// The call threw; the throwable crosses the boundary verbatim.
    Failure { error: SerializedThrowable },
}

impl CallResult {
    pub fn success(value: Value) -> Self {
        Self::Success { value }
    }

    pub fn failure(error: SerializedThrowable) -> Self {
        Self::Failure { error }
    }
}

/// Encodes a call envelope to bytes.
pub fn encode_call(call: &Call) -> Result<Vec<u8>> {
    let mut map = Map::new();
    map.insert(KEY_SERVICE.into(), Value::String(call.service.clone()));
    map.insert(KEY_FUNCTION.into(), Value::from(call.function as u64));
    map.insert(KEY_ARGS.into(), Value::Array(call.args.clone()));
    if let Some(callback) = &call.suspend_callback {
        map.insert(KEY_CALLBACK.into(), Value::String(callback.clone()));
    }
    Ok(serde_json::to_vec(&Value::Object(map))?)
}

/// Decodes a call envelope from bytes.
pub fn decode_call(bytes: &[u8]) -> Result<Call> {
    let value: Value = serde_json::from_slice(bytes)?;
    let Value::Object(map) = value else {
        return Err(Error::InvalidFrame("call envelope is not an object".into()));
    };

    let mut service = None;
    let mut function = None;
    let mut args = None;
    let mut suspend_callback = None;

    for (key, value) in map {
        match key.as_str() {
            KEY_SERVICE => match value {
                Value::String(s) => service = Some(s),
                _ => return Err(Error::InvalidFrame("service is not a string".into())),
            },
            KEY_FUNCTION => match value.as_u64() {
                Some(n) => function = Some(n as usize),
                None => return Err(Error::InvalidFrame("function is not an ordinal".into())),
            },
            KEY_ARGS => match value {
                Value::Array(a) => args = Some(a),
                _ => return Err(Error::InvalidFrame("args is not an array".into())),
            },
            KEY_CALLBACK => match value {
                Value::String(s) => suspend_callback = Some(s),
                Value::Null => {}
                _ => return Err(Error::InvalidFrame("callback is not a string".into())),
            },
            _ => {} // skip unknown fields
        }
    }

    Ok(Call {
        service: service.ok_or_else(|| Error::InvalidFrame("missing service".into()))?,
        function: function.ok_or_else(|| Error::InvalidFrame("missing function".into()))?,
        args: args.ok_or_else(|| Error::InvalidFrame("missing args".into()))?,
        suspend_callback,
    })
}

/// Encodes a result envelope to bytes.
pub fn encode_result(result: &CallResult) -> Result<Vec<u8>> {
    let mut map = Map::new();
    match result {
        CallResult::Success { value } => {
            map.insert(KEY_VALUE.into(), value.clone());
        }
        CallResult::Failure { error } => {
            map.insert(KEY_ERROR.into(), serde_json::to_value(error)?);
        }
    }
    Ok(serde_json::to_vec(&Value::Object(map))?)
}

/// Decodes a result envelope from bytes.
///
/// Presence of the `"e"` key decides failure; a success envelope carries
/// `"v"`, which may be JSON null.
pub fn decode_result(bytes: &[u8]) -> Result<CallResult> {
    let value: Value = serde_json::from_slice(bytes)?;
    let Value::Object(map) = value else {
        return Err(Error::InvalidFrame("result envelope is not an object".into()));
    };

    let mut success = None;
    let mut failure = None;

    for (key, value) in map {
        match key.as_str() {
            KEY_VALUE => success = Some(value),
            KEY_ERROR => failure = Some(serde_json::from_value(value)?),
            _ => {} // skip unknown fields
        }
    }

    match (success, failure) {
        (_, Some(error)) => Ok(CallResult::Failure { error }),
        (Some(value), None) => Ok(CallResult::Success { value }),
        (None, None) => Err(Error::InvalidFrame("result envelope has neither value nor error".into())),
    }
}

/// Builds the suspend-initial reply value naming the peer-side cancel service.
pub fn cancel_callback_value(name: &str) -> Value {
    let mut map = Map::new();
    map.insert(KEY_CANCEL_CALLBACK.into(), Value::String(name.into()));
    Value::Object(map)
}

/// Extracts the cancel-service name from a suspend-initial reply value.
pub fn as_cancel_callback(value: &Value) -> Option<&str> {
    value.get(KEY_CANCEL_CALLBACK)?.as_str()
}
