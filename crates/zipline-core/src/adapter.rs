//! # Service Adapters
//!
//! A per-interface descriptor: the ordered function list (ordinals are stable
//! identity), inbound dispatch onto a concrete instance, and the factory that
//! builds an outbound proxy over a call handler.
//!
//! Adapters are written by hand, one per service interface. The endpoint
//! depends on nothing else about an interface; see `platform` for two
//! complete reference adapters.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::endpoint::CallContext;
use crate::error::BridgeError;
use crate::error::Result;
use crate::outbound::OutboundCallHandler;

/// Boxed future used by suspending dispatch.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Canonical signature of the close function. The outbound call handler
/// special-cases it: it marks the handler closed instead of crossing the
/// boundary, and any subsequent call on the same proxy fails fatally.
pub const CLOSE_SIGNATURE: &str = "fun close(): Unit";

/// One function of a service interface. Identified by its ordinal index
/// within the adapter's function list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Function {
    /// Canonical signature string, stable identity for logging and
    /// compatibility checks.
    pub signature: &'static str,
    pub is_suspending: bool,
}

/// A long-lived addressable object exposed across the boundary.
///
/// `close` releases held resources; it is invoked exactly once when the
/// service is removed from its endpoint. `outbound_name` is overridden only
/// by generated proxies so a received service can be passed back by name.
pub trait ZiplineService: Send + Sync + 'static {
    fn close(&self) {}

    #[doc(hidden)]
    fn outbound_name(&self) -> Option<String> {
        None
    }
}

/// Per-interface descriptor enabling encoding and dispatch.
pub trait ServiceAdapter: Clone + Send + Sync + 'static {
    /// The service interface, usually a trait object type.
    type Service: ZiplineService + ?Sized;
    /// The concrete proxy type returned by `take`.
    type Proxy;

    /// Ordered list of functions. Ordinals index into this list.
    fn functions(&self) -> &'static [Function];

    /// Invokes a normal function on a concrete instance given decoded
    /// arguments. Used for inbound dispatch.
    fn call(
        &self,
        service: &Arc<Self::Service>,
        context: &CallContext,
        ordinal: usize,
        args: Vec<Value>,
    ) -> Result<Value>;

    /// Invokes a suspending function on a concrete instance. The returned
    /// future runs on the dispatcher and may be cancelled cooperatively.
    fn call_suspending(
        &self,
        _service: Arc<Self::Service>,
        _context: CallContext,
        ordinal: usize,
        _args: Vec<Value>,
    ) -> BoxFuture<Result<Value>> {
        Box::pin(async move {
            Err(BridgeError::Protocol(format!(
                "function {} is not suspending",
                ordinal
            )))
        })
    }

    /// Builds a proxy whose methods forward to the handler.
    fn outbound_proxy(&self, handler: OutboundCallHandler) -> Self::Proxy;
}

/// Decodes one positional argument with the function's per-parameter
/// serializer. Null decodes into `Option::None`.
pub fn decode_arg<T: DeserializeOwned>(args: &[Value], index: usize) -> Result<T> {
    let value = args
        .get(index)
        .ok_or_else(|| BridgeError::Protocol(format!("missing argument {}", index)))?;
    serde_json::from_value(value.clone())
        .map_err(|e| BridgeError::Protocol(format!("argument {}: {}", index, e)))
}

/// Encodes one value for the wire.
pub fn encode_value<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(BridgeError::from)
}

/// Decodes a result value received from the peer.
pub fn decode_value<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| BridgeError::Protocol(format!("result: {}", e)))
}
