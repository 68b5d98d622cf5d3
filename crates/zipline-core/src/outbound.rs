//! # Outbound Call Handler
//!
//! The routing half of an outbound proxy. A proxy's methods forward to
//! `call` / `call_suspending` by ordinal; the handler encodes arguments,
//! crosses the channel, and decodes the reply.
//!
//! ## Invariants
//! - A suspending call resolves exactly once: success, failure, or
//!   cancellation.
//! - Dropping the in-flight future fires the peer's cancel service at most
//!   once, and only if the suspend callback has not yet completed.
//! - A handler dropped without `close()` reports `service_leaked` and is
//!   closed defensively.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::oneshot;

use zipline_wire::as_cancel_callback;
use zipline_wire::decode_result;
use zipline_wire::encode_call;
use zipline_wire::Call;
use zipline_wire::CallResult;

use crate::adapter::Function;
use crate::adapter::CLOSE_SIGNATURE;
use crate::endpoint::CallContext;
use crate::endpoint::Endpoint;
use crate::error::BridgeError;
use crate::error::Result;
use crate::events::CallEvent;
use crate::scope::ZiplineScope;

/// Shared state of one outbound proxy.
pub(crate) struct OutboundState {
    pub(crate) endpoint: Arc<Endpoint>,
    pub(crate) service_name: String,
    functions: &'static [Function],
    pub(crate) closed: AtomicBool,
    scope: Option<ZiplineScope>,
}

impl OutboundState {
    /// Marks the proxy closed and reclaims the peer-side registration.
    /// Idempotent.
    pub(crate) fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.endpoint.is_closed() {
            return Ok(());
        }
        let channel = self.endpoint.outbound_channel()?;
        channel.disconnect(&self.service_name);
        Ok(())
    }
}

impl Drop for OutboundState {
    fn drop(&mut self) {
        if self.closed.load(Ordering::SeqCst) || self.endpoint.is_closed() {
            return;
        }
        self.endpoint.listener().service_leaked(&self.service_name);
        let _ = self.close();
    }
}

/// Handle held by a generated proxy; cheap to clone.
#[derive(Clone)]
pub struct OutboundCallHandler {
    state: Arc<OutboundState>,
}

impl std::fmt::Debug for OutboundCallHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundCallHandler")
            .field("service_name", &self.state.service_name)
            .finish()
    }
}

impl OutboundCallHandler {
    pub(crate) fn new(
        endpoint: Arc<Endpoint>,
        service_name: &str,
        functions: &'static [Function],
        scope: Option<ZiplineScope>,
    ) -> Self {
        let state = Arc::new(OutboundState {
            endpoint,
            service_name: service_name.to_string(),
            functions,
            closed: AtomicBool::new(false),
            scope,
        });
        if let Some(scope) = &state.scope {
            scope.add(&state);
        }
        Self { state }
    }

    /// The peer-side name this proxy is bound to.
    pub fn service_name(&self) -> &str {
        &self.state.service_name
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Context for encoding and decoding pass-by-reference arguments and
    /// results, carrying this proxy's scope.
    pub fn context(&self) -> CallContext {
        CallContext::new(Arc::clone(&self.state.endpoint), self.state.scope.clone())
    }

    /// Marks this proxy closed; any subsequent call fails fatally.
    pub fn close(&self) -> Result<()> {
        self.state.close()
    }

    fn function(&self, ordinal: usize) -> Result<Function> {
        self.state.functions.get(ordinal).copied().ok_or_else(|| {
            BridgeError::Protocol(format!(
                "unknown function {} on {}",
                ordinal, self.state.service_name
            ))
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(BridgeError::ServiceClosed(self.state.service_name.clone()));
        }
        if self.state.endpoint.is_closed() {
            return Err(BridgeError::EndpointClosed);
        }
        Ok(())
    }

    /// Synchronous round-trip. Blocks the dispatcher until the peer returns;
    /// intentionally not cancellable because the peer is non-yielding.
    pub fn call(&self, ordinal: usize, args: Vec<Value>) -> Result<Value> {
        let function = self.function(ordinal)?;
        if function.signature == CLOSE_SIGNATURE {
            self.close()?;
            return Ok(Value::Null);
        }
        self.check_open()?;

        let endpoint = &self.state.endpoint;
        let event = CallEvent {
            service_name: self.state.service_name.clone(),
            function: function.signature.to_string(),
            args: args.clone(),
        };
        let token = endpoint.listener().call_start(&event);

        // A name bound on this side resolves to the original instance.
        let outcome = if let Some(local) = endpoint.local_handler(&self.state.service_name) {
            local.call(&self.context(), ordinal, args)
        } else {
            self.invoke_remote(ordinal, args)
        };

        endpoint.listener().call_end(&event, &outcome, token);
        outcome
    }

    fn invoke_remote(&self, ordinal: usize, args: Vec<Value>) -> Result<Value> {
        let call = Call {
            service: self.state.service_name.clone(),
            function: ordinal,
            args,
            suspend_callback: None,
        };
        let encoded = encode_call(&call)?;
        let channel = self.state.endpoint.outbound_channel()?;
        let reply = channel.invoke(&encoded);
        match decode_result(&reply)? {
            CallResult::Success { value } => Ok(value),
            CallResult::Failure { error } => Err(BridgeError::from_throwable(error)),
        }
    }

    /// Suspending round-trip. Registers a one-shot suspend callback, sends
    /// the call, and awaits the peer's eventual result. Dropping the
    /// returned future cancels the peer-side handler cooperatively.
    pub async fn call_suspending(&self, ordinal: usize, args: Vec<Value>) -> Result<Value> {
        let function = self.function(ordinal)?;
        self.check_open()?;

        let endpoint = Arc::clone(&self.state.endpoint);
        let event = CallEvent {
            service_name: self.state.service_name.clone(),
            function: function.signature.to_string(),
            args: args.clone(),
        };
        let token = endpoint.listener().call_start(&event);

        // A name bound on this side resolves to the original instance.
        if let Some(local) = endpoint.local_handler(&self.state.service_name) {
            let outcome = local.call_suspending(self.context(), ordinal, args).await;
            endpoint.listener().call_end(&event, &outcome, token);
            return outcome;
        }

        let call = Call {
            service: self.state.service_name.clone(),
            function: ordinal,
            args,
            suspend_callback: None, // assigned below
        };
        let channel = endpoint.outbound_channel()?;

        let callback_name = endpoint.generate_name(crate::endpoint::CALLBACK_PREFIX);
        let call = Call {
            suspend_callback: Some(callback_name.clone()),
            ..call
        };
        let encoded = encode_call(&call)?;

        let (tx, rx) = oneshot::channel();
        endpoint.register_continuation(&callback_name, tx)?;

        let reply = channel.invoke_suspending(&encoded, &callback_name);
        let cancel_name = match decode_result(&reply) {
            Ok(CallResult::Success { value }) => as_cancel_callback(&value).map(str::to_string),
            Ok(CallResult::Failure { error }) => {
                // The peer rejected the call before suspending.
                let outcome = Err(BridgeError::from_throwable(error));
                endpoint.unbind(&callback_name);
                endpoint.take_continuation(&callback_name);
                endpoint.listener().call_end(&event, &outcome, token);
                return outcome;
            }
            Err(e) => {
                let outcome = Err(BridgeError::from(e));
                endpoint.unbind(&callback_name);
                endpoint.take_continuation(&callback_name);
                endpoint.listener().call_end(&event, &outcome, token);
                return outcome;
            }
        };

        let mut guard = CancelGuard {
            endpoint: Arc::clone(&endpoint),
            callback_name,
            cancel_name,
            armed: true,
        };

        let outcome = match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(BridgeError::EndpointClosed),
        };
        guard.armed = false;

        endpoint.listener().call_end(&event, &outcome, token);
        outcome
    }
}

/// Fires the peer's cancel service if the caller abandoned the suspending
/// call before its continuation resolved.
struct CancelGuard {
    endpoint: Arc<Endpoint>,
    callback_name: String,
    cancel_name: Option<String>,
    armed: bool,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // The continuation gates at-most-once cancellation: if it is gone,
        // the callback already completed.
        if self.endpoint.take_continuation(&self.callback_name).is_none() {
            return;
        }
        let Some(cancel_name) = &self.cancel_name else {
            self.endpoint.unbind(&self.callback_name);
            return;
        };
        let call = Call {
            service: cancel_name.clone(),
            function: 0,
            args: Vec::new(),
            suspend_callback: None,
        };
        if let (Ok(encoded), Ok(channel)) = (encode_call(&call), self.endpoint.outbound_channel()) {
            let _ = channel.invoke(&encoded);
        }
    }
}
