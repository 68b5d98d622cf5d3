//! # Endpoint
//!
//! The per-side router. Maintains the registry of local (inbound) and remote
//! (outbound) services by name, dispatches inbound calls to local handlers,
//! constructs outbound proxies, manages suspending-call continuations and
//! their cancellation, and generates fresh reference names.
//!
//! ## Invariants
//! - Every suspending outbound call resolves its continuation exactly once:
//!   success, failure, or cancellation.
//! - Removing an inbound service invokes its `close()` exactly once;
//!   `remove` is idempotent.
//! - Closing the endpoint fails every pending continuation with
//!   `EndpointClosed`; no later call returns success.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;

use zipline_wire::cancel_callback_value;
use zipline_wire::decode_call;
use zipline_wire::encode_call;
use zipline_wire::encode_result;
use zipline_wire::Call;
use zipline_wire::CallResult;
use zipline_wire::SerializedThrowable;

use crate::adapter::decode_arg;
use crate::adapter::BoxFuture;
use crate::adapter::Function;
use crate::adapter::ServiceAdapter;
use crate::adapter::ZiplineService;
use crate::channel;
use crate::channel::CallChannel;
use crate::error::BridgeError;
use crate::error::Result;
use crate::events::CallEvent;
use crate::events::EventListener;
use crate::events::SafeEventListener;
use crate::outbound::OutboundCallHandler;
use crate::scope::ZiplineScope;

/// Name prefix for services registered implicitly by reference encoding.
const REFERENCE_PREFIX: &str = "zipline/service";
/// Name prefix for one-shot suspend callbacks.
pub(crate) const CALLBACK_PREFIX: &str = "zipline/callback";
/// Name prefix for one-shot cancel services.
const CANCEL_PREFIX: &str = "zipline/cancel";

/// Type-erased inbound registration: an adapter paired with its instance.
pub(crate) trait InboundHandler: Send + Sync + 'static {
    fn functions(&self) -> &'static [Function];

    fn call(&self, context: &CallContext, ordinal: usize, args: Vec<Value>) -> Result<Value>;

    fn call_suspending(
        &self,
        context: CallContext,
        ordinal: usize,
        args: Vec<Value>,
    ) -> BoxFuture<Result<Value>>;

    fn close_service(&self);

    /// Stable identity of the underlying instance, for reference reuse.
    fn instance_key(&self) -> usize;
}

struct InboundBinding<A: ServiceAdapter> {
    adapter: A,
    service: Arc<A::Service>,
}

impl<A: ServiceAdapter> InboundHandler for InboundBinding<A> {
    fn functions(&self) -> &'static [Function] {
        self.adapter.functions()
    }

    fn call(&self, context: &CallContext, ordinal: usize, args: Vec<Value>) -> Result<Value> {
        self.adapter.call(&self.service, context, ordinal, args)
    }

    fn call_suspending(
        &self,
        context: CallContext,
        ordinal: usize,
        args: Vec<Value>,
    ) -> BoxFuture<Result<Value>> {
        self.adapter
            .call_suspending(Arc::clone(&self.service), context, ordinal, args)
    }

    fn close_service(&self) {
        self.service.close();
    }

    fn instance_key(&self) -> usize {
        Arc::as_ptr(&self.service).cast::<()>() as usize
    }
}

/// Context threaded through inbound dispatch and proxy encoding, giving
/// adapters access to reference encoding and the current scope.
#[derive(Clone)]
pub struct CallContext {
    endpoint: Arc<Endpoint>,
    scope: Option<ZiplineScope>,
}

impl CallContext {
    pub(crate) fn new(endpoint: Arc<Endpoint>, scope: Option<ZiplineScope>) -> Self {
        Self { endpoint, scope }
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub fn scope(&self) -> Option<&ZiplineScope> {
        self.scope.as_ref()
    }

    /// Encodes a pass-by-reference service: reuses the existing registration
    /// for this instance (or the peer name, when the instance is itself a
    /// proxy), otherwise binds it under a fresh name.
    pub fn encode_service<A: ServiceAdapter>(
        &self,
        service: Arc<A::Service>,
        adapter: A,
    ) -> Result<Value> {
        let name = self.endpoint.encode_service_name(service, adapter)?;
        Ok(Value::String(name))
    }

    /// Decodes a pass-by-reference service: the peer name becomes an
    /// outbound proxy, registered under the current scope (if any).
    pub fn decode_service<A: ServiceAdapter>(&self, value: &Value, adapter: A) -> Result<A::Proxy> {
        let name = value
            .as_str()
            .ok_or_else(|| BridgeError::Protocol("service reference is not a name".into()))?;
        self.endpoint.take_internal(name, adapter, self.scope.as_ref())
    }
}

/// Per-side router owning the service registry and continuation registry.
pub struct Endpoint {
    /// Diagnostic label, e.g. `host` or `js`.
    name: String,
    listener: SafeEventListener,
    outbound: Mutex<Arc<dyn CallChannel>>,
    services: DashMap<String, Arc<dyn InboundHandler>>,
    /// Instance identity → bound name, for reference-encoding reuse.
    bound_names: DashMap<usize, String>,
    /// Suspend-callback name → pending local continuation.
    continuations: DashMap<String, oneshot::Sender<Result<Value>>>,
    next_name: AtomicU64,
    closed: AtomicBool,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, listener: Arc<dyn EventListener>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            listener: SafeEventListener::new(listener),
            outbound: Mutex::new(channel::disconnected()),
            services: DashMap::new(),
            bound_names: DashMap::new(),
            continuations: DashMap::new(),
            next_name: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn listener(&self) -> &SafeEventListener {
        &self.listener
    }

    /// How many listener hooks panicked so far.
    pub fn listener_error_count(&self) -> u64 {
        self.listener.error_count()
    }

    /// Wires the peer's inbound channel as this side's outbound channel.
    pub fn connect(&self, outbound: Arc<dyn CallChannel>) {
        *self.outbound.lock().unwrap_or_else(|e| e.into_inner()) = outbound;
    }

    pub(crate) fn outbound_channel(&self) -> Result<Arc<dyn CallChannel>> {
        if self.is_closed() {
            return Err(BridgeError::EndpointClosed);
        }
        Ok(Arc::clone(&self.outbound.lock().unwrap_or_else(|e| e.into_inner())))
    }

    /// This side's inbound channel, to be published to the peer.
    pub fn inbound_channel(self: &Arc<Self>) -> Arc<dyn CallChannel> {
        Arc::new(EndpointChannel {
            endpoint: Arc::clone(self),
        })
    }

    /// Returns a fresh name of the form `<prefix>/<counter>`. The counter is
    /// monotonic per endpoint.
    pub fn generate_name(&self, prefix: &str) -> String {
        let n = self.next_name.fetch_add(1, Ordering::Relaxed);
        format!("{}/{}", prefix, n)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Count of suspending outbound calls that have not yet resolved.
    pub fn incomplete_continuations(&self) -> usize {
        self.continuations.len()
    }

    /// Snapshot of names registered on this side.
    pub fn service_names(&self) -> Vec<String> {
        self.services.iter().map(|e| e.key().clone()).collect()
    }

    /// Registers an inbound service. Replaces any prior registration of
    /// `name`; the prior instance's `close()` is invoked exactly once.
    /// Allocates nothing on the wire.
    pub fn bind<A: ServiceAdapter>(
        &self,
        name: &str,
        service: Arc<A::Service>,
        adapter: A,
    ) -> Result<()> {
        self.listener.bind_service(name);
        self.bind_handler(name, Arc::new(InboundBinding { adapter, service }))
    }

    pub(crate) fn bind_handler(&self, name: &str, handler: Arc<dyn InboundHandler>) -> Result<()> {
        if self.is_closed() {
            return Err(BridgeError::EndpointClosed);
        }
        let key = handler.instance_key();
        if let Some(prior) = self.services.insert(name.to_string(), handler) {
            if prior.instance_key() != key {
                self.bound_names.remove(&prior.instance_key());
            }
            prior.close_service();
        }
        self.bound_names.insert(key, name.to_string());
        Ok(())
    }

    /// Returns an outbound proxy to the peer's service under `name`. Does
    /// not round-trip.
    pub fn take<A: ServiceAdapter>(
        self: &Arc<Self>,
        name: &str,
        adapter: A,
        scope: Option<&ZiplineScope>,
    ) -> Result<A::Proxy> {
        self.listener.take_service(name);
        self.take_internal(name, adapter, scope)
    }

    pub(crate) fn take_internal<A: ServiceAdapter>(
        self: &Arc<Self>,
        name: &str,
        adapter: A,
        scope: Option<&ZiplineScope>,
    ) -> Result<A::Proxy> {
        if self.is_closed() {
            return Err(BridgeError::EndpointClosed);
        }
        let handler =
            OutboundCallHandler::new(Arc::clone(self), name, adapter.functions(), scope.cloned());
        Ok(adapter.outbound_proxy(handler))
    }

    /// Removes an inbound service; invokes its `close()` exactly once if
    /// present. Idempotent.
    pub fn remove(&self, name: &str) -> bool {
        match self.services.remove(name) {
            Some((_, handler)) => {
                self.bound_names.remove(&handler.instance_key());
                handler.close_service();
                true
            }
            None => false,
        }
    }

    /// Quiet variant of `remove` for internal one-shot services.
    pub(crate) fn unbind(&self, name: &str) {
        if let Some((_, handler)) = self.services.remove(name) {
            self.bound_names.remove(&handler.instance_key());
        }
    }

    pub(crate) fn local_handler(&self, name: &str) -> Option<Arc<dyn InboundHandler>> {
        self.services.get(name).map(|e| Arc::clone(e.value()))
    }

    fn encode_service_name<A: ServiceAdapter>(
        &self,
        service: Arc<A::Service>,
        adapter: A,
    ) -> Result<String> {
        // A proxy passed back to its owner encodes as the original name.
        if let Some(name) = service.outbound_name() {
            return Ok(name);
        }
        let key = Arc::as_ptr(&service).cast::<()>() as usize;
        if let Some(existing) = self.bound_names.get(&key) {
            return Ok(existing.value().clone());
        }
        let name = self.generate_name(REFERENCE_PREFIX);
        self.listener.bind_service(&name);
        self.bind_handler(&name, Arc::new(InboundBinding { adapter, service }))?;
        Ok(name)
    }

    /// Registers a one-shot suspend callback for an outbound suspending call.
    pub(crate) fn register_continuation(
        self: &Arc<Self>,
        callback_name: &str,
        tx: oneshot::Sender<Result<Value>>,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(BridgeError::EndpointClosed);
        }
        self.continuations.insert(callback_name.to_string(), tx);
        let callback = Arc::new(SuspendCallbackService {
            endpoint: Arc::downgrade(self),
            name: callback_name.to_string(),
            completed: AtomicBool::new(false),
        });
        self.bind_handler(callback_name, callback)
    }

    pub(crate) fn take_continuation(
        &self,
        callback_name: &str,
    ) -> Option<oneshot::Sender<Result<Value>>> {
        self.continuations.remove(callback_name).map(|(_, tx)| tx)
    }

    /// Marks the endpoint closed, fails all pending continuations with
    /// `EndpointClosed`, and closes every inbound service exactly once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let pending: Vec<String> = self.continuations.iter().map(|e| e.key().clone()).collect();
        for name in pending {
            if let Some((_, tx)) = self.continuations.remove(&name) {
                let _ = tx.send(Err(BridgeError::EndpointClosed));
            }
        }
        let names: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((_, handler)) = self.services.remove(&name) {
                handler.close_service();
            }
        }
        self.bound_names.clear();
        tracing::debug!(endpoint = %self.name, "endpoint closed");
    }

    /// Routes one inbound call envelope to its local handler and encodes the
    /// reply. Total: every failure becomes a failure envelope.
    pub(crate) fn dispatch(self: &Arc<Self>, encoded_call: &[u8]) -> Vec<u8> {
        let result = self.dispatch_inner(encoded_call);
        match encode_result(&result) {
            Ok(bytes) => bytes,
            Err(e) => encode_failure_envelope(&format!("result encoding failed: {}", e)),
        }
    }

    fn dispatch_inner(self: &Arc<Self>, encoded_call: &[u8]) -> CallResult {
        if self.is_closed() {
            return CallResult::failure(BridgeError::EndpointClosed.to_throwable());
        }

        let call = match decode_call(encoded_call) {
            Ok(call) => call,
            Err(e) => {
                return CallResult::failure(
                    BridgeError::Protocol(format!("invalid call envelope: {}", e)).to_throwable(),
                );
            }
        };

        let Some(handler) = self.local_handler(&call.service) else {
            return CallResult::failure(
                BridgeError::Protocol(format!("unknown service: {}", call.service)).to_throwable(),
            );
        };
        let Some(function) = handler.functions().get(call.function).copied() else {
            return CallResult::failure(
                BridgeError::Protocol(format!(
                    "unknown function {} on {}",
                    call.function, call.service
                ))
                .to_throwable(),
            );
        };

        let event = CallEvent {
            service_name: call.service.clone(),
            function: function.signature.to_string(),
            args: call.args.clone(),
        };
        let token = self.listener.call_start(&event);

        if function.is_suspending {
            self.dispatch_suspending(handler, call, event, token)
        } else {
            let context = CallContext::new(Arc::clone(self), None);
            let outcome = handler.call(&context, call.function, call.args);
            self.listener.call_end(&event, &outcome, token);
            match outcome {
                Ok(value) => CallResult::success(value),
                Err(e) => CallResult::failure(e.to_throwable()),
            }
        }
    }

    /// Creates a cancel service, schedules the handler, and replies with the
    /// cancel-callback reference immediately. The eventual result travels as
    /// a call to the peer's suspend callback.
    fn dispatch_suspending(
        self: &Arc<Self>,
        handler: Arc<dyn InboundHandler>,
        call: Call,
        event: CallEvent,
        token: u64,
    ) -> CallResult {
        let Some(callback_name) = call.suspend_callback else {
            return CallResult::failure(
                BridgeError::Protocol(format!(
                    "suspending call to {} without a suspend callback",
                    call.service
                ))
                .to_throwable(),
            );
        };

        let cancel_name = self.generate_name(CANCEL_PREFIX);
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let cancel = Arc::new(CancelService {
            tx: Mutex::new(Some(cancel_tx)),
        });
        if let Err(e) = self.bind_handler(&cancel_name, cancel) {
            return CallResult::failure(e.to_throwable());
        }

        let endpoint = Arc::clone(self);
        let ordinal = call.function;
        let args = call.args;
        let spawned_cancel_name = cancel_name.clone();
        tokio::spawn(async move {
            let context = CallContext::new(Arc::clone(&endpoint), None);
            let outcome = tokio::select! {
                outcome = handler.call_suspending(context, ordinal, args) => outcome,
                _ = cancel_rx => Err(BridgeError::Cancelled),
            };
            endpoint.unbind(&spawned_cancel_name);
            endpoint.listener.call_end(&event, &outcome, token);
            endpoint.send_suspend_result(&callback_name, outcome);
        });

        CallResult::success(cancel_callback_value(&cancel_name))
    }

    /// Delivers a suspending call's outcome to the peer's suspend callback.
    fn send_suspend_result(&self, callback_name: &str, outcome: Result<Value>) {
        let (function, argument) = match outcome {
            Ok(value) => (SUSPEND_SUCCESS_ORDINAL, value),
            Err(e) => {
                let throwable = e.to_throwable();
                match serde_json::to_value(&throwable) {
                    Ok(value) => (SUSPEND_FAILURE_ORDINAL, value),
                    Err(encode_error) => {
                        tracing::warn!(callback = callback_name, error = %encode_error, "failed to encode suspend failure");
                        return;
                    }
                }
            }
        };
        let call = Call {
            service: callback_name.to_string(),
            function,
            args: vec![argument],
            suspend_callback: None,
        };
        let encoded = match encode_call(&call) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(callback = callback_name, error = %e, "failed to encode suspend result");
                return;
            }
        };
        let channel = match self.outbound_channel() {
            Ok(channel) => channel,
            Err(_) => return, // endpoint closed while the handler ran
        };
        let reply = channel.invoke(&encoded);
        if let Ok(CallResult::Failure { error }) = zipline_wire::decode_result(&reply) {
            tracing::warn!(callback = callback_name, error = %error, "suspend result rejected by peer");
        }
    }
}

pub(crate) const SUSPEND_SUCCESS_ORDINAL: usize = 0;
pub(crate) const SUSPEND_FAILURE_ORDINAL: usize = 1;

static SUSPEND_CALLBACK_FUNCTIONS: &[Function] = &[
    Function {
        signature: "fun success(result: Any?): Unit",
        is_suspending: false,
    },
    Function {
        signature: "fun failure(error: Throwable): Unit",
        is_suspending: false,
    },
];

/// One-shot local service receiving the eventual result of a suspending peer
/// call. Completing twice is a protocol bug, detected by the `completed`
/// flag.
struct SuspendCallbackService {
    endpoint: std::sync::Weak<Endpoint>,
    name: String,
    completed: AtomicBool,
}

impl InboundHandler for SuspendCallbackService {
    fn functions(&self) -> &'static [Function] {
        SUSPEND_CALLBACK_FUNCTIONS
    }

    fn call(&self, _context: &CallContext, ordinal: usize, args: Vec<Value>) -> Result<Value> {
        if self.completed.swap(true, Ordering::SeqCst) {
            return Err(BridgeError::Protocol(format!(
                "suspend callback {} already completed",
                self.name
            )));
        }
        let Some(endpoint) = self.endpoint.upgrade() else {
            return Err(BridgeError::EndpointClosed);
        };

        let outcome = match ordinal {
            SUSPEND_SUCCESS_ORDINAL => {
                Ok(args.into_iter().next().unwrap_or(Value::Null))
            }
            _ => {
                let throwable: SerializedThrowable = decode_arg(&args, 0)?;
                Err(BridgeError::from_throwable(throwable))
            }
        };

        endpoint.unbind(&self.name);
        if let Some(tx) = endpoint.take_continuation(&self.name) {
            let _ = tx.send(outcome);
        }
        Ok(Value::Null)
    }

    fn call_suspending(
        &self,
        _context: CallContext,
        _ordinal: usize,
        _args: Vec<Value>,
    ) -> BoxFuture<Result<Value>> {
        let name = self.name.clone();
        Box::pin(async move {
            Err(BridgeError::Protocol(format!(
                "suspend callback {} has no suspending functions",
                name
            )))
        })
    }

    fn close_service(&self) {}

    fn instance_key(&self) -> usize {
        self as *const Self as *const () as usize
    }
}

static CANCEL_FUNCTIONS: &[Function] = &[Function {
    signature: "fun cancel(): Unit",
    is_suspending: false,
}];

/// One-shot peer-facing service requesting cancellation of an in-flight
/// suspending call.
struct CancelService {
    tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl InboundHandler for CancelService {
    fn functions(&self) -> &'static [Function] {
        CANCEL_FUNCTIONS
    }

    fn call(&self, _context: &CallContext, _ordinal: usize, _args: Vec<Value>) -> Result<Value> {
        if let Some(tx) = self.tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = tx.send(());
        }
        Ok(Value::Null)
    }

    fn call_suspending(
        &self,
        _context: CallContext,
        _ordinal: usize,
        _args: Vec<Value>,
    ) -> BoxFuture<Result<Value>> {
        Box::pin(async move {
            Err(BridgeError::Protocol(
                "cancel service has no suspending functions".into(),
            ))
        })
    }

    fn close_service(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    fn instance_key(&self) -> usize {
        self as *const Self as *const () as usize
    }
}

/// The endpoint's inbound side, published to the peer as its outbound
/// channel.
struct EndpointChannel {
    endpoint: Arc<Endpoint>,
}

impl CallChannel for EndpointChannel {
    fn service_names(&self) -> Vec<String> {
        self.endpoint.service_names()
    }

    fn invoke(&self, encoded_call: &[u8]) -> Vec<u8> {
        self.endpoint.dispatch(encoded_call)
    }

    fn invoke_suspending(&self, encoded_call: &[u8], _suspend_callback: &str) -> Vec<u8> {
        // The envelope names the callback; the argument mirrors the ABI.
        self.endpoint.dispatch(encoded_call)
    }

    fn disconnect(&self, name: &str) -> bool {
        self.endpoint.remove(name)
    }
}

/// A failure envelope built without going through a handler, for paths where
/// no call ever decoded.
pub(crate) fn encode_failure_envelope(message: &str) -> Vec<u8> {
    let result = CallResult::failure(SerializedThrowable::new("ChannelError", message));
    match encode_result(&result) {
        Ok(bytes) => bytes,
        Err(_) => br#"{"e":{"type":"ChannelError"}}"#.to_vec(),
    }
}
