//! # Call Channel
//!
//! The raw two-sided transport between the host and the JavaScript engine.
//! One side's inbound channel is the peer's outbound channel.
//!
//! All four methods are total: errors travel inside encoded result envelopes,
//! never as channel failures. Calls across the channel are linearizable within
//! the single-threaded dispatcher model; the channel itself buffers nothing
//! beyond a single call's byte arrays.

use std::sync::Arc;

/// Symbol the JS engine exports for the channel the host calls into.
pub const INBOUND_CHANNEL_NAME: &str = "app_cash_zipline_inboundChannel";

/// Symbol the host publishes for the channel JS calls into.
pub const OUTBOUND_CHANNEL_NAME: &str = "app_cash_zipline_outboundChannel";

/// The four-method transport contract shared by both sides.
pub trait CallChannel: Send + Sync + 'static {
    /// Snapshot of service names registered on this side.
    fn service_names(&self) -> Vec<String>;

    /// Synchronous round-trip. The JS side never yields here; the host side
    /// blocks until the peer returns.
    fn invoke(&self, encoded_call: &[u8]) -> Vec<u8>;

    /// Returns immediately, typically with an encoded cancel-callback
    /// reference. The eventual result is delivered by a later `invoke` from
    /// the peer to the named suspend callback.
    ///
    /// The callback name also travels inside the envelope; the separate
    /// argument mirrors the channel ABI.
    fn invoke_suspending(&self, encoded_call: &[u8], suspend_callback: &str) -> Vec<u8>;

    /// Removes the named service on this side. Returns whether a service with
    /// that name existed.
    fn disconnect(&self, name: &str) -> bool;
}

impl std::fmt::Debug for dyn CallChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CallChannel({} services)", self.service_names().len())
    }
}

/// A channel that has not been wired yet, or whose peer is gone.
///
/// Every operation reports failure without panicking, so a half-constructed
/// endpoint still satisfies the total-function contract.
pub(crate) struct DisconnectedChannel;

impl CallChannel for DisconnectedChannel {
    fn service_names(&self) -> Vec<String> {
        Vec::new()
    }

    fn invoke(&self, _encoded_call: &[u8]) -> Vec<u8> {
        crate::endpoint::encode_failure_envelope("channel disconnected")
    }

    fn invoke_suspending(&self, _encoded_call: &[u8], _suspend_callback: &str) -> Vec<u8> {
        crate::endpoint::encode_failure_envelope("channel disconnected")
    }

    fn disconnect(&self, _name: &str) -> bool {
        false
    }
}

pub(crate) fn disconnected() -> Arc<dyn CallChannel> {
    Arc::new(DisconnectedChannel)
}
