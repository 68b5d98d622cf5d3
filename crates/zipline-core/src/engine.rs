//! # JS Engine Seam
//!
//! The bridge consumes a narrow interface from the embedded JavaScript
//! engine: an evaluation channel exposing two named byte-array FIFOs and a
//! code-module receiver. Engine embedding itself is an external collaborator.

use std::sync::Arc;

use crate::channel::CallChannel;
use crate::error::Result;

/// The JavaScript engine as seen by the bridge.
///
/// `inbound_channel` is the channel JS exports under
/// [`crate::channel::INBOUND_CHANNEL_NAME`]; `install_outbound_channel`
/// publishes the host's channel under
/// [`crate::channel::OUTBOUND_CHANNEL_NAME`].
pub trait JsEngine: Send + Sync + 'static {
    /// The channel the host calls into JS with.
    fn inbound_channel(&self) -> Arc<dyn CallChannel>;

    /// Publishes the host's inbound channel for JS to call into.
    fn install_outbound_channel(&self, channel: Arc<dyn CallChannel>);

    /// Loads one verified module's bytecode, after all of its dependencies.
    fn load_module(&self, id: &str, bytecode: &[u8]) -> Result<()>;

    /// Releases the engine. Idempotent.
    fn close(&self);
}
