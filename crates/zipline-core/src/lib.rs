//! # Zipline Core
//!
//! The cross-runtime service bridge. Either side exposes strongly-typed
//! service objects; calls route across the host↔JS boundary with
//! pass-by-value arguments and pass-by-reference service handles.
//!
//! ## Architecture
//!
//! - **CallChannel**: the raw two-sided byte transport (§`channel`).
//! - **Endpoint**: per-side router owning the service and continuation
//!   registries (§`endpoint`).
//! - **ServiceAdapter**: per-interface descriptor enabling encoding and
//!   dispatch; written by hand per service interface (§`adapter`).
//! - **ZiplineScope**: lifetime group of outbound proxies (§`scope`).
//! - **Zipline**: the facade owning one endpoint and one JS engine, with the
//!   host bootstrap services installed (§`zipline`, §`platform`).

pub mod adapter;
pub mod channel;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod events;
pub mod outbound;
pub mod platform;
pub mod scope;
pub mod testing;
pub mod zipline;


pub use adapter::BoxFuture;
pub use adapter::Function;
pub use adapter::ServiceAdapter;
pub use adapter::ZiplineService;
pub use adapter::CLOSE_SIGNATURE;
pub use channel::CallChannel;
pub use channel::INBOUND_CHANNEL_NAME;
pub use channel::OUTBOUND_CHANNEL_NAME;
pub use endpoint::CallContext;
pub use endpoint::Endpoint;
pub use engine::JsEngine;
pub use error::BridgeError;
pub use error::MultiError;
pub use error::Result;
pub use events::CallEvent;
pub use events::EventListener;
pub use events::NullEventListener;
pub use events::SafeEventListener;
pub use outbound::OutboundCallHandler;
pub use scope::ZiplineScope;
pub use zipline::Zipline;

pub use zipline_wire::SerializedThrowable;
