//! # Zipline Wire Codec
//!
//! Encodes and decodes the byte envelopes exchanged between the host and the
//! embedded JavaScript engine: calls, results, argument lists, and serialized
//! throwables.
//!
//! ## Invariants
//! - **Panic Safety**: All decoding paths return `Result`, never panicking on
//!   unknown data.
//! - **Forward Compatibility**: Unknown envelope fields are safely skipped.
//! - **Round Trip**: `decode(encode(x)) == x` for every envelope and throwable.

mod error;
mod envelope;
mod throwable;


pub use error::Error;
pub use error::Result;
pub use envelope::Call;
pub use envelope::CallResult;
pub use envelope::as_cancel_callback;
pub use envelope::cancel_callback_value;
pub use envelope::decode_call;
pub use envelope::decode_result;
pub use envelope::encode_call;
pub use envelope::encode_result;
pub use throwable::SerializedThrowable;
pub use throwable::CANCELLATION_CLASS;
