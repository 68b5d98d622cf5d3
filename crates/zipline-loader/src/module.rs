//! # Module File Container
//!
//! Custom binary container for one code module: a little-endian `u32`
//! version followed by engine bytecode. The version must equal
//! [`CURRENT_ZIPLINE_VERSION`].

use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;

use crate::error::LoaderError;
use crate::error::Result;

/// Container version this loader produces and accepts.
pub const CURRENT_ZIPLINE_VERSION: u32 = 20001;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleFile {
    pub version: u32,
    pub bytecode: Bytes,
}

impl ModuleFile {
    pub fn new(bytecode: impl Into<Bytes>) -> Self {
        Self {
            version: CURRENT_ZIPLINE_VERSION,
            bytecode: bytecode.into(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(4 + self.bytecode.len());
        out.put_u32_le(self.version);
        out.extend_from_slice(&self.bytecode);
        out.freeze()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(LoaderError::ModuleCorrupt(format!(
                "container is {} bytes, need at least 4",
                bytes.len()
            )));
        }
        let version = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if version != CURRENT_ZIPLINE_VERSION {
            return Err(LoaderError::VersionMismatch {
                expected: CURRENT_ZIPLINE_VERSION,
                actual: version,
            });
        }
        Ok(Self {
            version,
            bytecode: Bytes::copy_from_slice(&bytes[4..]),
        })
    }
}
