//! # Module Receivers
//!
//! Where verified modules go: installed into the JS engine, or saved to the
//! filesystem to pin an application for the next cold start.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;

use zipline_core::Zipline;

use crate::error::LoaderError;
use crate::error::Result;
use crate::module::ModuleFile;

/// Receives each module strictly after all of its dependencies.
#[async_trait::async_trait]
pub trait ModuleReceiver: Send + Sync + 'static {
    async fn receive(
        &self,
        id: &str,
        sha256_hex: &str,
        file: &ModuleFile,
        raw: &Bytes,
    ) -> Result<()>;
}

/// Installs module bytecode into a running bridge's engine.
pub struct EngineReceiver {
    zipline: Arc<Zipline>,
}

impl EngineReceiver {
    pub fn new(zipline: Arc<Zipline>) -> Self {
        Self { zipline }
    }
}

#[async_trait::async_trait]
impl ModuleReceiver for EngineReceiver {
    async fn receive(
        &self,
        id: &str,
        _sha256_hex: &str,
        file: &ModuleFile,
        _raw: &Bytes,
    ) -> Result<()> {
        self.zipline
            .load_module(id, &file.bytecode)
            .map_err(LoaderError::Bridge)
    }
}

/// Saves raw module files content-addressed by hash, for embedding into the
/// next release or pinning for the next cold start.
pub struct FsSaveReceiver {
    dir: PathBuf,
}

impl FsSaveReceiver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Pins a manifest under the embedded filename convention.
    pub async fn save_manifest(&self, application_name: &str, bytes: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self
            .dir
            .join(crate::manifest::manifest_file_name(application_name));
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ModuleReceiver for FsSaveReceiver {
    async fn receive(
        &self,
        _id: &str,
        sha256_hex: &str,
        _file: &ModuleFile,
        raw: &Bytes,
    ) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.dir.join(sha256_hex), raw).await?;
        Ok(())
    }
}
