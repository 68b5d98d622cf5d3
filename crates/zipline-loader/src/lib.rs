//! # Zipline Loader
//!
//! Fetches a manifest describing a DAG of code modules, downloads the modules
//! concurrently with bounded parallelism, verifies them, and installs them
//! into the JS engine respecting inter-module dependency ordering.
//!
//! ## Dataflow
//!
//! manifest URL → fetcher chain (embedded → cache → HTTP) → manifest decode →
//! per-module fetch tasks gated by a download semaphore → SHA-256 and
//! container verification → ordered `receive` into the engine or filesystem.

pub mod error;
pub mod fetcher;
pub mod hash;
pub mod loader;
pub mod manifest;
pub mod module;
pub mod receiver;

#[cfg(test)]
mod tests;

pub use error::HttpError;
pub use error::LoaderError;
pub use error::Result;
pub use fetcher::BlobStore;
pub use fetcher::CachingFetcher;
pub use fetcher::EmbeddedFetcher;
pub use fetcher::FetchKind;
pub use fetcher::FetchRequest;
pub use fetcher::Fetcher;
pub use fetcher::HttpClient;
pub use fetcher::HttpFetcher;
pub use fetcher::MemoryBlobStore;
pub use loader::ZiplineLoader;
pub use loader::DEFAULT_CONCURRENT_DOWNLOADS;
pub use manifest::manifest_file_name;
pub use manifest::ManifestModule;
pub use manifest::ZiplineManifest;
pub use module::ModuleFile;
pub use module::CURRENT_ZIPLINE_VERSION;
pub use receiver::EngineReceiver;
pub use receiver::FsSaveReceiver;
pub use receiver::ModuleReceiver;
