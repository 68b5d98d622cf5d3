//! # Fetcher Chain
//!
//! Fetchers are consulted in a fixed order for each module; the first that
//! returns bytes wins. The standard chain is embedded → caching(HTTP): the
//! embedded fetcher reads a read-only directory shipped with the app, the
//! caching fetcher fronts a content-addressed blob store, and the HTTP
//! fetcher goes to the network.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;

use zipline_core::SafeEventListener;

use crate::error::HttpError;
use crate::error::LoaderError;
use crate::error::Result;
use crate::manifest::manifest_file_name;

/// What a request is for. Modules are content-addressed; manifests are keyed
/// by URL, never by content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchKind {
    Module,
    Manifest,
}

/// One fetch: an application's module, addressed by content hash and URL.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub application_name: String,
    pub id: String,
    /// Lowercase hex SHA-256 of the wanted bytes. Manifest fetches carry a
    /// random sentinel so content-addressed layers cannot false-positive.
    pub sha256_hex: String,
    pub url: Option<String>,
    pub kind: FetchKind,
}

#[async_trait::async_trait]
pub trait Fetcher: Send + Sync + 'static {
    /// Returns the bytes if this fetcher has them, `None` to defer to the
    /// next fetcher, or an error to fail the load.
    async fn fetch(&self, request: &FetchRequest) -> Result<Option<Bytes>>;

    /// An embedded manifest for fallback loads, keyed by application name.
    async fn fetch_embedded_manifest(&self, application_name: &str) -> Result<Option<Bytes>> {
        let _ = application_name;
        Ok(None)
    }

    /// Whether this fetcher works with no network. Fallback loads consult
    /// only offline fetchers.
    fn offline(&self) -> bool {
        false
    }
}

/// Consults `fetchers` in order; the first non-empty result wins.
pub(crate) async fn fetch_chain(
    fetchers: &[Arc<dyn Fetcher>],
    request: &FetchRequest,
) -> Result<Bytes> {
    for fetcher in fetchers {
        if let Some(bytes) = fetcher.fetch(request).await? {
            return Ok(bytes);
        }
    }
    Err(LoaderError::ModuleUnavailable(request.id.clone()))
}

/// Reads modules from a read-only directory, keyed by content hash, and
/// embedded manifests keyed by application name.
pub struct EmbeddedFetcher {
    dir: PathBuf,
}

impl EmbeddedFetcher {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    async fn read(&self, file_name: &str) -> Result<Option<Bytes>> {
        match tokio::fs::read(self.dir.join(file_name)).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(LoaderError::Io(e)),
        }
    }
}

#[async_trait::async_trait]
impl Fetcher for EmbeddedFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<Option<Bytes>> {
        match request.kind {
            FetchKind::Module => self.read(&request.sha256_hex).await,
            // Embedded manifests serve fallback loads only; a shipped copy
            // must not shadow a fresh one from the network.
            FetchKind::Manifest => Ok(None),
        }
    }

    async fn fetch_embedded_manifest(&self, application_name: &str) -> Result<Option<Bytes>> {
        self.read(&manifest_file_name(application_name)).await
    }

    fn offline(&self) -> bool {
        true
    }
}

/// A local content-addressed blob store.
///
/// Writers are single-writer per key; readers may race with writers and must
/// observe either absent or complete bytes.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync + 'static {
    async fn read(&self, key: &str) -> Option<Bytes>;
    async fn write(&self, key: &str, bytes: Bytes);
}

/// An in-process blob store. The on-disk store is an external collaborator.
#[derive(Default)]
pub struct MemoryBlobStore {
    entries: DashMap<String, Bytes>,
}

impl MemoryBlobStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

#[async_trait::async_trait]
impl BlobStore for MemoryBlobStore {
    async fn read(&self, key: &str) -> Option<Bytes> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    async fn write(&self, key: &str, bytes: Bytes) {
        self.entries.insert(key.to_string(), bytes);
    }
}

/// Fronts a delegate with a content-addressed cache: a hit short-circuits,
/// a miss delegates and stores the result under its hash.
pub struct CachingFetcher {
    store: Arc<dyn BlobStore>,
    delegate: Arc<dyn Fetcher>,
}

impl CachingFetcher {
    pub fn new(store: Arc<dyn BlobStore>, delegate: Arc<dyn Fetcher>) -> Self {
        Self { store, delegate }
    }

    /// Modules are stored under their content hash; manifests under a key
    /// derived from the URL.
    fn store_key(request: &FetchRequest) -> Option<String> {
        match request.kind {
            FetchKind::Module => Some(request.sha256_hex.clone()),
            FetchKind::Manifest => request
                .url
                .as_ref()
                .map(|url| format!("manifest/{}", crate::hash::sha256_hex(url.as_bytes()))),
        }
    }
}

#[async_trait::async_trait]
impl Fetcher for CachingFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<Option<Bytes>> {
        let Some(key) = Self::store_key(request) else {
            return self.delegate.fetch(request).await;
        };
        if let Some(hit) = self.store.read(&key).await {
            return Ok(Some(hit));
        }
        let Some(bytes) = self.delegate.fetch(request).await? else {
            return Ok(None);
        };
        self.store.write(&key, bytes.clone()).await;
        Ok(Some(bytes))
    }
}

/// The HTTP byte fetcher the loader consumes; the actual HTTP stack is an
/// external collaborator.
#[async_trait::async_trait]
pub trait HttpClient: Send + Sync + 'static {
    async fn get(&self, url: &str) -> std::result::Result<Bytes, HttpError>;
}

/// Fetches module bytes over HTTP, reporting download events.
pub struct HttpFetcher {
    client: Arc<dyn HttpClient>,
    listener: SafeEventListener,
}

impl HttpFetcher {
    pub fn new(client: Arc<dyn HttpClient>, listener: SafeEventListener) -> Self {
        Self { client, listener }
    }
}

#[async_trait::async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<Option<Bytes>> {
        let Some(url) = &request.url else {
            return Ok(None);
        };
        self.listener.download_start(&request.application_name, url);
        match self.client.get(url).await {
            Ok(bytes) => {
                self.listener.download_end(&request.application_name, url);
                Ok(Some(bytes))
            }
            Err(error) => {
                let error = LoaderError::Http {
                    url: url.clone(),
                    error,
                };
                self.listener
                    .download_failed(&request.application_name, url, &error);
                Err(error)
            }
        }
    }
}
