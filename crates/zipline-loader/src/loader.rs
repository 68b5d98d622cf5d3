//! # ZiplineLoader
//!
//! Drives the load pipeline: manifest fetch and validation, concurrent
//! module fetches gated by the download semaphore, verification, and ordered
//! delivery to a receiver.
//!
//! ## Ordering
//!
//! Module bytes may be fetched in any order; only `receive` is ordered. A
//! module's `receive` is called strictly after its upstream modules'
//! `receive` has returned.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::sync::Semaphore;
use tokio::task::AbortHandle;
use tokio::task::JoinHandle;

use zipline_core::EventListener;
use zipline_core::SafeEventListener;

use crate::error::LoaderError;
use crate::error::Result;
use crate::fetcher::fetch_chain;
use crate::fetcher::FetchKind;
use crate::fetcher::FetchRequest;
use crate::fetcher::Fetcher;
use crate::hash::sha256_hex;
use crate::hash::to_hex;
use crate::manifest::ZiplineManifest;
use crate::module::ModuleFile;
use crate::receiver::ModuleReceiver;

/// Default permit count for the download semaphore.
pub const DEFAULT_CONCURRENT_DOWNLOADS: usize = 3;

/// Aborts still-running fetch tasks when a load is dropped mid-flight.
struct AbortGuard(Vec<AbortHandle>);

impl Drop for AbortGuard {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

pub struct ZiplineLoader {
    fetchers: Vec<Arc<dyn Fetcher>>,
    listener: SafeEventListener,
    semaphore: Arc<Semaphore>,
}

impl ZiplineLoader {
    pub fn new(fetchers: Vec<Arc<dyn Fetcher>>, listener: Arc<dyn EventListener>) -> Self {
        Self {
            fetchers,
            listener: SafeEventListener::new(listener),
            semaphore: Arc::new(Semaphore::new(DEFAULT_CONCURRENT_DOWNLOADS)),
        }
    }

    /// Replaces the download semaphore with one of `permits` permits.
    pub fn with_concurrent_downloads(mut self, permits: usize) -> Self {
        self.semaphore = Arc::new(Semaphore::new(permits));
        self
    }

    pub fn listener(&self) -> &SafeEventListener {
        &self.listener
    }

    /// Loads an application: manifest, then modules in dependency order.
    pub async fn load(
        &self,
        application_name: &str,
        manifest_url: &str,
        receiver: &Arc<dyn ModuleReceiver>,
    ) -> Result<ZiplineManifest> {
        self.listener
            .application_load_start(application_name, Some(manifest_url));
        match self.load_once(application_name, manifest_url, receiver).await {
            Ok(manifest) => {
                self.listener
                    .application_load_end(application_name, Some(manifest_url));
                Ok(manifest)
            }
            Err(e) => {
                self.listener
                    .application_load_failed(application_name, Some(manifest_url), &e);
                Err(e)
            }
        }
    }

    /// Attempts a normal load; on any error, attempts a fallback load from
    /// the embedded manifest with no network. If both fail, the fallback's
    /// error propagates.
    pub async fn load_or_fall_back(
        &self,
        application_name: &str,
        manifest_url: &str,
        receiver: &Arc<dyn ModuleReceiver>,
    ) -> Result<ZiplineManifest> {
        match self.load(application_name, manifest_url, receiver).await {
            Ok(manifest) => Ok(manifest),
            Err(first) => {
                tracing::debug!(application = application_name, error = %first, "falling back to embedded manifest");
                self.load_fallback(application_name, receiver).await
            }
        }
    }

    /// Re-fetches on each poll tick or URL emission, delivering a manifest
    /// only when it differs structurally from the previous one. The returned
    /// channel closes when the URL source is dropped.
    pub fn load_continuously(
        self: &Arc<Self>,
        application_name: String,
        mut manifest_urls: watch::Receiver<String>,
        poll_interval: Duration,
        receiver: Arc<dyn ModuleReceiver>,
    ) -> mpsc::Receiver<ZiplineManifest> {
        let (tx, rx) = mpsc::channel(16);
        let loader = Arc::clone(self);

        tokio::spawn(async move {
            let mut previous: Option<ZiplineManifest> = None;
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    changed = manifest_urls.changed() => {
                        if changed.is_err() {
                            break; // URL source dropped
                        }
                    }
                    _ = ticker.tick() => {}
                    _ = tx.closed() => break,
                }

                let url = manifest_urls.borrow_and_update().clone();
                let manifest = match loader.fetch_manifest(&application_name, &url).await {
                    Ok(manifest) => manifest,
                    Err(e) => {
                        tracing::warn!(application = %application_name, error = %e, "continuous manifest fetch failed");
                        continue;
                    }
                };
                if previous.as_ref() == Some(&manifest) {
                    continue;
                }
                match loader
                    .receive_modules(&application_name, &manifest, &receiver, &loader.fetchers)
                    .await
                {
                    Ok(()) => {
                        previous = Some(manifest.clone());
                        if tx.send(manifest).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(application = %application_name, error = %e, "continuous module load failed");
                    }
                }
            }
        });

        rx
    }

    async fn load_once(
        &self,
        application_name: &str,
        manifest_url: &str,
        receiver: &Arc<dyn ModuleReceiver>,
    ) -> Result<ZiplineManifest> {
        let manifest = self.fetch_manifest(application_name, manifest_url).await?;
        self.receive_modules(application_name, &manifest, receiver, &self.fetchers)
            .await?;
        Ok(manifest)
    }

    async fn fetch_manifest(
        &self,
        application_name: &str,
        manifest_url: &str,
    ) -> Result<ZiplineManifest> {
        // Manifests are keyed by URL, not content: a random sentinel hash
        // keeps the content-addressed layers from false-positives.
        let sentinel: [u8; 32] = rand::random();
        let request = FetchRequest {
            application_name: application_name.to_string(),
            id: "manifest".to_string(),
            sha256_hex: to_hex(&sentinel),
            url: Some(manifest_url.to_string()),
            kind: FetchKind::Manifest,
        };
        let bytes = fetch_chain(&self.fetchers, &request).await?;
        self.decode_manifest(application_name, Some(manifest_url), &bytes)
    }

    fn decode_manifest(
        &self,
        application_name: &str,
        manifest_url: Option<&str>,
        bytes: &[u8],
    ) -> Result<ZiplineManifest> {
        let mut manifest = match ZiplineManifest::decode(bytes) {
            Ok(manifest) => manifest,
            Err(e) => {
                self.listener
                    .manifest_parse_failed(application_name, manifest_url, &e);
                return Err(e);
            }
        };
        if let Some(url) = manifest_url {
            manifest.resolve_urls(url)?;
        }
        Ok(manifest)
    }

    async fn load_fallback(
        &self,
        application_name: &str,
        receiver: &Arc<dyn ModuleReceiver>,
    ) -> Result<ZiplineManifest> {
        self.listener.application_load_start(application_name, None);
        match self.load_fallback_once(application_name, receiver).await {
            Ok(manifest) => {
                self.listener.application_load_end(application_name, None);
                Ok(manifest)
            }
            Err(e) => {
                self.listener
                    .application_load_failed(application_name, None, &e);
                Err(e)
            }
        }
    }

    async fn load_fallback_once(
        &self,
        application_name: &str,
        receiver: &Arc<dyn ModuleReceiver>,
    ) -> Result<ZiplineManifest> {
        let offline: Vec<Arc<dyn Fetcher>> = self
            .fetchers
            .iter()
            .filter(|f| f.offline())
            .map(Arc::clone)
            .collect();

        let mut manifest_bytes = None;
        for fetcher in &offline {
            if let Some(bytes) = fetcher.fetch_embedded_manifest(application_name).await? {
                manifest_bytes = Some(bytes);
                break;
            }
        }
        let Some(bytes) = manifest_bytes else {
            return Err(LoaderError::ModuleUnavailable(
                crate::manifest::manifest_file_name(application_name),
            ));
        };

        // Embedded modules are keyed by hash; the manifest URL is not
        // consulted, so relative URLs stay as-is.
        let manifest = self.decode_manifest(application_name, None, &bytes)?;
        self.receive_modules(application_name, &manifest, receiver, &offline)
            .await?;
        Ok(manifest)
    }

    /// Spawns a fetch task per module, all gated by the download semaphore,
    /// then delivers results in topological order.
    async fn receive_modules(
        &self,
        application_name: &str,
        manifest: &ZiplineManifest,
        receiver: &Arc<dyn ModuleReceiver>,
        fetchers: &[Arc<dyn Fetcher>],
    ) -> Result<()> {
        let order = manifest.topological_order()?;

        let mut tasks: HashMap<String, JoinHandle<Result<(ModuleFile, Bytes)>>> = HashMap::new();
        let mut aborts = Vec::with_capacity(manifest.modules.len());
        for (id, module) in &manifest.modules {
            let semaphore = Arc::clone(&self.semaphore);
            let fetchers = fetchers.to_vec();
            let request = FetchRequest {
                application_name: application_name.to_string(),
                id: id.clone(),
                sha256_hex: module.sha256.clone(),
                url: Some(module.url.clone()),
                kind: FetchKind::Module,
            };
            let handle = tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| LoaderError::Cancelled)?;
                let raw = fetch_chain(&fetchers, &request).await?;
                let actual = sha256_hex(&raw);
                if actual != request.sha256_hex {
                    return Err(LoaderError::Sha256Mismatch {
                        id: request.id,
                        expected: request.sha256_hex,
                        actual,
                    });
                }
                let file = ModuleFile::decode(&raw)?;
                Ok((file, raw))
            });
            aborts.push(handle.abort_handle());
            tasks.insert(id.clone(), handle);
        }
        let _guard = AbortGuard(aborts);

        for id in &order {
            let Some(task) = tasks.remove(id) else { continue };
            let (file, raw) = task.await.map_err(|_| LoaderError::Cancelled)??;
            let sha = &manifest.modules[id].sha256;
            receiver.receive(id, sha, &file, &raw).await?;
        }
        Ok(())
    }
}
