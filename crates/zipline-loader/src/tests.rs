//! Loader tests over in-memory fetchers and receivers.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;

use zipline_core::testing::TestListener;
use zipline_core::NullEventListener;
use zipline_core::SafeEventListener;

use crate::error::HttpError;
use crate::error::LoaderError;
use crate::error::Result;
use crate::fetcher::CachingFetcher;
use crate::fetcher::FetchKind;
use crate::fetcher::FetchRequest;
use crate::fetcher::Fetcher;
use crate::fetcher::HttpClient;
use crate::fetcher::HttpFetcher;
use crate::fetcher::MemoryBlobStore;
use crate::hash::sha256_hex;
use crate::loader::ZiplineLoader;
use crate::manifest::ManifestModule;
use crate::manifest::ZiplineManifest;
use crate::module::ModuleFile;
use crate::module::CURRENT_ZIPLINE_VERSION;
use crate::receiver::ModuleReceiver;

// --- Fixtures ---

fn module_bytes(bytecode: &[u8]) -> (Bytes, String) {
    let raw = ModuleFile::new(Bytes::copy_from_slice(bytecode)).encode();
    let sha = sha256_hex(&raw);
    (raw, sha)
}

fn manifest_of(entries: &[(&str, &str, &[&str])]) -> ZiplineManifest {
    let mut manifest = ZiplineManifest {
        modules: Default::default(),
    };
    for (id, sha256, depends_on) in entries {
        manifest.modules.insert(
            id.to_string(),
            ManifestModule {
                url: format!("https://example.com/{}.zipline", id),
                sha256: sha256.to_string(),
                depends_on_ids: depends_on.iter().map(|d| d.to_string()).collect(),
            },
        );
    }
    manifest
}

/// HTTP stub: a URL→bytes map plus a request counter.
#[derive(Default)]
struct FakeHttpClient {
    responses: DashMap<String, Bytes>,
    requests: AtomicUsize,
}

impl FakeHttpClient {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn put(&self, url: &str, bytes: Bytes) {
        self.responses.insert(url.to_string(), bytes);
    }

    fn clear(&self) {
        self.responses.clear();
    }

    fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl HttpClient for FakeHttpClient {
    async fn get(&self, url: &str) -> std::result::Result<Bytes, HttpError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.responses
            .get(url)
            .map(|e| e.value().clone())
            .ok_or_else(|| HttpError("HTTP 500".into()))
    }
}

/// Records receive order.
#[derive(Default)]
struct RecordingReceiver {
    received: Mutex<Vec<String>>,
}

impl RecordingReceiver {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ModuleReceiver for RecordingReceiver {
    async fn receive(
        &self,
        id: &str,
        _sha256_hex: &str,
        _file: &ModuleFile,
        _raw: &Bytes,
    ) -> Result<()> {
        self.received.lock().unwrap().push(id.to_string());
        Ok(())
    }
}

/// Wraps a fetcher and tracks the highest concurrent fetch count.
struct GaugeFetcher {
    inner: Arc<dyn Fetcher>,
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl GaugeFetcher {
    fn new(inner: Arc<dyn Fetcher>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Fetcher for GaugeFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<Option<Bytes>> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let result = self.inner.fetch(request).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

fn http_loader(client: &Arc<FakeHttpClient>) -> (ZiplineLoader, Arc<MemoryBlobStore>) {
    let store = MemoryBlobStore::new();
    let http = HttpFetcher::new(
        Arc::clone(client) as Arc<dyn HttpClient>,
        SafeEventListener::new(Arc::new(NullEventListener)),
    );
    let caching = CachingFetcher::new(
        Arc::clone(&store) as Arc<dyn crate::fetcher::BlobStore>,
        Arc::new(http),
    );
    let loader = ZiplineLoader::new(
        vec![Arc::new(caching) as Arc<dyn Fetcher>],
        Arc::new(NullEventListener),
    );
    (loader, store)
}

fn seed_application(client: &FakeHttpClient, manifest: &ZiplineManifest, modules: &[(&str, Bytes)]) {
    client.put(
        "https://example.com/app.manifest.zipline.json",
        Bytes::from(manifest.encode().unwrap()),
    );
    for (id, raw) in modules {
        client.put(&format!("https://example.com/{}.zipline", id), raw.clone());
    }
}

// --- Manifest ---

#[test]
fn manifest_rejects_unknown_dependency() {
    let (_, sha) = module_bytes(b"alpha");
    let manifest = manifest_of(&[("alpha", &sha, &["missing"])]);
    let err = ZiplineManifest::decode(&manifest.encode().unwrap()).unwrap_err();
    match err {
        LoaderError::ManifestInvalid(msg) => assert!(msg.contains("unknown module")),
        _ => panic!("expected ManifestInvalid, got {:?}", err),
    }
}

#[test]
fn manifest_rejects_cycles() {
    let (_, sha) = module_bytes(b"x");
    let manifest = manifest_of(&[("alpha", &sha, &["bravo"]), ("bravo", &sha, &["alpha"])]);
    let err = ZiplineManifest::decode(&manifest.encode().unwrap()).unwrap_err();
    match err {
        LoaderError::ManifestInvalid(msg) => assert!(msg.contains("cycle")),
        _ => panic!("expected ManifestInvalid, got {:?}", err),
    }
}

#[test]
fn manifest_rejects_malformed_sha() {
    let manifest = manifest_of(&[("alpha", "nothex", &[])]);
    let err = ZiplineManifest::decode(&manifest.encode().unwrap()).unwrap_err();
    match err {
        LoaderError::ManifestInvalid(msg) => assert!(msg.contains("sha256")),
        _ => panic!("expected ManifestInvalid, got {:?}", err),
    }
}

#[test]
fn topological_order_respects_dependencies() {
    let (_, sha) = module_bytes(b"x");
    let manifest = manifest_of(&[
        ("delta", &sha, &["bravo", "charlie"]),
        ("bravo", &sha, &["alpha"]),
        ("charlie", &sha, &["alpha"]),
        ("alpha", &sha, &[]),
    ]);
    assert_eq!(
        manifest.topological_order().unwrap(),
        vec!["alpha", "bravo", "charlie", "delta"]
    );
}

#[test]
fn urls_resolve_against_the_manifest_url() {
    let (_, sha) = module_bytes(b"x");
    let mut manifest = manifest_of(&[("alpha", &sha, &[])]);
    manifest.modules.get_mut("alpha").unwrap().url = "alpha.zipline".into();
    manifest
        .resolve_urls("https://cdn.example.com/apps/app.manifest.zipline.json")
        .unwrap();
    assert_eq!(
        manifest.modules["alpha"].url,
        "https://cdn.example.com/apps/alpha.zipline"
    );

    // Absolute URLs pass through.
    manifest.modules.get_mut("alpha").unwrap().url = "https://elsewhere.example.com/m.zipline".into();
    manifest
        .resolve_urls("https://cdn.example.com/apps/app.manifest.zipline.json")
        .unwrap();
    assert_eq!(
        manifest.modules["alpha"].url,
        "https://elsewhere.example.com/m.zipline"
    );
}

// --- Module container ---

#[test]
fn module_container_round_trip() {
    let file = ModuleFile::new(Bytes::from_static(b"bytecode"));
    let decoded = ModuleFile::decode(&file.encode()).unwrap();
    assert_eq!(file, decoded);
    assert_eq!(decoded.version, CURRENT_ZIPLINE_VERSION);
}

#[test]
fn module_container_rejects_unknown_version() {
    let mut raw = ModuleFile::new(Bytes::from_static(b"bytecode")).encode().to_vec();
    raw[0] = raw[0].wrapping_add(1);
    let err = ModuleFile::decode(&raw).unwrap_err();
    match err {
        LoaderError::VersionMismatch { expected, .. } => {
            assert_eq!(expected, CURRENT_ZIPLINE_VERSION);
        }
        _ => panic!("expected VersionMismatch, got {:?}", err),
    }
}

#[test]
fn module_container_rejects_truncation() {
    let err = ModuleFile::decode(&[1, 2]).unwrap_err();
    match err {
        LoaderError::ModuleCorrupt(_) => {}
        _ => panic!("expected ModuleCorrupt, got {:?}", err),
    }
}

// --- Load pipeline ---

#[tokio::test]
async fn load_receives_modules_in_dependency_order() {
    let (alpha_raw, alpha_sha) = module_bytes(b"alpha");
    let (bravo_raw, bravo_sha) = module_bytes(b"bravo");
    let manifest = manifest_of(&[
        ("bravo", &bravo_sha, &["alpha"]),
        ("alpha", &alpha_sha, &[]),
    ]);

    let client = FakeHttpClient::new();
    seed_application(&client, &manifest, &[("alpha", alpha_raw), ("bravo", bravo_raw)]);

    let (loader, _store) = http_loader(&client);
    let loader = loader.with_concurrent_downloads(1);
    let receiver = RecordingReceiver::new();

    let loaded = loader
        .load(
            "app",
            "https://example.com/app.manifest.zipline.json",
            &(Arc::clone(&receiver) as Arc<dyn ModuleReceiver>),
        )
        .await
        .unwrap();

    assert_eq!(loaded, manifest);
    assert_eq!(receiver.received(), vec!["alpha", "bravo"]);
}

#[tokio::test]
async fn sha_mismatch_fails_the_load() {
    let (alpha_raw, _) = module_bytes(b"alpha");
    let (_, wrong_sha) = module_bytes(b"other");
    let manifest = manifest_of(&[("alpha", &wrong_sha, &[])]);

    let client = FakeHttpClient::new();
    seed_application(&client, &manifest, &[("alpha", alpha_raw)]);

    let (loader, _store) = http_loader(&client);
    let receiver = RecordingReceiver::new();

    let err = loader
        .load(
            "app",
            "https://example.com/app.manifest.zipline.json",
            &(Arc::clone(&receiver) as Arc<dyn ModuleReceiver>),
        )
        .await
        .unwrap_err();

    match err {
        LoaderError::Sha256Mismatch { id, .. } => assert_eq!(id, "alpha"),
        _ => panic!("expected Sha256Mismatch, got {:?}", err),
    }
    assert!(receiver.received().is_empty());
}

#[tokio::test]
async fn manifest_parse_failure_is_reported() {
    let listener = TestListener::new();
    let client = FakeHttpClient::new();
    client.put(
        "https://example.com/app.manifest.zipline.json",
        Bytes::from_static(b"not json"),
    );

    let http = HttpFetcher::new(
        Arc::clone(&client) as Arc<dyn HttpClient>,
        SafeEventListener::new(listener.clone()),
    );
    let loader = ZiplineLoader::new(vec![Arc::new(http) as Arc<dyn Fetcher>], listener.clone());
    let receiver = RecordingReceiver::new();

    let err = loader
        .load(
            "app",
            "https://example.com/app.manifest.zipline.json",
            &(Arc::clone(&receiver) as Arc<dyn ModuleReceiver>),
        )
        .await
        .unwrap_err();

    match err {
        LoaderError::ManifestParse(_) => {}
        _ => panic!("expected ManifestParse, got {:?}", err),
    }
    assert_eq!(listener.count_of("manifestParseFailed app"), 1);
    assert_eq!(listener.count_of("applicationLoadFailed app"), 1);
}

#[tokio::test]
async fn download_semaphore_bounds_concurrency() {
    let mut entries = Vec::new();
    let mut modules = Vec::new();
    let mut shas = Vec::new();
    for i in 0..6 {
        let (raw, sha) = module_bytes(format!("module-{}", i).as_bytes());
        shas.push(sha);
        modules.push((format!("m{}", i), raw));
    }
    for (i, (id, _)) in modules.iter().enumerate() {
        entries.push((id.as_str(), shas[i].as_str(), &[][..]));
    }
    let manifest = manifest_of(&entries);

    let client = FakeHttpClient::new();
    client.put(
        "https://example.com/app.manifest.zipline.json",
        Bytes::from(manifest.encode().unwrap()),
    );
    for (id, raw) in &modules {
        client.put(&format!("https://example.com/{}.zipline", id), raw.clone());
    }

    let http = HttpFetcher::new(
        Arc::clone(&client) as Arc<dyn HttpClient>,
        SafeEventListener::new(Arc::new(NullEventListener)),
    );
    let gauge = GaugeFetcher::new(Arc::new(http));
    let loader = ZiplineLoader::new(
        vec![Arc::clone(&gauge) as Arc<dyn Fetcher>],
        Arc::new(NullEventListener),
    )
    .with_concurrent_downloads(2);
    let receiver = RecordingReceiver::new();

    loader
        .load(
            "app",
            "https://example.com/app.manifest.zipline.json",
            &(Arc::clone(&receiver) as Arc<dyn ModuleReceiver>),
        )
        .await
        .unwrap();

    // The manifest fetch runs alone; module fetches never exceed the permit
    // count.
    assert!(gauge.peak() <= 2, "peak concurrency was {}", gauge.peak());
    assert_eq!(receiver.received().len(), 6);
}

#[tokio::test]
async fn cached_reload_makes_no_http_calls() {
    let (alpha_raw, alpha_sha) = module_bytes(b"alpha");
    let (bravo_raw, bravo_sha) = module_bytes(b"bravo");
    let manifest = manifest_of(&[
        ("bravo", &bravo_sha, &["alpha"]),
        ("alpha", &alpha_sha, &[]),
    ]);

    let client = FakeHttpClient::new();
    seed_application(&client, &manifest, &[("alpha", alpha_raw), ("bravo", bravo_raw)]);

    let (loader, store) = http_loader(&client);
    let receiver = RecordingReceiver::new();
    let receiver_dyn = Arc::clone(&receiver) as Arc<dyn ModuleReceiver>;

    loader
        .load("app", "https://example.com/app.manifest.zipline.json", &receiver_dyn)
        .await
        .unwrap();
    assert_eq!(store.entry_count(), 3); // manifest + two modules

    client.clear();
    let before = client.request_count();

    loader
        .load("app", "https://example.com/app.manifest.zipline.json", &receiver_dyn)
        .await
        .unwrap();

    assert_eq!(client.request_count(), before);
    assert_eq!(receiver.received(), vec!["alpha", "bravo", "alpha", "bravo"]);
}

#[tokio::test]
async fn identical_content_modules_share_one_cache_entry() {
    let (raw, sha) = module_bytes(b"shared");
    let mut manifest = manifest_of(&[("alpha", &sha, &[]), ("bravo", &sha, &[])]);
    // Same bytes served from two distinct URLs.
    manifest.modules.get_mut("bravo").unwrap().url = "https://example.com/copy.zipline".into();

    let client = FakeHttpClient::new();
    client.put(
        "https://example.com/app.manifest.zipline.json",
        Bytes::from(manifest.encode().unwrap()),
    );
    client.put("https://example.com/alpha.zipline", raw.clone());
    client.put("https://example.com/copy.zipline", raw.clone());

    let (loader, store) = http_loader(&client);
    let loader = loader.with_concurrent_downloads(1);
    let receiver = RecordingReceiver::new();

    loader
        .load(
            "app",
            "https://example.com/app.manifest.zipline.json",
            &(Arc::clone(&receiver) as Arc<dyn ModuleReceiver>),
        )
        .await
        .unwrap();

    // Both modules load; the content hash collapses them to one cache
    // entry (plus the manifest), and the second fetch never hits HTTP.
    assert_eq!(receiver.received().len(), 2);
    assert_eq!(store.entry_count(), 2);
    assert_eq!(client.request_count(), 2); // manifest + one module
}

#[tokio::test]
async fn module_unavailable_when_no_fetcher_yields() {
    let (_, sha) = module_bytes(b"alpha");
    let manifest = manifest_of(&[("alpha", &sha, &[])]);

    struct EmptyFetcher;
    #[async_trait::async_trait]
    impl Fetcher for EmptyFetcher {
        async fn fetch(&self, request: &FetchRequest) -> Result<Option<Bytes>> {
            if request.kind == FetchKind::Manifest {
                panic!("manifest should come from the seeded fetcher");
            }
            Ok(None)
        }
    }

    struct ManifestOnlyFetcher(Bytes);
    #[async_trait::async_trait]
    impl Fetcher for ManifestOnlyFetcher {
        async fn fetch(&self, request: &FetchRequest) -> Result<Option<Bytes>> {
            match request.kind {
                FetchKind::Manifest => Ok(Some(self.0.clone())),
                FetchKind::Module => Ok(None),
            }
        }
    }

    let loader = ZiplineLoader::new(
        vec![
            Arc::new(ManifestOnlyFetcher(Bytes::from(manifest.encode().unwrap())))
                as Arc<dyn Fetcher>,
            Arc::new(EmptyFetcher),
        ],
        Arc::new(NullEventListener),
    );
    let receiver = RecordingReceiver::new();

    let err = loader
        .load(
            "app",
            "https://example.com/app.manifest.zipline.json",
            &(Arc::clone(&receiver) as Arc<dyn ModuleReceiver>),
        )
        .await
        .unwrap_err();

    match err {
        LoaderError::ModuleUnavailable(id) => assert_eq!(id, "alpha"),
        _ => panic!("expected ModuleUnavailable, got {:?}", err),
    }
}

#[tokio::test]
async fn continuous_load_emits_only_on_change() {
    let (alpha_raw, alpha_sha) = module_bytes(b"alpha");
    let manifest_v1 = manifest_of(&[("alpha", &alpha_sha, &[])]);

    let client = FakeHttpClient::new();
    seed_application(&client, &manifest_v1, &[("alpha", alpha_raw.clone())]);

    let (loader, _store) = http_loader(&client);
    let loader = Arc::new(loader);
    let receiver = RecordingReceiver::new();

    let (url_tx, url_rx) = tokio::sync::watch::channel(
        "https://example.com/app.manifest.zipline.json".to_string(),
    );
    let mut loads = loader.load_continuously(
        "app".to_string(),
        url_rx,
        Duration::from_millis(50),
        Arc::clone(&receiver) as Arc<dyn ModuleReceiver>,
    );

    // First poll delivers the initial manifest.
    let first = loads.recv().await.unwrap();
    assert_eq!(first, manifest_v1);

    // An unchanged manifest is not re-emitted; a changed one is. The second
    // version must bypass the URL-keyed cache, so it gets its own URL.
    let (beta_raw, beta_sha) = module_bytes(b"beta");
    let mut manifest_v2 = manifest_of(&[("alpha", &beta_sha, &[])]);
    manifest_v2.modules.get_mut("alpha").unwrap().url = "https://example.com/beta.zipline".into();
    client.put(
        "https://example.com/app-v2.manifest.zipline.json",
        Bytes::from(manifest_v2.encode().unwrap()),
    );
    client.put("https://example.com/beta.zipline", beta_raw);
    url_tx
        .send("https://example.com/app-v2.manifest.zipline.json".to_string())
        .unwrap();

    let second = loads.recv().await.unwrap();
    assert_eq!(second, manifest_v2);

    drop(url_tx);
    assert!(loads.recv().await.is_none());
}
