//! End-to-end loader scenarios: module DAGs installed into a bridge, the
//! embedded fallback path, and pinning for the next cold start.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;

use zipline_core::testing::MockJsEngine;
use zipline_core::testing::TestListener;
use zipline_core::NullEventListener;
use zipline_core::SafeEventListener;
use zipline_core::Zipline;

use zipline_loader::manifest_file_name;
use zipline_loader::BlobStore;
use zipline_loader::CachingFetcher;
use zipline_loader::EmbeddedFetcher;
use zipline_loader::EngineReceiver;
use zipline_loader::Fetcher;
use zipline_loader::FsSaveReceiver;
use zipline_loader::HttpClient;
use zipline_loader::HttpError;
use zipline_loader::HttpFetcher;
use zipline_loader::ManifestModule;
use zipline_loader::MemoryBlobStore;
use zipline_loader::ModuleFile;
use zipline_loader::ModuleReceiver;
use zipline_loader::ZiplineLoader;
use zipline_loader::ZiplineManifest;

#[derive(Default)]
struct FakeHttpClient {
    responses: DashMap<String, Bytes>,
}

impl FakeHttpClient {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn put(&self, url: &str, bytes: Bytes) {
        self.responses.insert(url.to_string(), bytes);
    }
}

#[async_trait::async_trait]
impl HttpClient for FakeHttpClient {
    async fn get(&self, url: &str) -> Result<Bytes, HttpError> {
        self.responses
            .get(url)
            .map(|e| e.value().clone())
            .ok_or_else(|| HttpError("HTTP 500".into()))
    }
}

fn module_bytes(bytecode: &[u8]) -> (Bytes, String) {
    let raw = ModuleFile::new(Bytes::copy_from_slice(bytecode)).encode();
    let sha = zipline_loader::hash::sha256_hex(&raw);
    (raw, sha)
}

fn two_module_manifest(alpha_sha: &str, bravo_sha: &str) -> ZiplineManifest {
    let mut manifest = ZiplineManifest {
        modules: Default::default(),
    };
    manifest.modules.insert(
        "alpha".into(),
        ManifestModule {
            url: "https://example.com/alpha.zipline".into(),
            sha256: alpha_sha.into(),
            depends_on_ids: vec![],
        },
    );
    manifest.modules.insert(
        "bravo".into(),
        ManifestModule {
            url: "https://example.com/bravo.zipline".into(),
            sha256: bravo_sha.into(),
            depends_on_ids: vec!["alpha".into()],
        },
    );
    manifest
}

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "zipline-loader-it-{}-{}",
        std::process::id(),
        name
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn http_chain(
    client: &Arc<FakeHttpClient>,
    listener: Arc<dyn zipline_core::EventListener>,
) -> Vec<Arc<dyn Fetcher>> {
    let http = HttpFetcher::new(
        Arc::clone(client) as Arc<dyn HttpClient>,
        SafeEventListener::new(listener),
    );
    let caching = CachingFetcher::new(
        MemoryBlobStore::new() as Arc<dyn BlobStore>,
        Arc::new(http),
    );
    vec![Arc::new(caching) as Arc<dyn Fetcher>]
}

/// Module DAG: with one download permit, both modules fetch and the engine
/// observes `alpha` strictly before its dependent `bravo`.
#[tokio::test]
async fn module_dag_loads_in_order() {
    let (alpha_raw, alpha_sha) = module_bytes(b"alpha");
    let (bravo_raw, bravo_sha) = module_bytes(b"bravo");
    let manifest = two_module_manifest(&alpha_sha, &bravo_sha);

    let client = FakeHttpClient::new();
    client.put(
        "https://example.com/app.manifest.zipline.json",
        Bytes::from(manifest.encode().unwrap()),
    );
    client.put("https://example.com/alpha.zipline", alpha_raw);
    client.put("https://example.com/bravo.zipline", bravo_raw);

    let engine = MockJsEngine::new();
    let zipline = Zipline::create(engine.clone(), Arc::new(NullEventListener)).unwrap();

    let loader = ZiplineLoader::new(
        http_chain(&client, Arc::new(NullEventListener)),
        Arc::new(NullEventListener),
    )
    .with_concurrent_downloads(1);
    let receiver = Arc::new(EngineReceiver::new(Arc::clone(&zipline))) as Arc<dyn ModuleReceiver>;

    loader
        .load("app", "https://example.com/app.manifest.zipline.json", &receiver)
        .await
        .unwrap();

    assert_eq!(engine.log(), "alpha loaded\nbravo loaded\n");
    assert_eq!(
        engine.loaded_modules(),
        vec!["alpha".to_string(), "bravo".to_string()]
    );

    zipline.close();
}

/// Fallback: HTTP 500 for the manifest, embedded manifest and modules
/// present for the app name. The listener sees the failed network load
/// before the successful fallback load.
#[tokio::test]
async fn fallback_load_uses_the_embedded_application() {
    let (alpha_raw, alpha_sha) = module_bytes(b"alpha");
    let (bravo_raw, bravo_sha) = module_bytes(b"bravo");
    let manifest = two_module_manifest(&alpha_sha, &bravo_sha);

    let dir = temp_dir("fallback");
    std::fs::write(
        dir.join(manifest_file_name("app")),
        manifest.encode().unwrap(),
    )
    .unwrap();
    std::fs::write(dir.join(&alpha_sha), &alpha_raw).unwrap();
    std::fs::write(dir.join(&bravo_sha), &bravo_raw).unwrap();

    let client = FakeHttpClient::new(); // empty: every GET is a 500
    let listener = TestListener::new();

    let embedded = Arc::new(EmbeddedFetcher::new(&dir)) as Arc<dyn Fetcher>;
    let mut fetchers = vec![embedded];
    fetchers.extend(http_chain(&client, listener.clone()));

    let engine = MockJsEngine::new();
    let zipline = Zipline::create(engine.clone(), Arc::new(NullEventListener)).unwrap();
    let loader = ZiplineLoader::new(fetchers, listener.clone());
    let receiver = Arc::new(EngineReceiver::new(Arc::clone(&zipline))) as Arc<dyn ModuleReceiver>;

    let loaded = loader
        .load_or_fall_back("app", "https://example.com/app.manifest.zipline.json", &receiver)
        .await
        .unwrap();

    assert_eq!(loaded, manifest);
    assert_eq!(engine.log(), "alpha loaded\nbravo loaded\n");

    let events = listener.events();
    let failed_at = events
        .iter()
        .position(|e| e.starts_with("applicationLoadFailed app"))
        .expect("missing applicationLoadFailed");
    let ended_at = events
        .iter()
        .position(|e| e.starts_with("applicationLoadEnd app"))
        .expect("missing applicationLoadEnd");
    assert!(failed_at < ended_at);

    zipline.close();
}

/// Download events bracket each fetch on the happy path.
#[tokio::test]
async fn download_events_are_reported() {
    let (alpha_raw, alpha_sha) = module_bytes(b"alpha");
    let (bravo_raw, bravo_sha) = module_bytes(b"bravo");
    let manifest = two_module_manifest(&alpha_sha, &bravo_sha);

    let client = FakeHttpClient::new();
    client.put(
        "https://example.com/app.manifest.zipline.json",
        Bytes::from(manifest.encode().unwrap()),
    );
    client.put("https://example.com/alpha.zipline", alpha_raw);
    client.put("https://example.com/bravo.zipline", bravo_raw);

    let listener = TestListener::new();
    let engine = MockJsEngine::new();
    let zipline = Zipline::create(engine.clone(), Arc::new(NullEventListener)).unwrap();
    let loader = ZiplineLoader::new(http_chain(&client, listener.clone()), listener.clone());
    let receiver = Arc::new(EngineReceiver::new(Arc::clone(&zipline))) as Arc<dyn ModuleReceiver>;

    loader
        .load("app", "https://example.com/app.manifest.zipline.json", &receiver)
        .await
        .unwrap();

    // Manifest + two modules.
    assert_eq!(listener.count_of("downloadStart app"), 3);
    assert_eq!(listener.count_of("downloadEnd app"), 3);
    assert_eq!(listener.count_of("downloadFailed"), 0);

    zipline.close();
}

/// Pin for the next cold start: save a network load to disk, then reload it
/// offline through the embedded fetcher.
#[tokio::test]
async fn saved_application_reloads_offline() {
    let (alpha_raw, alpha_sha) = module_bytes(b"alpha");
    let (bravo_raw, bravo_sha) = module_bytes(b"bravo");
    let manifest = two_module_manifest(&alpha_sha, &bravo_sha);

    let client = FakeHttpClient::new();
    client.put(
        "https://example.com/app.manifest.zipline.json",
        Bytes::from(manifest.encode().unwrap()),
    );
    client.put("https://example.com/alpha.zipline", alpha_raw);
    client.put("https://example.com/bravo.zipline", bravo_raw);

    let dir = temp_dir("pin");
    let save = Arc::new(FsSaveReceiver::new(&dir));
    let loader = ZiplineLoader::new(
        http_chain(&client, Arc::new(NullEventListener)),
        Arc::new(NullEventListener),
    );

    let loaded = loader
        .load(
            "app",
            "https://example.com/app.manifest.zipline.json",
            &(Arc::clone(&save) as Arc<dyn ModuleReceiver>),
        )
        .await
        .unwrap();
    save.save_manifest("app", &loaded.encode().unwrap()).await.unwrap();

    // Cold start with no network at all.
    let engine = MockJsEngine::new();
    let zipline = Zipline::create(engine.clone(), Arc::new(NullEventListener)).unwrap();
    let offline_loader = ZiplineLoader::new(
        vec![Arc::new(EmbeddedFetcher::new(&dir)) as Arc<dyn Fetcher>],
        Arc::new(NullEventListener),
    );
    let receiver = Arc::new(EngineReceiver::new(Arc::clone(&zipline))) as Arc<dyn ModuleReceiver>;

    offline_loader
        .load_or_fall_back("app", "https://gone.example.com/app.manifest.zipline.json", &receiver)
        .await
        .unwrap();

    assert_eq!(engine.log(), "alpha loaded\nbravo loaded\n");
    zipline.close();
}

/// Dropping an in-flight load aborts its fetch tasks.
#[tokio::test]
async fn dropped_load_aborts_fetches() {
    let (alpha_raw, alpha_sha) = module_bytes(b"alpha");
    let mut manifest = ZiplineManifest {
        modules: Default::default(),
    };
    manifest.modules.insert(
        "alpha".into(),
        ManifestModule {
            url: "https://example.com/alpha.zipline".into(),
            sha256: alpha_sha.clone(),
            depends_on_ids: vec![],
        },
    );

    struct StallingClient {
        inner: Arc<FakeHttpClient>,
    }

    #[async_trait::async_trait]
    impl HttpClient for StallingClient {
        async fn get(&self, url: &str) -> Result<Bytes, HttpError> {
            if url.ends_with(".zipline") {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            self.inner.get(url).await
        }
    }

    let inner = FakeHttpClient::new();
    inner.put(
        "https://example.com/app.manifest.zipline.json",
        Bytes::from(manifest.encode().unwrap()),
    );
    inner.put("https://example.com/alpha.zipline", alpha_raw);

    let http = HttpFetcher::new(
        Arc::new(StallingClient {
            inner: Arc::clone(&inner),
        }) as Arc<dyn HttpClient>,
        SafeEventListener::new(Arc::new(NullEventListener)),
    );
    let loader = ZiplineLoader::new(
        vec![Arc::new(http) as Arc<dyn Fetcher>],
        Arc::new(NullEventListener),
    );

    struct NullReceiver;
    #[async_trait::async_trait]
    impl ModuleReceiver for NullReceiver {
        async fn receive(
            &self,
            _id: &str,
            _sha256_hex: &str,
            _file: &ModuleFile,
            _raw: &Bytes,
        ) -> zipline_loader::Result<()> {
            Ok(())
        }
    }

    let receiver = Arc::new(NullReceiver) as Arc<dyn ModuleReceiver>;
    let load = loader.load("app", "https://example.com/app.manifest.zipline.json", &receiver);
    let outcome = tokio::time::timeout(Duration::from_millis(100), load).await;
    assert!(outcome.is_err()); // still stalled; dropping the future aborts the fetch task
}
