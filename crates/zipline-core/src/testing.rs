//! In-process test doubles: paired endpoints and a mock JS engine.
//!
//! These are used by the test suites of this crate and the loader crate;
//! they are not part of the supported API.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use serde_json::Value;

use crate::channel::CallChannel;
use crate::endpoint::Endpoint;
use crate::engine::JsEngine;
use crate::error::Result;
use crate::events::CallEvent;
use crate::events::EventListener;
use crate::events::NullEventListener;
use crate::platform::JsPlatform;
use crate::platform::JsPlatformAdapter;
use crate::platform::JS_PLATFORM_NAME;
use crate::ZiplineService;

/// Two endpoints wired directly to each other, each side's inbound channel
/// serving as the peer's outbound channel.
pub fn endpoint_pair(
    listener_a: Arc<dyn EventListener>,
    listener_b: Arc<dyn EventListener>,
) -> (Arc<Endpoint>, Arc<Endpoint>) {
    let a = Endpoint::new("a", listener_a);
    let b = Endpoint::new("b", listener_b);
    a.connect(b.inbound_channel());
    b.connect(a.inbound_channel());
    (a, b)
}

/// An event listener that records everything it observes.
#[derive(Default)]
pub struct TestListener {
    next_token: AtomicU64,
    events: Mutex<Vec<String>>,
}

impl TestListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn count_of(&self, prefix: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event);
    }
}

impl EventListener for TestListener {
    fn bind_service(&self, name: &str) {
        self.record(format!("bindService {}", name));
    }

    fn take_service(&self, name: &str) {
        self.record(format!("takeService {}", name));
    }

    fn call_start(&self, call: &CallEvent) -> u64 {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed) + 1;
        self.record(format!("callStart {} {}", call.service_name, call.function));
        token
    }

    fn call_end(&self, call: &CallEvent, result: &Result<Value>, token: u64) {
        let outcome = match result {
            Ok(_) => "success",
            Err(_) => "failure",
        };
        self.record(format!(
            "callEnd {} {} {} token={}",
            call.service_name, call.function, outcome, token
        ));
    }

    fn service_leaked(&self, name: &str) {
        self.record(format!("serviceLeaked {}", name));
    }

    fn download_start(&self, application_name: &str, url: &str) {
        self.record(format!("downloadStart {} {}", application_name, url));
    }

    fn download_end(&self, application_name: &str, url: &str) {
        self.record(format!("downloadEnd {} {}", application_name, url));
    }

    fn download_failed(
        &self,
        application_name: &str,
        url: &str,
        _error: &(dyn std::error::Error + 'static),
    ) {
        self.record(format!("downloadFailed {} {}", application_name, url));
    }

    fn manifest_parse_failed(
        &self,
        application_name: &str,
        _url: Option<&str>,
        _error: &(dyn std::error::Error + 'static),
    ) {
        self.record(format!("manifestParseFailed {}", application_name));
    }

    fn application_load_start(&self, application_name: &str, _url: Option<&str>) {
        self.record(format!("applicationLoadStart {}", application_name));
    }

    fn application_load_end(&self, application_name: &str, _url: Option<&str>) {
        self.record(format!("applicationLoadEnd {}", application_name));
    }

    fn application_load_failed(
        &self,
        application_name: &str,
        _url: Option<&str>,
        _error: &(dyn std::error::Error + 'static),
    ) {
        self.record(format!("applicationLoadFailed {}", application_name));
    }
}

/// The mock engine's JS platform: records jobs instead of running bytecode.
#[derive(Default)]
pub struct MockJsPlatform {
    jobs: Mutex<Vec<u32>>,
}

impl MockJsPlatform {
    pub fn ran_jobs(&self) -> Vec<u32> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl JsPlatform for MockJsPlatform {
    fn run_job(&self, timeout_id: u32) {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(timeout_id);
    }
}

impl ZiplineService for MockJsPlatform {}

/// A JS engine played by a second in-process endpoint. Loaded modules are
/// recorded in a log the way a real engine's `globalThis` script would.
pub struct MockJsEngine {
    endpoint: Arc<Endpoint>,
    platform: Arc<MockJsPlatform>,
    loaded: Mutex<Vec<String>>,
    log: Mutex<String>,
}

impl MockJsEngine {
    pub fn new() -> Arc<Self> {
        let endpoint = Endpoint::new("js", Arc::new(NullEventListener));
        let platform = Arc::new(MockJsPlatform::default());
        endpoint
            .bind(
                JS_PLATFORM_NAME,
                Arc::clone(&platform) as Arc<dyn JsPlatform>,
                JsPlatformAdapter,
            )
            .ok();
        Arc::new(Self {
            endpoint,
            platform,
            loaded: Mutex::new(Vec::new()),
            log: Mutex::new(String::new()),
        })
    }

    /// The endpoint playing the JS side, for binding fake JS services.
    pub fn js_endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub fn platform(&self) -> &Arc<MockJsPlatform> {
        &self.platform
    }

    /// Module ids in the order they were installed.
    pub fn loaded_modules(&self) -> Vec<String> {
        self.loaded.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// What a loaded script would have appended to `globalThis.log`.
    pub fn log(&self) -> String {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl JsEngine for MockJsEngine {
    fn inbound_channel(&self) -> Arc<dyn CallChannel> {
        self.endpoint.inbound_channel()
    }

    fn install_outbound_channel(&self, channel: Arc<dyn CallChannel>) {
        self.endpoint.connect(channel);
    }

    fn load_module(&self, id: &str, _bytecode: &[u8]) -> Result<()> {
        self.loaded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(id.to_string());
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_str(&format!("{} loaded\n", id));
        Ok(())
    }

    fn close(&self) {
        self.endpoint.close();
    }
}
