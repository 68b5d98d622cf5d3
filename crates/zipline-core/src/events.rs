//! # Event Listener
//!
//! A pure observer of bridge and loader activity. Hooks have no control
//! effects; exceptions raised by a listener are caught and swallowed,
//! observed only through an internal error count.

use std::panic::catch_unwind;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::Value;

use crate::error::Result;

/// One call crossing the boundary, as seen by the listener.
#[derive(Debug, Clone)]
pub struct CallEvent {
    pub service_name: String,
    /// The function's canonical signature.
    pub function: String,
    pub args: Vec<Value>,
}

/// Observer hooks for bridge calls, service lifecycle, and code loading.
///
/// All hooks default to no-ops. `call_start` may return a token that is
/// handed back to the matching `call_end`.
pub trait EventListener: Send + Sync + 'static {
    fn bind_service(&self, _name: &str) {}

    fn take_service(&self, _name: &str) {}

    fn call_start(&self, _call: &CallEvent) -> u64 {
        0
    }

    fn call_end(&self, _call: &CallEvent, _result: &Result<Value>, _token: u64) {}

    /// An outbound proxy was dropped without `close()`.
    fn service_leaked(&self, _name: &str) {}

    fn download_start(&self, _application_name: &str, _url: &str) {}

    fn download_end(&self, _application_name: &str, _url: &str) {}

    fn download_failed(
        &self,
        _application_name: &str,
        _url: &str,
        _error: &(dyn std::error::Error + 'static),
    ) {
    }

    fn manifest_parse_failed(
        &self,
        _application_name: &str,
        _url: Option<&str>,
        _error: &(dyn std::error::Error + 'static),
    ) {
    }

    fn application_load_start(&self, _application_name: &str, _url: Option<&str>) {}

    fn application_load_end(&self, _application_name: &str, _url: Option<&str>) {}

    fn application_load_failed(
        &self,
        _application_name: &str,
        _url: Option<&str>,
        _error: &(dyn std::error::Error + 'static),
    ) {
    }
}

/// The default listener: observes nothing.
pub struct NullEventListener;

impl EventListener for NullEventListener {}

/// Wraps a listener so that a panicking hook never takes down the dispatcher.
/// Panics are counted and logged.
#[derive(Clone)]
pub struct SafeEventListener {
    inner: Arc<dyn EventListener>,
    errors: Arc<AtomicU64>,
}

impl SafeEventListener {
    pub fn new(inner: Arc<dyn EventListener>) -> Self {
        Self {
            inner,
            errors: Arc::new(AtomicU64::new(0)),
        }
    }

    /// How many hook invocations panicked.
    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    fn guard<R>(&self, hook: &'static str, f: impl FnOnce() -> R, fallback: R) -> R {
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(result) => result,
            Err(_) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(hook, "event listener panicked");
                fallback
            }
        }
    }

    pub fn bind_service(&self, name: &str) {
        self.guard("bind_service", || self.inner.bind_service(name), ());
    }

    pub fn take_service(&self, name: &str) {
        self.guard("take_service", || self.inner.take_service(name), ());
    }

    pub fn call_start(&self, call: &CallEvent) -> u64 {
        self.guard("call_start", || self.inner.call_start(call), 0)
    }

    pub fn call_end(&self, call: &CallEvent, result: &Result<Value>, token: u64) {
        self.guard("call_end", || self.inner.call_end(call, result, token), ());
    }

    pub fn service_leaked(&self, name: &str) {
        self.guard("service_leaked", || self.inner.service_leaked(name), ());
    }

    pub fn download_start(&self, application_name: &str, url: &str) {
        self.guard(
            "download_start",
            || self.inner.download_start(application_name, url),
            (),
        );
    }

    pub fn download_end(&self, application_name: &str, url: &str) {
        self.guard(
            "download_end",
            || self.inner.download_end(application_name, url),
            (),
        );
    }

    pub fn download_failed(
        &self,
        application_name: &str,
        url: &str,
        error: &(dyn std::error::Error + 'static),
    ) {
        self.guard(
            "download_failed",
            || self.inner.download_failed(application_name, url, error),
            (),
        );
    }

    pub fn manifest_parse_failed(
        &self,
        application_name: &str,
        url: Option<&str>,
        error: &(dyn std::error::Error + 'static),
    ) {
        self.guard(
            "manifest_parse_failed",
            || self.inner.manifest_parse_failed(application_name, url, error),
            (),
        );
    }

    pub fn application_load_start(&self, application_name: &str, url: Option<&str>) {
        self.guard(
            "application_load_start",
            || self.inner.application_load_start(application_name, url),
            (),
        );
    }

    pub fn application_load_end(&self, application_name: &str, url: Option<&str>) {
        self.guard(
            "application_load_end",
            || self.inner.application_load_end(application_name, url),
            (),
        );
    }

    pub fn application_load_failed(
        &self,
        application_name: &str,
        url: Option<&str>,
        error: &(dyn std::error::Error + 'static),
    ) {
        self.guard(
            "application_load_failed",
            || self.inner.application_load_failed(application_name, url, error),
            (),
        );
    }
}
