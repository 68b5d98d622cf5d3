//! # Zipline Facade
//!
//! Owns one endpoint and one JS engine. Creation wires the two channels
//! symmetrically and installs the bootstrap services; close tears the whole
//! bridge down.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::adapter::ServiceAdapter;
use crate::endpoint::Endpoint;
use crate::engine::JsEngine;
use crate::error::Result;
use crate::events::EventListener;
use crate::platform::HostPlatformAdapter;
use crate::platform::HostService;
use crate::platform::JsPlatformAdapter;
use crate::platform::HOST_PLATFORM_NAME;
use crate::platform::JS_PLATFORM_NAME;
use crate::scope::ZiplineScope;

/// A running bridge to one embedded JavaScript application.
pub struct Zipline {
    endpoint: Arc<Endpoint>,
    engine: Arc<dyn JsEngine>,
    closed: AtomicBool,
}

impl Zipline {
    /// Wires the endpoint to the engine's channels, installs the host
    /// platform services, and takes the JS platform proxy.
    pub fn create(engine: Arc<dyn JsEngine>, listener: Arc<dyn EventListener>) -> Result<Arc<Self>> {
        let endpoint = Endpoint::new("host", listener);
        engine.install_outbound_channel(endpoint.inbound_channel());
        endpoint.connect(engine.inbound_channel());

        let js = endpoint.take(JS_PLATFORM_NAME, JsPlatformAdapter, None)?;
        let host = Arc::new(HostService::new(Arc::new(js)));
        endpoint.bind(
            HOST_PLATFORM_NAME,
            host as Arc<dyn crate::platform::HostPlatform>,
            HostPlatformAdapter,
        )?;

        Ok(Arc::new(Self {
            endpoint,
            engine,
            closed: AtomicBool::new(false),
        }))
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    /// Registers an inbound service for the JS side to call.
    pub fn bind<A: ServiceAdapter>(
        &self,
        name: &str,
        service: Arc<A::Service>,
        adapter: A,
    ) -> Result<()> {
        self.endpoint.bind(name, service, adapter)
    }

    /// Returns a proxy to a service the JS side bound.
    pub fn take<A: ServiceAdapter>(&self, name: &str, adapter: A) -> Result<A::Proxy> {
        self.endpoint.take(name, adapter, None)
    }

    /// Like [`take`](Self::take), registering the proxy under `scope`.
    pub fn take_in_scope<A: ServiceAdapter>(
        &self,
        name: &str,
        adapter: A,
        scope: &ZiplineScope,
    ) -> Result<A::Proxy> {
        self.endpoint.take(name, adapter, Some(scope))
    }

    /// Installs one verified module into the engine.
    pub fn load_module(&self, id: &str, bytecode: &[u8]) -> Result<()> {
        self.engine.load_module(id, bytecode)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Marks the endpoint closed, fails all pending continuations, and
    /// releases the JS engine. Post-close calls fail with `EndpointClosed`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.endpoint.close();
        self.engine.close();
    }
}

impl Drop for Zipline {
    fn drop(&mut self) {
        self.close();
    }
}
