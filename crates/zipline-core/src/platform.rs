//! # Host Bootstrap Services
//!
//! The two platform services installed at startup, with their hand-written
//! adapters. These double as the reference adapters for user services.
//!
//! - `zipline/host` (bound by the host): `setTimeout` and the console bridge.
//! - `zipline/js` (bound by JS): `runJob`, fired when a timer elapses.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::json;
use serde_json::Value;

use crate::adapter::decode_arg;
use crate::adapter::Function;
use crate::adapter::ServiceAdapter;
use crate::adapter::ZiplineService;
use crate::endpoint::CallContext;
use crate::error::BridgeError;
use crate::error::Result;
use crate::outbound::OutboundCallHandler;

/// Name the JS side binds its platform service under.
pub const JS_PLATFORM_NAME: &str = "zipline/js";

/// Name the host binds its platform service under.
pub const HOST_PLATFORM_NAME: &str = "zipline/host";

/// The JS side of the bootstrap contract.
pub trait JsPlatform: ZiplineService {
    /// Runs the job scheduled under `timeout_id`.
    fn run_job(&self, timeout_id: u32);
}

static JS_PLATFORM_FUNCTIONS: &[Function] = &[Function {
    signature: "fun runJob(timeoutId: Int): Unit",
    is_suspending: false,
}];

#[derive(Clone)]
pub struct JsPlatformAdapter;

impl ServiceAdapter for JsPlatformAdapter {
    type Service = dyn JsPlatform;
    type Proxy = JsPlatformProxy;

    fn functions(&self) -> &'static [Function] {
        JS_PLATFORM_FUNCTIONS
    }

    fn call(
        &self,
        service: &Arc<Self::Service>,
        _context: &CallContext,
        ordinal: usize,
        args: Vec<Value>,
    ) -> Result<Value> {
        match ordinal {
            0 => {
                let timeout_id: u32 = decode_arg(&args, 0)?;
                service.run_job(timeout_id);
                Ok(Value::Null)
            }
            _ => Err(BridgeError::Protocol(format!("unknown function {}", ordinal))),
        }
    }

    fn outbound_proxy(&self, handler: OutboundCallHandler) -> Self::Proxy {
        JsPlatformProxy { handler }
    }
}

pub struct JsPlatformProxy {
    handler: OutboundCallHandler,
}

impl JsPlatform for JsPlatformProxy {
    fn run_job(&self, timeout_id: u32) {
        if let Err(e) = self.handler.call(0, vec![json!(timeout_id)]) {
            tracing::warn!(timeout_id, error = %e, "runJob failed");
        }
    }
}

impl ZiplineService for JsPlatformProxy {
    fn close(&self) {
        let _ = self.handler.close();
    }

    fn outbound_name(&self) -> Option<String> {
        Some(self.handler.service_name().to_string())
    }
}

/// The host side of the bootstrap contract.
pub trait HostPlatform: ZiplineService {
    /// Schedules `JsPlatform::run_job(timeout_id)` after `delay_ms` on the
    /// dispatcher.
    fn set_timeout(&self, timeout_id: u32, delay_ms: u32);

    /// Routes one console line to the host log.
    fn console_message(&self, level: &str, message: &str);
}

static HOST_PLATFORM_FUNCTIONS: &[Function] = &[
    Function {
        signature: "fun setTimeout(timeoutId: Int, delayMs: Int): Unit",
        is_suspending: false,
    },
    Function {
        signature: "fun consoleMessage(level: String, message: String): Unit",
        is_suspending: false,
    },
];

#[derive(Clone)]
pub struct HostPlatformAdapter;

impl ServiceAdapter for HostPlatformAdapter {
    type Service = dyn HostPlatform;
    type Proxy = HostPlatformProxy;

    fn functions(&self) -> &'static [Function] {
        HOST_PLATFORM_FUNCTIONS
    }

    fn call(
        &self,
        service: &Arc<Self::Service>,
        _context: &CallContext,
        ordinal: usize,
        args: Vec<Value>,
    ) -> Result<Value> {
        match ordinal {
            0 => {
                let timeout_id: u32 = decode_arg(&args, 0)?;
                let delay_ms: u32 = decode_arg(&args, 1)?;
                service.set_timeout(timeout_id, delay_ms);
                Ok(Value::Null)
            }
            1 => {
                let level: String = decode_arg(&args, 0)?;
                let message: String = decode_arg(&args, 1)?;
                service.console_message(&level, &message);
                Ok(Value::Null)
            }
            _ => Err(BridgeError::Protocol(format!("unknown function {}", ordinal))),
        }
    }

    fn outbound_proxy(&self, handler: OutboundCallHandler) -> Self::Proxy {
        HostPlatformProxy { handler }
    }
}

pub struct HostPlatformProxy {
    handler: OutboundCallHandler,
}

impl HostPlatform for HostPlatformProxy {
    fn set_timeout(&self, timeout_id: u32, delay_ms: u32) {
        if let Err(e) = self.handler.call(0, vec![json!(timeout_id), json!(delay_ms)]) {
            tracing::warn!(timeout_id, error = %e, "setTimeout failed");
        }
    }

    fn console_message(&self, level: &str, message: &str) {
        if let Err(e) = self.handler.call(1, vec![json!(level), json!(message)]) {
            tracing::warn!(error = %e, "consoleMessage failed");
        }
    }
}

impl ZiplineService for HostPlatformProxy {
    fn close(&self) {
        let _ = self.handler.close();
    }

    fn outbound_name(&self) -> Option<String> {
        Some(self.handler.service_name().to_string())
    }
}

/// The host's platform implementation: tokio timers feeding `runJob`, and a
/// console bridge into `tracing`.
pub struct HostService {
    js: Arc<dyn JsPlatform>,
    timers: Mutex<Vec<tokio::task::AbortHandle>>,
}

impl HostService {
    pub fn new(js: Arc<dyn JsPlatform>) -> Self {
        Self {
            js,
            timers: Mutex::new(Vec::new()),
        }
    }

    fn timers(&self) -> std::sync::MutexGuard<'_, Vec<tokio::task::AbortHandle>> {
        self.timers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl HostPlatform for HostService {
    fn set_timeout(&self, timeout_id: u32, delay_ms: u32) {
        let js = Arc::clone(&self.js);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(u64::from(delay_ms))).await;
            js.run_job(timeout_id);
        });
        let mut timers = self.timers();
        timers.retain(|t| !t.is_finished());
        timers.push(handle.abort_handle());
    }

    fn console_message(&self, level: &str, message: &str) {
        match level {
            "warn" => tracing::warn!(target: "zipline.console", "{}", message),
            "error" => tracing::error!(target: "zipline.console", "{}", message),
            _ => tracing::info!(target: "zipline.console", "{}", message),
        }
    }
}

impl ZiplineService for HostService {
    fn close(&self) {
        for timer in self.timers().drain(..) {
            timer.abort();
        }
        self.js.close();
    }
}
