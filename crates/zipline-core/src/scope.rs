//! # ZiplineScope
//!
//! A lifetime group of outbound proxies belonging to one logical task.
//! Closing the scope closes every still-open member exactly once.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

use crate::error::MultiError;
use crate::outbound::OutboundState;

struct ScopeState {
    open: bool,
    /// Weak so a proxy dropped by its owner is collected, not pinned.
    members: Vec<Weak<OutboundState>>,
}

/// A set of outbound proxies closed together. Cheap to clone; clones share
/// membership.
#[derive(Clone)]
pub struct ZiplineScope {
    state: Arc<Mutex<ScopeState>>,
}

impl Default for ZiplineScope {
    fn default() -> Self {
        Self::new()
    }
}

impl ZiplineScope {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ScopeState {
                open: true,
                members: Vec::new(),
            })),
        }
    }

    pub fn is_closed(&self) -> bool {
        !self.lock().open
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScopeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a proxy with this scope. Adding to a closed scope closes
    /// the newcomer immediately.
    pub(crate) fn add(&self, member: &Arc<OutboundState>) {
        let mut state = self.lock();
        if !state.open {
            drop(state);
            let _ = member.close();
            return;
        }
        state.members.push(Arc::downgrade(member));
    }

    /// Closes every still-open member exactly once. Idempotent. Failures
    /// during close are aggregated and reported, never re-thrown.
    pub fn close(&self) {
        let members = {
            let mut state = self.lock();
            if !state.open {
                return;
            }
            state.open = false;
            std::mem::take(&mut state.members)
        };

        let mut failures = Vec::new();
        for member in members {
            let Some(member) = member.upgrade() else { continue };
            if let Err(e) = member.close() {
                failures.push(e);
            }
        }
        if !failures.is_empty() {
            tracing::warn!(error = %MultiError(failures), "scope close failures");
        }
    }
}
