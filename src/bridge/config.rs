//! Bridge configuration.

use crate::dns::HostResolver;
use crate::memory::BlockAllocator;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

/// Resolution hook settings.
///
/// Plain data, so hosts can load it from their own configuration files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolveSettings {
    /// Deadline for one resolution, in milliseconds
    pub timeout_ms: u64,
    /// URL schemes whose hosts are resolved before admission
    pub schemes: Vec<String>,
    /// Let concurrent transfers to the same host share one lookup
    pub share_inflight: bool,
}

impl Default for ResolveSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            schemes: vec!["http".to_string(), "https".to_string()],
            share_inflight: true,
        }
    }
}

impl ResolveSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn is_resolvable(&self, scheme: &str) -> bool {
        self.schemes.iter().any(|s| s.eq_ignore_ascii_case(scheme))
    }
}

/// Options for [`Bridge::create`](super::Bridge::create).
#[derive(Clone, Default)]
pub struct BridgeConfig {
    /// Allocator handed to the engine; the process-wide segregated
    /// allocator when unset.
    pub allocator: Option<Arc<dyn BlockAllocator>>,
    /// Resolver for the pre-connect resolution hook; no hook when unset.
    pub resolver: Option<Rc<dyn HostResolver>>,
    pub resolve: ResolveSettings,
}

impl BridgeConfig {
    /// Create a new config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the engine allocator.
    pub fn allocator(mut self, allocator: Arc<dyn BlockAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Enable the resolution hook with `resolver`.
    pub fn resolver(mut self, resolver: Rc<dyn HostResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Replace all resolution settings.
    pub fn resolve_settings(mut self, settings: ResolveSettings) -> Self {
        self.resolve = settings;
        self
    }

    /// Set the resolution deadline.
    pub fn resolve_timeout(mut self, timeout: Duration) -> Self {
        self.resolve.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Enable or disable in-flight lookup sharing.
    pub fn share_inflight(mut self, share: bool) -> Self {
        self.resolve.share_inflight = share;
        self
    }
}

impl fmt::Debug for BridgeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeConfig")
            .field("allocator", &self.allocator.as_ref().map(|a| a.name()))
            .field("resolver", &self.resolver.is_some())
            .field("resolve", &self.resolve)
            .finish()
    }
}
