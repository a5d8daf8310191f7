//! Callback-style resolution on the reactor thread.
//!
//! The bridge does not await futures; it hands the resolver a completion
//! callback and carries on. [`LocalHostResolver`] adapts any futures-based
//! [`Resolve`] to that shape by driving the lookup as a local task.

use super::{Name, Resolve};
use crate::base::neterror::NetError;
use std::net::IpAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

/// Called once, on the reactor thread, with the resolved addresses.
pub type ResolveCallback = Box<dyn FnOnce(Result<Vec<IpAddr>, NetError>)>;

/// Asynchronous host resolution driven by the reactor.
///
/// `done` must be invoked exactly once and never synchronously from inside
/// `resolve`. An empty address list is reported as an error, not `Ok`.
pub trait HostResolver {
    fn resolve(&self, name: Name, timeout: Duration, done: ResolveCallback);
}

impl<R: HostResolver + ?Sized> HostResolver for Rc<R> {
    fn resolve(&self, name: Name, timeout: Duration, done: ResolveCallback) {
        (**self).resolve(name, timeout, done)
    }
}

/// [`HostResolver`] running a [`Resolve`] implementation on the current
/// `LocalSet`.
///
/// # Panics
///
/// `resolve` spawns a local task and must be called inside a `LocalSet`.
#[derive(Clone)]
pub struct LocalHostResolver {
    inner: Arc<dyn Resolve>,
}

impl LocalHostResolver {
    pub fn new(inner: impl Resolve + 'static) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn from_arc(inner: Arc<dyn Resolve>) -> Self {
        Self { inner }
    }
}

impl std::fmt::Debug for LocalHostResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalHostResolver").finish_non_exhaustive()
    }
}

impl HostResolver for LocalHostResolver {
    fn resolve(&self, name: Name, timeout: Duration, done: ResolveCallback) {
        let lookup = self.inner.resolve(name.clone());
        tokio::task::spawn_local(async move {
            let result = match tokio::time::timeout(timeout, lookup).await {
                Ok(Ok(addrs)) => {
                    let mut ips: Vec<IpAddr> = Vec::new();
                    for addr in addrs {
                        if !ips.contains(&addr.ip()) {
                            ips.push(addr.ip());
                        }
                    }
                    if ips.is_empty() {
                        Err(NetError::NameNotResolved)
                    } else {
                        Ok(ips)
                    }
                }
                Ok(Err(e)) => Err(e),
                Err(_) => {
                    tracing::debug!(host = %name, ?timeout, "resolution deadline elapsed");
                    Err(NetError::NameResolutionTimedOut {
                        domain: name.as_str().to_string(),
                    })
                }
            };
            done(result);
        });
    }
}
