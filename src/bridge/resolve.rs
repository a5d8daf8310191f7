//! Resolution hook.
//!
//! Transfers aimed at a named host on a resolvable scheme are held back
//! while the host resolver runs. The answer is pinned onto each waiting
//! transfer as a per-transfer DNS override before the engine sees it; a
//! failed or timed-out lookup fails the transfer without involving the
//! engine.
//!
//! Lookups are identified by a sequence number. With sharing enabled,
//! concurrent transfers to the same host join the lookup already in
//! flight; nothing is cached once it completes.

use super::handle::{Callbacks, HandleContext, HandleState};
use super::{drain, Inner, Shared};
use crate::base::neterror::NetError;
use crate::dns::{HostResolver, Name};
use crate::engine::{Engine, Rejected, TransferId};
use std::collections::HashMap;
use std::net::IpAddr;
use std::rc::Rc;
use std::time::Duration;
use url::Host;

pub(crate) struct Target {
    pub(crate) host: Name,
    pub(crate) port: u16,
}

/// Where `transfer` must be resolved, or `None` to admit it directly.
pub(crate) fn target<E: Engine>(inner: &Inner<E>, transfer: &E::Transfer) -> Option<Target> {
    inner.resolver.as_ref()?;
    let url = inner.engine.as_ref()?.target_url(transfer)?;
    if !inner.settings.is_resolvable(url.scheme()) {
        return None;
    }
    let host = match url.host()? {
        Host::Domain(domain) => Name::new(domain),
        Host::Ipv4(_) | Host::Ipv6(_) => return None,
    };
    let port = url.port_or_known_default()?;
    Some(Target { host, port })
}

pub(crate) struct Join {
    pub(crate) lookup: u64,
    /// A new lookup must be started.
    pub(crate) fresh: bool,
}

#[derive(Default)]
pub(crate) struct Lookups {
    next: u64,
    by_name: HashMap<Name, u64>,
    waiters: HashMap<u64, Vec<TransferId>>,
}

impl Lookups {
    pub(crate) fn join(&mut self, host: &Name, id: TransferId, share: bool) -> Join {
        if share {
            if let Some(&lookup) = self.by_name.get(host) {
                self.waiters.entry(lookup).or_default().push(id);
                return Join {
                    lookup,
                    fresh: false,
                };
            }
        }

        self.next += 1;
        let lookup = self.next;
        self.waiters.insert(lookup, vec![id]);
        if share {
            self.by_name.insert(host.clone(), lookup);
        }
        Join {
            lookup,
            fresh: true,
        }
    }

    /// The lookup stays in flight; its result is discarded for `id`.
    pub(crate) fn leave(&mut self, lookup: u64, id: TransferId) {
        if let Some(waiters) = self.waiters.get_mut(&lookup) {
            waiters.retain(|&w| w != id);
        }
    }

    fn complete(&mut self, lookup: u64) -> Vec<TransferId> {
        self.by_name.retain(|_, l| *l != lookup);
        self.waiters.remove(&lookup).unwrap_or_default()
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.waiters.len()
    }
}

pub(crate) fn start<E: Engine + 'static>(
    shared: &Shared<E>,
    resolver: Rc<dyn HostResolver>,
    host: Name,
    lookup: u64,
    timeout: Duration,
) {
    let weak = Rc::downgrade(shared);
    tracing::debug!(host = %host, lookup, ?timeout, "resolution started");
    resolver.resolve(
        host,
        timeout,
        Box::new(move |result| {
            if let Some(shared) = weak.upgrade() {
                finish(&shared, lookup, result);
            }
        }),
    );
}

fn finish<E: Engine + 'static>(
    shared: &Shared<E>,
    lookup: u64,
    result: Result<Vec<IpAddr>, NetError>,
) {
    let mut failed: Vec<(Callbacks<E>, E::Transfer, NetError)> = Vec::new();
    {
        let Ok(mut guard) = shared.try_borrow_mut() else {
            tracing::error!(lookup, error = %NetError::ReentrantDispatch, "dropping resolution result");
            return;
        };
        let inner = &mut *guard;
        let waiters = inner.lookups.complete(lookup);
        match &result {
            Ok(addrs) => tracing::debug!(lookup, addrs = addrs.len(), waiters = waiters.len(), "resolution complete"),
            Err(e) => tracing::debug!(lookup, error = %e, waiters = waiters.len(), "resolution failed"),
        }

        let mut admitted = 0usize;
        for id in waiters {
            let Some(HandleContext { callbacks, state }) = inner.handles.remove(&id) else {
                continue;
            };
            let (mut transfer, host, port) = match state {
                HandleState::Resolving {
                    transfer, host, port, ..
                } => (transfer, host, port),
                state @ HandleState::Active { .. } => {
                    inner.handles.insert(id, HandleContext { callbacks, state });
                    continue;
                }
            };

            let addrs = match &result {
                Ok(addrs) => addrs,
                Err(e) => {
                    failed.push((callbacks, transfer, e.clone()));
                    continue;
                }
            };
            let Ok((engine, adapters)) = inner.driver() else {
                failed.push((callbacks, transfer, NetError::Aborted));
                continue;
            };
            if let Err(e) = engine.override_resolution(&mut transfer, host.as_str(), port, addrs) {
                tracing::warn!(transfer = %id, error = %e, "pinning resolved addresses failed");
                failed.push((callbacks, transfer, e));
                continue;
            }
            match engine.add(transfer, id, adapters) {
                Ok(handle) => {
                    inner.handles.insert(
                        id,
                        HandleContext {
                            callbacks,
                            state: HandleState::Active { handle },
                        },
                    );
                    admitted += 1;
                    tracing::debug!(transfer = %id, host = %host, port, "transfer attached after resolution");
                }
                Err(Rejected { error, inner: transfer }) => {
                    tracing::warn!(transfer = %id, error = %error, "engine rejected resolved transfer");
                    failed.push((callbacks, transfer, error));
                }
            }
        }

        if admitted > 0 {
            if let Ok((engine, adapters)) = inner.driver() {
                if let Err(e) = engine.timer_action(adapters) {
                    tracing::warn!(error = %e, "engine kick after resolution failed");
                }
            }
        }
    }

    for (callbacks, transfer, error) in failed {
        callbacks.finish(transfer, Err(error));
    }
    drain::drain(shared);
}
