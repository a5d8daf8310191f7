//! System DNS resolver using getaddrinfo.
//!
//! Runs `getaddrinfo` on tokio's blocking pool so the reactor thread never
//! waits on the system resolver.

use super::{Addrs, Name, Resolve, Resolving};
use crate::base::context::IoResultExt;
use crate::base::neterror::NetError;
use std::{io, net::ToSocketAddrs};

/// System DNS resolver using `getaddrinfo` in a thread pool.
#[derive(Clone, Debug, Default)]
pub struct GaiResolver;

impl GaiResolver {
    pub fn new() -> Self {
        Self
    }
}

impl Resolve for GaiResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(async move {
            let host = name.as_str().to_string();

            let lookup = tokio::task::spawn_blocking(move || {
                tracing::debug!(host = %host, "resolving via getaddrinfo");
                (host.as_str(), 0u16)
                    .to_socket_addrs()
                    .map(|iter| iter.collect::<Vec<_>>())
            })
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "getaddrinfo task failed");
                NetError::NameNotResolved
            })?;

            let addrs = lookup.dns_context(name.as_str())?;
            if addrs.is_empty() {
                return Err(NetError::dns_failed(
                    name.as_str(),
                    io::Error::new(io::ErrorKind::NotFound, "No addresses returned by getaddrinfo"),
                ));
            }

            tracing::debug!(host = %name, count = addrs.len(), "getaddrinfo resolution complete");
            Ok(Box::new(addrs.into_iter()) as Addrs)
        })
    }
}
