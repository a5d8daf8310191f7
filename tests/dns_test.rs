//! DNS Module Tests
//!
//! Covers:
//! - `LocalHostResolver` over a scripted `Resolve`
//! - `DnsResolverWithOverrides` feeding the callback-style resolver
//! - `GaiResolver` through the host resolver on a `LocalSet`

use reactornet::base::neterror::NetError;
use reactornet::dns::{
    Addrs, DnsResolverWithOverrides, GaiResolver, HostResolver, LocalHostResolver, Name, Resolve,
    Resolving,
};

use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::LocalSet;

struct ScriptedResolver {
    answer: Result<Vec<SocketAddr>, NetError>,
    calls: AtomicUsize,
}

impl Resolve for ScriptedResolver {
    fn resolve(&self, _name: Name) -> Resolving {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let answer = self.answer.clone();
        Box::pin(async move { answer.map(|addrs| Box::new(addrs.into_iter()) as Addrs) })
    }
}

type Slot = Rc<RefCell<Option<Result<Vec<IpAddr>, NetError>>>>;

async fn resolve_once(resolver: &dyn HostResolver, host: &str) -> Result<Vec<IpAddr>, NetError> {
    let slot: Slot = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&slot);
    resolver.resolve(
        Name::new(host),
        Duration::from_secs(5),
        Box::new(move |result| *sink.borrow_mut() = Some(result)),
    );
    loop {
        if let Some(result) = slot.borrow_mut().take() {
            return result;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

#[tokio::test]
async fn test_host_resolver_strips_ports_and_keeps_order() {
    let inner = ScriptedResolver {
        answer: Ok(vec![
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 0),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)), 0),
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 443),
        ]),
        calls: AtomicUsize::new(0),
    };
    let resolver = LocalHostResolver::new(inner);

    let ips = LocalSet::new()
        .run_until(resolve_once(&resolver, "dual.test"))
        .await
        .unwrap();
    assert_eq!(
        ips,
        vec![
            IpAddr::V6(Ipv6Addr::LOCALHOST),
            IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)),
        ]
    );
}

#[tokio::test]
async fn test_host_resolver_reports_empty_answer() {
    let resolver = LocalHostResolver::new(ScriptedResolver {
        answer: Ok(Vec::new()),
        calls: AtomicUsize::new(0),
    });

    let err = LocalSet::new()
        .run_until(resolve_once(&resolver, "empty.test"))
        .await
        .unwrap_err();
    assert_eq!(err, NetError::NameNotResolved);
}

#[tokio::test]
async fn test_overrides_through_host_resolver() {
    let inner = Arc::new(ScriptedResolver {
        answer: Err(NetError::NameNotResolved),
        calls: AtomicUsize::new(0),
    });

    let mut overrides = HashMap::new();
    overrides.insert(
        Cow::Borrowed("pinned.test"),
        vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 0)],
    );
    let with_overrides = DnsResolverWithOverrides::new(inner.clone(), overrides);
    assert_eq!(with_overrides.override_count(), 1);
    let resolver = LocalHostResolver::new(with_overrides);

    let local = LocalSet::new();
    let pinned = local
        .run_until(resolve_once(&resolver, "pinned.test"))
        .await
        .unwrap();
    assert_eq!(pinned, vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]);
    assert_eq!(inner.calls.load(Ordering::SeqCst), 0);

    let miss = local.run_until(resolve_once(&resolver, "other.test")).await;
    assert!(miss.unwrap_err().is_resolution_error());
    assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_gai_resolver_localhost() {
    let resolver = LocalHostResolver::new(GaiResolver::new());

    // localhost resolves from /etc/hosts on any sane system.
    match LocalSet::new()
        .run_until(resolve_once(&resolver, "localhost"))
        .await
    {
        Ok(ips) => assert!(ips.iter().all(|ip| ip.is_loopback())),
        Err(e) => println!("GaiResolver failed for localhost: {e}"),
    }
}
