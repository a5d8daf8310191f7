//! Resolution hook tests.
//!
//! Covers:
//! - Deferred admission and per-transfer address pinning
//! - Failures delivered without the engine seeing the transfer
//! - Hosts and schemes that bypass resolution
//! - In-flight lookup sharing
//! - The resolution deadline, with the tokio-backed host resolver

mod common;

use common::{EngineControl, MockEngine, MockResolver, MockTransfer, Outcome, Outcomes};
use reactornet::base::loadstate::LoadState;
use reactornet::base::neterror::NetError;
use reactornet::bridge::{Bridge, BridgeConfig, ResolveSettings};
use reactornet::dns::{LocalHostResolver, Name, Resolve, Resolving};
use std::net::{IpAddr, Ipv4Addr};
use std::rc::Rc;
use std::time::Duration;

const TEST_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10));

fn setup(config: BridgeConfig) -> (Rc<MockResolver>, EngineControl, Bridge<MockEngine>) {
    let reactor = common::MockReactor::new();
    let resolver = MockResolver::new();
    let control = EngineControl::new();
    let bridge = Bridge::with_engine(
        reactor,
        control.engine(),
        config.resolver(resolver.clone()),
    );
    (resolver, control, bridge)
}

#[test]
fn test_resolved_transfer_is_pinned_then_admitted() {
    let (resolver, control, bridge) = setup(BridgeConfig::new());
    let outcomes = Outcomes::new();

    let id = bridge
        .attach(
            MockTransfer::new(1, "http://example.test:8080/index.html"),
            outcomes.on_success(),
            outcomes.on_failure(),
        )
        .unwrap();

    assert_eq!(bridge.load_state(id), LoadState::ResolvingHost);
    assert!(control.state().added.is_empty());
    assert_eq!(
        resolver.calls(),
        vec![(Name::new("example.test"), Duration::from_secs(5))]
    );

    assert!(resolver.answer("example.test", Ok(vec![TEST_IP])));
    assert_eq!(bridge.load_state(id), LoadState::Active);
    assert_eq!(control.state().added, vec![id]);
    assert!(control.state().timer_actions >= 1);

    control.complete(id, Ok(()));
    assert_eq!(resolver.pending(), 0);
    // Admitting another transfer kicks the engine, which drains the
    // completion.
    let other = bridge
        .attach(
            MockTransfer::new(2, "http://127.0.0.1/"),
            outcomes.on_success(),
            outcomes.on_failure(),
        )
        .unwrap();
    bridge.detach(other).unwrap();

    match &outcomes.all()[..] {
        [Outcome::Success(transfer)] => {
            assert_eq!(
                transfer.pinned,
                vec![("example.test".to_string(), 8080, vec![TEST_IP])]
            );
        }
        other => panic!("unexpected outcomes: {other:?}"),
    }
    bridge.destroy().unwrap();
}

#[test]
fn test_resolution_failure_bypasses_engine() {
    let (resolver, control, bridge) = setup(BridgeConfig::new());
    let outcomes = Outcomes::new();

    bridge
        .attach(
            MockTransfer::new(3, "https://example.test/"),
            outcomes.on_success(),
            outcomes.on_failure(),
        )
        .unwrap();
    resolver.answer("example.test", Err(NetError::NameNotResolved));

    match &outcomes.all()[..] {
        [Outcome::Failure(transfer, e)] => {
            assert_eq!(transfer.user_data, 3);
            assert!(e.is_resolution_error());
        }
        other => panic!("unexpected outcomes: {other:?}"),
    }
    assert!(control.state().added.is_empty());
    assert_eq!(bridge.live_transfers(), 0);
    bridge.destroy().unwrap();
}

#[test]
fn test_engine_refusal_after_resolution_fails_once() {
    let (resolver, control, bridge) = setup(BridgeConfig::new());
    let outcomes = Outcomes::new();

    let id = bridge
        .attach(
            MockTransfer::new(9, "http://example.test:8443/"),
            outcomes.on_success(),
            outcomes.on_failure(),
        )
        .unwrap();
    control.configure(|s| s.reject_add = true);
    resolver.answer("example.test", Ok(vec![TEST_IP]));

    match &outcomes.all()[..] {
        [Outcome::Failure(transfer, e)] => {
            assert_eq!(transfer.user_data, 9);
            assert_eq!(
                transfer.pinned,
                vec![("example.test".to_string(), 8443, vec![TEST_IP])]
            );
            assert!(matches!(e, NetError::EngineFailure { code: 2, .. }));
        }
        other => panic!("unexpected outcomes: {other:?}"),
    }
    assert!(control.state().added.is_empty());
    assert_eq!(bridge.live_transfers(), 0);
    assert_eq!(bridge.load_state(id), LoadState::Idle);
    bridge.destroy().unwrap();
}

#[test]
fn test_ip_literals_and_other_schemes_skip_resolution() {
    let (resolver, control, bridge) = setup(BridgeConfig::new());
    let outcomes = Outcomes::new();

    let ids: Vec<_> = [
        "http://127.0.0.1:8080/",
        "https://[::1]/",
        "ftp://example.test/",
    ]
    .iter()
    .enumerate()
    .map(|(n, url)| {
        bridge
            .attach(
                MockTransfer::new(n as u64, url),
                outcomes.on_success(),
                outcomes.on_failure(),
            )
            .unwrap()
    })
    .collect();

    assert!(resolver.calls().is_empty());
    assert_eq!(control.state().added, ids);
    for id in ids {
        bridge.detach(id).unwrap();
    }
    bridge.destroy().unwrap();
}

#[test]
fn test_no_resolver_admits_directly() {
    let reactor = common::MockReactor::new();
    let control = EngineControl::new();
    let bridge = Bridge::with_engine(reactor, control.engine(), BridgeConfig::new());
    let outcomes = Outcomes::new();

    let id = bridge
        .attach(
            MockTransfer::new(1, "http://example.test/"),
            outcomes.on_success(),
            outcomes.on_failure(),
        )
        .unwrap();
    assert_eq!(bridge.load_state(id), LoadState::Active);
    bridge.detach(id).unwrap();
}

#[test]
fn test_concurrent_attaches_share_one_lookup() {
    let (resolver, control, bridge) = setup(BridgeConfig::new());
    let outcomes = Outcomes::new();

    let a = bridge
        .attach(
            MockTransfer::new(1, "https://example.test/"),
            outcomes.on_success(),
            outcomes.on_failure(),
        )
        .unwrap();
    let b = bridge
        .attach(
            MockTransfer::new(2, "https://example.test:8443/"),
            outcomes.on_success(),
            outcomes.on_failure(),
        )
        .unwrap();
    assert_eq!(resolver.calls().len(), 1);

    resolver.answer("example.test", Ok(vec![TEST_IP]));
    assert_eq!(control.state().added, vec![a, b]);

    let first = bridge.detach(a).unwrap();
    let second = bridge.detach(b).unwrap();
    assert_eq!(first.pinned[0].1, 443);
    assert_eq!(second.pinned[0].1, 8443);

    // Nothing is cached: the next attach looks the host up again.
    let c = bridge
        .attach(
            MockTransfer::new(3, "https://example.test/"),
            outcomes.on_success(),
            outcomes.on_failure(),
        )
        .unwrap();
    assert_eq!(resolver.calls().len(), 2);
    bridge.detach(c).unwrap();
    bridge.destroy().unwrap();
}

#[test]
fn test_sharing_can_be_disabled() {
    let (resolver, _control, bridge) = setup(BridgeConfig::new().share_inflight(false));
    let outcomes = Outcomes::new();

    for n in 0..2 {
        bridge
            .attach(
                MockTransfer::new(n, "http://example.test/"),
                outcomes.on_success(),
                outcomes.on_failure(),
            )
            .unwrap();
    }
    assert_eq!(resolver.calls().len(), 2);

    resolver.answer("example.test", Err(NetError::NameNotResolved));
    assert_eq!(outcomes.len(), 1);
    resolver.answer("example.test", Err(NetError::NameNotResolved));
    assert_eq!(outcomes.len(), 2);
    bridge.destroy().unwrap();
}

#[test]
fn test_detach_while_resolving() {
    let (resolver, control, bridge) = setup(BridgeConfig::new());
    let outcomes = Outcomes::new();

    let id = bridge
        .attach(
            MockTransfer::new(77, "http://example.test/"),
            outcomes.on_success(),
            outcomes.on_failure(),
        )
        .unwrap();
    let transfer = bridge.detach(id).unwrap();
    assert_eq!(transfer.user_data, 77);
    assert!(transfer.pinned.is_empty());

    resolver.answer("example.test", Ok(vec![TEST_IP]));
    assert_eq!(outcomes.len(), 0);
    assert!(control.state().added.is_empty());
    bridge.destroy().unwrap();
}

#[test]
fn test_custom_schemes_and_timeout() {
    let settings = ResolveSettings {
        timeout_ms: 750,
        schemes: vec!["https".into()],
        share_inflight: true,
    };
    let (resolver, _control, bridge) = setup(BridgeConfig::new().resolve_settings(settings));
    let outcomes = Outcomes::new();

    let plain = bridge
        .attach(
            MockTransfer::new(1, "http://example.test/"),
            outcomes.on_success(),
            outcomes.on_failure(),
        )
        .unwrap();
    let secure = bridge
        .attach(
            MockTransfer::new(2, "https://example.test/"),
            outcomes.on_success(),
            outcomes.on_failure(),
        )
        .unwrap();

    assert_eq!(bridge.load_state(plain), LoadState::Active);
    assert_eq!(bridge.load_state(secure), LoadState::ResolvingHost);
    assert_eq!(resolver.calls()[0].1, Duration::from_millis(750));

    bridge.detach(plain).unwrap();
    bridge.detach(secure).unwrap();
    bridge.destroy().unwrap();
}

struct NeverResolves;

impl Resolve for NeverResolves {
    fn resolve(&self, _name: Name) -> Resolving {
        Box::pin(futures::future::pending())
    }
}

#[tokio::test(start_paused = true)]
async fn test_deadline_fails_transfer_after_five_seconds() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let reactor = common::MockReactor::new();
            let control = EngineControl::new();
            let config = BridgeConfig::new()
                .resolver(Rc::new(LocalHostResolver::new(NeverResolves)));
            let bridge = Bridge::with_engine(reactor, control.engine(), config);
            let outcomes = Outcomes::new();

            bridge
                .attach(
                    MockTransfer::new(1, "http://example.test/"),
                    outcomes.on_success(),
                    outcomes.on_failure(),
                )
                .unwrap();

            tokio::time::sleep(Duration::from_millis(4_900)).await;
            assert_eq!(outcomes.len(), 0);

            tokio::time::sleep(Duration::from_millis(200)).await;
            match &outcomes.all()[..] {
                [Outcome::Failure(transfer, e)] => {
                    assert_eq!(transfer.user_data, 1);
                    assert_eq!(
                        *e,
                        NetError::NameResolutionTimedOut {
                            domain: "example.test".into()
                        }
                    );
                }
                other => panic!("unexpected outcomes: {other:?}"),
            }
            assert!(control.state().added.is_empty());
            bridge.destroy().unwrap();
        })
        .await;
}
