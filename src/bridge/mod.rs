//! The reactor/engine bridge.
//!
//! A [`Bridge`] owns one [`Engine`] and drives it from a host [`Reactor`]:
//! - [`socket`]: engine socket interest mapped onto reactor registrations
//! - [`timer`]: the engine's deadline mapped onto one reactor timer
//! - [`drain`]: finished transfers handed back through user callbacks
//! - [`resolve`]: optional asynchronous DNS before engine admission
//!
//! Everything runs on the reactor thread. Shared state sits behind one
//! `Rc<RefCell<_>>`; reactor callbacks hold only `Weak` references, and no
//! borrow is held while user callbacks run, so callbacks may attach and
//! detach freely.
//!
//! # Example
//!
//! ```rust,ignore
//! use reactornet::bridge::{Bridge, BridgeConfig};
//! use reactornet::engine::{CurlEngine, CurlTransfer};
//! use reactornet::reactor::TokioReactor;
//! use std::rc::Rc;
//!
//! let reactor = Rc::new(TokioReactor::new()?);
//! let bridge: Bridge<CurlEngine<Collector>> = Bridge::create(reactor, BridgeConfig::new())?;
//! let transfer = CurlTransfer::new(Collector::default(), "http://example.com/".parse()?)?;
//! bridge.attach(
//!     transfer,
//!     |done| println!("fetched {} bytes", done.handler().len()),
//!     |_, err| eprintln!("failed: {err}"),
//! )?;
//! ```

mod config;
mod drain;
mod handle;
mod resolve;
mod socket;
mod timer;

pub use config::{BridgeConfig, ResolveSettings};
pub use handle::{FailureCallback, SuccessCallback};

use crate::base::loadstate::LoadState;
use crate::base::neterror::NetError;
use crate::dns::HostResolver;
use crate::engine::{
    Engine, EngineHooks, EngineSettings, EventMask, Rejected, SocketInterest, TransferId,
};
use crate::memory::{default_allocator, BlockAllocator};
use crate::reactor::{Reactor, Readiness, ReadinessHandler};
use handle::{Callbacks, HandleContext, HandleState};
use resolve::Lookups;
use socket::SocketAdapter;
use std::cell::RefCell;
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;
use timer::{FireHandler, TimerAdapter};

/// The engine's view of the reactor.
pub(crate) struct Adapters {
    sockets: SocketAdapter,
    timer: TimerAdapter,
}

impl EngineHooks for Adapters {
    fn socket_interest(&mut self, fd: RawFd, interest: SocketInterest) -> Result<(), NetError> {
        self.sockets.update(fd, interest)
    }

    fn timer_deadline(&mut self, deadline: Option<Duration>) -> Result<(), NetError> {
        self.timer.update(deadline)
    }
}

pub(crate) struct Inner<E: Engine> {
    /// `None` once torn down.
    engine: Option<E>,
    adapters: Adapters,
    handles: HashMap<TransferId, HandleContext<E>>,
    lookups: Lookups,
    next_id: u64,
    allocator: Arc<dyn BlockAllocator>,
    resolver: Option<Rc<dyn HostResolver>>,
    settings: ResolveSettings,
}

impl<E: Engine> Inner<E> {
    /// The engine together with the hooks it calls back into.
    fn driver(&mut self) -> Result<(&mut E, &mut Adapters), NetError> {
        match self.engine.as_mut() {
            Some(engine) => Ok((engine, &mut self.adapters)),
            None => Err(NetError::Aborted),
        }
    }

    fn issue_id(&mut self) -> TransferId {
        self.next_id += 1;
        TransferId(self.next_id)
    }
}

type Shared<E> = Rc<RefCell<Inner<E>>>;

fn socket_dispatcher<E: Engine + 'static>(weak: Weak<RefCell<Inner<E>>>) -> ReadinessHandler {
    Rc::new(move |fd: RawFd, readiness: Readiness| {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        let events = EventMask::from(readiness);
        tracing::trace!(fd, ?events, "forwarding socket readiness");
        {
            let Ok(mut guard) = shared.try_borrow_mut() else {
                tracing::error!(fd, error = %NetError::ReentrantDispatch, "dropping socket event");
                return;
            };
            let Ok((engine, adapters)) = guard.driver() else {
                return;
            };
            if let Err(e) = engine.socket_action(fd, events, adapters) {
                tracing::error!(fd, error = %e, "engine socket action failed");
            }
        }
        drain::drain(&shared);
    })
}

fn timer_dispatcher<E: Engine + 'static>(weak: Weak<RefCell<Inner<E>>>) -> FireHandler {
    Rc::new(move |generation: u64| {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        {
            let Ok(mut guard) = shared.try_borrow_mut() else {
                tracing::error!(generation, error = %NetError::ReentrantDispatch, "dropping timer event");
                return;
            };
            if !guard.adapters.timer.take_fired(generation) {
                return;
            }
            let Ok((engine, adapters)) = guard.driver() else {
                return;
            };
            if let Err(e) = engine.timer_action(adapters) {
                tracing::error!(error = %e, "engine timer action failed");
            }
        }
        drain::drain(&shared);
    })
}

/// Drives an [`Engine`] from a single-threaded [`Reactor`].
///
/// The bridge must be [destroyed](Bridge::destroy) (or dropped) only after
/// every attached transfer has completed or been detached.
pub struct Bridge<E: Engine + 'static> {
    shared: Shared<E>,
}

impl<E: Engine + 'static> Bridge<E> {
    /// Initialize a fresh engine and bind it to `reactor`.
    ///
    /// Nothing is registered with the reactor if engine initialization
    /// fails.
    pub fn create(reactor: Rc<dyn Reactor>, config: BridgeConfig) -> Result<Self, NetError> {
        let allocator = config.allocator.clone().unwrap_or_else(default_allocator);
        let engine = E::init(EngineSettings {
            allocator: Arc::clone(&allocator),
        })
        .inspect_err(|e| tracing::error!(error = %e, "engine initialization failed"))?;
        Ok(Self::assemble(reactor, engine, allocator, config))
    }

    /// Bind an already initialized engine to `reactor`.
    pub fn with_engine(reactor: Rc<dyn Reactor>, engine: E, config: BridgeConfig) -> Self {
        let allocator = config.allocator.clone().unwrap_or_else(default_allocator);
        Self::assemble(reactor, engine, allocator, config)
    }

    fn assemble(
        reactor: Rc<dyn Reactor>,
        engine: E,
        allocator: Arc<dyn BlockAllocator>,
        config: BridgeConfig,
    ) -> Self {
        tracing::debug!(
            allocator = allocator.name(),
            resolver = config.resolver.is_some(),
            "bridge created"
        );
        let shared = Rc::new_cyclic(|weak: &Weak<RefCell<Inner<E>>>| {
            RefCell::new(Inner {
                engine: Some(engine),
                adapters: Adapters {
                    sockets: SocketAdapter::new(Rc::clone(&reactor), socket_dispatcher(weak.clone())),
                    timer: TimerAdapter::new(reactor, timer_dispatcher(weak.clone())),
                },
                handles: HashMap::new(),
                lookups: Lookups::default(),
                next_id: 0,
                allocator,
                resolver: config.resolver,
                settings: config.resolve,
            })
        });
        Self { shared }
    }

    /// Hand `transfer` to the bridge.
    ///
    /// Exactly one of `on_success` / `on_failure` runs later on the reactor
    /// thread, unless the transfer is [detached](Bridge::detach) first.
    /// When the transfer is admitted to the engine directly, the engine is
    /// kicked before this returns, so a transfer that finishes immediately
    /// has its callback run before `attach` returns.
    ///
    /// If the transfer cannot be admitted, nothing is left registered and
    /// the transfer comes back inside the error; no callback runs.
    pub fn attach<S, F>(
        &self,
        transfer: E::Transfer,
        on_success: S,
        on_failure: F,
    ) -> Result<TransferId, Rejected<E::Transfer>>
    where
        S: FnOnce(E::Transfer) + 'static,
        F: FnOnce(E::Transfer, NetError) + 'static,
    {
        let Ok(mut guard) = self.shared.try_borrow_mut() else {
            return Err(Rejected::new(NetError::ReentrantDispatch, transfer));
        };
        let inner = &mut *guard;
        if let Err(e) = inner.driver() {
            return Err(Rejected::new(e, transfer));
        }
        let callbacks = Callbacks::new(Box::new(on_success), Box::new(on_failure));
        let id = inner.issue_id();

        if let Some(target) = resolve::target(inner, &transfer) {
            let start = inner.lookups.join(&target.host, id, inner.settings.share_inflight);
            tracing::debug!(transfer = %id, host = %target.host, port = target.port, "transfer waiting on resolution");
            inner.handles.insert(
                id,
                HandleContext {
                    callbacks,
                    state: HandleState::Resolving {
                        transfer,
                        host: target.host.clone(),
                        port: target.port,
                        lookup: start.lookup,
                    },
                },
            );
            let resolver = inner.resolver.clone();
            let timeout = inner.settings.timeout();
            drop(guard);
            if let (true, Some(resolver)) = (start.fresh, resolver) {
                resolve::start(&self.shared, resolver, target.host, start.lookup, timeout);
            }
            return Ok(id);
        }

        let added = match inner.driver() {
            Ok((engine, adapters)) => engine.add(transfer, id, adapters),
            Err(e) => Err(Rejected::new(e, transfer)),
        };
        let handle = added.inspect_err(|rejected| {
            tracing::warn!(transfer = %id, error = %rejected.error, "engine rejected transfer");
        })?;
        inner.handles.insert(
            id,
            HandleContext {
                callbacks,
                state: HandleState::Active { handle },
            },
        );
        tracing::debug!(transfer = %id, "transfer attached");

        if let Ok((engine, adapters)) = inner.driver() {
            if let Err(e) = engine.timer_action(adapters) {
                tracing::warn!(transfer = %id, error = %e, "initial engine kick failed");
            }
        }
        drop(guard);
        drain::drain(&self.shared);
        Ok(id)
    }

    /// Take a transfer back before it finishes. No callback runs.
    ///
    /// If the engine refuses to let go, the transfer stays attached exactly
    /// as before and the engine's error is returned.
    pub fn detach(&self, id: TransferId) -> Result<E::Transfer, NetError> {
        let mut guard = self
            .shared
            .try_borrow_mut()
            .map_err(|_| NetError::ReentrantDispatch)?;
        let inner = &mut *guard;
        let HandleContext { callbacks, state } =
            inner.handles.remove(&id).ok_or(NetError::NotAttached)?;

        let transfer = match state {
            HandleState::Resolving {
                transfer, lookup, ..
            } => {
                inner.lookups.leave(lookup, id);
                transfer
            }
            HandleState::Active { handle } => {
                let removed = match inner.driver() {
                    Ok((engine, adapters)) => engine.remove(handle, adapters),
                    Err(e) => Err(Rejected::new(e, handle)),
                };
                match removed {
                    Ok(transfer) => transfer,
                    Err(Rejected { error, inner: handle }) => {
                        tracing::error!(transfer = %id, error = %error, "engine refused removal");
                        inner.handles.insert(
                            id,
                            HandleContext {
                                callbacks,
                                state: HandleState::Active { handle },
                            },
                        );
                        return Err(error);
                    }
                }
            }
        };
        drop(guard);
        drop(callbacks);
        tracing::debug!(transfer = %id, "transfer detached");
        Ok(transfer)
    }

    /// Tear the bridge down.
    ///
    /// Cancels the engine timer, releases every reactor registration and
    /// destroys the engine. Calling this with transfers still attached is a
    /// caller bug: it asserts in debug builds; release builds log, tear
    /// down anyway (dropping those transfers without callbacks) and return
    /// [`NetError::LiveTransfers`].
    pub fn destroy(self) -> Result<(), NetError> {
        let count = self.live_transfers();
        debug_assert!(count == 0, "bridge destroyed with {count} live transfers");
        if count > 0 {
            tracing::error!(count, "bridge destroyed with live transfers");
        }
        self.teardown();
        if count > 0 {
            return Err(NetError::LiveTransfers { count });
        }
        Ok(())
    }

    fn teardown(&self) {
        let Ok(mut guard) = self.shared.try_borrow_mut() else {
            tracing::error!("bridge torn down while busy");
            return;
        };
        let inner = &mut *guard;
        let Some(mut engine) = inner.engine.take() else {
            return;
        };

        // Transfers still in the engine are pulled out before it goes away.
        // Everything user-owned is dropped only after the borrow ends.
        let mut leftovers: Vec<(Callbacks<E>, Option<E::Transfer>)> = Vec::new();
        for (id, HandleContext { callbacks, state }) in inner.handles.drain() {
            let transfer = match state {
                HandleState::Resolving { transfer, .. } => Some(transfer),
                HandleState::Active { handle } => {
                    match engine.remove(handle, &mut inner.adapters) {
                        Ok(transfer) => Some(transfer),
                        Err(rejected) => {
                            tracing::error!(transfer = %id, error = %rejected.error, "engine refused removal at teardown");
                            None
                        }
                    }
                }
            };
            leftovers.push((callbacks, transfer));
        }
        inner.adapters.timer.cancel();
        inner.adapters.sockets.release_all();
        inner.lookups = Lookups::default();
        drop(guard);

        drop(leftovers);
        drop(engine);
        tracing::debug!("bridge destroyed");
    }

    /// The allocator handed to the engine.
    pub fn allocator(&self) -> Arc<dyn BlockAllocator> {
        Arc::clone(&self.shared.borrow().allocator)
    }

    /// Transfers attached and not yet finished or detached.
    pub fn live_transfers(&self) -> usize {
        self.shared.borrow().handles.len()
    }

    /// Sockets currently registered with the reactor.
    pub fn tracked_sockets(&self) -> usize {
        self.shared.borrow().adapters.sockets.len()
    }

    /// Whether an engine timer is pending.
    pub fn timer_armed(&self) -> bool {
        self.shared.borrow().adapters.timer.is_armed()
    }

    /// Stage of an attached transfer; [`LoadState::Idle`] if unknown.
    pub fn load_state(&self, id: TransferId) -> LoadState {
        self.shared
            .borrow()
            .handles
            .get(&id)
            .map_or(LoadState::Idle, HandleContext::load_state)
    }
}

impl<E: Engine + 'static> Drop for Bridge<E> {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl<E: Engine + 'static> std::fmt::Debug for Bridge<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.shared.try_borrow() {
            Ok(inner) => f
                .debug_struct("Bridge")
                .field("live_transfers", &inner.handles.len())
                .field("tracked_sockets", &inner.adapters.sockets.len())
                .field("timer_armed", &inner.adapters.timer.is_armed())
                .finish(),
            Err(_) => f.write_str("Bridge { <busy> }"),
        }
    }
}
