//! Test doubles shared by the bridge integration tests.
//!
//! - `MockReactor`: records registrations and timers; tests fire readiness
//!   and timers by hand
//! - `MockEngine`: scripted engine; tests queue hook requests and
//!   completions through an `EngineControl`
//! - `MockResolver`: holds resolution callbacks until the test answers them

#![allow(dead_code)]

use reactornet::base::neterror::NetError;
use reactornet::dns::{HostResolver, Name, ResolveCallback};
use reactornet::engine::{
    Completion, Engine, EngineHooks, EngineSettings, EventMask, Rejected, SocketInterest,
    TransferId,
};
use reactornet::reactor::{
    Interest, Reactor, Readiness, ReadinessHandler, RegistrationId, TimerHandler, TimerId,
};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;
use url::Url;

// ---------------------------------------------------------------------------
// Reactor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactorCall {
    Register(RawFd),
    SetInterest(RawFd, Interest),
    Deregister(RawFd),
    ArmTimer(Duration),
    DisarmTimer,
}

struct Registration {
    fd: RawFd,
    interest: Interest,
    handler: ReadinessHandler,
}

#[derive(Default)]
struct ReactorState {
    next_id: u64,
    registrations: HashMap<RegistrationId, Registration>,
    timers: HashMap<TimerId, (Duration, TimerHandler)>,
    calls: Vec<ReactorCall>,
    fail_register: bool,
}

#[derive(Default)]
pub struct MockReactor {
    state: RefCell<ReactorState>,
}

impl MockReactor {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<ReactorCall> {
        self.state.borrow().calls.clone()
    }

    pub fn count(&self, matches: impl Fn(&ReactorCall) -> bool) -> usize {
        self.state.borrow().calls.iter().filter(|c| matches(c)).count()
    }

    pub fn registrations(&self) -> usize {
        self.state.borrow().registrations.len()
    }

    pub fn interest(&self, fd: RawFd) -> Option<Interest> {
        self.state
            .borrow()
            .registrations
            .values()
            .find(|r| r.fd == fd)
            .map(|r| r.interest)
    }

    pub fn armed_timers(&self) -> usize {
        self.state.borrow().timers.len()
    }

    pub fn armed_deadlines(&self) -> Vec<Duration> {
        self.state.borrow().timers.values().map(|(d, _)| *d).collect()
    }

    pub fn fail_registrations(&self, fail: bool) {
        self.state.borrow_mut().fail_register = fail;
    }

    /// Dispatch readiness for `fd`. Returns false if `fd` is not registered.
    pub fn fire_ready(&self, fd: RawFd, readiness: Readiness) -> bool {
        let handler = self
            .state
            .borrow()
            .registrations
            .values()
            .find(|r| r.fd == fd && !r.interest.is_none())
            .map(|r| Rc::clone(&r.handler));
        match handler {
            Some(handler) => {
                handler(fd, readiness);
                true
            }
            None => false,
        }
    }

    /// Fire every armed timer. Returns how many fired.
    pub fn fire_timers(&self) -> usize {
        let timers: Vec<_> = self.state.borrow_mut().timers.drain().collect();
        let fired = timers.len();
        for (_, (_, on_fire)) in timers {
            on_fire();
        }
        fired
    }
}

impl Reactor for MockReactor {
    fn register(&self, fd: RawFd, handler: ReadinessHandler) -> Result<RegistrationId, NetError> {
        let mut state = self.state.borrow_mut();
        if state.fail_register {
            return Err(NetError::InsufficientResources);
        }
        state.next_id += 1;
        let id = RegistrationId(state.next_id);
        state.registrations.insert(
            id,
            Registration {
                fd,
                interest: Interest::NONE,
                handler,
            },
        );
        state.calls.push(ReactorCall::Register(fd));
        Ok(id)
    }

    fn set_interest(&self, id: RegistrationId, interest: Interest) -> Result<(), NetError> {
        let mut state = self.state.borrow_mut();
        let registration = state
            .registrations
            .get_mut(&id)
            .ok_or(NetError::InvalidRegistration)?;
        registration.interest = interest;
        let fd = registration.fd;
        state.calls.push(ReactorCall::SetInterest(fd, interest));
        Ok(())
    }

    fn deregister(&self, id: RegistrationId) -> Result<(), NetError> {
        let mut state = self.state.borrow_mut();
        let registration = state
            .registrations
            .remove(&id)
            .ok_or(NetError::InvalidRegistration)?;
        state.calls.push(ReactorCall::Deregister(registration.fd));
        Ok(())
    }

    fn arm_timer(&self, after: Duration, on_fire: TimerHandler) -> Result<TimerId, NetError> {
        let mut state = self.state.borrow_mut();
        state.next_id += 1;
        let id = TimerId(state.next_id);
        state.timers.insert(id, (after, on_fire));
        state.calls.push(ReactorCall::ArmTimer(after));
        Ok(id)
    }

    fn disarm_timer(&self, id: TimerId) {
        let mut state = self.state.borrow_mut();
        if state.timers.remove(&id).is_some() {
            state.calls.push(ReactorCall::DisarmTimer);
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// A caller's transfer: opaque user data plus the target URL.
#[derive(Debug, Clone, PartialEq)]
pub struct MockTransfer {
    pub user_data: u64,
    pub url: Url,
    pub pinned: Vec<(String, u16, Vec<IpAddr>)>,
}

impl MockTransfer {
    pub fn new(user_data: u64, url: &str) -> Self {
        Self {
            user_data,
            url: Url::parse(url).unwrap(),
            pinned: Vec::new(),
        }
    }
}

/// Engine handle: the engine keeps the transfer while it runs.
pub struct MockHandle {
    id: TransferId,
    transfer: MockTransfer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookRequest {
    Socket(RawFd, SocketInterest),
    Timer(Option<Duration>),
}

#[derive(Default)]
pub struct EngineState {
    pub added: Vec<TransferId>,
    pub removed: Vec<TransferId>,
    pub socket_actions: Vec<(RawFd, EventMask)>,
    pub timer_actions: usize,
    pub hook_errors: Vec<NetError>,
    pub reject_add: bool,
    /// Refuse to release handles; the transfer keeps running.
    pub reject_remove: bool,
    /// Hook requests replayed on every add.
    pub on_add: Vec<HookRequest>,
    /// Hook requests replayed on every remove.
    pub on_remove: Vec<HookRequest>,
    pending_hooks: VecDeque<HookRequest>,
    completions: VecDeque<Completion>,
    running: Vec<TransferId>,
}

/// Test-side control of a [`MockEngine`].
#[derive(Clone, Default)]
pub struct EngineControl {
    state: Rc<RefCell<EngineState>>,
}

impl EngineControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn engine(&self) -> MockEngine {
        MockEngine {
            state: Rc::clone(&self.state),
        }
    }

    pub fn state(&self) -> std::cell::Ref<'_, EngineState> {
        self.state.borrow()
    }

    pub fn configure(&self, f: impl FnOnce(&mut EngineState)) {
        f(&mut self.state.borrow_mut());
    }

    /// Queue a hook request for the next engine call.
    pub fn request(&self, hook: HookRequest) {
        self.state.borrow_mut().pending_hooks.push_back(hook);
    }

    /// Report `id` finished on the next drain.
    pub fn complete(&self, id: TransferId, result: Result<(), NetError>) {
        self.state
            .borrow_mut()
            .completions
            .push_back(Completion { id, result });
    }

    /// Finish every running transfer successfully.
    pub fn complete_all(&self) {
        let mut state = self.state.borrow_mut();
        let running = state.running.clone();
        for id in running {
            state.completions.push_back(Completion { id, result: Ok(()) });
        }
    }

    pub fn running(&self) -> Vec<TransferId> {
        self.state.borrow().running.clone()
    }
}

pub struct MockEngine {
    state: Rc<RefCell<EngineState>>,
}

impl MockEngine {
    fn replay(&self, extra: &[HookRequest], hooks: &mut dyn EngineHooks) -> Result<(), NetError> {
        let mut requests: Vec<HookRequest> = extra.to_vec();
        requests.extend(self.state.borrow_mut().pending_hooks.drain(..));

        let mut first_error = None;
        for request in requests {
            let result = match request {
                HookRequest::Socket(fd, interest) => hooks.socket_interest(fd, interest),
                HookRequest::Timer(deadline) => hooks.timer_deadline(deadline),
            };
            if let Err(e) = result {
                self.state.borrow_mut().hook_errors.push(e.clone());
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Engine for MockEngine {
    type Transfer = MockTransfer;
    type Handle = MockHandle;

    fn init(_settings: EngineSettings) -> Result<Self, NetError> {
        Err(NetError::EngineInitFailed("mock engine needs an EngineControl".into()))
    }

    fn add(
        &mut self,
        transfer: MockTransfer,
        id: TransferId,
        hooks: &mut dyn EngineHooks,
    ) -> Result<MockHandle, Rejected<MockTransfer>> {
        if self.state.borrow().reject_add {
            return Err(Rejected::new(
                NetError::EngineFailure {
                    code: 2,
                    message: "rejected".into(),
                },
                transfer,
            ));
        }
        let on_add = {
            let mut state = self.state.borrow_mut();
            state.added.push(id);
            state.running.push(id);
            state.on_add.clone()
        };
        let handle = MockHandle { id, transfer };
        match self.replay(&on_add, hooks) {
            Ok(()) => Ok(handle),
            Err(e) => {
                let mut state = self.state.borrow_mut();
                state.added.retain(|&a| a != id);
                state.running.retain(|&r| r != id);
                Err(Rejected::new(e, handle.transfer))
            }
        }
    }

    fn remove(
        &mut self,
        handle: MockHandle,
        hooks: &mut dyn EngineHooks,
    ) -> Result<MockTransfer, Rejected<MockHandle>> {
        if self.state.borrow().reject_remove {
            return Err(Rejected::new(
                NetError::EngineFailure {
                    code: 3,
                    message: "bad easy handle".into(),
                },
                handle,
            ));
        }
        let on_remove = {
            let mut state = self.state.borrow_mut();
            state.removed.push(handle.id);
            state.running.retain(|&r| r != handle.id);
            state.completions.retain(|c| c.id != handle.id);
            state.on_remove.clone()
        };
        let _ = self.replay(&on_remove, hooks);
        Ok(handle.transfer)
    }

    fn socket_action(
        &mut self,
        fd: RawFd,
        events: EventMask,
        hooks: &mut dyn EngineHooks,
    ) -> Result<(), NetError> {
        self.state.borrow_mut().socket_actions.push((fd, events));
        self.replay(&[], hooks)
    }

    fn timer_action(&mut self, hooks: &mut dyn EngineHooks) -> Result<(), NetError> {
        self.state.borrow_mut().timer_actions += 1;
        self.replay(&[], hooks)
    }

    fn next_completion(&mut self) -> Option<Completion> {
        self.state.borrow_mut().completions.pop_front()
    }

    fn target_url(&self, transfer: &MockTransfer) -> Option<Url> {
        Some(transfer.url.clone())
    }

    fn override_resolution(
        &self,
        transfer: &mut MockTransfer,
        host: &str,
        port: u16,
        addrs: &[IpAddr],
    ) -> Result<(), NetError> {
        transfer
            .pinned
            .push((host.to_string(), port, addrs.to_vec()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockResolver {
    pending: RefCell<Vec<(Name, Duration, ResolveCallback)>>,
    calls: RefCell<Vec<(Name, Duration)>>,
}

impl MockResolver {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<(Name, Duration)> {
        self.calls.borrow().clone()
    }

    pub fn pending(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Answer the oldest pending lookup for `host`.
    pub fn answer(&self, host: &str, result: Result<Vec<IpAddr>, NetError>) -> bool {
        let done = {
            let mut pending = self.pending.borrow_mut();
            match pending.iter().position(|(name, _, _)| name.as_str() == host) {
                Some(index) => pending.remove(index).2,
                None => return false,
            }
        };
        done(result);
        true
    }
}

impl HostResolver for MockResolver {
    fn resolve(&self, name: Name, timeout: Duration, done: ResolveCallback) {
        self.calls.borrow_mut().push((name.clone(), timeout));
        self.pending.borrow_mut().push((name, timeout, done));
    }
}

// ---------------------------------------------------------------------------
// Callback recording
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(MockTransfer),
    Failure(MockTransfer, NetError),
}

/// Collects callback outcomes in the order they fire.
#[derive(Clone, Default)]
pub struct Outcomes {
    inner: Rc<RefCell<Vec<Outcome>>>,
}

impl Outcomes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_success(&self) -> impl FnOnce(MockTransfer) + 'static {
        let inner = Rc::clone(&self.inner);
        move |t| inner.borrow_mut().push(Outcome::Success(t))
    }

    pub fn on_failure(&self) -> impl FnOnce(MockTransfer, NetError) + 'static {
        let inner = Rc::clone(&self.inner);
        move |t, e| inner.borrow_mut().push(Outcome::Failure(t, e))
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().len()
    }

    pub fn all(&self) -> Vec<Outcome> {
        self.inner.borrow().clone()
    }
}
