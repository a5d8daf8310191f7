//! Reactor implementation on a tokio current-thread `LocalSet`.
//!
//! Each registration wraps the descriptor in an [`AsyncFd`] and runs one
//! local task that waits for the enabled directions and calls the handler.
//! tokio reports readiness edge-triggered; the engine on the other side
//! expects level-triggered notifications (it may not drain a socket in one
//! go), so after every dispatch the task re-checks the descriptor with a
//! zero-timeout `poll(2)` and keeps dispatching while it stays ready.
//! A descriptor the handler never drains (a hung-up peer nobody reads, for
//! one) would keep that loop hot, so after a bounded number of yields the
//! re-checks back off exponentially, up to 50ms apart, until the
//! descriptor goes quiet or a fresh edge arrives.

use super::{Interest, Reactor, Readiness, ReadinessHandler, RegistrationId, TimerHandler, TimerId};
use crate::base::context::IoResultExt;
use crate::base::neterror::NetError;
use futures::future::poll_fn;
use std::cell::RefCell;
use std::collections::HashMap;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Level re-checks per wakeup before yielding to other local tasks.
const LEVEL_ROUNDS: usize = 16;

/// Yields a descriptor may stay ready for before dispatch backs off.
const LEVEL_YIELDS: u32 = 64;
const LEVEL_BACKOFF_MIN: Duration = Duration::from_millis(1);
const LEVEL_BACKOFF_MAX: Duration = Duration::from_millis(50);

/// Borrowed descriptor; the engine owns and closes the socket.
struct SocketFd(RawFd);

impl AsRawFd for SocketFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

struct SlotState {
    io: Option<AsyncFd<SocketFd>>,
    interest: Interest,
    waker: Option<Waker>,
}

struct Slot {
    fd: RawFd,
    state: RefCell<SlotState>,
}

impl Slot {
    fn wake(&self) {
        if let Some(waker) = self.state.borrow_mut().waker.take() {
            waker.wake();
        }
    }

    /// `Ready(None)` once the registration has been released.
    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<Option<Readiness>> {
        let mut state = self.state.borrow_mut();
        let interest = state.interest;
        let mut readiness = Readiness::default();

        {
            let Some(io) = state.io.as_ref() else {
                return Poll::Ready(None);
            };

            if interest.is_readable() {
                match io.poll_read_ready(cx) {
                    Poll::Ready(Ok(mut guard)) => {
                        let ready = guard.ready();
                        readiness.readable = ready.is_readable() || ready.is_read_closed();
                        readiness.read_error = ready.is_error();
                        guard.clear_ready();
                    }
                    Poll::Ready(Err(_)) => readiness.read_error = true,
                    Poll::Pending => {}
                }
            }

            if interest.is_writable() {
                match io.poll_write_ready(cx) {
                    Poll::Ready(Ok(mut guard)) => {
                        let ready = guard.ready();
                        readiness.writable = ready.is_writable() || ready.is_write_closed();
                        readiness.write_error = ready.is_error();
                        guard.clear_ready();
                    }
                    Poll::Ready(Err(_)) => readiness.write_error = true,
                    Poll::Pending => {}
                }
            }
        }

        if readiness.is_empty() {
            state.waker = Some(cx.waker().clone());
            Poll::Pending
        } else {
            Poll::Ready(Some(readiness))
        }
    }

    /// Zero-timeout `poll(2)` for the enabled directions.
    fn level_check(&self) -> Option<Readiness> {
        let interest = {
            let state = self.state.borrow();
            if state.io.is_none() || state.interest.is_none() {
                return None;
            }
            state.interest
        };

        let mut events: libc::c_short = 0;
        if interest.is_readable() {
            events |= libc::POLLIN;
        }
        if interest.is_writable() {
            events |= libc::POLLOUT;
        }
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events,
            revents: 0,
        };
        // SAFETY: one valid pollfd, zero timeout.
        let n = unsafe { libc::poll(&mut pfd, 1, 0) };
        if n <= 0 {
            return None;
        }

        let failed = pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0;
        let readiness = Readiness {
            readable: interest.is_readable() && pfd.revents & (libc::POLLIN | libc::POLLHUP) != 0,
            writable: interest.is_writable() && pfd.revents & libc::POLLOUT != 0,
            read_error: interest.is_readable() && failed,
            write_error: interest.is_writable() && failed,
        };
        (!readiness.is_empty()).then_some(readiness)
    }
}

async fn dispatch_loop(slot: Rc<Slot>, handler: ReadinessHandler) {
    'edge: loop {
        let Some(readiness) = poll_fn(|cx| slot.poll_ready(cx)).await else {
            break;
        };
        tracing::trace!(fd = slot.fd, ?readiness, "descriptor ready");
        handler(slot.fd, readiness);

        let mut yields = 0;
        let mut backoff = LEVEL_BACKOFF_MIN;
        loop {
            for _ in 0..LEVEL_ROUNDS {
                match slot.level_check() {
                    Some(readiness) => handler(slot.fd, readiness),
                    None => continue 'edge,
                }
            }
            if yields < LEVEL_YIELDS {
                yields += 1;
                tokio::task::yield_now().await;
                continue;
            }
            if backoff == LEVEL_BACKOFF_MIN {
                tracing::debug!(fd = slot.fd, "descriptor stays ready without progress, backing off");
            }
            // Sleep between re-checks, waking early on a fresh edge.
            match tokio::time::timeout(backoff, poll_fn(|cx| slot.poll_ready(cx))).await {
                Ok(Some(readiness)) => handler(slot.fd, readiness),
                Ok(None) => break 'edge,
                Err(_) => backoff = (backoff * 2).min(LEVEL_BACKOFF_MAX),
            }
        }
    }
    tracing::trace!(fd = slot.fd, "dispatch task finished");
}

#[derive(Default)]
struct State {
    next_registration: u64,
    next_timer: u64,
    registrations: HashMap<RegistrationId, Rc<Slot>>,
    timers: HashMap<TimerId, JoinHandle<()>>,
}

/// [`Reactor`] backed by the current tokio runtime and `LocalSet`.
///
/// Readiness is redelivered while a descriptor stays ready. If the handler
/// stops making progress, redelivery slows to at most one round every
/// 50ms instead of spinning the `LocalSet`.
///
/// # Panics
///
/// `register` and `arm_timer` spawn local tasks and therefore must be
/// called from inside a `LocalSet` (for example under
/// `LocalSet::run_until` or `LocalSet::block_on`).
pub struct TokioReactor {
    handle: Handle,
    state: Rc<RefCell<State>>,
}

impl TokioReactor {
    /// Bind to the tokio runtime of the calling thread.
    pub fn new() -> Result<Self, NetError> {
        let handle = Handle::try_current().map_err(|e| {
            tracing::error!(error = %e, "no tokio runtime for reactor");
            NetError::Unexpected
        })?;
        Ok(Self {
            handle,
            state: Rc::new(RefCell::new(State::default())),
        })
    }

    /// Live descriptor registrations.
    pub fn registration_count(&self) -> usize {
        self.state.borrow().registrations.len()
    }

    /// Timers armed and not yet fired.
    pub fn armed_timers(&self) -> usize {
        self.state.borrow().timers.len()
    }

    fn slot(&self, id: RegistrationId) -> Result<Rc<Slot>, NetError> {
        self.state
            .borrow()
            .registrations
            .get(&id)
            .cloned()
            .ok_or(NetError::InvalidRegistration)
    }
}

impl std::fmt::Debug for TokioReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("TokioReactor")
            .field("registrations", &state.registrations.len())
            .field("timers", &state.timers.len())
            .finish()
    }
}

impl Reactor for TokioReactor {
    fn register(&self, fd: RawFd, handler: ReadinessHandler) -> Result<RegistrationId, NetError> {
        let _enter = self.handle.enter();
        let io = AsyncFd::with_interest(
            SocketFd(fd),
            tokio::io::Interest::READABLE | tokio::io::Interest::WRITABLE,
        )
        .registration_context(fd)?;

        let slot = Rc::new(Slot {
            fd,
            state: RefCell::new(SlotState {
                io: Some(io),
                interest: Interest::NONE,
                waker: None,
            }),
        });
        tokio::task::spawn_local(dispatch_loop(Rc::clone(&slot), handler));

        let mut state = self.state.borrow_mut();
        state.next_registration += 1;
        let id = RegistrationId(state.next_registration);
        state.registrations.insert(id, slot);
        Ok(id)
    }

    fn set_interest(&self, id: RegistrationId, interest: Interest) -> Result<(), NetError> {
        let slot = self.slot(id)?;
        slot.state.borrow_mut().interest = interest;
        slot.wake();
        Ok(())
    }

    fn deregister(&self, id: RegistrationId) -> Result<(), NetError> {
        let slot = self
            .state
            .borrow_mut()
            .registrations
            .remove(&id)
            .ok_or(NetError::InvalidRegistration)?;
        // Dropping the AsyncFd removes the descriptor from epoll right away.
        let io = {
            let mut state = slot.state.borrow_mut();
            state.interest = Interest::NONE;
            state.io.take()
        };
        drop(io);
        slot.wake();
        Ok(())
    }

    fn arm_timer(&self, after: Duration, on_fire: TimerHandler) -> Result<TimerId, NetError> {
        let deadline = tokio::time::Instant::now().checked_add(after).ok_or_else(|| {
            tracing::warn!(?after, "timer deadline out of range");
            NetError::TimerFailed
        })?;
        let id = {
            let mut state = self.state.borrow_mut();
            state.next_timer += 1;
            TimerId(state.next_timer)
        };

        let state = Rc::clone(&self.state);
        let task = tokio::task::spawn_local(async move {
            tokio::time::sleep_until(deadline).await;
            state.borrow_mut().timers.remove(&id);
            on_fire();
        });
        self.state.borrow_mut().timers.insert(id, task);
        Ok(id)
    }

    fn disarm_timer(&self, id: TimerId) {
        if let Some(task) = self.state.borrow_mut().timers.remove(&id) {
            task.abort();
        }
    }
}

impl Drop for TokioReactor {
    fn drop(&mut self) {
        let mut state = self.state.borrow_mut();
        for (_, task) in state.timers.drain() {
            task.abort();
        }
        for (_, slot) in state.registrations.drain() {
            let io = slot.state.borrow_mut().io.take();
            drop(io);
            slot.wake();
        }
    }
}
