//! Multi-transfer engine interface.
//!
//! An engine runs many transfers at once but owns no event loop. It tells
//! its driver which sockets it wants watched and when it next needs a
//! timeout, and expects to be called back through
//! [`socket_action`](Engine::socket_action) and
//! [`timer_action`](Engine::timer_action). Finished transfers are queued
//! and popped with [`next_completion`](Engine::next_completion).
//!
//! The driver passes its [`EngineHooks`] into every call that can change
//! socket or timer state, so an engine never holds a reference back into
//! the driver.

#[cfg(feature = "curl")]
mod libcurl;

#[cfg(feature = "curl")]
pub use libcurl::{BodyCollector, CurlEngine, CurlHandle, CurlTransfer};

use crate::base::neterror::NetError;
use crate::memory::BlockAllocator;
use crate::reactor::{Interest, Readiness};
use std::fmt;
use std::net::IpAddr;
use std::ops::BitOr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Bridge-issued token identifying one attached transfer.
///
/// Tokens increase monotonically and are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(pub u64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What the engine wants from a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketInterest {
    Read,
    Write,
    ReadWrite,
    /// The engine no longer tracks the socket.
    Remove,
}

impl SocketInterest {
    /// Reactor directions for this interest; `Remove` maps to none.
    pub fn as_interest(self) -> Interest {
        match self {
            SocketInterest::Read => Interest::READ,
            SocketInterest::Write => Interest::WRITE,
            SocketInterest::ReadWrite => Interest::READ_WRITE,
            SocketInterest::Remove => Interest::NONE,
        }
    }
}

/// Events delivered to [`Engine::socket_action`].
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct EventMask(u8);

impl EventMask {
    pub const NONE: EventMask = EventMask(0);
    pub const READABLE: EventMask = EventMask(0b001);
    pub const WRITABLE: EventMask = EventMask(0b010);
    pub const ERROR: EventMask = EventMask(0b100);

    pub fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    pub fn is_error(self) -> bool {
        self.0 & Self::ERROR.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

impl From<Readiness> for EventMask {
    fn from(ready: Readiness) -> Self {
        let mut mask = EventMask::NONE;
        if ready.readable {
            mask = mask | EventMask::READABLE;
        }
        if ready.writable {
            mask = mask | EventMask::WRITABLE;
        }
        if ready.read_error || ready.write_error {
            mask = mask | EventMask::ERROR;
        }
        mask
    }
}

impl fmt::Debug for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = f.debug_set();
        if self.is_readable() {
            set.entry(&"READABLE");
        }
        if self.is_writable() {
            set.entry(&"WRITABLE");
        }
        if self.is_error() {
            set.entry(&"ERROR");
        }
        set.finish()
    }
}

/// A finished transfer reported by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub id: TransferId,
    pub result: Result<(), NetError>,
}

/// Something the engine refused, handed back with the reason.
///
/// Returned by [`Engine::add`] (carrying the transfer) and
/// [`Engine::remove`] (carrying the handle), and by `Bridge::attach`, so a
/// failed call never costs the caller what they passed in.
pub struct Rejected<T> {
    pub error: NetError,
    pub inner: T,
}

impl<T> Rejected<T> {
    pub fn new(error: NetError, inner: T) -> Self {
        Self { error, inner }
    }

    pub fn into_parts(self) -> (NetError, T) {
        (self.error, self.inner)
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T> fmt::Debug for Rejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl<T> fmt::Display for Rejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

impl<T> std::error::Error for Rejected<T> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl<T> From<Rejected<T>> for NetError {
    fn from(rejected: Rejected<T>) -> Self {
        rejected.error
    }
}

/// Settings handed to [`Engine::init`].
#[derive(Clone)]
pub struct EngineSettings {
    /// Allocator the engine should draw its memory from.
    pub allocator: Arc<dyn BlockAllocator>,
}

impl fmt::Debug for EngineSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineSettings")
            .field("allocator", &self.allocator.name())
            .finish()
    }
}

/// Callbacks an engine uses to ask its driver for socket and timer work.
///
/// Errors returned here are fed back to the engine, which surfaces them
/// from the action that triggered the hook.
pub trait EngineHooks {
    /// The engine's interest in `fd` changed.
    fn socket_interest(&mut self, fd: RawFd, interest: SocketInterest) -> Result<(), NetError>;

    /// Call [`Engine::timer_action`] after `deadline`; `None` cancels.
    fn timer_deadline(&mut self, deadline: Option<Duration>) -> Result<(), NetError>;
}

/// A multi-transfer engine driven from outside.
pub trait Engine {
    /// The caller's transfer object.
    type Transfer;
    /// Engine-side handle for a transfer while it is registered.
    type Handle;

    fn init(settings: EngineSettings) -> Result<Self, NetError>
    where
        Self: Sized;

    /// Start driving `transfer`. On failure the transfer comes back
    /// untouched and the engine holds nothing for `id`.
    fn add(
        &mut self,
        transfer: Self::Transfer,
        id: TransferId,
        hooks: &mut dyn EngineHooks,
    ) -> Result<Self::Handle, Rejected<Self::Transfer>>;

    /// Stop driving a transfer and hand it back. On failure the handle
    /// comes back and the transfer is still registered.
    fn remove(
        &mut self,
        handle: Self::Handle,
        hooks: &mut dyn EngineHooks,
    ) -> Result<Self::Transfer, Rejected<Self::Handle>>;

    /// Report events on `fd`.
    fn socket_action(
        &mut self,
        fd: RawFd,
        events: EventMask,
        hooks: &mut dyn EngineHooks,
    ) -> Result<(), NetError>;

    /// Report that the last requested deadline elapsed.
    fn timer_action(&mut self, hooks: &mut dyn EngineHooks) -> Result<(), NetError>;

    /// Pop one finished transfer, if any.
    fn next_completion(&mut self) -> Option<Completion>;

    /// The URL the transfer will fetch, used by the resolution hook.
    fn target_url(&self, transfer: &Self::Transfer) -> Option<Url>;

    /// Pin `host:port` to `addrs` for this transfer only.
    fn override_resolution(
        &self,
        transfer: &mut Self::Transfer,
        host: &str,
        port: u16,
        addrs: &[IpAddr],
    ) -> Result<(), NetError>;
}
