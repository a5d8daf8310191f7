//! Host reactor interface.
//!
//! The reactor owns the only poll loop in the process. The bridge consumes
//! it through the [`Reactor`] trait: descriptor registrations with a
//! readiness callback, and one-shot timers with a fire callback. Everything
//! runs on the reactor's thread, so handlers are `Rc`/`Box` closures with no
//! `Send` bound.
//!
//! [`TokioReactor`] implements the trait on top of a tokio `LocalSet`.

mod localset;

pub use localset::TokioReactor;

use crate::base::neterror::NetError;
use std::fmt;
use std::ops::BitOr;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

/// Identifies a descriptor registration inside a reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationId(pub u64);

/// Identifies an armed one-shot timer inside a reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

/// Directions a registration dispatches for.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READ: Interest = Interest(0b01);
    pub const WRITE: Interest = Interest(0b10);
    pub const READ_WRITE: Interest = Interest(0b11);

    pub fn is_readable(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Interest::NONE => "NONE",
            Interest::READ => "READ",
            Interest::WRITE => "WRITE",
            _ => "READ_WRITE",
        };
        f.write_str(name)
    }
}

/// Per-direction readiness reported by the reactor for one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub read_error: bool,
    pub write_error: bool,
}

impl Readiness {
    pub fn readable() -> Self {
        Self {
            readable: true,
            ..Self::default()
        }
    }

    pub fn writable() -> Self {
        Self {
            writable: true,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.readable || self.writable || self.read_error || self.write_error)
    }
}

/// Called on the reactor thread when a registered descriptor is ready.
pub type ReadinessHandler = Rc<dyn Fn(RawFd, Readiness)>;

/// Called once on the reactor thread when a timer expires.
pub type TimerHandler = Box<dyn FnOnce()>;

/// A single-threaded, callback-driven event loop.
///
/// Implementations must never invoke handlers synchronously from inside
/// these methods; dispatch happens from the loop itself.
pub trait Reactor {
    /// Start tracking `fd`. No directions are enabled until
    /// [`set_interest`](Reactor::set_interest) is called.
    fn register(&self, fd: RawFd, handler: ReadinessHandler) -> Result<RegistrationId, NetError>;

    /// Enable exactly the directions in `interest`.
    fn set_interest(&self, id: RegistrationId, interest: Interest) -> Result<(), NetError>;

    /// Stop tracking. The descriptor number is free for a new registration
    /// as soon as this returns.
    fn deregister(&self, id: RegistrationId) -> Result<(), NetError>;

    /// Arm a one-shot timer.
    fn arm_timer(&self, after: Duration, on_fire: TimerHandler) -> Result<TimerId, NetError>;

    /// Disarm a timer. Unknown or already-fired ids are ignored.
    fn disarm_timer(&self, id: TimerId);
}

impl<R: Reactor + ?Sized> Reactor for Rc<R> {
    fn register(&self, fd: RawFd, handler: ReadinessHandler) -> Result<RegistrationId, NetError> {
        (**self).register(fd, handler)
    }

    fn set_interest(&self, id: RegistrationId, interest: Interest) -> Result<(), NetError> {
        (**self).set_interest(id, interest)
    }

    fn deregister(&self, id: RegistrationId) -> Result<(), NetError> {
        (**self).deregister(id)
    }

    fn arm_timer(&self, after: Duration, on_fire: TimerHandler) -> Result<TimerId, NetError> {
        (**self).arm_timer(after, on_fire)
    }

    fn disarm_timer(&self, id: TimerId) {
        (**self).disarm_timer(id)
    }
}
