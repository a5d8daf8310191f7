//! Socket event adapter.
//!
//! Keeps one reactor registration per socket the engine is watching.
//! Registration is lazy (first active interest), interest changes keep the
//! registration, and removal releases it before returning so a recycled
//! descriptor number starts from scratch.

use crate::base::neterror::NetError;
use crate::engine::SocketInterest;
use crate::reactor::{Interest, Reactor, ReadinessHandler, RegistrationId};
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::rc::Rc;

#[derive(Debug, Clone, Copy)]
struct SocketRegistration {
    id: RegistrationId,
    interest: Interest,
}

pub(crate) struct SocketAdapter {
    reactor: Rc<dyn Reactor>,
    on_ready: ReadinessHandler,
    sockets: HashMap<RawFd, SocketRegistration>,
}

impl SocketAdapter {
    pub(crate) fn new(reactor: Rc<dyn Reactor>, on_ready: ReadinessHandler) -> Self {
        Self {
            reactor,
            on_ready,
            sockets: HashMap::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.sockets.len()
    }

    pub(crate) fn update(&mut self, fd: RawFd, interest: SocketInterest) -> Result<(), NetError> {
        let wanted = interest.as_interest();

        if wanted.is_none() {
            return self.release(fd);
        }

        if let Some(registration) = self.sockets.get_mut(&fd) {
            if registration.interest == wanted {
                return Ok(());
            }
            self.reactor
                .set_interest(registration.id, wanted)
                .inspect_err(|e| tracing::error!(fd, ?wanted, error = %e, "updating socket interest failed"))?;
            tracing::debug!(fd, from = ?registration.interest, to = ?wanted, "socket interest changed");
            registration.interest = wanted;
            return Ok(());
        }

        let id = self
            .reactor
            .register(fd, Rc::clone(&self.on_ready))
            .inspect_err(|e| tracing::error!(fd, error = %e, "registering socket failed"))?;
        if let Err(e) = self.reactor.set_interest(id, wanted) {
            tracing::error!(fd, ?wanted, error = %e, "enabling socket interest failed");
            if let Err(e) = self.reactor.deregister(id) {
                tracing::error!(fd, error = %e, "rolling back socket registration failed");
            }
            return Err(e);
        }
        self.sockets.insert(
            fd,
            SocketRegistration {
                id,
                interest: wanted,
            },
        );
        tracing::debug!(fd, interest = ?wanted, registration = id.0, "socket tracked");
        Ok(())
    }

    fn release(&mut self, fd: RawFd) -> Result<(), NetError> {
        let Some(registration) = self.sockets.remove(&fd) else {
            tracing::trace!(fd, "removal for untracked socket");
            return Ok(());
        };
        self.reactor
            .deregister(registration.id)
            .inspect_err(|e| tracing::error!(fd, error = %e, "releasing socket failed"))?;
        tracing::debug!(fd, registration = registration.id.0, "socket released");
        Ok(())
    }

    /// Drop every registration, logging failures.
    pub(crate) fn release_all(&mut self) {
        for (fd, registration) in self.sockets.drain() {
            if let Err(e) = self.reactor.deregister(registration.id) {
                tracing::error!(fd, error = %e, "releasing socket during teardown failed");
            }
        }
    }
}
