//! Timer adapter: the engine's single deadline mapped onto one reactor
//! timer.
//!
//! Every arm gets a new generation. A fire whose generation no longer
//! matches the armed one was superseded and is ignored.

use crate::base::neterror::NetError;
use crate::reactor::{Reactor, TimerId};
use std::rc::Rc;
use std::time::Duration;

/// Receives the generation of the timer that fired.
pub(crate) type FireHandler = Rc<dyn Fn(u64)>;

#[derive(Debug, Clone, Copy)]
struct ArmedTimer {
    id: TimerId,
    generation: u64,
}

pub(crate) struct TimerAdapter {
    reactor: Rc<dyn Reactor>,
    on_fire: FireHandler,
    armed: Option<ArmedTimer>,
    generation: u64,
}

impl TimerAdapter {
    pub(crate) fn new(reactor: Rc<dyn Reactor>, on_fire: FireHandler) -> Self {
        Self {
            reactor,
            on_fire,
            armed: None,
            generation: 0,
        }
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    pub(crate) fn update(&mut self, deadline: Option<Duration>) -> Result<(), NetError> {
        let Some(after) = deadline else {
            if self.cancel() {
                tracing::debug!("engine timer cancelled");
            }
            return Ok(());
        };

        self.cancel();
        self.generation += 1;
        let generation = self.generation;
        let on_fire = Rc::clone(&self.on_fire);
        let id = self
            .reactor
            .arm_timer(after, Box::new(move || on_fire(generation)))
            .inspect_err(|e| tracing::error!(?after, error = %e, "arming engine timer failed"))?;
        self.armed = Some(ArmedTimer { id, generation });
        tracing::debug!(?after, generation, "engine timer armed");
        Ok(())
    }

    /// Disarm the pending timer. Returns whether one was armed.
    pub(crate) fn cancel(&mut self) -> bool {
        match self.armed.take() {
            Some(timer) => {
                self.reactor.disarm_timer(timer.id);
                true
            }
            None => false,
        }
    }

    /// Mark the slot idle if `generation` is the armed timer.
    pub(crate) fn take_fired(&mut self, generation: u64) -> bool {
        match self.armed {
            Some(timer) if timer.generation == generation => {
                self.armed = None;
                true
            }
            _ => {
                tracing::trace!(generation, "ignoring superseded timer");
                false
            }
        }
    }
}
