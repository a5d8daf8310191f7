//! Per-transfer context.
//!
//! A [`HandleContext`] lives from admission until the transfer completes or
//! is detached. It holds the user's callbacks and, depending on the stage,
//! either the transfer itself (waiting on the resolution hook) or the
//! engine handle (registered with the engine).

use crate::base::loadstate::LoadState;
use crate::base::neterror::NetError;
use crate::dns::Name;
use crate::engine::Engine;

/// Invoked with the transfer when it finishes successfully.
pub type SuccessCallback<T> = Box<dyn FnOnce(T)>;

/// Invoked with the transfer and the reason it failed.
pub type FailureCallback<T> = Box<dyn FnOnce(T, NetError)>;

pub(crate) struct Callbacks<E: Engine> {
    on_success: SuccessCallback<E::Transfer>,
    on_failure: FailureCallback<E::Transfer>,
}

impl<E: Engine> Callbacks<E> {
    pub(crate) fn new(
        on_success: SuccessCallback<E::Transfer>,
        on_failure: FailureCallback<E::Transfer>,
    ) -> Self {
        Self {
            on_success,
            on_failure,
        }
    }

    /// Hand the transfer back through exactly one callback. Must run with
    /// no bridge borrow held.
    pub(crate) fn finish(self, transfer: E::Transfer, result: Result<(), NetError>) {
        match result {
            Ok(()) => (self.on_success)(transfer),
            Err(e) => (self.on_failure)(transfer, e),
        }
    }
}

pub(crate) enum HandleState<E: Engine> {
    /// Held back until the resolution hook answers.
    Resolving {
        transfer: E::Transfer,
        host: Name,
        port: u16,
        lookup: u64,
    },
    /// Registered with the engine.
    Active { handle: E::Handle },
}

pub(crate) struct HandleContext<E: Engine> {
    pub(crate) callbacks: Callbacks<E>,
    pub(crate) state: HandleState<E>,
}

impl<E: Engine> HandleContext<E> {
    pub(crate) fn load_state(&self) -> LoadState {
        match self.state {
            HandleState::Resolving { .. } => LoadState::ResolvingHost,
            HandleState::Active { .. } => LoadState::Active,
        }
    }
}
