//! Completion drain.
//!
//! Runs after every engine action. Each finished transfer is removed from
//! the engine under a short borrow; the borrow is released before the
//! user's callback runs with the transfer. A transfer the engine will not
//! release keeps its context and stays attached.

use super::handle::{HandleContext, HandleState};
use super::Shared;
use crate::engine::{Completion, Engine, Rejected};

pub(crate) fn drain<E: Engine + 'static>(shared: &Shared<E>) {
    loop {
        let (callbacks, transfer, result) = {
            let Ok(mut guard) = shared.try_borrow_mut() else {
                tracing::warn!("completion drain skipped: bridge busy");
                return;
            };
            let inner = &mut *guard;
            let Some(engine) = inner.engine.as_mut() else {
                return;
            };
            let Some(Completion { id, result }) = engine.next_completion() else {
                return;
            };

            let Some(HandleContext { callbacks, state }) = inner.handles.remove(&id) else {
                tracing::warn!(transfer = %id, "completion for unknown transfer");
                continue;
            };
            let handle = match state {
                HandleState::Active { handle } => handle,
                state @ HandleState::Resolving { .. } => {
                    tracing::warn!(transfer = %id, "completion for transfer the engine never saw");
                    inner.handles.insert(id, HandleContext { callbacks, state });
                    continue;
                }
            };

            let removed = match inner.driver() {
                Ok((engine, adapters)) => engine.remove(handle, adapters),
                Err(e) => Err(Rejected::new(e, handle)),
            };
            let transfer = match removed {
                Ok(transfer) => transfer,
                // Still registered with the engine: keep the context so the
                // transfer can be detached later.
                Err(Rejected { error, inner: handle }) => {
                    tracing::error!(transfer = %id, error = %error, "removing finished transfer failed");
                    inner.handles.insert(
                        id,
                        HandleContext {
                            callbacks,
                            state: HandleState::Active { handle },
                        },
                    );
                    continue;
                }
            };
            tracing::debug!(transfer = %id, success = result.is_ok(), "transfer finished");
            (callbacks, transfer, result)
        };

        callbacks.finish(transfer, result);
    }
}
