/// Where an attached transfer currently sits inside the bridge.
/// Named after the matching states in net/base/load_states.h.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadState {
    /// Not attached to a bridge.
    #[default]
    Idle,

    /// Waiting for the host resolver before the engine sees the transfer.
    ResolvingHost,

    /// Registered with the transfer engine; I/O is in progress.
    Active,
}

impl LoadState {
    /// True once the engine owns the transfer.
    pub fn is_active(self) -> bool {
        matches!(self, LoadState::Active)
    }
}
