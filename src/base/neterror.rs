use std::os::fd::RawFd;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum NetError {
    // Generic Errors
    #[error("Operation failed")]
    Failed,
    #[error("Operation aborted")]
    Aborted,
    #[error("Invalid argument")]
    InvalidArgument,
    #[error("Operation timed out")]
    TimedOut,
    #[error("Unexpected error")]
    Unexpected,
    #[error("Insufficient resources (descriptor limit reached)")]
    InsufficientResources,
    #[error("Out of memory")]
    OutOfMemory,

    // Reactor Errors
    #[error("Registering socket {fd} with the reactor failed: {source}")]
    SocketRegistrationFailed {
        fd: RawFd,
        #[source]
        source: Arc<std::io::Error>,
    },
    #[error("Unknown reactor registration")]
    InvalidRegistration,
    #[error("Arming reactor timer failed")]
    TimerFailed,
    #[error("Reactor dispatched into a bridge that is already busy")]
    ReentrantDispatch,

    // Engine Errors
    #[error("Transfer engine initialization failed: {0}")]
    EngineInitFailed(String),
    #[error("Transfer engine error {code}: {message}")]
    EngineFailure { code: i32, message: String },
    #[error("Transfer already attached")]
    AlreadyAttached,
    #[error("Transfer not attached")]
    NotAttached,
    #[error("Transfer failed with engine code {code}: {message}")]
    TransferFailed { code: i32, message: String },
    #[error("Bridge destroyed with {count} live transfers")]
    LiveTransfers { count: usize },

    // DNS Errors
    #[error("Name not resolved")]
    NameNotResolved,
    #[error("Failed to resolve '{domain}': {source}")]
    NameNotResolvedFor {
        domain: String,
        #[source]
        source: Arc<std::io::Error>,
    },
    #[error("Resolving '{domain}' timed out")]
    NameResolutionTimedOut { domain: String },
    #[error("Name resolution failed")]
    NameResolutionFailed,

    // URL Errors
    #[error("Invalid URL")]
    InvalidUrl,
    #[error("Unknown URL scheme")]
    UnknownUrlScheme,

    #[error("Unknown error code {0}")]
    Unknown(i32),
}

impl NetError {
    pub fn as_i32(&self) -> i32 {
        match self {
            NetError::Failed => -2,
            NetError::Aborted => -3,
            NetError::InvalidArgument => -4,
            NetError::TimedOut => -7,
            NetError::Unexpected => -9,
            NetError::InsufficientResources => -12,
            NetError::OutOfMemory => -13,
            NetError::NameNotResolved => -105,
            NetError::NameNotResolvedFor { .. } => -105,
            NetError::NameResolutionFailed => -137,
            NetError::InvalidUrl => -300,
            NetError::UnknownUrlScheme => -302,

            // Bridge-specific codes (Custom range -20000)
            NetError::SocketRegistrationFailed { .. } => -20000,
            NetError::InvalidRegistration => -20002,
            NetError::TimerFailed => -20003,
            NetError::ReentrantDispatch => -20004,
            NetError::EngineInitFailed(_) => -20010,
            NetError::EngineFailure { .. } => -20011,
            NetError::AlreadyAttached => -20012,
            NetError::NotAttached => -20013,
            NetError::TransferFailed { .. } => -20014,
            NetError::LiveTransfers { .. } => -20015,
            NetError::NameResolutionTimedOut { .. } => -20020,

            NetError::Unknown(code) => *code,
        }
    }

    /// True for errors produced by name resolution, before the engine saw
    /// the transfer.
    pub fn is_resolution_error(&self) -> bool {
        matches!(
            self,
            NetError::NameNotResolved
                | NetError::NameNotResolvedFor { .. }
                | NetError::NameResolutionTimedOut { .. }
                | NetError::NameResolutionFailed
        )
    }

    /// Reactor-level failure for `fd`, with the OS error attached.
    pub fn registration_failed(fd: RawFd, source: std::io::Error) -> Self {
        // EMFILE / ENFILE / ENOSPC from epoll all mean "out of descriptors".
        match source.raw_os_error() {
            Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOSPC) => {
                NetError::InsufficientResources
            }
            _ => NetError::SocketRegistrationFailed {
                fd,
                source: Arc::new(source),
            },
        }
    }

    pub fn dns_failed(domain: &str, source: std::io::Error) -> Self {
        NetError::NameNotResolvedFor {
            domain: domain.to_string(),
            source: Arc::new(source),
        }
    }
}

impl From<i32> for NetError {
    fn from(code: i32) -> Self {
        match code {
            -2 => NetError::Failed,
            -3 => NetError::Aborted,
            -4 => NetError::InvalidArgument,
            -7 => NetError::TimedOut,
            -9 => NetError::Unexpected,
            -12 => NetError::InsufficientResources,
            -13 => NetError::OutOfMemory,
            -105 => NetError::NameNotResolved,
            -137 => NetError::NameResolutionFailed,
            -300 => NetError::InvalidUrl,
            -302 => NetError::UnknownUrlScheme,
            -20002 => NetError::InvalidRegistration,
            -20003 => NetError::TimerFailed,
            -20004 => NetError::ReentrantDispatch,
            -20012 => NetError::AlreadyAttached,
            -20013 => NetError::NotAttached,
            _ => NetError::Unknown(code),
        }
    }
}

impl PartialEq for NetError {
    fn eq(&self, other: &Self) -> bool {
        self.as_i32() == other.as_i32()
    }
}

impl Eq for NetError {}
