//! Ergonomic error context helpers.
//!
//! Provides extension traits for adding context to `Result` types,
//! converting IO errors from the reactor into context-rich `NetError`
//! variants.

use crate::base::neterror::NetError;
use std::io;
use std::os::fd::RawFd;

/// Extension trait for adding context to IO Results.
pub trait IoResultExt<T> {
    /// Add registration context to an IO error raised while adding `fd`
    /// to the reactor.
    ///
    /// # Example
    /// ```ignore
    /// use reactornet::base::context::IoResultExt;
    ///
    /// let registration = AsyncFd::new(SocketFd(fd)).registration_context(fd)?;
    /// // Error: "Registering socket 7 with the reactor failed: ..."
    /// ```
    fn registration_context(self, fd: RawFd) -> Result<T, NetError>;

    /// Add DNS resolution context to an IO error.
    fn dns_context(self, domain: &str) -> Result<T, NetError>;
}

impl<T> IoResultExt<T> for Result<T, io::Error> {
    fn registration_context(self, fd: RawFd) -> Result<T, NetError> {
        self.map_err(|e| NetError::registration_failed(fd, e))
    }

    fn dns_context(self, domain: &str) -> Result<T, NetError> {
        self.map_err(|e| NetError::dns_failed(domain, e))
    }
}
