//! DNS Resolution Module
//!
//! Two layers:
//! - [`Resolve`]: futures-based resolvers (system getaddrinfo, hickory-dns,
//!   hostname overrides), usable from any tokio context
//! - [`HostResolver`]: the callback-style resolver the bridge's resolution
//!   hook consumes from the host reactor; [`LocalHostResolver`] adapts any
//!   [`Resolve`] onto the reactor's `LocalSet`
//!
//! # Example
//!
//! ```rust,ignore
//! use reactornet::dns::{HickoryResolver, LocalHostResolver, Name, HostResolver};
//! use std::time::Duration;
//!
//! let resolver = LocalHostResolver::new(HickoryResolver::new());
//! resolver.resolve(Name::new("example.com"), Duration::from_secs(5), Box::new(|result| {
//!     println!("resolved: {result:?}");
//! }));
//! ```

mod gai;
mod hickory;
mod host;
mod resolve;

pub use gai::GaiResolver;
pub use hickory::HickoryResolver;
pub use host::{HostResolver, LocalHostResolver, ResolveCallback};
pub use resolve::{Addrs, DnsResolverWithOverrides, Name, Resolve, Resolving};
