//! # reactornet
//!
//! Drive a multi-transfer HTTP engine from a single-threaded host reactor.
//!
//! The host owns the only event loop. `reactornet` sits between that loop
//! and a transfer engine (libcurl's multi interface by default) that wants
//! to be told when its sockets are ready and when its timer fires, and
//! hands finished transfers back through per-transfer callbacks.
//!
//! ## Features
//!
//! - **Bridge**: socket interest multiplexing, a single engine timer,
//!   completion draining and per-transfer lifecycle tracking
//! - **Resolution Hook**: asynchronous DNS before engine admission, with
//!   in-flight lookup sharing and a deadline
//! - **Segregated Allocator**: lock-free power-of-two free lists, usable as
//!   the engine's allocator or as `#[global_allocator]`
//! - **Tokio Reactor**: a ready-made reactor on a tokio `LocalSet`
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use reactornet::bridge::{Bridge, BridgeConfig};
//! use reactornet::dns::{HickoryResolver, LocalHostResolver};
//! use reactornet::engine::{CurlEngine, CurlTransfer};
//! use reactornet::reactor::TokioReactor;
//! use std::rc::Rc;
//!
//! let local = tokio::task::LocalSet::new();
//! local.block_on(&runtime, async {
//!     let reactor = Rc::new(TokioReactor::new()?);
//!     let config = BridgeConfig::new()
//!         .resolver(Rc::new(LocalHostResolver::new(HickoryResolver::new())));
//!     let bridge: Bridge<CurlEngine<Sink>> = Bridge::create(reactor, config)?;
//!
//!     let transfer = CurlTransfer::new(Sink::default(), "http://example.com/".parse()?)?;
//!     bridge.attach(transfer, |t| println!("done: {}", t.url()), |_, e| eprintln!("{e}"))?;
//! });
//! ```
//!
//! ## Modules
//!
//! - [`base`] - Error codes and transfer load states
//! - [`bridge`] - The reactor/engine bridge
//! - [`dns`] - Futures-based resolvers and the callback-style host resolver
//! - [`engine`] - Engine interface and the libcurl engine
//! - [`memory`] - Block allocators
//! - [`reactor`] - Host reactor interface and the tokio reactor

pub mod base;
pub mod bridge;
pub mod dns;
pub mod engine;
pub mod memory;
pub mod reactor;
