//! Base types and error handling.
//!
//! Provides foundational types mirroring Chromium's `net/base/`:
//! - [`NetError`](neterror::NetError): Error codes for the bridge, engine,
//!   reactor and resolver
//! - [`LoadState`](loadstate::LoadState): Where an attached transfer sits

pub mod context;
pub mod loadstate;
pub mod neterror;
