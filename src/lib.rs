//! Client-side cache and synchronization engine for a marketplace of
//! versioned resources.
//!
//! - [`api`]: HTTP transport with retry, and the caching [`api::ResourceClient`]
//! - [`cache`]: persistent SQLite entity cache and write outbox
//! - [`sync`]: single-flight reconciliation of the cache against the server
//! - [`state`]: optimistic in-memory store with rollback and permissions
//! - [`realtime`]: pooled, self-healing websocket connections

pub mod api;
pub mod cache;
pub mod error;
pub mod realtime;
pub mod state;
pub mod sync;

#[cfg(test)]
mod testing;

pub use api::Resource;
pub use error::{Error, ErrorKind, Result};
