//! Persistent entity cache.
//!
//! This module provides a domain-agnostic local store that:
//! - Caches entities by type and id, each with a fetch time and expiry
//! - Supports bulk upsert, single upsert, delete, clear and expiry sweeps
//! - Prunes entries the server no longer knows about (`validate_consistency`)
//! - Hosts the outbox of write intents queued for later delivery
//!
//! The cache is a disposable projection of server state. Every failure here
//! is reported to the caller, who is expected to log it and fall back to
//! the network.

mod storage;
mod traits;

pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CacheResult, CacheSource, Cacheable, CachedEntity, ConsistencyReport};
