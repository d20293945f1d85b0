//! Coordination layer backed by the external status store (Redis-compatible).
//!
//! Holds everything the mirror shares across processes: the per-(pool, url)
//! cache-entry records with their TTLs, and the single-flight copy locks
//! that guarantee at most one worker streams a given URL into a regional
//! bucket at any instant.  All state lives in the store so that any number
//! of redirect front ends and copy workers can cooperate; the connection
//! itself is owned by [`status::StatusStore`].

pub mod locks;
pub mod node;
pub mod status;

pub use status::{CacheEntry, EntryStatus, StatusStore};
