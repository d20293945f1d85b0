//! Per-pool cache orchestration.
//!
//! A [`CacheManager`] owns one pool's view of the world: the status-store
//! records for its (region, url) pairs, the regional bucket, and the copy
//! queue.  The redirect front end drives it through lookup/request/purge;
//! the copy workers drive it through [`copier`], which streams validated
//! origin bytes into the bucket under a single-flight lock.

pub mod copier;
pub mod manager;

pub use manager::{CacheManager, RedirectLookup, RedirectStatus};
