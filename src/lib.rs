//! Partitioned, optimistic cache synchronization for the community prayer
//! client.
//!
//! Server data is held in identity-scoped partitions that are served
//! immediately, refreshed in the background, edited optimistically and
//! persisted across restarts. [`engine::SyncEngine`] is the entry point.

pub mod cache;
pub mod clock;
pub mod community;
pub mod config;
pub mod engine;
pub mod error;
pub mod identity;
pub mod network;
pub mod reconcile;
pub mod storage;
pub mod watch;

#[cfg(test)]
mod testing;

pub use engine::{EngineOptions, SyncEngine};
pub use error::{SyncError, SyncResult};
