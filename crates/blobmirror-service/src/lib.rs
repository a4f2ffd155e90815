//! Core engine of the blobmirror update mirror.
//!
//! The mirror sits in front of a remote object store and serves its objects
//! over HTTP while keeping local copies on disk. This crate contains the
//! engine only: the [`caching`] module with the item directory, the per-item
//! state machine and the tailing readers, the [`store`] module with the
//! remote store capability and its backends, and the [`config`] module. The
//! HTTP surface lives in the `blobmirror` binary crate.

pub mod caching;
pub mod config;
pub mod store;

pub use caching::{Cache, CacheEntry, CacheError, Item, ItemReader, ItemState};
pub use config::Config;
