//! # The mirror cache engine
//!
//! The engine keeps an in-memory directory of every remote object the mirror
//! has been asked about, and serves each of them through a per-key [`Item`]
//! with an explicit lifecycle:
//!
//! ```text
//! Created ──exists()──► Querying ──► NotFound
//!                                └──► Found ──download()──► Active ──► Downloaded
//!                                                               └─fail─► Created
//! any non-Expired ──expire()──► Expired   (terminal)
//! ```
//!
//! Both the existence probe and the download are single-flight: the first
//! caller launches the work and every concurrent caller awaits the same
//! resolution. While a download is in flight, readers tail the growing local
//! file via a progress signal instead of waiting for completion, so the first
//! client of a large object streams it at remote speed and later clients
//! stream it at disk speed.
//!
//! The [`Cache`] owns the directory and enforces three bounds in a background
//! expirer task: a validity period per item, a byte cap over fully downloaded
//! items, and a cap on negatively cached keys. Limit violations are reported
//! by the items and coalesced into a single sweep via a debounced trigger;
//! sweeps evict least-recently-accessed items down to a hysteresis band below
//! the caps so that traffic sitting exactly at a limit does not thrash.
//!
//! Nothing about the directory is persisted. The cache directory holds only
//! the object files themselves, and a restart simply refills on demand.

mod cache;
mod error;
mod item;
mod reader;
#[cfg(test)]
mod tests;

pub use cache::Cache;
pub use error::{CacheEntry, CacheError};
pub use item::{Download, Item, ItemState};
pub use reader::ItemReader;
