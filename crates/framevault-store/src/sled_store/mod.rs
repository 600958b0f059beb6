//! Embedded ordered-KV backend.
//!
//! Two sled trees at independent paths: one for packet records keyed by raw
//! id, one for the address index. sled has no native TTL, so every entry
//! carries enough to compute its expiry (the packet record its capture time,
//! the index key its bucket, the per-edge value its deadline) and reads treat
//! expired entries as absent, deleting them on the way past.

mod data;
mod index;

pub use data::SledDataStore;
pub use index::{IndexLayout, SledIndexStore};

/// Day-granular index buckets, `YYYY:MM:DD`.
pub const DEFAULT_TIME_FORMAT: &str = "%Y:%m:%d";
