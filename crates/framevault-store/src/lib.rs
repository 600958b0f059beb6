#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

use std::collections::HashMap;
use std::net::Ipv4Addr;

use async_trait::async_trait;

use framevault_core::{FindQuery, Packet, PacketDecodeError};

pub mod encoder;

mod clickhouse_store;
mod sled_store;

pub use clickhouse_store::{ClickHouseOptions, ClickHouseStore};
pub use encoder::{EncodeError, IndexEncoder, IndexValue, ProtoEncoder};
pub use sled_store::{IndexLayout, SledDataStore, SledIndexStore, DEFAULT_TIME_FORMAT};

/// Free-form backend counters surfaced under `/stats`.
pub type StoreStats = HashMap<String, String>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("key-value backend error: {0}")]
    Kv(#[from] sled::Error),

    #[error("clickhouse error: {0}")]
    Sql(#[from] clickhouse::error::Error),

    #[error(transparent)]
    PacketDecode(#[from] PacketDecodeError),

    #[error(transparent)]
    IndexDecode(#[from] EncodeError),

    #[error("corrupt index key {0:?}")]
    CorruptKey(String),
}

/// Persistence of raw packet records, keyed by packet id.
///
/// Writes are atomic per packet, never per batch. Entries expire
/// `retention` after their capture time; expired entries are invisible to
/// reads and reclaimed lazily by the backend.
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn store(&self, pkts: &[Packet]) -> Result<(), StoreError>;

    /// Point lookups for `ids`, filtered by the query window, then truncated
    /// to the newest `max_count`. Unknown ids are skipped silently.
    async fn get(&self, ids: &[String], query: &FindQuery) -> Result<Vec<Packet>, StoreError>;

    async fn data_keys(&self) -> Result<Vec<String>, StoreError>;

    async fn delete(&self, pkts: &[Packet]) -> Result<(), StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;

    /// Capability probe: backends that can answer address queries without an
    /// index round-trip return themselves here.
    fn as_direct(&self) -> Option<&dyn DirectData> {
        None
    }

    fn close(&self);
}

/// Secondary index from IPv4 address to the ids of packets that carried it.
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Index `src_ip` and `dst_ip` of every packet whose frame parses as
    /// Ethernet/IPv4; packets that do not are skipped silently.
    async fn index(&self, pkts: &[Packet]) -> Result<(), StoreError>;

    /// All live packet ids recorded for `ip`, in unspecified order. The
    /// result is a multiset: re-delivered batches may have indexed an id
    /// more than once.
    async fn find_by_address(&self, ip: Ipv4Addr) -> Result<Vec<String>, StoreError>;

    /// Distinct index keys in stored form. May be served from a cache that
    /// refreshes on a fixed interval.
    async fn index_keys(&self) -> Result<Vec<String>, StoreError>;

    async fn delete(&self, pkts: &[Packet]) -> Result<(), StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;

    fn close(&self);
}

/// Address-keyed retrieval fused into the data store, skipping the index
/// hop entirely. Only some backends can offer this.
#[async_trait]
pub trait DirectData: Send + Sync {
    async fn get_by_address(
        &self,
        ip: Ipv4Addr,
        query: &FindQuery,
    ) -> Result<Vec<Packet>, StoreError>;
}
