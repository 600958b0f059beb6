use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use parking_lot::Mutex;
use tracing::warn;

use framevault_core::{net, Packet};

use crate::{IndexEncoder, IndexStore, StoreError, StoreStats};

use super::DEFAULT_TIME_FORMAT;

/// `index_keys` walks the whole tree; callers tolerate results this stale.
const KEYS_CACHE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(15 * 60);

/// How address→id bindings are laid out in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexLayout {
    /// One key per `(address, day bucket)` holding an encoded id list.
    /// Expiry is `bucket_start + retention`, derived from the key itself.
    Aggregated,
    /// One key per `(address, packet id)`; the value carries the expiry
    /// deadline in unix seconds. Lookups are pure prefix scans.
    PerEdge,
}

pub struct SledIndexStore {
    db: sled::Db,
    encoder: Box<dyn IndexEncoder>,
    layout: IndexLayout,
    time_format: String,
    retention: Duration,
    keys_cache: Mutex<Option<KeysCache>>,
}

struct KeysCache {
    scanned_at: Instant,
    keys: Vec<String>,
}

struct BucketEntry {
    ids: Vec<String>,
}

impl SledIndexStore {
    pub fn open(
        path: impl AsRef<Path>,
        encoder: Box<dyn IndexEncoder>,
        layout: IndexLayout,
        retention: Duration,
    ) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Ok(Self {
            db,
            encoder,
            layout,
            time_format: DEFAULT_TIME_FORMAT.to_owned(),
            retention,
            keys_cache: Mutex::new(None),
        })
    }

    /// Override the bucket coarsening. The format must render and re-parse
    /// as a calendar date.
    pub fn with_time_format(mut self, format: &str) -> Self {
        self.time_format = format.to_owned();
        self
    }

    fn bucket_key(&self, pkt: &Packet, addr: Ipv4Addr) -> String {
        format!(
            "{}-{}",
            hex::encode(addr.octets()),
            pkt.timestamp.format(&self.time_format)
        )
    }

    fn edge_key(pkt: &Packet, addr: Ipv4Addr) -> String {
        format!("{}-{}", hex::encode(addr.octets()), pkt.id)
    }

    /// Group the batch by storage key, keeping id insertion order. Packets
    /// whose frame is not Ethernet/IPv4 contribute nothing.
    fn bucket_keys(&self, pkts: &[Packet]) -> HashMap<String, BucketEntry> {
        let mut buckets: HashMap<String, BucketEntry> = HashMap::new();

        for pkt in pkts {
            let Some((src, dst)) = net::extract_ipv4(&pkt.data) else {
                continue;
            };
            for addr in [src, dst] {
                buckets
                    .entry(self.bucket_key(pkt, addr))
                    .or_insert_with(|| BucketEntry { ids: Vec::new() })
                    .ids
                    .push(pkt.id.clone());
            }
        }

        buckets
    }

    fn bucket_start(&self, bucket: &str) -> Result<DateTime<Utc>, StoreError> {
        let date = NaiveDate::parse_from_str(bucket, &self.time_format)
            .map_err(|_| StoreError::CorruptKey(bucket.to_owned()))?;
        Ok(date.and_time(NaiveTime::MIN).and_utc())
    }

    fn entry_expired(&self, key: &str, value: &[u8]) -> Result<bool, StoreError> {
        match self.layout {
            IndexLayout::Aggregated => {
                let (_, bucket) = key
                    .split_once('-')
                    .ok_or_else(|| StoreError::CorruptKey(key.to_owned()))?;
                Ok(self.bucket_start(bucket)? + self.retention <= Utc::now())
            }
            IndexLayout::PerEdge => {
                let deadline: [u8; 8] = value
                    .try_into()
                    .map_err(|_| StoreError::CorruptKey(key.to_owned()))?;
                Ok(i64::from_le_bytes(deadline) <= Utc::now().timestamp())
            }
        }
    }

    fn index_aggregated(&self, pkts: &[Packet]) -> Result<(), StoreError> {
        for (name, entry) in self.bucket_keys(pkts) {
            let key = name.as_bytes();

            // One read-modify-write per address key; the swap loop stands in
            // for a transaction when several batches land on the same bucket.
            loop {
                let current = self.db.get(key)?;
                let mut value = match current.as_ref() {
                    // A decode failure here propagates: never overwrite an
                    // entry that cannot be read back.
                    Some(data) => self.encoder.from_bytes(data.as_ref())?,
                    None => self.encoder.new_empty(),
                };
                value.add(&entry.ids);

                if self
                    .db
                    .compare_and_swap(key, current, Some(value.serialize()))?
                    .is_ok()
                {
                    break;
                }
            }
        }
        Ok(())
    }

    fn index_per_edge(&self, pkts: &[Packet]) -> Result<(), StoreError> {
        for pkt in pkts {
            let Some((src, dst)) = net::extract_ipv4(&pkt.data) else {
                continue;
            };
            let deadline = pkt.expires_at(self.retention).timestamp().to_le_bytes();
            for addr in [src, dst] {
                self.db
                    .insert(Self::edge_key(pkt, addr).as_bytes(), deadline.to_vec())?;
            }
        }
        Ok(())
    }

    fn delete_aggregated(&self, pkts: &[Packet]) -> Result<(), StoreError> {
        for (name, entry) in self.bucket_keys(pkts) {
            let key = name.as_bytes();
            let remove: HashSet<&str> = entry.ids.iter().map(String::as_str).collect();

            loop {
                let Some(current) = self.db.get(key)? else {
                    break;
                };
                let value = self.encoder.from_bytes(current.as_ref())?;
                let kept: Vec<String> = value
                    .ids()
                    .iter()
                    .filter(|id| !remove.contains(id.as_str()))
                    .cloned()
                    .collect();

                let replacement = if kept.is_empty() {
                    None
                } else {
                    let mut rebuilt = self.encoder.new_empty();
                    rebuilt.add(&kept);
                    Some(rebuilt.serialize())
                };

                if self
                    .db
                    .compare_and_swap(key, Some(current), replacement)?
                    .is_ok()
                {
                    break;
                }
            }
        }
        Ok(())
    }

    fn delete_per_edge(&self, pkts: &[Packet]) -> Result<(), StoreError> {
        for pkt in pkts {
            let Some((src, dst)) = net::extract_ipv4(&pkt.data) else {
                continue;
            };
            for addr in [src, dst] {
                self.db.remove(Self::edge_key(pkt, addr).as_bytes())?;
            }
        }
        Ok(())
    }

    fn scan_keys(&self) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();

        for item in self.db.iter() {
            let (key, value) = item?;
            let key_str = String::from_utf8_lossy(&key).into_owned();
            if self.entry_expired(&key_str, &value)? {
                self.db.remove(&key)?;
                continue;
            }
            keys.push(key_str);
        }

        Ok(keys)
    }
}

#[async_trait]
impl IndexStore for SledIndexStore {
    #[tracing::instrument(skip_all, fields(packets_count = pkts.len()))]
    async fn index(&self, pkts: &[Packet]) -> Result<(), StoreError> {
        match self.layout {
            IndexLayout::Aggregated => self.index_aggregated(pkts)?,
            IndexLayout::PerEdge => self.index_per_edge(pkts)?,
        }
        self.db.flush_async().await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn find_by_address(&self, ip: Ipv4Addr) -> Result<Vec<String>, StoreError> {
        let prefix = hex::encode(ip.octets());
        let mut ids = Vec::new();

        for item in self.db.scan_prefix(prefix.as_bytes()) {
            let (key, value) = item?;
            let key_str = String::from_utf8_lossy(&key).into_owned();
            if self.entry_expired(&key_str, &value)? {
                self.db.remove(&key)?;
                continue;
            }

            match self.layout {
                IndexLayout::Aggregated => {
                    let list = self.encoder.from_bytes(&value)?;
                    ids.extend_from_slice(list.ids());
                }
                IndexLayout::PerEdge => {
                    let (_, id) = key_str
                        .split_once('-')
                        .ok_or(StoreError::CorruptKey(key_str.clone()))?;
                    ids.push(id.to_owned());
                }
            }
        }

        Ok(ids)
    }

    async fn index_keys(&self) -> Result<Vec<String>, StoreError> {
        {
            let cache = self.keys_cache.lock();
            if let Some(cache) = cache.as_ref() {
                if cache.scanned_at.elapsed() < KEYS_CACHE_INTERVAL {
                    return Ok(cache.keys.clone());
                }
            }
        }

        let keys = self.scan_keys()?;
        *self.keys_cache.lock() = Some(KeysCache {
            scanned_at: Instant::now(),
            keys: keys.clone(),
        });
        Ok(keys)
    }

    async fn delete(&self, pkts: &[Packet]) -> Result<(), StoreError> {
        match self.layout {
            IndexLayout::Aggregated => self.delete_aggregated(pkts)?,
            IndexLayout::PerEdge => self.delete_per_edge(pkts)?,
        }
        self.db.flush_async().await?;
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let mut stats = StoreStats::new();
        stats.insert("entries".into(), self.db.len().to_string());
        stats.insert("disk_size".into(), self.db.size_on_disk()?.to_string());
        Ok(stats)
    }

    fn close(&self) {
        if let Err(err) = self.db.flush() {
            warn!(%err, "flushing index store on close failed");
        }
    }
}
