use std::path::Path;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tracing::warn;

use framevault_core::{FindQuery, Packet};

use crate::{DataStore, StoreError, StoreStats};

pub struct SledDataStore {
    db: sled::Db,
    retention: Duration,
}

impl SledDataStore {
    pub fn open(path: impl AsRef<Path>, retention: Duration) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Ok(Self { db, retention })
    }

    fn expired(&self, pkt: &Packet) -> bool {
        pkt.expires_at(self.retention) <= Utc::now()
    }
}

#[async_trait]
impl DataStore for SledDataStore {
    #[tracing::instrument(skip_all, fields(packets_count = pkts.len()))]
    async fn store(&self, pkts: &[Packet]) -> Result<(), StoreError> {
        for pkt in pkts {
            self.db.insert(pkt.id.as_bytes(), pkt.to_bytes())?;
        }
        self.db.flush_async().await?;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(ids_count = ids.len()))]
    async fn get(&self, ids: &[String], query: &FindQuery) -> Result<Vec<Packet>, StoreError> {
        let mut pkts = Vec::with_capacity(ids.len());

        for id in ids {
            let Some(value) = self.db.get(id.as_bytes())? else {
                continue;
            };
            let pkt = Packet::from_bytes(&value)?;

            if self.expired(&pkt) {
                self.db.remove(id.as_bytes())?;
                continue;
            }
            if query.matches(&pkt) {
                pkts.push(pkt);
            }
        }

        Ok(query.truncate(pkts))
    }

    async fn data_keys(&self) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();

        for item in self.db.iter() {
            let (key, value) = item?;
            let pkt = Packet::from_bytes(&value)?;
            if self.expired(&pkt) {
                self.db.remove(&key)?;
                continue;
            }
            keys.push(String::from_utf8_lossy(&key).into_owned());
        }

        Ok(keys)
    }

    async fn delete(&self, pkts: &[Packet]) -> Result<(), StoreError> {
        for pkt in pkts {
            self.db.remove(pkt.id.as_bytes())?;
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
            warn!(%err, "flushing data store on close failed");
        }
    }
}
