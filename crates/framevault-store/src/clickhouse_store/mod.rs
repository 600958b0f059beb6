//! Columnar SQL backend.
//!
//! Packets and their address edges live in two MergeTree tables; indexing is
//! fused into the write path, so the separate `index` call is a no-op and
//! address queries can join straight to the packet rows (`DirectData`).
//! Retention is declared as a table TTL, reclaimed by the server itself.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use chrono::Duration;
use clickhouse::{Client, Row};
use serde::{Deserialize, Serialize};

use framevault_core::{net, FindQuery, Packet};

use crate::{DataStore, DirectData, IndexStore, StoreError, StoreStats};

const MIGRATIONS: &[&str] = &[include_str!("migrations/0001_create_tables.sql")];

#[derive(Debug, Clone)]
pub struct ClickHouseOptions {
    pub addr: String,
    pub database: String,
    pub username: String,
    pub password: String,
    pub retention: Duration,
}

impl Default for ClickHouseOptions {
    fn default() -> Self {
        Self {
            addr: "http://127.0.0.1:8123".to_owned(),
            database: "framevault".to_owned(),
            username: "default".to_owned(),
            password: String::new(),
            retention: Duration::days(7),
        }
    }
}

pub struct ClickHouseStore {
    client: Client,
}

#[derive(Debug, Row, Serialize, Deserialize)]
struct PacketRow {
    id: String,
    #[serde(with = "serde_bytes")]
    data: Vec<u8>,
    timestamp_ns: i64,
    capture_length: u64,
    data_length: u64,
}

#[derive(Debug, Row, Serialize, Deserialize)]
struct PacketIpRow {
    packet_id: String,
    timestamp_ns: i64,
    ip: String,
}

impl PacketRow {
    fn from_packet(pkt: &Packet) -> Self {
        Self {
            id: pkt.id.clone(),
            data: pkt.data.clone(),
            timestamp_ns: pkt.timestamp.timestamp_nanos_opt().unwrap_or_default(),
            capture_length: pkt.capture_length,
            data_length: pkt.data_length,
        }
    }

    fn into_packet(self) -> Packet {
        Packet {
            id: self.id,
            data: self.data,
            timestamp: chrono::DateTime::from_timestamp_nanos(self.timestamp_ns),
            capture_length: self.capture_length,
            data_length: self.data_length,
        }
    }
}

impl ClickHouseStore {
    /// Connect and bring the schema up to date.
    pub async fn connect(options: &ClickHouseOptions) -> Result<Self, StoreError> {
        let client = Client::default()
            .with_url(&options.addr)
            .with_database(&options.database)
            .with_user(&options.username)
            .with_password(&options.password);

        let store = Self { client };
        store.apply_migrations(options.retention).await?;
        Ok(store)
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        self.client.query("SELECT 1").execute().await?;
        Ok(())
    }

    async fn apply_migrations(&self, retention: Duration) -> Result<(), StoreError> {
        let retention_secs = retention.num_seconds().max(0).to_string();

        for migration in MIGRATIONS {
            let sql = migration.replace("{retention_secs}", &retention_secs);
            for statement in split_statements(&sql) {
                self.client.query(&statement).execute().await?;
            }
        }
        Ok(())
    }

    fn time_bounds(query: &FindQuery) -> (String, Vec<i64>) {
        let mut sql = String::new();
        let mut binds = Vec::new();

        if let Some(from) = query.from {
            sql.push_str(" AND timestamp_ns >= ?");
            binds.push(from.timestamp_nanos_opt().unwrap_or_default());
        }
        if let Some(to) = query.to {
            sql.push_str(" AND timestamp_ns <= ?");
            binds.push(to.timestamp_nanos_opt().unwrap_or_default());
        }

        (sql, binds)
    }
}

/// A migration file holds several statements separated by semicolons;
/// comment-only lines are dropped before execution.
fn split_statements(sql: &str) -> Vec<String> {
    sql.split(';')
        .map(|stmt| {
            stmt.lines()
                .filter(|line| !line.trim_start().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n")
                .trim()
                .to_owned()
        })
        .filter(|stmt| !stmt.is_empty())
        .collect()
}

#[async_trait]
impl DataStore for ClickHouseStore {
    #[tracing::instrument(skip_all, fields(packets_count = pkts.len()))]
    async fn store(&self, pkts: &[Packet]) -> Result<(), StoreError> {
        if pkts.is_empty() {
            return Ok(());
        }

        let mut packets = self.client.insert::<PacketRow>("packets")?;
        for pkt in pkts {
            packets.write(&PacketRow::from_packet(pkt)).await?;
        }
        packets.end().await?;

        let mut edges = self.client.insert::<PacketIpRow>("packet_ips")?;
        for pkt in pkts {
            let Some((src, dst)) = net::extract_ipv4(&pkt.data) else {
                continue;
            };
            let timestamp_ns = pkt.timestamp.timestamp_nanos_opt().unwrap_or_default();
            for ip in [src, dst] {
                edges
                    .write(&PacketIpRow {
                        packet_id: pkt.id.clone(),
                        timestamp_ns,
                        ip: ip.to_string(),
                    })
                    .await?;
            }
        }
        edges.end().await?;

        Ok(())
    }

    #[tracing::instrument(skip_all, fields(ids_count = ids.len()))]
    async fn get(&self, ids: &[String], query: &FindQuery) -> Result<Vec<Packet>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut sql = String::from(
            "SELECT id, data, timestamp_ns, capture_length, data_length \
             FROM packets WHERE id IN ?",
        );
        let (bounds, binds) = Self::time_bounds(query);
        sql.push_str(&bounds);
        if query.max_count > 0 {
            sql.push_str(" ORDER BY timestamp_ns DESC LIMIT ?");
        }

        let mut prepared = self.client.query(&sql).bind(ids);
        for bound in binds {
            prepared = prepared.bind(bound);
        }
        if query.max_count > 0 {
            prepared = prepared.bind(query.max_count as u64);
        }

        let rows = prepared.fetch_all::<PacketRow>().await?;
        Ok(rows.into_iter().map(PacketRow::into_packet).collect())
    }

    async fn data_keys(&self) -> Result<Vec<String>, StoreError> {
        let ids = self
            .client
            .query("SELECT DISTINCT id FROM packets ORDER BY id")
            .fetch_all::<String>()
            .await?;
        Ok(ids)
    }

    async fn delete(&self, pkts: &[Packet]) -> Result<(), StoreError> {
        if pkts.is_empty() {
            return Ok(());
        }
        let ids: Vec<&str> = pkts.iter().map(|p| p.id.as_str()).collect();

        self.client
            .query("DELETE FROM packet_ips WHERE packet_id IN ?")
            .bind(&ids)
            .execute()
            .await?;
        self.client
            .query("DELETE FROM packets WHERE id IN ?")
            .bind(&ids)
            .execute()
            .await?;
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let packet_count = self
            .client
            .query("SELECT count() FROM packets")
            .fetch_one::<u64>()
            .await?;
        let unique_ips = self
            .client
            .query("SELECT uniqExact(ip) FROM packet_ips")
            .fetch_one::<u64>()
            .await?;
        let disk_size = self
            .client
            .query(
                "SELECT coalesce(sum(bytes_on_disk), 0) FROM system.parts \
                 WHERE database = currentDatabase() AND table = 'packets' AND active",
            )
            .fetch_one::<u64>()
            .await?;

        let mut stats = StoreStats::new();
        stats.insert("packet_count".into(), packet_count.to_string());
        stats.insert("unique_ips".into(), unique_ips.to_string());
        stats.insert("packets_disk_size".into(), disk_size.to_string());
        Ok(stats)
    }

    fn as_direct(&self) -> Option<&dyn DirectData> {
        Some(self)
    }

    fn close(&self) {}
}

#[async_trait]
impl IndexStore for ClickHouseStore {
    /// Address edges are written together with the packet rows, so there is
    /// nothing left to do here.
    async fn index(&self, _pkts: &[Packet]) -> Result<(), StoreError> {
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn find_by_address(&self, ip: Ipv4Addr) -> Result<Vec<String>, StoreError> {
        let ids = self
            .client
            .query("SELECT DISTINCT packet_id FROM packet_ips WHERE ip = ?")
            .bind(ip.to_string())
            .fetch_all::<String>()
            .await?;
        Ok(ids)
    }

    async fn index_keys(&self) -> Result<Vec<String>, StoreError> {
        let ips = self
            .client
            .query("SELECT DISTINCT ip FROM packet_ips ORDER BY ip")
            .fetch_all::<String>()
            .await?;
        Ok(ips)
    }

    async fn delete(&self, pkts: &[Packet]) -> Result<(), StoreError> {
        DataStore::delete(self, pkts).await
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        DataStore::stats(self).await
    }

    fn close(&self) {}
}

#[async_trait]
impl DirectData for ClickHouseStore {
    #[tracing::instrument(skip(self, query))]
    async fn get_by_address(
        &self,
        ip: Ipv4Addr,
        query: &FindQuery,
    ) -> Result<Vec<Packet>, StoreError> {
        let mut sql = String::from(
            "SELECT p.id, p.data, p.timestamp_ns, p.capture_length, p.data_length \
             FROM packet_ips AS pi \
             INNER JOIN packets AS p ON pi.packet_id = p.id \
             WHERE pi.ip = ?",
        );
        let mut binds = Vec::new();
        if let Some(from) = query.from {
            sql.push_str(" AND pi.timestamp_ns >= ?");
            binds.push(from.timestamp_nanos_opt().unwrap_or_default());
        }
        if let Some(to) = query.to {
            sql.push_str(" AND pi.timestamp_ns <= ?");
            binds.push(to.timestamp_nanos_opt().unwrap_or_default());
        }
        if query.max_count > 0 {
            sql.push_str(" ORDER BY pi.timestamp_ns DESC LIMIT ?");
        }

        let mut prepared = self.client.query(&sql).bind(ip.to_string());
        for bound in binds {
            prepared = prepared.bind(bound);
        }
        if query.max_count > 0 {
            prepared = prepared.bind(query.max_count as u64);
        }

        let rows = prepared.fetch_all::<PacketRow>().await?;
        Ok(rows.into_iter().map(PacketRow::into_packet).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::split_statements;

    #[test]
    fn migration_splits_into_two_statements() {
        let statements = split_statements(super::MIGRATIONS[0]);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].starts_with("CREATE TABLE IF NOT EXISTS packets"));
        assert!(statements[1].starts_with("CREATE TABLE IF NOT EXISTS packet_ips"));
    }

    #[test]
    fn comments_and_blank_statements_are_dropped() {
        let statements = split_statements("-- nothing\n;;SELECT 1;\n-- tail\n");
        assert_eq!(statements, vec!["SELECT 1".to_owned()]);
    }
}
