//! Integration coverage for the columnar backend. These need a reachable
//! ClickHouse server, so they are ignored by default:
//!
//! ```sh
//! CLICKHOUSE_ADDR=http://127.0.0.1:8123 cargo test -p framevault-store -- --ignored
//! ```

use std::net::Ipv4Addr;

use chrono::{Duration, Utc};

use framevault_core::net::build_ipv4_frame;
use framevault_core::{FindQuery, Packet};
use framevault_store::{ClickHouseOptions, ClickHouseStore, DataStore, IndexStore};

fn options() -> ClickHouseOptions {
    ClickHouseOptions {
        addr: std::env::var("CLICKHOUSE_ADDR")
            .unwrap_or_else(|_| "http://127.0.0.1:8123".to_owned()),
        database: std::env::var("CLICKHOUSE_DATABASE").unwrap_or_else(|_| "default".to_owned()),
        username: "default".to_owned(),
        password: String::new(),
        retention: Duration::days(1),
    }
}

fn packet(id: String, src: Ipv4Addr, dst: Ipv4Addr, offset_minutes: i64) -> Packet {
    let data = build_ipv4_frame(src, dst);
    Packet {
        id,
        capture_length: data.len() as u64,
        data_length: data.len() as u64,
        data,
        timestamp: Utc::now() - Duration::minutes(offset_minutes),
    }
}

fn unique(prefix: &str) -> String {
    format!("{prefix}_{}", ulid_like())
}

// Enough uniqueness for a shared test database without pulling in a crate.
fn ulid_like() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default()
}

#[tokio::test]
#[ignore = "needs a running ClickHouse server"]
async fn store_and_retrieve_round_trip() {
    let store = ClickHouseStore::connect(&options()).await.unwrap();
    store.ping().await.unwrap();

    let src = Ipv4Addr::new(192, 168, 1, 100);
    let dst = Ipv4Addr::new(192, 168, 1, 200);
    let pkts = vec![
        packet(unique("rt"), src, dst, 2),
        packet(unique("rt"), src, dst, 1),
        packet(unique("rt"), src, dst, 0),
    ];

    store.store(&pkts).await.unwrap();

    let ids: Vec<String> = pkts.iter().map(|p| p.id.clone()).collect();
    let found = store.get(&ids, &FindQuery::default()).await.unwrap();
    assert_eq!(found.len(), 3);

    for got in &found {
        let original = pkts.iter().find(|p| p.id == got.id).unwrap();
        assert_eq!(got.data, original.data);
        assert_eq!(got.capture_length, original.capture_length);
    }
}

#[tokio::test]
#[ignore = "needs a running ClickHouse server"]
async fn window_and_count_filters_apply() {
    let store = ClickHouseStore::connect(&options()).await.unwrap();

    let src = Ipv4Addr::new(192, 168, 2, 1);
    let dst = Ipv4Addr::new(192, 168, 2, 2);
    let pkts = vec![
        packet(unique("win"), src, dst, 120),
        packet(unique("win"), src, dst, 30),
        packet(unique("win"), src, dst, 0),
    ];
    store.store(&pkts).await.unwrap();

    let ids: Vec<String> = pkts.iter().map(|p| p.id.clone()).collect();
    let query = FindQuery {
        from: Some(Utc::now() - Duration::minutes(45)),
        to: Some(Utc::now() + Duration::minutes(5)),
        max_count: 10,
    };
    let found = store.get(&ids, &query).await.unwrap();
    assert_eq!(found.len(), 2);
}

#[tokio::test]
#[ignore = "needs a running ClickHouse server"]
async fn address_lookups_use_the_fused_tables() {
    let store = ClickHouseStore::connect(&options()).await.unwrap();

    let src = Ipv4Addr::new(10, 30, 0, 1);
    let dst = Ipv4Addr::new(10, 30, 0, 2);
    let pkt = packet(unique("addr"), src, dst, 0);
    store.store(std::slice::from_ref(&pkt)).await.unwrap();

    let by_src = store.find_by_address(src).await.unwrap();
    assert!(by_src.contains(&pkt.id));
    let by_dst = store.find_by_address(dst).await.unwrap();
    assert!(by_dst.contains(&pkt.id));

    // This backend answers address queries directly.
    let direct = store.as_direct().expect("columnar store is DirectData");
    let found = direct
        .get_by_address(src, &FindQuery::default())
        .await
        .unwrap();
    assert!(found.iter().any(|p| p.id == pkt.id));

    let keys = store.index_keys().await.unwrap();
    assert!(keys.contains(&src.to_string()));

    let data_keys = store.data_keys().await.unwrap();
    assert!(data_keys.contains(&pkt.id));
}

#[tokio::test]
#[ignore = "needs a running ClickHouse server"]
async fn stats_expose_counts() {
    let store = ClickHouseStore::connect(&options()).await.unwrap();

    let stats = DataStore::stats(&store).await.unwrap();
    assert!(stats.contains_key("packet_count"));
    assert!(stats.contains_key("unique_ips"));
    assert!(stats.contains_key("packets_disk_size"));
}
