use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::info;

use framevault_core::pcap::PcapWriter;
use framevault_core::{FindQuery, Packet, SourceSnapshot, Stats};
use framevault_store::{DataStore, IndexStore, StoreError, StoreStats};

#[derive(Clone)]
pub struct AppState {
    pub data: Arc<dyn DataStore>,
    pub index: Arc<dyn IndexStore>,
    pub stats: Arc<Stats>,
    pub snaplen: u32,
}

pub async fn start_http_server(
    state: AppState,
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = router(state);

    info!(%addr, "http api listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(get_stats))
        .route("/keys", get(get_keys))
        .route("/download/{address}", get(download))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn store_failure(err: &StoreError) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
}

fn bad_request(msg: String) -> Response {
    (StatusCode::BAD_REQUEST, msg).into_response()
}

async fn health() {}

// --- /stats ---

#[derive(Serialize)]
struct StatsResponse {
    sources: HashMap<String, SourceSnapshot>,
    keys: usize,
    index_stats: StoreStats,
    data_stats: StoreStats,
}

async fn get_stats(State(state): State<AppState>) -> Response {
    match build_stats(&state).await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => store_failure(&err),
    }
}

async fn build_stats(state: &AppState) -> Result<StatsResponse, StoreError> {
    let raw_keys = state.index.index_keys().await?;
    let addresses: HashSet<String> = raw_keys.iter().map(|k| decode_index_key(k)).collect();

    Ok(StatsResponse {
        sources: state.stats.snapshot(),
        keys: addresses.len(),
        index_stats: state.index.stats().await?,
        data_stats: state.data.stats().await?,
    })
}

// --- /keys ---

#[derive(Deserialize)]
struct KeysParams {
    #[serde(rename = "withData")]
    with_data: Option<bool>,
}

#[derive(Serialize)]
struct KeysResponse {
    index_keys: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data_keys: Option<Vec<String>>,
}

/// Stored index keys are `hex(addr)-<suffix>`; the leading hex decodes to a
/// dotted IPv4. Backends that already key by dotted address pass through.
pub fn decode_index_key(key: &str) -> String {
    let prefix = key.split('-').next().unwrap_or(key);
    match hex::decode(prefix) {
        Ok(bytes) => match <[u8; 4]>::try_from(bytes.as_slice()) {
            Ok(octets) => Ipv4Addr::from(octets).to_string(),
            Err(_) => key.to_owned(),
        },
        Err(_) => key.to_owned(),
    }
}

async fn get_keys(State(state): State<AppState>, Query(params): Query<KeysParams>) -> Response {
    let raw_keys = match state.index.index_keys().await {
        Ok(keys) => keys,
        Err(err) => return store_failure(&err),
    };

    let mut seen = HashSet::new();
    let index_keys: Vec<String> = raw_keys
        .iter()
        .map(|k| decode_index_key(k))
        .filter(|addr| seen.insert(addr.clone()))
        .collect();

    let data_keys = if params.with_data.unwrap_or(false) {
        match state.data.data_keys().await {
            Ok(keys) => Some(keys),
            Err(err) => return store_failure(&err),
        }
    } else {
        None
    };

    Json(KeysResponse {
        index_keys,
        data_keys,
    })
    .into_response()
}

// --- /download/{address} ---

#[derive(Deserialize)]
struct DownloadParams {
    from: Option<String>,
    to: Option<String>,
    count: Option<usize>,
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|err| format!("invalid time {value:?}: {err}"))
}

async fn download(
    Path(address): Path<String>,
    Query(params): Query<DownloadParams>,
    State(state): State<AppState>,
) -> Response {
    let ip: Ipv4Addr = match address.parse() {
        Ok(ip) => ip,
        Err(_) => return bad_request(format!("invalid ipv4 address {address:?}")),
    };

    let mut query = FindQuery {
        max_count: params.count.unwrap_or(0),
        ..FindQuery::default()
    };
    if let Some(from) = &params.from {
        match parse_time(from) {
            Ok(t) => query.from = Some(t),
            Err(msg) => return bad_request(msg),
        }
    }
    if let Some(to) = &params.to {
        match parse_time(to) {
            Ok(t) => query.to = Some(t),
            Err(msg) => return bad_request(msg),
        }
    }

    let pkts = match fetch_by_address(&state, ip, &query).await {
        Ok(pkts) => pkts,
        Err(err) => return store_failure(&err),
    };

    match write_pcap(&pkts, state.snaplen) {
        Ok(body) => (
            [
                (header::CONTENT_TYPE, "application/octet-stream"),
                (header::CONTENT_DISPOSITION, "inline; filename=data.pcap"),
            ],
            body,
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

/// Prefer the fused address query when the data store offers one; otherwise
/// resolve ids through the index and fetch them individually.
pub async fn fetch_by_address(
    state: &AppState,
    ip: Ipv4Addr,
    query: &FindQuery,
) -> Result<Vec<Packet>, StoreError> {
    if let Some(direct) = state.data.as_direct() {
        return direct.get_by_address(ip, query).await;
    }

    let ids = state.index.find_by_address(ip).await?;
    state.data.get(&ids, query).await
}

pub fn write_pcap(pkts: &[Packet], snaplen: u32) -> std::io::Result<Vec<u8>> {
    let mut writer = PcapWriter::new(Vec::new(), snaplen)?;
    for pkt in pkts {
        writer.write_packet(pkt)?;
    }
    Ok(writer.into_inner())
}
