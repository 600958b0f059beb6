#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::too_many_lines)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use framevault_agent::{Agent, AgentOptions, DEFAULT_BATCH_SIZE};
use framevault_core::Stats;
use framevault_proto::ArchivistServer;
use framevault_store::{
    ClickHouseOptions, ClickHouseStore, DataStore, IndexLayout, IndexStore, ProtoEncoder,
    SledDataStore, SledIndexStore,
};

mod http_server;
mod retention;
mod service;
#[cfg(test)]
mod tests;

use service::ArchivistService;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug)]
#[command(name = "framevault", version, about = "Capture and archive network traffic")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Central ingest and query process
    Archivist(ArchivistArgs),
    /// Per-host capture process
    Agent(AgentArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreType {
    /// Embedded ordered key-value store on local disk
    OrderedKv,
    /// ClickHouse with fused data + index tables
    Columnar,
}

#[derive(clap::Args, Debug)]
struct ArchivistArgs {
    /// gRPC address to accept agent batches on
    #[arg(long, env = "LISTEN_GRPC")]
    listen_grpc: SocketAddr,

    /// HTTP address for the query API
    #[arg(long, env = "LISTEN_HTTP")]
    listen_http: SocketAddr,

    #[arg(long, env = "STORE_TYPE", value_enum)]
    store_type: StoreType,

    /// Packet store path (ordered-kv only)
    #[arg(long, env = "DATA_PATH")]
    data_path: Option<PathBuf>,

    /// Address index path (ordered-kv only)
    #[arg(long, env = "INDEX_PATH")]
    index_path: Option<PathBuf>,

    #[arg(long, env = "CLICKHOUSE_ADDR")]
    clickhouse_addr: Option<String>,

    #[arg(long, env = "CLICKHOUSE_DATABASE", default_value = "framevault")]
    clickhouse_database: String,

    #[arg(long, env = "CLICKHOUSE_USERNAME", default_value = "default")]
    clickhouse_username: String,

    #[arg(long, env = "CLICKHOUSE_PASSWORD", default_value = "")]
    clickhouse_password: String,

    /// How long packets stay queryable, measured from capture time
    #[arg(long, env = "RETENTION", default_value = "7d", value_parser = humantime::parse_duration)]
    retention: std::time::Duration,

    /// Snaplen written into downloaded pcap headers
    #[arg(long, env = "SNAP_LEN", default_value_t = framevault_core::pcap::DEFAULT_SNAPLEN)]
    snap_len: u32,
}

#[derive(clap::Args, Debug)]
struct AgentArgs {
    /// Archivist gRPC endpoint, e.g. http://archivist:4242
    #[arg(long, env = "ARCHIVIST_ADDRESS")]
    archivist_address: String,

    /// BPF filter applied at capture
    #[arg(long, env = "FILTER")]
    filter: String,

    /// Interface to capture on
    #[arg(long, env = "INTERFACE")]
    interface: String,

    /// Name identifying this packet source in the archivist
    #[arg(long, env = "AGENT_NAME")]
    agent_name: String,

    #[arg(long, env = "BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,
}

async fn run_archivist(args: ArchivistArgs) -> Result<(), BoxError> {
    let retention = chrono::Duration::from_std(args.retention)
        .map_err(|_| format!("retention {:?} is out of range", args.retention))?;

    let (data, index): (Arc<dyn DataStore>, Arc<dyn IndexStore>) = match args.store_type {
        StoreType::OrderedKv => {
            let data_path = args
                .data_path
                .ok_or("--data-path is required with --store-type ordered-kv")?;
            let index_path = args
                .index_path
                .ok_or("--index-path is required with --store-type ordered-kv")?;

            let data = SledDataStore::open(data_path, retention)?;
            let index = SledIndexStore::open(
                index_path,
                Box::new(ProtoEncoder),
                IndexLayout::Aggregated,
                retention,
            )?;
            (Arc::new(data), Arc::new(index))
        }
        StoreType::Columnar => {
            let addr = args
                .clickhouse_addr
                .ok_or("--clickhouse-addr is required with --store-type columnar")?;
            let store = Arc::new(
                ClickHouseStore::connect(&ClickHouseOptions {
                    addr,
                    database: args.clickhouse_database,
                    username: args.clickhouse_username,
                    password: args.clickhouse_password,
                    retention,
                })
                .await?,
            );
            (store.clone(), store)
        }
    };

    let stats = Arc::new(Stats::new());

    let http_state = http_server::AppState {
        data: data.clone(),
        index: index.clone(),
        stats: stats.clone(),
        snaplen: args.snap_len,
    };
    let http_addr = args.listen_http;
    tokio::spawn(async move {
        if let Err(err) = http_server::start_http_server(http_state, http_addr).await {
            error!(%err, "http server failed");
        }
    });

    let _retention = retention::spawn_ticker();

    let service = ArchivistService::new(data.clone(), index.clone(), stats);

    info!(grpc = %args.listen_grpc, http = %args.listen_http, "archivist listening");

    tonic::transport::Server::builder()
        .add_service(ArchivistServer::new(service))
        .serve_with_shutdown(args.listen_grpc, async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown signal received");
        })
        .await?;

    data.close();
    index.close();
    Ok(())
}

async fn run_agent(args: AgentArgs) -> Result<(), BoxError> {
    let agent = Agent::connect(AgentOptions {
        archivist_address: args.archivist_address,
        interface: args.interface,
        filter: args.filter,
        name: args.agent_name,
        batch_size: args.batch_size,
    })
    .await?;

    info!("agent connected, starting capture");
    agent.run().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Archivist(args) => run_archivist(args).await,
        Command::Agent(args) => run_agent(args).await,
    }
}
