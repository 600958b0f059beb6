#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]

//! Per-host capture agent: reads frames off an interface through a BPF
//! filter, batches them, and ships batches to the archivist over gRPC with
//! unbounded retry.

use std::time::Duration;

use backoff::ExponentialBackoff;
use tokio::sync::mpsc;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::{Channel, Endpoint};
use tracing::{info, warn, Instrument};
use ulid::Ulid;

use framevault_proto as pb;
use framevault_proto::ArchivistClient;

mod batch_queue;

pub use batch_queue::{BatchQueue, Callback};

pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const BATCH_TIMEOUT: Duration = Duration::from_secs(1);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const SNAPLEN: i32 = 1000;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("failed to reach archivist: {0}")]
    Connect(#[from] tonic::transport::Error),

    #[error("capture driver error: {0}")]
    Capture(#[from] pcap::Error),

    #[error("agent name {0:?} cannot be sent as request metadata")]
    AgentName(String),

    #[error("batch send failed permanently: {0}")]
    Send(#[from] tonic::Status),

    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub archivist_address: String,
    pub interface: String,
    pub filter: String,
    pub name: String,
    pub batch_size: usize,
}

pub struct Agent {
    options: AgentOptions,
    client: ArchivistClient<Channel>,
    agent_name: MetadataValue<Ascii>,
}

impl Agent {
    /// Dial the archivist (bounded startup timeout) and prepare the agent.
    pub async fn connect(options: AgentOptions) -> Result<Self, AgentError> {
        let agent_name = MetadataValue::try_from(options.name.as_str())
            .map_err(|_| AgentError::AgentName(options.name.clone()))?;

        let channel = Endpoint::from_shared(options.archivist_address.clone())?
            .connect_timeout(CONNECT_TIMEOUT)
            .connect()
            .await?;

        Ok(Self {
            options,
            client: ArchivistClient::new(channel),
            agent_name,
        })
    }

    /// Capture until the source is exhausted. Runs the blocking capture loop
    /// on its own thread and a single dispatch task that owns the RPC side;
    /// the bounded handoff channel is what throttles capture when the
    /// archivist is slow.
    pub async fn run(self) -> Result<(), AgentError> {
        let (batch_tx, batch_rx) = mpsc::channel::<Vec<pb::Packet>>(1);

        let dispatch = tokio::spawn(dispatch_loop(
            self.client.clone(),
            self.agent_name.clone(),
            batch_rx,
        ));

        let options = self.options.clone();
        let capture = tokio::task::spawn_blocking(move || capture_loop(&options, &batch_tx));

        capture.await??;
        dispatch.await??;
        Ok(())
    }
}

fn capture_loop(
    options: &AgentOptions,
    batch_tx: &mpsc::Sender<Vec<pb::Packet>>,
) -> Result<(), AgentError> {
    let mut capture = pcap::Capture::from_device(options.interface.as_str())?
        .snaplen(SNAPLEN)
        .precision(pcap::Precision::Nano)
        .open()?;
    capture.filter(&options.filter, true)?;

    info!(
        interface = %options.interface,
        filter = %options.filter,
        "capture started"
    );

    let tx = batch_tx.clone();
    let queue = BatchQueue::new(
        options.batch_size,
        BATCH_TIMEOUT,
        Box::new(move |batch: Vec<pb::Packet>| {
            if tx.blocking_send(batch).is_err() {
                warn!("dispatch channel closed, dropping batch");
            }
        }),
    );

    loop {
        match capture.next_packet() {
            Ok(frame) => {
                // With nanosecond precision the tv_usec field carries nanos.
                let timestamp_nano = frame.header.ts.tv_sec as i64 * 1_000_000_000
                    + frame.header.ts.tv_usec as i64;

                queue.add(pb::Packet {
                    id: Ulid::new().to_string(),
                    data: frame.data.to_vec(),
                    timestamp: 0,
                    timestamp_nano,
                    capture_length: i64::from(frame.header.caplen),
                    data_length: i64::from(frame.header.len),
                });
            }
            Err(pcap::Error::TimeoutExpired) => {}
            Err(pcap::Error::NoMorePackets) => break,
            Err(err) => return Err(err.into()),
        }
    }

    info!("capture source exhausted, draining");
    queue.drain();
    Ok(())
}

/// One unary `SendPacket` per closed batch, in close order, retried with
/// exponential backoff until the archivist takes it. Capture keeps running
/// during an outage; at most one closed batch waits in the channel, the rest
/// back up into the capture driver.
async fn dispatch_loop(
    client: ArchivistClient<Channel>,
    agent_name: MetadataValue<Ascii>,
    mut batch_rx: mpsc::Receiver<Vec<pb::Packet>>,
) -> Result<(), AgentError> {
    while let Some(batch) = batch_rx.recv().await {
        let span = tracing::info_span!("send_batch", packets_count = batch.len());

        async {
            let policy = ExponentialBackoff {
                max_elapsed_time: None,
                ..ExponentialBackoff::default()
            };

            backoff::future::retry_notify(
                policy,
                || async {
                    let mut request = tonic::Request::new(pb::PacketBatch {
                        packets: batch.clone(),
                    });
                    request
                        .metadata_mut()
                        .insert("agent-name", agent_name.clone());

                    let mut client = client.clone();
                    client
                        .send_packet(request)
                        .await
                        .map_err(backoff::Error::transient)?;
                    Ok(())
                },
                |err: tonic::Status, wait| {
                    warn!(%err, ?wait, "batch send failed, retrying");
                },
            )
            .await
        }
        .instrument(span)
        .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tokio_stream::wrappers::TcpListenerStream;
    use tonic::{Request, Response, Status};

    use framevault_proto::{Archivist, ArchivistServer, PacketBatch, SendPacketResp};

    use super::*;

    #[derive(Default)]
    struct Recording {
        agents: Mutex<Vec<String>>,
        batch_sizes: Mutex<Vec<usize>>,
        attempts: AtomicUsize,
        failures_left: AtomicUsize,
    }

    struct RecordingArchivist {
        state: Arc<Recording>,
    }

    #[tonic::async_trait]
    impl Archivist for RecordingArchivist {
        async fn send_packet(
            &self,
            request: Request<PacketBatch>,
        ) -> Result<Response<SendPacketResp>, Status> {
            self.state.attempts.fetch_add(1, Ordering::SeqCst);

            if self
                .state
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Status::unavailable("not ready yet"));
            }

            let agent = request
                .metadata()
                .get("agent-name")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("<missing>")
                .to_owned();
            self.state.agents.lock().push(agent);
            self.state
                .batch_sizes
                .lock()
                .push(request.into_inner().packets.len());

            Ok(Response::new(SendPacketResp {}))
        }
    }

    async fn spawn_archivist(state: Arc<Recording>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(
            tonic::transport::Server::builder()
                .add_service(ArchivistServer::new(RecordingArchivist { state }))
                .serve_with_incoming(TcpListenerStream::new(listener)),
        );

        format!("http://{addr}")
    }

    fn wire_packet(id: &str) -> pb::Packet {
        pb::Packet {
            id: id.into(),
            data: vec![1, 2, 3],
            timestamp: 0,
            timestamp_nano: 1_700_000_000_000_000_000,
            capture_length: 3,
            data_length: 3,
        }
    }

    #[tokio::test]
    async fn batches_arrive_with_agent_metadata() {
        let state = Arc::new(Recording::default());
        let addr = spawn_archivist(state.clone()).await;

        let channel = Endpoint::from_shared(addr).unwrap().connect().await.unwrap();
        let (tx, rx) = mpsc::channel(1);
        let dispatch = tokio::spawn(dispatch_loop(
            ArchivistClient::new(channel),
            MetadataValue::try_from("edge-1").unwrap(),
            rx,
        ));

        tx.send(vec![wire_packet("a"), wire_packet("b")])
            .await
            .unwrap();
        tx.send(vec![wire_packet("c")]).await.unwrap();
        drop(tx);

        dispatch.await.unwrap().unwrap();
        assert_eq!(
            *state.agents.lock(),
            vec!["edge-1".to_owned(), "edge-1".to_owned()]
        );
        assert_eq!(*state.batch_sizes.lock(), vec![2, 1]);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_the_batch_lands() {
        let state = Arc::new(Recording::default());
        state.failures_left.store(2, Ordering::SeqCst);
        let addr = spawn_archivist(state.clone()).await;

        let channel = Endpoint::from_shared(addr).unwrap().connect().await.unwrap();
        let (tx, rx) = mpsc::channel(1);
        let dispatch = tokio::spawn(dispatch_loop(
            ArchivistClient::new(channel),
            MetadataValue::try_from("edge-1").unwrap(),
            rx,
        ));

        tx.send(vec![wire_packet("a")]).await.unwrap();
        drop(tx);

        dispatch.await.unwrap().unwrap();
        assert_eq!(state.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(*state.batch_sizes.lock(), vec![1]);
    }
}
