use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::error;

use framevault_core::{Packet, Stats};
use framevault_proto::{Archivist, PacketBatch, SendPacketResp};
use framevault_store::{DataStore, IndexStore, StoreError};

/// gRPC ingest endpoint: decode, account, persist, index, ack.
pub struct ArchivistService {
    data: Arc<dyn DataStore>,
    index: Arc<dyn IndexStore>,
    stats: Arc<Stats>,
}

impl ArchivistService {
    pub fn new(data: Arc<dyn DataStore>, index: Arc<dyn IndexStore>, stats: Arc<Stats>) -> Self {
        Self { data, index, stats }
    }
}

fn internal(err: &StoreError) -> Status {
    error!(%err, "batch ingest failed");
    Status::internal(err.to_string())
}

#[tonic::async_trait]
impl Archivist for ArchivistService {
    #[tracing::instrument(skip_all)]
    async fn send_packet(
        &self,
        request: Request<PacketBatch>,
    ) -> Result<Response<SendPacketResp>, Status> {
        let agent = request
            .metadata()
            .get("agent-name")
            .and_then(|v| v.to_str().ok())
            .map(ToOwned::to_owned)
            .ok_or_else(|| Status::invalid_argument("agent-name metadata is required"))?;

        let batch = request.into_inner();
        let packets: Vec<Packet> = batch.packets.iter().map(Packet::from_proto).collect();

        if let Some(last) = packets.iter().map(|p| p.timestamp).max() {
            self.stats.register(&agent, last, packets.len() as u64);
        }

        // Data lands before the index. If the index write fails the batch is
        // rejected; rows already stored stay dark until TTL reclaims them.
        self.data
            .store(&packets)
            .await
            .map_err(|err| internal(&err))?;
        self.index
            .index(&packets)
            .await
            .map_err(|err| internal(&err))?;

        Ok(Response::new(SendPacketResp {}))
    }
}
