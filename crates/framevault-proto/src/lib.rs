pub mod framevault {
    tonic::include_proto!("framevault");
}

pub use framevault::archivist_client::ArchivistClient;
pub use framevault::archivist_server::{Archivist, ArchivistServer};
pub use framevault::{IndexArray, Packet, PacketBatch, SendPacketResp};
