use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use chrono::{DateTime, Duration, Utc};

use framevault_proto as pb;

/// A captured link-layer frame together with its capture metadata.
///
/// The `id` is unique across all agents (k-sortable), `data` holds the raw
/// Ethernet frame and `timestamp` the capture time with nanosecond precision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: String,
    pub data: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub capture_length: u64,
    pub data_length: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum PacketDecodeError {
    #[error("truncated packet record")]
    Truncated,
    #[error("packet id is not valid utf-8")]
    InvalidId,
}

impl Packet {
    /// Rebuild the in-core packet from its wire form.
    ///
    /// Legacy agents put whole seconds in `timestamp`; current agents put the
    /// full capture time in `timestamp_nano` and leave `timestamp` at zero.
    /// Adding both covers either generation.
    pub fn from_proto(p: &pb::Packet) -> Self {
        let nanos = p
            .timestamp
            .saturating_mul(1_000_000_000)
            .saturating_add(p.timestamp_nano);

        Self {
            id: p.id.clone(),
            data: p.data.clone(),
            timestamp: DateTime::from_timestamp_nanos(nanos),
            capture_length: p.capture_length as u64,
            data_length: p.data_length as u64,
        }
    }

    pub fn to_proto(&self) -> pb::Packet {
        pb::Packet {
            id: self.id.clone(),
            data: self.data.clone(),
            timestamp: 0,
            timestamp_nano: self.timestamp.timestamp_nanos_opt().unwrap_or_default(),
            capture_length: self.capture_length as i64,
            data_length: self.data_length as i64,
        }
    }

    /// Stable on-disk value encoding, little-endian and length-prefixed:
    /// `u16 id_len | id | i64 timestamp_ns | u64 capture_length |
    /// u64 data_length | u32 data_len | data`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 + self.id.len() + 8 + 8 + 8 + 4 + self.data.len());

        buf.extend_from_slice(&(self.id.len() as u16).to_le_bytes());
        buf.extend_from_slice(self.id.as_bytes());
        buf.extend_from_slice(
            &self
                .timestamp
                .timestamp_nanos_opt()
                .unwrap_or_default()
                .to_le_bytes(),
        );
        buf.extend_from_slice(&self.capture_length.to_le_bytes());
        buf.extend_from_slice(&self.data_length.to_le_bytes());
        buf.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.data);

        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, PacketDecodeError> {
        let mut cursor = Cursor::new(data);

        let id_len = cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| PacketDecodeError::Truncated)?;
        let mut id_buf = vec![0u8; id_len as usize];
        std::io::Read::read_exact(&mut cursor, &mut id_buf)
            .map_err(|_| PacketDecodeError::Truncated)?;
        let id = String::from_utf8(id_buf).map_err(|_| PacketDecodeError::InvalidId)?;

        let nanos = cursor
            .read_i64::<LittleEndian>()
            .map_err(|_| PacketDecodeError::Truncated)?;
        let capture_length = cursor
            .read_u64::<LittleEndian>()
            .map_err(|_| PacketDecodeError::Truncated)?;
        let data_length = cursor
            .read_u64::<LittleEndian>()
            .map_err(|_| PacketDecodeError::Truncated)?;

        let frame_len = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| PacketDecodeError::Truncated)?;
        let mut frame = vec![0u8; frame_len as usize];
        std::io::Read::read_exact(&mut cursor, &mut frame)
            .map_err(|_| PacketDecodeError::Truncated)?;

        Ok(Self {
            id,
            data: frame,
            timestamp: DateTime::from_timestamp_nanos(nanos),
            capture_length,
            data_length,
        })
    }

    /// Entries become inaccessible once `timestamp + retention` has passed.
    pub fn expires_at(&self, retention: Duration) -> DateTime<Utc> {
        self.timestamp + retention
    }
}
