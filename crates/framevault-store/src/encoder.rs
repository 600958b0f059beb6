use framevault_proto::IndexArray;
use prost::Message;

#[derive(Debug, thiserror::Error)]
#[error("index value decode failed: {0}")]
pub struct EncodeError(#[from] prost::DecodeError);

/// Serialization of an index value, the set of packet ids bound to one key.
///
/// Only the logical round-trip is guaranteed: decoding a serialized value
/// yields the same ids in the same order. The byte representation itself may
/// differ between encoders.
pub trait IndexEncoder: Send + Sync {
    fn new_empty(&self) -> Box<dyn IndexValue>;
    fn from_bytes(&self, data: &[u8]) -> Result<Box<dyn IndexValue>, EncodeError>;
}

pub trait IndexValue: Send {
    /// Append ids in order. Duplicates are kept; consumers treat decoded id
    /// lists as multisets.
    fn add(&mut self, ids: &[String]);
    fn serialize(&self) -> Vec<u8>;
    fn ids(&self) -> &[String];
}

/// Stock encoder: a length-prefixed protobuf list (`IndexArray`).
#[derive(Debug, Default, Clone, Copy)]
pub struct ProtoEncoder;

struct ProtoValue {
    list: IndexArray,
}

impl IndexEncoder for ProtoEncoder {
    fn new_empty(&self) -> Box<dyn IndexValue> {
        Box::new(ProtoValue {
            list: IndexArray::default(),
        })
    }

    fn from_bytes(&self, data: &[u8]) -> Result<Box<dyn IndexValue>, EncodeError> {
        let list = IndexArray::decode(data)?;
        Ok(Box::new(ProtoValue { list }))
    }
}

impl IndexValue for ProtoValue {
    fn add(&mut self, ids: &[String]) {
        self.list.ids.extend_from_slice(ids);
    }

    fn serialize(&self) -> Vec<u8> {
        self.list.encode_to_vec()
    }

    fn ids(&self) -> &[String] {
        &self.list.ids
    }
}
