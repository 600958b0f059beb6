#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod net;
pub mod packet;
pub mod pcap;
pub mod query;
pub mod stats;

pub use packet::{Packet, PacketDecodeError};
pub use query::FindQuery;
pub use stats::{SourceSnapshot, Stats};
