use std::io::{self, Write};

use byteorder::{LittleEndian, WriteBytesExt};

use crate::packet::Packet;

/// Classic tcpdump magic (microsecond timestamps, host-endian written LE).
pub const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
pub const LINKTYPE_ETHERNET: u32 = 1;
pub const DEFAULT_SNAPLEN: u32 = 65535;

const VERSION_MAJOR: u16 = 2;
const VERSION_MINOR: u16 = 4;

/// Streaming writer for the legacy pcap file format.
pub struct PcapWriter<W: Write> {
    out: W,
}

impl<W: Write> PcapWriter<W> {
    /// Write the 24-byte global header and return the writer.
    pub fn new(mut out: W, snaplen: u32) -> io::Result<Self> {
        out.write_u32::<LittleEndian>(PCAP_MAGIC)?;
        out.write_u16::<LittleEndian>(VERSION_MAJOR)?;
        out.write_u16::<LittleEndian>(VERSION_MINOR)?;
        out.write_i32::<LittleEndian>(0)?; // thiszone
        out.write_u32::<LittleEndian>(0)?; // sigfigs
        out.write_u32::<LittleEndian>(snaplen)?;
        out.write_u32::<LittleEndian>(LINKTYPE_ETHERNET)?;
        Ok(Self { out })
    }

    /// Append one record: 16-byte header then the frame bytes.
    ///
    /// `incl_len` is taken from the bytes actually present so the file can
    /// never claim more data than it carries; `orig_len` reports the on-wire
    /// length seen at capture time.
    pub fn write_packet(&mut self, pkt: &Packet) -> io::Result<()> {
        let incl_len = pkt.data.len() as u32;
        let orig_len = if pkt.data_length == 0 {
            incl_len
        } else {
            pkt.data_length as u32
        };

        self.out
            .write_u32::<LittleEndian>(pkt.timestamp.timestamp() as u32)?;
        self.out
            .write_u32::<LittleEndian>(pkt.timestamp.timestamp_subsec_micros())?;
        self.out.write_u32::<LittleEndian>(incl_len)?;
        self.out.write_u32::<LittleEndian>(orig_len)?;
        self.out.write_all(&pkt.data)?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    fn pkt(ts_nanos: i64, data: Vec<u8>) -> Packet {
        Packet {
            id: "p".into(),
            data_length: data.len() as u64,
            capture_length: data.len() as u64,
            data,
            timestamp: DateTime::from_timestamp_nanos(ts_nanos),
        }
    }

    #[test]
    fn global_header_layout() {
        let writer = PcapWriter::new(Vec::new(), DEFAULT_SNAPLEN).unwrap();
        let buf = writer.into_inner();

        assert_eq!(buf.len(), 24);
        assert_eq!(&buf[0..4], &PCAP_MAGIC.to_le_bytes());
        assert_eq!(&buf[4..6], &2u16.to_le_bytes());
        assert_eq!(&buf[6..8], &4u16.to_le_bytes());
        assert_eq!(&buf[16..20], &65535u32.to_le_bytes());
        assert_eq!(&buf[20..24], &1u32.to_le_bytes());
    }

    #[test]
    fn record_header_carries_capture_time_and_lengths() {
        let mut writer = PcapWriter::new(Vec::new(), DEFAULT_SNAPLEN).unwrap();
        // 1.000500 seconds after the epoch.
        writer
            .write_packet(&pkt(1_000_500_000, vec![0xaa, 0xbb, 0xcc]))
            .unwrap();
        let buf = writer.into_inner();

        let record = &buf[24..];
        assert_eq!(&record[0..4], &1u32.to_le_bytes()); // ts_sec
        assert_eq!(&record[4..8], &500_000u32.to_le_bytes()); // ts_usec
        assert_eq!(&record[8..12], &3u32.to_le_bytes()); // incl_len
        assert_eq!(&record[12..16], &3u32.to_le_bytes()); // orig_len
        assert_eq!(&record[16..], &[0xaa, 0xbb, 0xcc]);
    }
}
