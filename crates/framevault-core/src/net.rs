use std::net::Ipv4Addr;

use etherparse::{NetSlice, SlicedPacket};

/// Pull the IPv4 source and destination addresses out of an Ethernet frame.
///
/// Anything that is not Ethernet/IPv4 (ARP, IPv6, truncated frames) yields
/// `None`; such packets are stored but never indexed. No reassembly is
/// attempted, only what the IPv4 header itself carries.
pub fn extract_ipv4(frame: &[u8]) -> Option<(Ipv4Addr, Ipv4Addr)> {
    let sliced = SlicedPacket::from_ethernet(frame).ok()?;

    match sliced.net {
        Some(NetSlice::Ipv4(ip)) => {
            let header = ip.header();
            Some((header.source_addr(), header.destination_addr()))
        }
        _ => None,
    }
}

/// Test frames used across the workspace: a minimal Ethernet/IPv4/UDP packet
/// between the two given addresses.
#[cfg(any(test, feature = "test-util"))]
pub fn build_ipv4_frame(src: Ipv4Addr, dst: Ipv4Addr) -> Vec<u8> {
    let builder = etherparse::PacketBuilder::ethernet2(
        [0x02, 0x00, 0x5e, 0x10, 0x00, 0x00],
        [0x02, 0x00, 0x5e, 0x10, 0x00, 0x01],
    )
    .ipv4(src.octets(), dst.octets(), 64)
    .udp(12345, 80);

    let payload = b"test";
    let mut frame = Vec::with_capacity(builder.size(payload.len()));
    builder
        .write(&mut frame, payload)
        .expect("serializing a fixed test frame cannot fail");
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_both_addresses() {
        let src = Ipv4Addr::new(172, 16, 0, 1);
        let dst = Ipv4Addr::new(1, 2, 3, 4);
        let frame = build_ipv4_frame(src, dst);

        assert_eq!(extract_ipv4(&frame), Some((src, dst)));
    }

    #[test]
    fn non_ipv4_frames_are_skipped() {
        // Ethernet header with an ARP ethertype and no payload worth parsing.
        let mut frame = vec![0u8; 14];
        frame[12] = 0x08;
        frame[13] = 0x06;
        assert_eq!(extract_ipv4(&frame), None);
    }

    #[test]
    fn garbage_is_skipped() {
        assert_eq!(extract_ipv4(&[0x01, 0x02]), None);
    }
}
