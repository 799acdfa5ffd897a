//! Reply frame synthesis
//!
//! The router answers the tun-side client as if it were the remote peer, so
//! every frame it writes back is built from scratch here: fresh IPv4 header
//! (TTL 64, router-wide wrapping 16-bit ID counter), L4 header, both
//! checksums.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU16, Ordering};

use bytes::Bytes;

use crate::packet::checksum::{ipv4_header_checksum, l4_checksum, udp_checksum};
use crate::packet::ipv4::{TcpFlags, IPV4_MIN_HEADER, TCP_MIN_HEADER, UDP_HEADER};
use crate::packet::{PROTO_ICMP, PROTO_TCP, PROTO_UDP};

/// Time-to-live for synthesized frames
const TTL: u8 = 64;

/// Receive window advertised on synthesized TCP segments
pub const ADVERTISED_WINDOW: u16 = 0xFFFF;

/// Builder for synthesized IPv4 frames
///
/// One instance per router; the IP ID counter is shared by all flows and
/// wraps at 16 bits.
#[derive(Debug, Default)]
pub struct FrameBuilder {
    ip_id: AtomicU16,
}

impl FrameBuilder {
    /// Create a builder with the ID counter at zero
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> u16 {
        self.ip_id.fetch_add(1, Ordering::Relaxed)
    }

    fn write_ipv4_header(
        &self,
        buf: &mut [u8],
        protocol: u8,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        total_len: u16,
    ) {
        buf[0] = 0x45; // version 4, IHL 5
        buf[1] = 0;
        buf[2..4].copy_from_slice(&total_len.to_be_bytes());
        buf[4..6].copy_from_slice(&self.next_id().to_be_bytes());
        buf[6..8].copy_from_slice(&[0, 0]); // no fragmentation
        buf[8] = TTL;
        buf[9] = protocol;
        buf[10..12].copy_from_slice(&[0, 0]);
        buf[12..16].copy_from_slice(&src.octets());
        buf[16..20].copy_from_slice(&dst.octets());
        let sum = ipv4_header_checksum(&buf[..IPV4_MIN_HEADER]);
        buf[10..12].copy_from_slice(&sum.to_be_bytes());
    }

    /// Build a complete IPv4+UDP frame
    #[must_use]
    pub fn udp_frame(
        &self,
        src: Ipv4Addr,
        src_port: u16,
        dst: Ipv4Addr,
        dst_port: u16,
        payload: &[u8],
    ) -> Bytes {
        let udp_len = UDP_HEADER + payload.len();
        let total = IPV4_MIN_HEADER + udp_len;
        let mut buf = vec![0u8; total];

        self.write_ipv4_header(&mut buf, PROTO_UDP, src, dst, total as u16);

        let udp = &mut buf[IPV4_MIN_HEADER..];
        udp[0..2].copy_from_slice(&src_port.to_be_bytes());
        udp[2..4].copy_from_slice(&dst_port.to_be_bytes());
        udp[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
        udp[6..8].copy_from_slice(&[0, 0]);
        udp[UDP_HEADER..].copy_from_slice(payload);
        let sum = udp_checksum(src, dst, udp);
        buf[IPV4_MIN_HEADER + 6..IPV4_MIN_HEADER + 8].copy_from_slice(&sum.to_be_bytes());

        Bytes::from(buf)
    }

    /// Build a complete IPv4+TCP frame (no TCP options)
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn tcp_frame(
        &self,
        src: Ipv4Addr,
        src_port: u16,
        dst: Ipv4Addr,
        dst_port: u16,
        seq: u32,
        ack: u32,
        flags: TcpFlags,
        payload: &[u8],
    ) -> Bytes {
        let tcp_len = TCP_MIN_HEADER + payload.len();
        let total = IPV4_MIN_HEADER + tcp_len;
        let mut buf = vec![0u8; total];

        self.write_ipv4_header(&mut buf, PROTO_TCP, src, dst, total as u16);

        let tcp = &mut buf[IPV4_MIN_HEADER..];
        tcp[0..2].copy_from_slice(&src_port.to_be_bytes());
        tcp[2..4].copy_from_slice(&dst_port.to_be_bytes());
        tcp[4..8].copy_from_slice(&seq.to_be_bytes());
        tcp[8..12].copy_from_slice(&ack.to_be_bytes());
        tcp[12] = ((TCP_MIN_HEADER / 4) as u8) << 4;
        tcp[13] = flags.0;
        tcp[14..16].copy_from_slice(&ADVERTISED_WINDOW.to_be_bytes());
        // checksum and urgent pointer stay zero for the sum
        tcp[TCP_MIN_HEADER..].copy_from_slice(payload);
        let sum = l4_checksum(src, dst, PROTO_TCP, tcp);
        buf[IPV4_MIN_HEADER + 16..IPV4_MIN_HEADER + 18].copy_from_slice(&sum.to_be_bytes());

        Bytes::from(buf)
    }

    /// Build a complete IPv4+ICMP frame
    ///
    /// `rest` is everything after type/code/checksum (identifier onward).
    #[must_use]
    pub fn icmp_frame(
        &self,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        icmp_type: u8,
        code: u8,
        rest: &[u8],
    ) -> Bytes {
        let icmp_len = 4 + rest.len();
        let total = IPV4_MIN_HEADER + icmp_len;
        let mut buf = vec![0u8; total];

        self.write_ipv4_header(&mut buf, PROTO_ICMP, src, dst, total as u16);

        let icmp = &mut buf[IPV4_MIN_HEADER..];
        icmp[0] = icmp_type;
        icmp[1] = code;
        icmp[4..].copy_from_slice(rest);
        // ICMP checksum covers the ICMP message only, no pseudo-header.
        let sum = crate::packet::checksum::checksum(icmp);
        buf[IPV4_MIN_HEADER + 2..IPV4_MIN_HEADER + 4].copy_from_slice(&sum.to_be_bytes());

        Bytes::from(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::checksum::verify_ipv4_header;
    use crate::packet::ipv4::Ipv4Packet;

    #[test]
    fn test_ip_id_increments_and_wraps() {
        let builder = FrameBuilder::new();
        builder.ip_id.store(0xFFFE, Ordering::Relaxed);
        let src = "10.0.0.2".parse().unwrap();
        let dst = "1.1.1.1".parse().unwrap();
        let ids: Vec<u16> = (0..3)
            .map(|_| {
                let frame = builder.udp_frame(src, 1, dst, 2, b"x");
                u16::from_be_bytes([frame[4], frame[5]])
            })
            .collect();
        assert_eq!(ids, vec![0xFFFE, 0xFFFF, 0x0000]);
    }

    #[test]
    fn test_udp_frame_checksums_verify() {
        let builder = FrameBuilder::new();
        let frame = builder.udp_frame(
            "8.8.8.8".parse().unwrap(),
            53,
            "10.0.0.2".parse().unwrap(),
            41000,
            b"dns bytes",
        );
        assert!(verify_ipv4_header(&frame[..20]));
        // Full L4 sum including the filled checksum field folds to zero.
        let pkt = Ipv4Packet::parse(&frame).unwrap();
        let sum = l4_checksum(pkt.src(), pkt.dst(), PROTO_UDP, pkt.payload());
        assert_eq!(sum, 0);
    }

    #[test]
    fn test_tcp_frame_checksums_verify() {
        let builder = FrameBuilder::new();
        let frame = builder.tcp_frame(
            "93.184.216.34".parse().unwrap(),
            80,
            "10.0.0.2".parse().unwrap(),
            51000,
            1000,
            2000,
            TcpFlags(TcpFlags::ACK | TcpFlags::PSH),
            b"hello over tcp",
        );
        assert!(verify_ipv4_header(&frame[..20]));
        let pkt = Ipv4Packet::parse(&frame).unwrap();
        let sum = l4_checksum(pkt.src(), pkt.dst(), PROTO_TCP, pkt.payload());
        assert_eq!(sum, 0);
    }

    #[test]
    fn test_frame_ttl_and_no_fragment() {
        let builder = FrameBuilder::new();
        let frame = builder.icmp_frame(
            "1.1.1.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            0,
            0,
            &[0xAB; 12],
        );
        assert_eq!(frame[8], 64);
        assert_eq!(&frame[6..8], &[0, 0]);
        assert!(verify_ipv4_header(&frame[..20]));
        let icmp = &frame[20..];
        assert_eq!(crate::packet::checksum::checksum(icmp), 0);
    }
}
