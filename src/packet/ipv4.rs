//! IPv4 and L4 header decoding
//!
//! Zero-copy views over raw frames as they come off the tun fd. Only the
//! fields the router acts on are exposed; options are accepted and skipped
//! via the IHL.

use std::net::Ipv4Addr;

use crate::error::PacketError;
use crate::packet::{PROTO_ICMP, PROTO_TCP, PROTO_UDP};

/// Minimum IPv4 header length
pub const IPV4_MIN_HEADER: usize = 20;
/// UDP header length
pub const UDP_HEADER: usize = 8;
/// Minimum TCP header length
pub const TCP_MIN_HEADER: usize = 20;
/// ICMP header length (echo)
pub const ICMP_HEADER: usize = 8;

/// Decoded view of an IPv4 frame
#[derive(Debug, Clone, Copy)]
pub struct Ipv4Packet<'a> {
    buf: &'a [u8],
    header_len: usize,
    total_len: usize,
}

impl<'a> Ipv4Packet<'a> {
    /// Decode the fixed part of an IPv4 header
    ///
    /// Accepts options (skipped via IHL). The frame may carry trailing
    /// bytes beyond the IP total length; they are ignored.
    ///
    /// # Errors
    ///
    /// Fails on truncation, non-4 version, bad IHL, or a total length that
    /// overruns the buffer.
    pub fn parse(buf: &'a [u8]) -> Result<Self, PacketError> {
        if buf.len() < IPV4_MIN_HEADER {
            return Err(PacketError::Truncated {
                needed: IPV4_MIN_HEADER,
                got: buf.len(),
            });
        }
        let version = buf[0] >> 4;
        if version != 4 {
            return Err(PacketError::UnsupportedVersion(version));
        }
        let header_len = usize::from(buf[0] & 0x0F) * 4;
        if header_len < IPV4_MIN_HEADER {
            return Err(PacketError::malformed(format!("IHL {header_len} < 20")));
        }
        let total_len = usize::from(u16::from_be_bytes([buf[2], buf[3]]));
        if total_len < header_len || total_len > buf.len() {
            return Err(PacketError::malformed(format!(
                "total length {total_len} inconsistent with buffer of {}",
                buf.len()
            )));
        }
        Ok(Self {
            buf,
            header_len,
            total_len,
        })
    }

    /// L4 protocol number
    #[must_use]
    pub fn protocol(&self) -> u8 {
        self.buf[9]
    }

    /// Source address
    #[must_use]
    pub fn src(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.buf[12], self.buf[13], self.buf[14], self.buf[15])
    }

    /// Destination address
    #[must_use]
    pub fn dst(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.buf[16], self.buf[17], self.buf[18], self.buf[19])
    }

    /// Header length in bytes (IHL x 4)
    #[must_use]
    pub fn header_len(&self) -> usize {
        self.header_len
    }

    /// Total frame length per the IP header
    #[must_use]
    pub fn total_len(&self) -> usize {
        self.total_len
    }

    /// L4 payload (everything between the IP header and total length)
    #[must_use]
    pub fn payload(&self) -> &'a [u8] {
        &self.buf[self.header_len..self.total_len]
    }

    /// Is this a protocol the router forwards?
    #[must_use]
    pub fn is_supported(&self) -> bool {
        matches!(self.protocol(), PROTO_UDP | PROTO_TCP | PROTO_ICMP)
    }
}

/// Decoded view of a UDP datagram
#[derive(Debug, Clone, Copy)]
pub struct UdpDatagram<'a> {
    /// Source port
    pub src_port: u16,
    /// Destination port
    pub dst_port: u16,
    /// Datagram payload
    pub payload: &'a [u8],
}

impl<'a> UdpDatagram<'a> {
    /// Decode a UDP header from an IP payload
    ///
    /// # Errors
    ///
    /// Fails when the payload is shorter than the UDP header or the UDP
    /// length field overruns it.
    pub fn parse(l4: &'a [u8]) -> Result<Self, PacketError> {
        if l4.len() < UDP_HEADER {
            return Err(PacketError::Truncated {
                needed: UDP_HEADER,
                got: l4.len(),
            });
        }
        let udp_len = usize::from(u16::from_be_bytes([l4[4], l4[5]]));
        if udp_len < UDP_HEADER || udp_len > l4.len() {
            return Err(PacketError::malformed(format!("UDP length {udp_len}")));
        }
        Ok(Self {
            src_port: u16::from_be_bytes([l4[0], l4[1]]),
            dst_port: u16::from_be_bytes([l4[2], l4[3]]),
            payload: &l4[UDP_HEADER..udp_len],
        })
    }
}

/// TCP flag bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    /// FIN bit
    pub const FIN: u8 = 0x01;
    /// SYN bit
    pub const SYN: u8 = 0x02;
    /// RST bit
    pub const RST: u8 = 0x04;
    /// PSH bit
    pub const PSH: u8 = 0x08;
    /// ACK bit
    pub const ACK: u8 = 0x10;
    /// URG bit
    pub const URG: u8 = 0x20;

    /// FIN set?
    #[must_use]
    pub fn fin(self) -> bool {
        self.0 & Self::FIN != 0
    }
    /// SYN set?
    #[must_use]
    pub fn syn(self) -> bool {
        self.0 & Self::SYN != 0
    }
    /// RST set?
    #[must_use]
    pub fn rst(self) -> bool {
        self.0 & Self::RST != 0
    }
    /// PSH set?
    #[must_use]
    pub fn psh(self) -> bool {
        self.0 & Self::PSH != 0
    }
    /// ACK set?
    #[must_use]
    pub fn ack(self) -> bool {
        self.0 & Self::ACK != 0
    }
    /// URG set?
    #[must_use]
    pub fn urg(self) -> bool {
        self.0 & Self::URG != 0
    }
}

impl std::fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (bit, name) in [
            (Self::SYN, "SYN"),
            (Self::ACK, "ACK"),
            (Self::FIN, "FIN"),
            (Self::RST, "RST"),
            (Self::PSH, "PSH"),
            (Self::URG, "URG"),
        ] {
            if self.0 & bit != 0 {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        if first {
            write!(f, "-")?;
        }
        Ok(())
    }
}

/// Decoded view of a TCP segment
#[derive(Debug, Clone, Copy)]
pub struct TcpSegment<'a> {
    /// Source port
    pub src_port: u16,
    /// Destination port
    pub dst_port: u16,
    /// Sequence number
    pub seq: u32,
    /// Acknowledgment number
    pub ack: u32,
    /// Flag bits
    pub flags: TcpFlags,
    /// Advertised window
    pub window: u16,
    /// Segment payload (after options)
    pub payload: &'a [u8],
}

impl<'a> TcpSegment<'a> {
    /// Decode a TCP header from an IP payload
    ///
    /// # Errors
    ///
    /// Fails on truncation or a data offset that overruns the payload.
    pub fn parse(l4: &'a [u8]) -> Result<Self, PacketError> {
        if l4.len() < TCP_MIN_HEADER {
            return Err(PacketError::Truncated {
                needed: TCP_MIN_HEADER,
                got: l4.len(),
            });
        }
        let data_offset = usize::from(l4[12] >> 4) * 4;
        if data_offset < TCP_MIN_HEADER || data_offset > l4.len() {
            return Err(PacketError::malformed(format!(
                "TCP data offset {data_offset}"
            )));
        }
        Ok(Self {
            src_port: u16::from_be_bytes([l4[0], l4[1]]),
            dst_port: u16::from_be_bytes([l4[2], l4[3]]),
            seq: u32::from_be_bytes([l4[4], l4[5], l4[6], l4[7]]),
            ack: u32::from_be_bytes([l4[8], l4[9], l4[10], l4[11]]),
            flags: TcpFlags(l4[13] & 0x3F),
            window: u16::from_be_bytes([l4[14], l4[15]]),
            payload: &l4[data_offset..],
        })
    }

    /// Sequence space the segment occupies (payload plus SYN/FIN)
    #[must_use]
    pub fn seq_len(&self) -> u32 {
        let mut len = self.payload.len() as u32;
        if self.flags.syn() {
            len += 1;
        }
        if self.flags.fin() {
            len += 1;
        }
        len
    }
}

/// Decoded view of an ICMP message
#[derive(Debug, Clone, Copy)]
pub struct IcmpMessage<'a> {
    /// ICMP type
    pub icmp_type: u8,
    /// ICMP code
    pub code: u8,
    /// Rest of the message after type/code/checksum (identifier onward)
    pub rest: &'a [u8],
}

impl<'a> IcmpMessage<'a> {
    /// Echo request type
    pub const ECHO_REQUEST: u8 = 8;
    /// Echo reply type
    pub const ECHO_REPLY: u8 = 0;

    /// Decode an ICMP header from an IP payload
    ///
    /// # Errors
    ///
    /// Fails when the payload is shorter than the 8-byte echo header.
    pub fn parse(l4: &'a [u8]) -> Result<Self, PacketError> {
        if l4.len() < ICMP_HEADER {
            return Err(PacketError::Truncated {
                needed: ICMP_HEADER,
                got: l4.len(),
            });
        }
        Ok(Self {
            icmp_type: l4[0],
            code: l4[1],
            rest: &l4[4..],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::builder::FrameBuilder;

    #[test]
    fn test_rejects_ipv6() {
        let mut frame = [0u8; 40];
        frame[0] = 0x60;
        assert!(matches!(
            Ipv4Packet::parse(&frame),
            Err(PacketError::UnsupportedVersion(6))
        ));
    }

    #[test]
    fn test_rejects_truncated() {
        let frame = [0x45u8; 10];
        assert!(matches!(
            Ipv4Packet::parse(&frame),
            Err(PacketError::Truncated { .. })
        ));
    }

    #[test]
    fn test_rejects_bad_total_length() {
        let mut frame = vec![0u8; 20];
        frame[0] = 0x45;
        frame[2..4].copy_from_slice(&100u16.to_be_bytes());
        assert!(matches!(
            Ipv4Packet::parse(&frame),
            Err(PacketError::Malformed(_))
        ));
    }

    #[test]
    fn test_parses_options_via_ihl() {
        // IHL = 6 -> 24-byte header with 4 bytes of options
        let mut frame = vec![0u8; 32];
        frame[0] = 0x46;
        frame[2..4].copy_from_slice(&32u16.to_be_bytes());
        frame[9] = PROTO_UDP;
        let pkt = Ipv4Packet::parse(&frame).unwrap();
        assert_eq!(pkt.header_len(), 24);
        assert_eq!(pkt.payload().len(), 8);
    }

    #[test]
    fn test_udp_roundtrip_through_builder() {
        let builder = FrameBuilder::new();
        let frame = builder.udp_frame(
            "8.8.8.8".parse().unwrap(),
            53,
            "10.0.0.2".parse().unwrap(),
            40000,
            b"response",
        );
        let pkt = Ipv4Packet::parse(&frame).unwrap();
        assert_eq!(pkt.protocol(), PROTO_UDP);
        assert_eq!(pkt.src(), "8.8.8.8".parse::<Ipv4Addr>().unwrap());
        assert_eq!(pkt.dst(), "10.0.0.2".parse::<Ipv4Addr>().unwrap());
        let udp = UdpDatagram::parse(pkt.payload()).unwrap();
        assert_eq!(udp.src_port, 53);
        assert_eq!(udp.dst_port, 40000);
        assert_eq!(udp.payload, b"response");
    }

    #[test]
    fn test_tcp_roundtrip_through_builder() {
        let builder = FrameBuilder::new();
        let frame = builder.tcp_frame(
            "93.184.216.34".parse().unwrap(),
            443,
            "10.0.0.2".parse().unwrap(),
            55000,
            0xDEAD_BEEF,
            0x0102_0304,
            TcpFlags(TcpFlags::SYN | TcpFlags::ACK),
            b"",
        );
        let pkt = Ipv4Packet::parse(&frame).unwrap();
        assert_eq!(pkt.protocol(), PROTO_TCP);
        let tcp = TcpSegment::parse(pkt.payload()).unwrap();
        assert_eq!(tcp.src_port, 443);
        assert_eq!(tcp.dst_port, 55000);
        assert_eq!(tcp.seq, 0xDEAD_BEEF);
        assert_eq!(tcp.ack, 0x0102_0304);
        assert!(tcp.flags.syn() && tcp.flags.ack());
        assert!(!tcp.flags.fin());
        assert_eq!(tcp.seq_len(), 1);
        assert!(tcp.payload.is_empty());
    }

    #[test]
    fn test_tcp_flags_display() {
        let flags = TcpFlags(TcpFlags::SYN | TcpFlags::ACK);
        assert_eq!(flags.to_string(), "SYN|ACK");
        assert_eq!(TcpFlags(0).to_string(), "-");
    }

    #[test]
    fn test_seq_len_counts_syn_fin_and_payload() {
        let mut l4 = vec![0u8; 24];
        l4[12] = 0x50; // offset 20
        l4[13] = TcpFlags::FIN | TcpFlags::ACK;
        let seg = TcpSegment::parse(&l4).unwrap();
        assert_eq!(seg.seq_len(), 4 + 1); // 4 payload bytes + FIN
    }
}
