//! Per-flow state and protocol handlers
//!
//! The router keeps one session per UDP or TCP 5-tuple, each owning a
//! "protected" native socket that forwards on behalf of the tunneled
//! client. ICMP needs no session: echo replies are synthesized on the spot.

pub mod icmp;
pub mod table;
pub mod tcp;
pub mod udp;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::RawFd;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::clock::PacketClock;
use crate::packet::FrameBuilder;
use crate::router::stats::RouterStats;
use crate::router::RouterEvent;
use crate::shaper::Shaper;

pub use table::SessionTable;
pub use tcp::TcpSession;
pub use udp::UdpSession;

/// Transport protocol of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowProto {
    /// UDP flow
    Udp,
    /// TCP flow
    Tcp,
}

impl std::fmt::Display for FlowProto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Udp => write!(f, "UDP"),
            Self::Tcp => write!(f, "TCP"),
        }
    }
}

/// 5-tuple identifying a UDP or TCP flow
///
/// Source is always the tun-side client; destination is the real remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Transport protocol
    pub proto: FlowProto,
    /// Client address (tun side)
    pub src_addr: Ipv4Addr,
    /// Client port
    pub src_port: u16,
    /// Remote address
    pub dst_addr: Ipv4Addr,
    /// Remote port
    pub dst_port: u16,
}

impl FlowKey {
    /// Build a UDP flow key
    #[must_use]
    pub const fn udp(src_addr: Ipv4Addr, src_port: u16, dst_addr: Ipv4Addr, dst_port: u16) -> Self {
        Self {
            proto: FlowProto::Udp,
            src_addr,
            src_port,
            dst_addr,
            dst_port,
        }
    }

    /// Build a TCP flow key
    #[must_use]
    pub const fn tcp(src_addr: Ipv4Addr, src_port: u16, dst_addr: Ipv4Addr, dst_port: u16) -> Self {
        Self {
            proto: FlowProto::Tcp,
            src_addr,
            src_port,
            dst_addr,
            dst_port,
        }
    }

    /// The real remote endpoint
    #[must_use]
    pub const fn remote(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.dst_addr, self.dst_port)
    }
}

impl std::fmt::Display for FlowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}:{} -> {}:{}",
            self.proto, self.src_addr, self.src_port, self.dst_addr, self.dst_port
        )
    }
}

/// A shaped client-to-network payload awaiting its native socket write
///
/// The outbound shaper queues these. At release time the drainer sends
/// TCP payloads straight into the attached writer channel; UDP payloads
/// are resolved against the session table (a datagram whose session has
/// meanwhile closed is dropped silently).
#[derive(Debug)]
pub struct OutboundPacket {
    /// Flow the payload belongs to
    pub key: FlowKey,
    /// L4 payload bytes
    pub payload: Bytes,
    /// Writer channel of the owning TCP session; carrying it on the
    /// packet keeps acknowledged bytes deliverable after the session has
    /// been torn out of the table
    pub sink: Option<mpsc::UnboundedSender<Bytes>>,
}

/// Marks native sockets so the host OS routes them around the tun
///
/// Must be applied before `connect`. The mechanism is host-OS dependent;
/// the collaborator that owns the tun supplies the implementation.
pub trait SocketProtector: Send + Sync {
    /// Protect a socket; `false` means the socket must not be used
    fn protect(&self, fd: RawFd) -> bool;
}

/// Protector that accepts every socket (tests, plain-routing hosts)
#[derive(Debug, Default)]
pub struct NoopProtector;

impl SocketProtector for NoopProtector {
    fn protect(&self, _fd: RawFd) -> bool {
        true
    }
}

/// Shared handles every flow handler and session task needs
///
/// One per router. Sessions receive it as an `Arc` clone; it carries no
/// per-flow state.
pub struct FlowContext {
    /// The tun interface's assigned address; the only legal source for
    /// outbound frames
    pub tun_addr: Ipv4Addr,
    /// Reply frame builder (owns the router-wide IP ID counter)
    pub builder: FrameBuilder,
    /// Packet clock shared with the shapers
    pub clock: Arc<dyn PacketClock>,
    /// Shaper for synthesized network-to-client frames (released to tun)
    pub inbound: Arc<Shaper<Bytes>>,
    /// Shaper for client-to-network payloads (released to native sockets)
    pub outbound: Arc<Shaper<OutboundPacket>>,
    /// Socket protection callback
    pub protector: Arc<dyn SocketProtector>,
    /// Traffic counters
    pub stats: Arc<RouterStats>,
    /// Session table (UDP and TCP maps)
    pub table: SessionTable,
    /// Supervisor event channel; sends are best-effort
    pub events: mpsc::Sender<RouterEvent>,
    /// Destination ports for which outbound SYNs are silently ignored
    pub reject_tcp_ports: Vec<u16>,
}

impl FlowContext {
    /// Emit a supervisor event without ever blocking a packet path
    pub fn emit(&self, event: RouterEvent) {
        let _ = self.events.try_send(event);
    }

    /// Submit a synthesized frame toward the tun writer
    pub fn submit_inbound(&self, frame: Bytes) {
        self.inbound.submit(frame);
    }

    /// Submit a datagram payload toward its native socket
    pub fn submit_outbound(&self, key: FlowKey, payload: Bytes) {
        self.outbound.submit(OutboundPacket {
            key,
            payload,
            sink: None,
        });
    }

    /// Convenience: current clock reading
    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::clock::{ManualClock, PacketClock};
    use crate::profile::{Direction, NetworkProfile};
    use crate::shaper::{Shaper, DEFAULT_HIGH_WATER};

    /// A flow context over an unimpaired profile and a manual clock,
    /// ready for exercising handlers without a running router.
    pub(crate) fn context() -> (Arc<FlowContext>, mpsc::Receiver<RouterEvent>) {
        let clock: Arc<dyn PacketClock> = Arc::new(ManualClock::new());
        let profile = Arc::new(NetworkProfile::unimpaired());
        let (events_tx, events_rx) = mpsc::channel(64);
        let ctx = Arc::new(FlowContext {
            tun_addr: "10.0.0.2".parse().unwrap(),
            builder: FrameBuilder::new(),
            clock: Arc::clone(&clock),
            inbound: Arc::new(Shaper::new(
                Direction::Inbound,
                Arc::clone(&profile),
                Arc::clone(&clock),
                DEFAULT_HIGH_WATER,
            )),
            outbound: Arc::new(Shaper::new(
                Direction::Outbound,
                profile,
                clock,
                DEFAULT_HIGH_WATER,
            )),
            protector: Arc::new(NoopProtector),
            stats: Arc::new(RouterStats::new()),
            table: SessionTable::new(),
            events: events_tx,
            reject_tcp_ports: vec![853],
        });
        (ctx, events_rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_key_display() {
        let key = FlowKey::udp(
            "10.0.0.2".parse().unwrap(),
            40000,
            "8.8.8.8".parse().unwrap(),
            53,
        );
        assert_eq!(key.to_string(), "UDP 10.0.0.2:40000 -> 8.8.8.8:53");
        assert_eq!(key.remote(), "8.8.8.8:53".parse().unwrap());
    }

    #[test]
    fn test_flow_keys_differ_by_proto() {
        let a = FlowKey::udp(
            "10.0.0.2".parse().unwrap(),
            1,
            "1.1.1.1".parse().unwrap(),
            2,
        );
        let b = FlowKey::tcp(
            "10.0.0.2".parse().unwrap(),
            1,
            "1.1.1.1".parse().unwrap(),
            2,
        );
        assert_ne!(a, b);
    }

    #[test]
    fn test_noop_protector_accepts() {
        assert!(NoopProtector.protect(3));
    }
}
