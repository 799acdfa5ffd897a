//! Shared fixtures for the integration tests
//!
//! A router is wired to an in-memory tun; tests play the role of the
//! tunneled application by injecting hand-built IPv4 frames and reading
//! the frames the router writes back.

#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;

use netem_router::error::Result;
use netem_router::packet::ipv4::TcpFlags;
use netem_router::packet::{FrameBuilder, Ipv4Packet, TcpSegment, UdpDatagram};
use netem_router::profile::NetworkProfile;
use netem_router::router::{Router, RouterConfig, RouterEvent, RouterHandle};
use netem_router::session::NoopProtector;
use netem_router::tun::{ChannelTun, TunInterface, TunPeer};

/// The address assigned to the emulated tun interface
pub const TUN_ADDR: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

/// A running router plus the test's side of the tun
pub struct Fixture {
    pub peer: TunPeer,
    pub handle: RouterHandle,
    pub runner: JoinHandle<Result<()>>,
    pub events: tokio::sync::mpsc::Receiver<RouterEvent>,
    pub builder: FrameBuilder,
}

impl Fixture {
    /// Start a router over an in-memory tun with the given profile
    pub fn start(profile: NetworkProfile) -> Self {
        Self::start_with_config(profile, RouterConfig::default())
    }

    /// Start with custom router knobs (idle timeouts, reject ports)
    pub fn start_with_config(profile: NetworkProfile, mut config: RouterConfig) -> Self {
        config.tun_addr = TUN_ADDR;
        let (tun, peer) = ChannelTun::pair(1024);
        let tun: Arc<dyn TunInterface> = Arc::new(tun);
        let (router, handle, events) =
            Router::new(tun, config, profile, Arc::new(NoopProtector));
        let runner = tokio::spawn(router.run());
        Self {
            peer,
            handle,
            runner,
            events,
            builder: FrameBuilder::new(),
        }
    }

    /// Inject a frame as the tunneled application
    pub async fn inject(&self, frame: Bytes) {
        self.peer.inject(frame).await.expect("router accepts frames");
    }

    /// Wait for the next frame written back to the tun
    pub async fn next_frame(&self) -> Bytes {
        tokio::time::timeout(Duration::from_secs(5), self.peer.next_frame())
            .await
            .expect("frame within deadline")
            .expect("tun still open")
    }

    /// Wait for the next TCP frame, decoded
    pub async fn next_tcp(&self) -> DecodedTcp {
        let frame = self.next_frame().await;
        decode_tcp(&frame)
    }

    /// Stop the router and wait for it to wind down
    pub async fn shutdown(self) {
        self.handle.stop().await.expect("router accepts stop");
        tokio::time::timeout(Duration::from_secs(5), self.runner)
            .await
            .expect("router stops in bounded time")
            .expect("router task completes")
            .expect("router exits cleanly");
    }
}

/// A decoded TCP frame the router wrote to the tun
#[derive(Debug, Clone)]
pub struct DecodedTcp {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub payload: Vec<u8>,
}

pub fn decode_tcp(frame: &[u8]) -> DecodedTcp {
    let ip = Ipv4Packet::parse(frame).expect("IPv4 frame");
    let tcp = TcpSegment::parse(ip.payload()).expect("TCP segment");
    DecodedTcp {
        src: ip.src(),
        dst: ip.dst(),
        src_port: tcp.src_port,
        dst_port: tcp.dst_port,
        seq: tcp.seq,
        ack: tcp.ack,
        flags: tcp.flags,
        payload: tcp.payload.to_vec(),
    }
}

/// A decoded UDP frame the router wrote to the tun
#[derive(Debug, Clone)]
pub struct DecodedUdp {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: Vec<u8>,
}

pub fn decode_udp(frame: &[u8]) -> DecodedUdp {
    let ip = Ipv4Packet::parse(frame).expect("IPv4 frame");
    let udp = UdpDatagram::parse(ip.payload()).expect("UDP datagram");
    DecodedUdp {
        src: ip.src(),
        dst: ip.dst(),
        src_port: udp.src_port,
        dst_port: udp.dst_port,
        payload: udp.payload.to_vec(),
    }
}

/// Build a client-side UDP frame (tun address as source)
pub fn client_udp(
    builder: &FrameBuilder,
    src_port: u16,
    dst: SocketAddrV4,
    payload: &[u8],
) -> Bytes {
    builder.udp_frame(TUN_ADDR, src_port, *dst.ip(), dst.port(), payload)
}

/// Build a client-side TCP frame (tun address as source)
pub fn client_tcp(
    builder: &FrameBuilder,
    src_port: u16,
    dst: SocketAddrV4,
    seq: u32,
    ack: u32,
    flags: u8,
    payload: &[u8],
) -> Bytes {
    builder.tcp_frame(
        TUN_ADDR,
        src_port,
        *dst.ip(),
        dst.port(),
        seq,
        ack,
        TcpFlags(flags),
        payload,
    )
}

/// Spawn a UDP echo server on a loopback port
pub async fn udp_echo_server() -> SocketAddrV4 {
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = v4(socket.local_addr().unwrap());
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });
    addr
}

/// Spawn a TCP echo server on a loopback port
pub async fn tcp_echo_server() -> SocketAddrV4 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = v4(listener.local_addr().unwrap());
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

fn v4(addr: SocketAddr) -> SocketAddrV4 {
    match addr {
        SocketAddr::V4(v4) => v4,
        SocketAddr::V6(_) => panic!("expected an IPv4 loopback address"),
    }
}
