//! netem-router: userspace network emulator for satellite/DTC links
//!
//! This crate sits on a tun-style layer-3 interface, intercepts every IPv4
//! packet the tunneled applications emit, forwards it to the real network
//! over "protected" native sockets, and returns synthesized replies onto
//! the tun. Every packet in both directions runs through a delay/loss
//! shaper so ordinary applications can be exercised against realistic
//! impaired links.
//!
//! # Architecture
//!
//! ```text
//! tun read ─> IpParser ─> UdpFlow / TcpFlow / IcmpEcho
//!                              │
//!                     outbound Shaper ─> DelayQueue ─> native socket
//!
//! native socket ─> flow handler synthesizes reply frame
//!                              │
//!                     inbound Shaper ─> DelayQueue ─> tun write
//! ```
//!
//! The TCP path is a minimum viable userspace TCP: the router answers the
//! client as if it were the remote peer (SYN+ACK, ACK tracking, a small
//! reassembly window, FIN/RST synthesis) while relaying the byte stream
//! over an ordinary stream socket.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use netem_router::config::load_config;
//! use netem_router::router::Router;
//! use netem_router::session::NoopProtector;
//! use netem_router::tun::{FdTun, TunInterface};
//!
//! # async fn example(tun_fd: std::os::unix::io::RawFd) -> anyhow::Result<()> {
//! let config = load_config("/etc/netem-router/config.json")?;
//! let tun: Arc<dyn TunInterface> = Arc::new(unsafe { FdTun::from_raw_fd(tun_fd)? });
//! let (router, handle, mut events) = Router::new(
//!     tun,
//!     config.router_config(),
//!     config.build_profile()?,
//!     Arc::new(NoopProtector),
//! );
//! tokio::spawn(async move { while events.recv().await.is_some() {} });
//! let runner = tokio::spawn(router.run());
//! // ... later:
//! handle.stop().await?;
//! runner.await??;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`clock`]: monotonic millisecond time source
//! - [`config`]: JSON configuration and loading
//! - [`error`]: error types
//! - [`packet`]: IPv4/TCP/UDP/ICMP decode, reply synthesis, checksums
//! - [`profile`]: impairment profiles and the percentile delay sampler
//! - [`relay`]: wire codec for the encrypted-tunnel collaborator
//! - [`router`]: the top-level loop, commands, events and statistics
//! - [`session`]: per-flow state (UDP relay, TCP pseudo-stack, ICMP echo)
//! - [`shaper`]: per-direction loss/delay shaping and the delay queue
//! - [`tun`]: the tun device seam

#![warn(clippy::pedantic)]
#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]

pub mod clock;
pub mod config;
pub mod error;
pub mod packet;
pub mod profile;
pub mod relay;
pub mod router;
pub mod session;
pub mod shaper;
pub mod tun;

// Re-export commonly used types at the crate root
pub use clock::{ManualClock, MonotonicClock, PacketClock};
pub use config::{load_config, load_config_str, load_config_with_env, Config};
pub use error::{ConfigError, PacketError, Result, RouterError, SessionError};
pub use profile::{
    BandwidthModel, DelayModel, Direction, LossModel, NetworkProfile, PercentilePoint,
    PercentileTable,
};
pub use router::{
    Router, RouterCommand, RouterConfig, RouterEvent, RouterHandle, RouterStats, StatsSnapshot,
};
pub use session::{
    FlowKey, FlowProto, NoopProtector, OutboundPacket, SessionTable, SocketProtector,
};
pub use shaper::{DelayQueue, LossStats, Shaper};
pub use tun::{ChannelTun, FdTun, TunInterface, TunPeer, MAX_FRAME};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
