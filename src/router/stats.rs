//! Router statistics
//!
//! Atomic counters updated on the hot paths, snapshotted on demand. The
//! snapshot is the authoritative user-visible view; the core does not own
//! whatever UI displays it.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::shaper::LossStats;

/// Atomic traffic counters
///
/// "Sent" is native egress (packets the router pushed toward the real
/// network); "received" is native ingress (packets the real network
/// answered with).
#[derive(Debug, Default)]
pub struct RouterStats {
    sent_bytes: AtomicU64,
    sent_packets: AtomicU64,
    received_bytes: AtomicU64,
    received_packets: AtomicU64,
    rejected_frames: AtomicU64,
}

impl RouterStats {
    /// Create zeroed counters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record bytes written to a native socket
    pub fn record_native_egress(&self, bytes: usize) {
        self.sent_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.sent_packets.fetch_add(1, Ordering::Relaxed);
    }

    /// Record bytes read from a native socket
    pub fn record_native_ingress(&self, bytes: usize) {
        self.received_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.received_packets.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a tun frame dropped before any flow handling
    /// (malformed, unsupported protocol, wrong source address)
    pub fn record_rejected_frame(&self) {
        self.rejected_frames.fetch_add(1, Ordering::Relaxed);
    }

    /// Bytes sent to native sockets
    #[must_use]
    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes.load(Ordering::Relaxed)
    }

    /// Packets sent to native sockets
    #[must_use]
    pub fn sent_packets(&self) -> u64 {
        self.sent_packets.load(Ordering::Relaxed)
    }

    /// Bytes received from native sockets
    #[must_use]
    pub fn received_bytes(&self) -> u64 {
        self.received_bytes.load(Ordering::Relaxed)
    }

    /// Packets received from native sockets
    #[must_use]
    pub fn received_packets(&self) -> u64 {
        self.received_packets.load(Ordering::Relaxed)
    }

    /// Frames rejected at the tun boundary
    #[must_use]
    pub fn rejected_frames(&self) -> u64 {
        self.rejected_frames.load(Ordering::Relaxed)
    }
}

/// Point-in-time statistics snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Bytes written to native sockets
    pub sent_bytes: u64,
    /// Packets written to native sockets
    pub sent_packets: u64,
    /// Bytes read from native sockets
    pub received_bytes: u64,
    /// Packets read from native sockets
    pub received_packets: u64,
    /// Frames rejected at the tun boundary
    pub rejected_frames: u64,
    /// Packets waiting in the outbound delay queue
    pub outbound_queue_size: usize,
    /// Packets waiting in the inbound delay queue
    pub inbound_queue_size: usize,
    /// Outbound loss counters
    pub outbound_loss: LossStats,
    /// Inbound loss counters
    pub inbound_loss: LossStats,
    /// Active UDP sessions
    pub udp_sessions: usize,
    /// Active TCP sessions
    pub tcp_sessions: usize,
}

impl StatsSnapshot {
    /// Total drops across both directions
    #[must_use]
    pub const fn total_dropped(&self) -> u64 {
        self.outbound_loss.dropped + self.inbound_loss.dropped
    }
}
