//! Keyed session maps with idle eviction
//!
//! Two concurrent maps, one per transport. The map locks (`DashMap` shards)
//! are only ever held for lookup, insert and remove; all per-session work
//! happens under the session's own lock.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use super::tcp::TcpSession;
use super::udp::UdpSession;
use super::FlowKey;

/// Concurrent UDP and TCP session maps
#[derive(Default)]
pub struct SessionTable {
    udp: DashMap<FlowKey, Arc<UdpSession>>,
    tcp: DashMap<FlowKey, Arc<TcpSession>>,
}

impl SessionTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a UDP session
    #[must_use]
    pub fn get_udp(&self, key: &FlowKey) -> Option<Arc<UdpSession>> {
        self.udp.get(key).map(|r| Arc::clone(r.value()))
    }

    /// Look up a TCP session
    #[must_use]
    pub fn get_tcp(&self, key: &FlowKey) -> Option<Arc<TcpSession>> {
        self.tcp.get(key).map(|r| Arc::clone(r.value()))
    }

    /// Insert a UDP session unless one raced us in
    ///
    /// `Ok` carries the inserted session; `Err` carries the
    /// already-registered one, and the losing session is dropped.
    pub fn insert_udp(
        &self,
        key: FlowKey,
        session: Arc<UdpSession>,
    ) -> Result<Arc<UdpSession>, Arc<UdpSession>> {
        match self.udp.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                Err(Arc::clone(existing.get()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&session));
                Ok(session)
            }
        }
    }

    /// Insert a TCP session unless one raced us in
    pub fn insert_tcp(
        &self,
        key: FlowKey,
        session: Arc<TcpSession>,
    ) -> Result<Arc<TcpSession>, Arc<TcpSession>> {
        match self.tcp.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                Err(Arc::clone(existing.get()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&session));
                Ok(session)
            }
        }
    }

    /// Remove a UDP session
    pub fn remove_udp(&self, key: &FlowKey) -> Option<Arc<UdpSession>> {
        self.udp.remove(key).map(|(_, s)| s)
    }

    /// Remove a TCP session
    pub fn remove_tcp(&self, key: &FlowKey) -> Option<Arc<TcpSession>> {
        self.tcp.remove(key).map(|(_, s)| s)
    }

    /// Active UDP session count
    #[must_use]
    pub fn udp_len(&self) -> usize {
        self.udp.len()
    }

    /// Active TCP session count
    #[must_use]
    pub fn tcp_len(&self) -> usize {
        self.tcp.len()
    }

    /// Evict and shut down every session idle longer than `timeout_ms`
    ///
    /// Returns the number of sessions closed. Sessions are removed from
    /// the maps first, then shut down outside any map shard lock.
    pub fn sweep_idle(&self, now_ms: u64, timeout_ms: u64) -> usize {
        let stale_udp: Vec<FlowKey> = self
            .udp
            .iter()
            .filter(|e| now_ms.saturating_sub(e.value().last_active_ms()) > timeout_ms)
            .map(|e| *e.key())
            .collect();
        let stale_tcp: Vec<FlowKey> = self
            .tcp
            .iter()
            .filter(|e| now_ms.saturating_sub(e.value().last_active_ms()) > timeout_ms)
            .map(|e| *e.key())
            .collect();

        let mut closed = 0;
        for key in stale_udp {
            if let Some(session) = self.remove_udp(&key) {
                session.shutdown();
                debug!(flow = %key, "idle UDP session evicted");
                closed += 1;
            }
        }
        for key in stale_tcp {
            if let Some(session) = self.remove_tcp(&key) {
                session.shutdown();
                debug!(flow = %key, "idle TCP session evicted");
                closed += 1;
            }
        }
        closed
    }

    /// Remove and shut down every session (router shutdown)
    pub fn clear(&self) -> usize {
        let mut closed = 0;
        let udp_keys: Vec<FlowKey> = self.udp.iter().map(|e| *e.key()).collect();
        for key in udp_keys {
            if let Some(session) = self.remove_udp(&key) {
                session.shutdown();
                closed += 1;
            }
        }
        let tcp_keys: Vec<FlowKey> = self.tcp.iter().map(|e| *e.key()).collect();
        for key in tcp_keys {
            if let Some(session) = self.remove_tcp(&key) {
                session.shutdown();
                closed += 1;
            }
        }
        closed
    }
}
