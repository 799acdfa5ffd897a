//! UDP flow forwarding
//!
//! One session per UDP 5-tuple: an owned connected datagram socket plus a
//! reader task that turns every native reply into a synthesized IP frame
//! for the inbound shaper. Sessions are created lazily on the first
//! outbound datagram and die on socket error or idle timeout.

use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::SessionError;
use crate::packet::{Ipv4Packet, UdpDatagram};
use crate::router::RouterEvent;

use super::{FlowContext, FlowKey};

/// Largest datagram a native socket may hand us and still fit a tun frame
/// (16 384-byte frame minus 28 bytes of IP+UDP header)
const MAX_DATAGRAM: usize = 16_384 - 28;

/// Per-flow UDP session
pub struct UdpSession {
    key: FlowKey,
    socket: Arc<UdpSocket>,
    last_active: AtomicU64,
    reader: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl UdpSession {
    /// Open a session: bind, protect, connect, register, spawn the reader
    ///
    /// When another task races the insert, the already-registered session
    /// is returned and the freshly-built socket is dropped.
    ///
    /// # Errors
    ///
    /// Fails when the socket cannot be bound or connected, or the
    /// `protect()` callback refuses it.
    pub async fn open(
        ctx: &Arc<FlowContext>,
        key: FlowKey,
    ) -> Result<Arc<Self>, SessionError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        if !ctx.protector.protect(socket.as_raw_fd()) {
            return Err(SessionError::ProtectFailed { dst: key.remote() });
        }
        socket
            .connect(key.remote())
            .await
            .map_err(|e| SessionError::connect_failed(key.remote(), e.to_string()))?;

        let session = Arc::new(Self {
            key,
            socket: Arc::new(socket),
            last_active: AtomicU64::new(ctx.now_ms()),
            reader: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let session = match ctx.table.insert_udp(key, session) {
            Ok(winner) => winner,
            Err(existing) => return Ok(existing),
        };

        let handle = tokio::spawn(run_reader(Arc::clone(ctx), Arc::clone(&session)));
        *session.reader.lock() = Some(handle);

        debug!(flow = %key, "UDP session opened");
        ctx.emit(RouterEvent::SessionOpened { flow: key });
        Ok(session)
    }

    /// Flow key
    #[must_use]
    pub fn key(&self) -> FlowKey {
        self.key
    }

    /// Write a released payload to the native socket
    ///
    /// # Errors
    ///
    /// Propagates the socket error; the caller closes the session, and the
    /// next outbound datagram re-opens it.
    pub async fn send(&self, payload: &[u8]) -> io::Result<usize> {
        self.socket.send(payload).await
    }

    /// Update the idle timestamp
    pub fn touch(&self, now_ms: u64) {
        self.last_active.store(now_ms, Ordering::Relaxed);
    }

    /// Last activity on the packet clock
    #[must_use]
    pub fn last_active_ms(&self) -> u64 {
        self.last_active.load(Ordering::Relaxed)
    }

    /// Stop the reader task and mark the session closed
    ///
    /// Idempotent; dropping the last `Arc` then closes the socket.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Receive native replies and push synthesized frames into the inbound
/// shaper until the socket errors or the session is shut down
async fn run_reader(ctx: Arc<FlowContext>, session: Arc<UdpSession>) {
    let key = session.key;
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match session.socket.recv(&mut buf).await {
            Ok(len) => {
                if session.is_closed() {
                    break;
                }
                session.touch(ctx.now_ms());
                ctx.stats.record_native_ingress(len);
                // Reply frame: addresses and ports swapped relative to the key.
                let frame = ctx.builder.udp_frame(
                    key.dst_addr,
                    key.dst_port,
                    key.src_addr,
                    key.src_port,
                    &buf[..len],
                );
                trace!(flow = %key, len, "UDP reply queued for tun");
                ctx.submit_inbound(frame);
            }
            Err(e) => {
                if !session.is_closed() {
                    debug!(flow = %key, error = %e, "UDP native socket error, closing session");
                    close_session(&ctx, &key);
                }
                break;
            }
        }
    }
}

/// Remove and shut down a UDP session, emitting the closure event
pub(crate) fn close_session(ctx: &FlowContext, key: &FlowKey) {
    if let Some(session) = ctx.table.remove_udp(key) {
        session.shutdown();
        ctx.emit(RouterEvent::SessionClosed { flow: *key });
    }
}

/// Handle one outbound UDP datagram from the tun side
///
/// Gets or lazily opens the session, then submits the payload to the
/// outbound shaper; the actual socket write happens when the shaper
/// releases it.
pub async fn handle_udp_datagram(
    ctx: &Arc<FlowContext>,
    ip: &Ipv4Packet<'_>,
    udp: &UdpDatagram<'_>,
) {
    let key = FlowKey::udp(ip.src(), udp.src_port, ip.dst(), udp.dst_port);

    let session = match ctx.table.get_udp(&key) {
        Some(session) => session,
        None => match UdpSession::open(ctx, key).await {
            Ok(session) => session,
            Err(e) => {
                warn!(flow = %key, error = %e, "dropping datagram, session open failed");
                return;
            }
        },
    };

    session.touch(ctx.now_ms());
    ctx.submit_outbound(key, Bytes::copy_from_slice(udp.payload));
}
