//! TCP flow pseudo-state-machine
//!
//! The router plays both ends: toward the tun-side client it acts as the
//! remote peer (synthesizing SYN+ACK, ACKs, data segments and FINs with
//! its own sequence numbers); toward the real remote it is an ordinary
//! socket client. This is a minimum viable TCP: no congestion control, no
//! window scaling, no SACK. Just enough SEQ/ACK bookkeeping and a small
//! reassembly buffer to carry a byte stream faithfully in both directions.
//!
//! All per-session mutations happen under the session's own lock; the
//! session-table shards are only touched for lookup, insert and remove.
//!
//! Client payloads travel: segment handler -> outbound shaper -> writer
//! channel -> native socket. A released payload carries its own clone of
//! the writer channel, so bytes the stack has already acknowledged still
//! reach the native socket even when a FIN tears the session out of the
//! table while they sit in the delay queue.

use std::collections::BTreeMap;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::packet::ipv4::TcpFlags;
use crate::packet::{seq_delta, Ipv4Packet, TcpSegment};
use crate::router::stats::RouterStats;
use crate::router::RouterEvent;

use super::{FlowContext, FlowKey, OutboundPacket};

/// Largest chunk relayed from the native socket per synthesized segment
pub const MSS: usize = 1400;
/// Reassembly buffer cap per session
const OOO_BUFFER_CAP: usize = 64 * 1024;
/// Segments whose SEQ is further than this past the expected SEQ are
/// dropped outright (DoS guard)
const MAX_SEQ_GAP: i32 = 65_535;

/// Connection state as tracked by the pseudo-stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    /// SYN seen, SYN+ACK sent, waiting for the client's ACK
    SynReceived,
    /// Three-way handshake complete
    Established,
    /// Torn down; the session is on its way out of the table
    Closed,
}

struct TcpInner {
    state: TcpState,
    /// Next SEQ we will send. Every byte we generate that occupies
    /// sequence space (SYN, FIN, payload byte) has already incremented it.
    ours: u32,
    /// Next SEQ expected from the client; anything strictly below is an
    /// old duplicate.
    theirs: u32,
    /// Out-of-order segments keyed by SEQ, capped at [`OOO_BUFFER_CAP`]
    ooo: BTreeMap<u32, Bytes>,
    ooo_bytes: usize,
}

/// Per-flow TCP session
pub struct TcpSession {
    key: FlowKey,
    inner: Mutex<TcpInner>,
    last_active: AtomicU64,
    /// Sender side of the writer channel. `None` once the session is
    /// closing; dropping it is what lets the writer task finish flushing
    /// and exit. The channel buffer doubles as the pre-connect queue.
    to_native: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    /// The connect-then-read task
    relay_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl TcpSession {
    /// Create a session for a fresh SYN and kick off the native connect
    ///
    /// Opens and protects the native socket first; a refused socket
    /// means no session and a silently dropped SYN. Then picks a random
    /// ISN, registers the session, spawns the connect task and answers
    /// the SYN with a SYN+ACK through the inbound shaper.
    pub fn open(ctx: &Arc<FlowContext>, key: FlowKey, peer_isn: u32) -> Option<Arc<Self>> {
        let socket = match TcpSocket::new_v4() {
            Ok(socket) => socket,
            Err(e) => {
                warn!(flow = %key, error = %e, "native socket creation failed, SYN dropped");
                return None;
            }
        };
        if !ctx.protector.protect(socket.as_raw_fd()) {
            warn!(flow = %key, "socket protection refused, SYN dropped");
            return None;
        }

        let isn: u32 = rand::thread_rng().gen();
        let (to_native, from_shaper) = mpsc::unbounded_channel();

        let session = Arc::new(Self {
            key,
            inner: Mutex::new(TcpInner {
                state: TcpState::SynReceived,
                ours: isn,
                // The SYN consumed one sequence number.
                theirs: peer_isn.wrapping_add(1),
                ooo: BTreeMap::new(),
                ooo_bytes: 0,
            }),
            last_active: AtomicU64::new(ctx.now_ms()),
            to_native: Mutex::new(Some(to_native)),
            relay_task: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let session = match ctx.table.insert_tcp(key, session) {
            Ok(winner) => winner,
            Err(existing) => return Some(existing),
        };

        let relay = tokio::spawn(run_connect(
            Arc::clone(ctx),
            Arc::clone(&session),
            socket,
            from_shaper,
        ));
        *session.relay_task.lock() = Some(relay);

        let syn_ack = {
            let mut inner = session.inner.lock();
            let seq = inner.ours;
            inner.ours = inner.ours.wrapping_add(1);
            session.segment(ctx, seq, inner.theirs, TcpFlags::SYN | TcpFlags::ACK, &[])
        };
        ctx.submit_inbound(syn_ack);

        debug!(flow = %key, "TCP session opened");
        ctx.emit(RouterEvent::SessionOpened { flow: key });
        Some(session)
    }

    /// Flow key
    #[must_use]
    pub fn key(&self) -> FlowKey {
        self.key
    }

    /// Current connection state
    #[must_use]
    pub fn state(&self) -> TcpState {
        self.inner.lock().state
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

    /// A handle onto the writer channel, if the session still accepts data
    #[must_use]
    pub fn sink(&self) -> Option<mpsc::UnboundedSender<Bytes>> {
        self.to_native.lock().clone()
    }

    /// Stop the relay task and mark the session closed (idempotent)
    ///
    /// The writer is not aborted: dropping the channel sender lets it
    /// flush whatever the shaper has already released, then exit.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.lock().state = TcpState::Closed;
        drop(self.to_native.lock().take());
        if let Some(handle) = self.relay_task.lock().take() {
            handle.abort();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Process one outbound (tun-side) segment for this session
    pub fn handle_segment(self: &Arc<Self>, ctx: &Arc<FlowContext>, seg: &TcpSegment<'_>) {
        self.touch(ctx.now_ms());

        let mut replies: Vec<Bytes> = Vec::new();
        let mut forwards: Vec<Bytes> = Vec::new();
        let mut remove = false;

        {
            let mut inner = self.inner.lock();
            if inner.state == TcpState::Closed {
                return;
            }

            if seg.flags.rst() {
                inner.state = TcpState::Closed;
                remove = true;
            } else if seg.flags.syn() {
                // SYN retransmit: the client missed our SYN+ACK. Replay it
                // with the original ISN (ours has moved one past it).
                let seq = inner.ours.wrapping_sub(1);
                replies.push(self.segment(
                    ctx,
                    seq,
                    inner.theirs,
                    TcpFlags::SYN | TcpFlags::ACK,
                    &[],
                ));
            } else {
                if inner.state == TcpState::SynReceived && seg.flags.ack() {
                    inner.state = TcpState::Established;
                    trace!(flow = %self.key, "TCP established");
                }

                if !seg.payload.is_empty() {
                    self.handle_payload(ctx, &mut inner, seg, &mut replies, &mut forwards);
                }

                if seg.flags.fin() {
                    // The FIN sits after any payload and consumes one
                    // sequence number itself.
                    inner.theirs = seg
                        .seq
                        .wrapping_add(seg.payload.len() as u32)
                        .wrapping_add(1);
                    let seq = inner.ours;
                    inner.ours = inner.ours.wrapping_add(1);
                    replies.push(self.segment(
                        ctx,
                        seq,
                        inner.theirs,
                        TcpFlags::FIN | TcpFlags::ACK,
                        &[],
                    ));
                    inner.state = TcpState::Closed;
                    remove = true;
                }
            }
        }

        let sink = self.sink();
        for payload in forwards {
            ctx.outbound.submit(OutboundPacket {
                key: self.key,
                payload,
                sink: sink.clone(),
            });
        }
        for frame in replies {
            ctx.submit_inbound(frame);
        }
        if remove {
            close_session(ctx, self);
        }
    }

    /// Payload path: duplicate / out-of-order / in-order handling
    fn handle_payload(
        &self,
        ctx: &Arc<FlowContext>,
        inner: &mut TcpInner,
        seg: &TcpSegment<'_>,
        replies: &mut Vec<Bytes>,
        forwards: &mut Vec<Bytes>,
    ) {
        let delta = seq_delta(seg.seq, inner.theirs);

        if delta < 0 {
            // Old duplicate: re-ACK what we expect, do not forward.
            replies.push(self.ack(ctx, inner));
            return;
        }

        if delta > 0 {
            if delta > MAX_SEQ_GAP {
                debug!(
                    flow = %self.key,
                    gap = delta,
                    "segment beyond reassembly window dropped"
                );
                return;
            }
            let len = seg.payload.len();
            if inner.ooo_bytes + len <= OOO_BUFFER_CAP {
                if !inner.ooo.contains_key(&seg.seq) {
                    inner.ooo.insert(seg.seq, Bytes::copy_from_slice(seg.payload));
                    inner.ooo_bytes += len;
                }
            } else {
                debug!(flow = %self.key, "reassembly buffer full, segment dropped");
            }
            // Duplicate ACK tells the client what is still missing.
            replies.push(self.ack(ctx, inner));
            return;
        }

        // In order: forward, advance, then drain whatever the reassembly
        // buffer can now contribute (trimming any overlap with data we
        // have already committed).
        forwards.push(Bytes::copy_from_slice(seg.payload));
        inner.theirs = inner.theirs.wrapping_add(seg.payload.len() as u32);

        while let Some((&buffered_seq, _)) = inner.ooo.iter().next() {
            if seq_delta(buffered_seq, inner.theirs) > 0 {
                break;
            }
            let data = inner.ooo.remove(&buffered_seq).expect("key just observed");
            inner.ooo_bytes -= data.len();
            let overlap = inner.theirs.wrapping_sub(buffered_seq) as usize;
            if overlap < data.len() {
                let residual = data.slice(overlap..);
                inner.theirs = inner.theirs.wrapping_add(residual.len() as u32);
                forwards.push(residual);
            }
        }

        replies.push(self.ack(ctx, inner));
    }

    fn ack(&self, ctx: &FlowContext, inner: &TcpInner) -> Bytes {
        self.segment(ctx, inner.ours, inner.theirs, TcpFlags::ACK, &[])
    }

    /// Build a tun-bound segment for this flow (remote -> client direction)
    fn segment(
        &self,
        ctx: &FlowContext,
        seq: u32,
        ack: u32,
        flags: u8,
        payload: &[u8],
    ) -> Bytes {
        ctx.builder.tcp_frame(
            self.key.dst_addr,
            self.key.dst_port,
            self.key.src_addr,
            self.key.src_port,
            seq,
            ack,
            TcpFlags(flags),
            payload,
        )
    }
}

/// Remove and shut down a TCP session, emitting the closure event
pub(crate) fn close_session(ctx: &FlowContext, session: &Arc<TcpSession>) {
    if session.closed.swap(true, Ordering::AcqRel) {
        return;
    }
    session.inner.lock().state = TcpState::Closed;
    ctx.table.remove_tcp(&session.key);
    drop(session.to_native.lock().take());
    if let Some(handle) = session.relay_task.lock().take() {
        handle.abort();
    }
    ctx.emit(RouterEvent::SessionClosed { flow: session.key });
}

/// Connect the already-protected native socket, then run the relay halves
async fn run_connect(
    ctx: Arc<FlowContext>,
    session: Arc<TcpSession>,
    socket: TcpSocket,
    from_shaper: mpsc::UnboundedReceiver<Bytes>,
) {
    let remote = session.key.remote();

    match socket.connect(std::net::SocketAddr::V4(remote)).await {
        Ok(stream) => {
            if session.is_closed() {
                return;
            }
            let (read_half, write_half) = stream.into_split();
            // The writer is deliberately not tied to the session's
            // lifetime: it exits on its own once the channel closes and
            // the released payloads have been flushed.
            tokio::spawn(run_writer(
                Arc::clone(&ctx.stats),
                session.key,
                write_half,
                from_shaper,
            ));
            run_reader(ctx, session, read_half).await;
        }
        Err(e) => {
            // No RST upstream; the client application times out.
            debug!(flow = %session.key, error = %e, "native connect failed");
            close_session(&ctx, &session);
        }
    }
}

/// Drain shaper-released payloads into the native socket
///
/// Starts consuming only once the connect has completed, which is what
/// makes the channel double as the pre-connect queue. Exits when every
/// sender (the session's own plus the clones riding on queued packets)
/// is gone and the channel is empty; dropping the write half then sends
/// the native FIN.
async fn run_writer(
    stats: Arc<RouterStats>,
    key: FlowKey,
    mut write_half: OwnedWriteHalf,
    mut from_shaper: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(chunk) = from_shaper.recv().await {
        match write_half.write_all(&chunk).await {
            Ok(()) => stats.record_native_egress(chunk.len()),
            Err(e) => {
                debug!(flow = %key, error = %e, "native write failed");
                return;
            }
        }
    }
    trace!(flow = %key, "writer drained, closing native write half");
}

/// Relay native-socket data back to the client as synthesized segments
async fn run_reader(ctx: Arc<FlowContext>, session: Arc<TcpSession>, mut read_half: OwnedReadHalf) {
    let mut buf = vec![0u8; MSS];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => {
                // Orderly close from the remote: pass the FIN through.
                if !session.is_closed() {
                    let fin = {
                        let mut inner = session.inner.lock();
                        let seq = inner.ours;
                        inner.ours = inner.ours.wrapping_add(1);
                        session.segment(
                            &ctx,
                            seq,
                            inner.theirs,
                            TcpFlags::FIN | TcpFlags::ACK,
                            &[],
                        )
                    };
                    ctx.submit_inbound(fin);
                    close_session(&ctx, &session);
                }
                return;
            }
            Ok(n) => {
                if session.is_closed() {
                    return;
                }
                session.touch(ctx.now_ms());
                ctx.stats.record_native_ingress(n);
                let data = {
                    let mut inner = session.inner.lock();
                    let seq = inner.ours;
                    inner.ours = inner.ours.wrapping_add(n as u32);
                    session.segment(
                        &ctx,
                        seq,
                        inner.theirs,
                        TcpFlags::ACK | TcpFlags::PSH,
                        &buf[..n],
                    )
                };
                ctx.submit_inbound(data);
            }
            Err(e) => {
                if !session.is_closed() {
                    debug!(flow = %session.key, error = %e, "native read failed, closing session");
                    close_session(&ctx, &session);
                }
                return;
            }
        }
    }
}

/// Dispatch one outbound TCP segment from the tun reader
pub fn handle_tcp_segment(ctx: &Arc<FlowContext>, ip: &Ipv4Packet<'_>, seg: &TcpSegment<'_>) {
    let key = FlowKey::tcp(ip.src(), seg.src_port, ip.dst(), seg.dst_port);

    if let Some(session) = ctx.table.get_tcp(&key) {
        session.handle_segment(ctx, seg);
        return;
    }

    if seg.flags.syn() && !seg.flags.ack() {
        if ctx.reject_tcp_ports.contains(&seg.dst_port) {
            debug!(flow = %key, "SYN to rejected port ignored");
            return;
        }
        TcpSession::open(ctx, key, seg.seq);
        return;
    }

    synthesize_rst(ctx, &key, seg);
}

/// Answer an unexpected segment with a reset, per RFC 793 section 3.4
///
/// With ACK set: `SEQ = seg.ack`, RST alone. Without: `SEQ = 0`,
/// `ACK = seg.seq + seg_len` (SYN/FIN each count one), RST|ACK. An
/// incoming RST is never answered.
fn synthesize_rst(ctx: &FlowContext, key: &FlowKey, seg: &TcpSegment<'_>) {
    if seg.flags.rst() {
        return;
    }
    let frame = if seg.flags.ack() {
        ctx.builder.tcp_frame(
            key.dst_addr,
            key.dst_port,
            key.src_addr,
            key.src_port,
            seg.ack,
            0,
            TcpFlags(TcpFlags::RST),
            &[],
        )
    } else {
        let ack = seg.seq.wrapping_add(seg.seq_len());
        ctx.builder.tcp_frame(
            key.dst_addr,
            key.dst_port,
            key.src_addr,
            key.src_port,
            0,
            ack,
            TcpFlags(TcpFlags::RST | TcpFlags::ACK),
            &[],
        )
    };
    debug!(flow = %key, flags = %seg.flags, "no session, synthesizing RST");
    ctx.submit_inbound(frame);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::ipv4::TcpSegment;
    use crate::session::testutil;
    use std::time::Duration;

    fn seg(seq: u32, ack: u32, flags: u8, payload: &[u8]) -> TcpSegment<'_> {
        TcpSegment {
            src_port: 50000,
            dst_port: 0, // set per test
            seq,
            ack,
            flags: TcpFlags(flags),
            window: 0xFFFF,
            payload,
        }
    }

    /// Drain the outbound shaper into the writer channels, as the
    /// router's outbound drainer would.
    fn pump_outbound(ctx: &Arc<FlowContext>) {
        while let Some(pkt) = ctx.outbound.try_drain() {
            if let Some(sink) = pkt.sink {
                let _ = sink.send(pkt.payload);
            }
        }
    }

    async fn expect_inbound_tcp(ctx: &Arc<FlowContext>) -> (TcpFlags, u32, u32, Vec<u8>) {
        let frame = tokio::time::timeout(Duration::from_secs(2), ctx.inbound.drain(1000))
            .await
            .unwrap()
            .expect("inbound frame");
        let pkt = Ipv4Packet::parse(&frame).unwrap();
        let tcp = TcpSegment::parse(pkt.payload()).unwrap();
        (tcp.flags, tcp.seq, tcp.ack, tcp.payload.to_vec())
    }

    /// A listener that accepts one connection and sinks everything it
    /// reads into the returned channel.
    async fn sink_listener() -> (std::net::SocketAddrV4, mpsc::UnboundedReceiver<Vec<u8>>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let std::net::SocketAddr::V4(addr) = listener.local_addr().unwrap() else {
            panic!("expected v4");
        };
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let _ = tx.send(buf[..n].to_vec());
                    }
                }
            }
        });
        (addr, rx)
    }

    #[tokio::test]
    async fn test_syn_creates_session_and_syn_ack() {
        let (ctx, _events) = testutil::context();
        let (addr, _rx) = sink_listener().await;
        let key = FlowKey::tcp("10.0.0.2".parse().unwrap(), 50000, *addr.ip(), addr.port());

        let session = TcpSession::open(&ctx, key, 1000).expect("session opens");
        assert_eq!(session.state(), TcpState::SynReceived);

        let (flags, _seq, ack, payload) = expect_inbound_tcp(&ctx).await;
        assert!(flags.syn() && flags.ack());
        assert_eq!(ack, 1001);
        assert!(payload.is_empty());

        // Client ACK completes the handshake.
        let mut ack_seg = seg(1001, 0, TcpFlags::ACK, &[]);
        ack_seg.dst_port = addr.port();
        session.handle_segment(&ctx, &ack_seg);
        assert_eq!(session.state(), TcpState::Established);
    }

    #[tokio::test]
    async fn test_duplicate_data_forwarded_once() {
        let (ctx, _events) = testutil::context();
        let (addr, mut sink) = sink_listener().await;
        let key = FlowKey::tcp("10.0.0.2".parse().unwrap(), 50000, *addr.ip(), addr.port());
        let session = TcpSession::open(&ctx, key, 1000).expect("session opens");
        let _syn_ack = expect_inbound_tcp(&ctx).await;

        let payload = vec![0xAA; 100];
        let mut data = seg(1001, 0, TcpFlags::ACK, &payload);
        data.dst_port = addr.port();

        session.handle_segment(&ctx, &data);
        session.handle_segment(&ctx, &data); // duplicate
        pump_outbound(&ctx);

        // Both segments are ACKed at the same edge.
        let (_, _, ack1, _) = expect_inbound_tcp(&ctx).await;
        let (_, _, ack2, _) = expect_inbound_tcp(&ctx).await;
        assert_eq!(ack1, 1101);
        assert_eq!(ack2, 1101);

        // The native side sees the 100 bytes exactly once.
        let received = tokio::time::timeout(Duration::from_secs(2), sink.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.len(), 100);
        assert!(sink.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_out_of_order_reassembly() {
        let (ctx, _events) = testutil::context();
        let (addr, mut sink) = sink_listener().await;
        let key = FlowKey::tcp("10.0.0.2".parse().unwrap(), 50000, *addr.ip(), addr.port());
        let session = TcpSession::open(&ctx, key, 1000).expect("session opens");
        let _syn_ack = expect_inbound_tcp(&ctx).await;

        let a = vec![b'a'; 100];
        let b = vec![b'b'; 100];
        let c = vec![b'c'; 50];

        let mut seg_a = seg(1001, 0, TcpFlags::ACK, &a);
        let mut seg_b = seg(1101, 0, TcpFlags::ACK, &b);
        let mut seg_c = seg(1201, 0, TcpFlags::ACK, &c);
        for s in [&mut seg_a, &mut seg_b, &mut seg_c] {
            s.dst_port = addr.port();
        }

        // Arrival order A, C, B.
        session.handle_segment(&ctx, &seg_a);
        let (_, _, ack, _) = expect_inbound_tcp(&ctx).await;
        assert_eq!(ack, 1101);

        session.handle_segment(&ctx, &seg_c);
        let (_, _, ack, _) = expect_inbound_tcp(&ctx).await;
        assert_eq!(ack, 1101); // duplicate ACK while B is missing

        session.handle_segment(&ctx, &seg_b);
        let (_, _, ack, _) = expect_inbound_tcp(&ctx).await;
        assert_eq!(ack, 1251); // B and the buffered C acknowledged together

        pump_outbound(&ctx);
        let mut received = Vec::new();
        while received.len() < 250 {
            let chunk = tokio::time::timeout(Duration::from_secs(2), sink.recv())
                .await
                .unwrap()
                .unwrap();
            received.extend_from_slice(&chunk);
        }
        let mut expected = a.clone();
        expected.extend_from_slice(&b);
        expected.extend_from_slice(&c);
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_overlapping_buffered_segment_trimmed() {
        let (ctx, _events) = testutil::context();
        let (addr, mut sink) = sink_listener().await;
        let key = FlowKey::tcp("10.0.0.2".parse().unwrap(), 50000, *addr.ip(), addr.port());
        let session = TcpSession::open(&ctx, key, 1000).expect("session opens");
        let _syn_ack = expect_inbound_tcp(&ctx).await;

        // Buffered segment at 1051 overlaps the first 50 bytes of the
        // in-order segment covering 1001..1101.
        let overlap = vec![b'x'; 100]; // 1051..1151
        let first = vec![b'y'; 100]; // 1001..1101
        let mut seg_overlap = seg(1051, 0, TcpFlags::ACK, &overlap);
        let mut seg_first = seg(1001, 0, TcpFlags::ACK, &first);
        seg_overlap.dst_port = addr.port();
        seg_first.dst_port = addr.port();

        session.handle_segment(&ctx, &seg_overlap);
        let (_, _, ack, _) = expect_inbound_tcp(&ctx).await;
        assert_eq!(ack, 1001);

        session.handle_segment(&ctx, &seg_first);
        let (_, _, ack, _) = expect_inbound_tcp(&ctx).await;
        assert_eq!(ack, 1151); // 100 new + 50 residual from the overlap

        pump_outbound(&ctx);
        let mut received = Vec::new();
        while received.len() < 150 {
            let chunk = tokio::time::timeout(Duration::from_secs(2), sink.recv())
                .await
                .unwrap()
                .unwrap();
            received.extend_from_slice(&chunk);
        }
        assert_eq!(&received[..100], &first[..]);
        assert_eq!(&received[100..150], &overlap[50..]);
    }

    #[tokio::test]
    async fn test_giant_sequence_gap_dropped() {
        let (ctx, _events) = testutil::context();
        let (addr, _sink) = sink_listener().await;
        let key = FlowKey::tcp("10.0.0.2".parse().unwrap(), 50000, *addr.ip(), addr.port());
        let session = TcpSession::open(&ctx, key, 1000).expect("session opens");
        let _syn_ack = expect_inbound_tcp(&ctx).await;

        let far = vec![0u8; 10];
        let mut seg_far = seg(1001 + 70_000, 0, TcpFlags::ACK, &far);
        seg_far.dst_port = addr.port();
        session.handle_segment(&ctx, &seg_far);

        // Dropped without even a duplicate ACK.
        assert_eq!(ctx.inbound.queue_len(), 0);
    }

    #[tokio::test]
    async fn test_fin_closes_and_acknowledges() {
        let (ctx, _events) = testutil::context();
        let (addr, _sink) = sink_listener().await;
        let key = FlowKey::tcp("10.0.0.2".parse().unwrap(), 50000, *addr.ip(), addr.port());
        let session = TcpSession::open(&ctx, key, 1000).expect("session opens");
        let (_, syn_ack_seq, _, _) = expect_inbound_tcp(&ctx).await;

        let mut fin = seg(1001, 0, TcpFlags::FIN | TcpFlags::ACK, &[]);
        fin.dst_port = addr.port();
        session.handle_segment(&ctx, &fin);

        let (flags, seq_num, ack, _) = expect_inbound_tcp(&ctx).await;
        assert!(flags.fin() && flags.ack());
        assert_eq!(ack, 1002); // FIN consumed one sequence number
        assert_eq!(seq_num, syn_ack_seq.wrapping_add(1));
        assert_eq!(session.state(), TcpState::Closed);
        assert_eq!(ctx.table.tcp_len(), 0);
    }

    #[tokio::test]
    async fn test_fin_with_queued_payload_still_delivers() {
        // Data ACKed by the stack must reach the native socket even when
        // the FIN removes the session while the payload sits in the
        // outbound queue.
        let (ctx, _events) = testutil::context();
        let (addr, mut sink) = sink_listener().await;
        let key = FlowKey::tcp("10.0.0.2".parse().unwrap(), 50000, *addr.ip(), addr.port());
        let session = TcpSession::open(&ctx, key, 1000).expect("session opens");
        let _syn_ack = expect_inbound_tcp(&ctx).await;

        // Prove the native path is up with a first exchange.
        let warmup = vec![0x01; 8];
        let mut first = seg(1001, 0, TcpFlags::ACK | TcpFlags::PSH, &warmup);
        first.dst_port = addr.port();
        session.handle_segment(&ctx, &first);
        pump_outbound(&ctx);
        let _ = expect_inbound_tcp(&ctx).await; // ACK
        let received = tokio::time::timeout(Duration::from_secs(2), sink.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, warmup);

        // Second payload stays queued while the FIN removes the session.
        let payload = vec![0x42; 64];
        let mut data = seg(1009, 0, TcpFlags::ACK | TcpFlags::PSH, &payload);
        let mut fin = seg(1073, 0, TcpFlags::FIN | TcpFlags::ACK, &[]);
        data.dst_port = addr.port();
        fin.dst_port = addr.port();

        session.handle_segment(&ctx, &data);
        session.handle_segment(&ctx, &fin); // session removed here
        assert_eq!(ctx.table.tcp_len(), 0);

        pump_outbound(&ctx); // payload released only now

        let received = tokio::time::timeout(Duration::from_secs(2), sink.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_rst_tears_down_silently() {
        let (ctx, _events) = testutil::context();
        let (addr, _sink) = sink_listener().await;
        let key = FlowKey::tcp("10.0.0.2".parse().unwrap(), 50000, *addr.ip(), addr.port());
        let session = TcpSession::open(&ctx, key, 1000).expect("session opens");
        let _syn_ack = expect_inbound_tcp(&ctx).await;

        let mut rst = seg(1001, 0, TcpFlags::RST, &[]);
        rst.dst_port = addr.port();
        session.handle_segment(&ctx, &rst);

        assert_eq!(ctx.table.tcp_len(), 0);
        assert_eq!(ctx.inbound.queue_len(), 0);
    }

    #[tokio::test]
    async fn test_syn_retransmit_replays_syn_ack() {
        let (ctx, _events) = testutil::context();
        let (addr, _sink) = sink_listener().await;
        let key = FlowKey::tcp("10.0.0.2".parse().unwrap(), 50000, *addr.ip(), addr.port());
        let session = TcpSession::open(&ctx, key, 1000).expect("session opens");
        let (_, first_seq, _, _) = expect_inbound_tcp(&ctx).await;

        let mut syn = seg(1000, 0, TcpFlags::SYN, &[]);
        syn.dst_port = addr.port();
        session.handle_segment(&ctx, &syn);

        let (flags, seq_num, ack, _) = expect_inbound_tcp(&ctx).await;
        assert!(flags.syn() && flags.ack());
        assert_eq!(seq_num, first_seq);
        assert_eq!(ack, 1001);
    }
}
