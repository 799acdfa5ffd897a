//! Top-level packet router
//!
//! Owns the tun interface, the session table, both shapers and the worker
//! tasks: tun reader, inbound/outbound drainers, idle sweeper, loss
//! logger, and a control loop that processes supervisor commands. Profile
//! updates and shutdown arrive as messages; nothing reaches into the
//! router from outside.

pub mod stats;

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::clock::MonotonicClock;
use crate::error::{Result, RouterError};
use crate::packet::{
    FrameBuilder, Ipv4Packet, TcpSegment, UdpDatagram, PROTO_ICMP, PROTO_TCP, PROTO_UDP,
};
use crate::profile::{Direction, NetworkProfile};
use crate::session::icmp::handle_icmp;
use crate::session::tcp::handle_tcp_segment;
use crate::session::udp::{self, handle_udp_datagram};
use crate::session::{FlowContext, FlowKey, FlowProto, SessionTable, SocketProtector};
use crate::shaper::Shaper;
use crate::tun::{TunInterface, MAX_FRAME};

pub use stats::{RouterStats, StatsSnapshot};

/// How long a drainer waits on its queue per iteration, bounding shutdown
/// latency
const DRAIN_WAIT_MS: u64 = 250;

/// Bound on every worker task's shutdown time
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Commands the supervisor (UI, config watcher) sends the router
#[derive(Debug)]
pub enum RouterCommand {
    /// Atomically replace the impairment profile
    UpdateProfile(NetworkProfile),
    /// Request a statistics snapshot
    GetStats(oneshot::Sender<StatsSnapshot>),
    /// Shut the router down
    Stop,
}

/// Events the router reports to its supervisor
///
/// Delivered over a bounded channel, best-effort: a slow consumer loses
/// events rather than stalling packet processing.
#[derive(Debug, Clone)]
pub enum RouterEvent {
    /// All worker tasks are running
    Started,
    /// A new flow session was registered
    SessionOpened {
        /// The flow's 5-tuple
        flow: FlowKey,
    },
    /// A flow session was closed and removed
    SessionClosed {
        /// The flow's 5-tuple
        flow: FlowKey,
    },
    /// The tun fd stopped yielding frames
    TunClosed {
        /// Whether the router is shutting down because of it
        fatal: bool,
    },
    /// Shutdown finished; all sockets are closed
    ShutdownComplete,
}

/// Router configuration knobs
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// The tun interface's assigned address
    pub tun_addr: Ipv4Addr,
    /// Destination ports whose SYNs are silently ignored
    pub reject_tcp_ports: Vec<u16>,
    /// Idle horizon after which sessions are evicted
    pub idle_timeout: Duration,
    /// How often the sweeper runs
    pub sweep_interval: Duration,
    /// Delay queue high-water mark (entries, per direction)
    pub queue_high_water: usize,
    /// How often target-vs-observed loss is logged
    pub stats_log_interval: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            tun_addr: Ipv4Addr::new(10, 0, 0, 2),
            reject_tcp_ports: vec![853],
            idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            queue_high_water: crate::shaper::DEFAULT_HIGH_WATER,
            stats_log_interval: Duration::from_secs(10),
        }
    }
}

/// Cloneable command-side handle to a running router
#[derive(Clone)]
pub struct RouterHandle {
    commands: mpsc::Sender<RouterCommand>,
}

impl RouterHandle {
    /// Push a new impairment profile
    ///
    /// # Errors
    ///
    /// Fails when the router has shut down.
    pub async fn update_profile(&self, profile: NetworkProfile) -> Result<()> {
        self.commands
            .send(RouterCommand::UpdateProfile(profile))
            .await
            .map_err(|_| RouterError::ShuttingDown)
    }

    /// Fetch a statistics snapshot
    ///
    /// # Errors
    ///
    /// Fails when the router has shut down.
    pub async fn stats(&self) -> Result<StatsSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(RouterCommand::GetStats(tx))
            .await
            .map_err(|_| RouterError::ShuttingDown)?;
        rx.await.map_err(|_| RouterError::ShuttingDown)
    }

    /// Ask the router to stop
    ///
    /// # Errors
    ///
    /// Fails when the router has already shut down.
    pub async fn stop(&self) -> Result<()> {
        self.commands
            .send(RouterCommand::Stop)
            .await
            .map_err(|_| RouterError::ShuttingDown)
    }
}

/// The packet router
pub struct Router {
    tun: Arc<dyn TunInterface>,
    ctx: Arc<FlowContext>,
    config: RouterConfig,
    commands: mpsc::Receiver<RouterCommand>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Router {
    /// Assemble a router around a tun interface
    ///
    /// Returns the router (drive it with [`run`](Self::run)), the command
    /// handle, and the event stream.
    #[must_use]
    pub fn new(
        tun: Arc<dyn TunInterface>,
        config: RouterConfig,
        profile: NetworkProfile,
        protector: Arc<dyn SocketProtector>,
    ) -> (Self, RouterHandle, mpsc::Receiver<RouterEvent>) {
        let clock: Arc<dyn crate::clock::PacketClock> = Arc::new(MonotonicClock::new());
        let profile = Arc::new(profile);
        let (events_tx, events_rx) = mpsc::channel(128);
        let (commands_tx, commands_rx) = mpsc::channel(32);
        let (shutdown_tx, _) = watch::channel(false);

        let ctx = Arc::new(FlowContext {
            tun_addr: config.tun_addr,
            builder: FrameBuilder::new(),
            clock: Arc::clone(&clock),
            inbound: Arc::new(Shaper::new(
                Direction::Inbound,
                Arc::clone(&profile),
                Arc::clone(&clock),
                config.queue_high_water,
            )),
            outbound: Arc::new(Shaper::new(
                Direction::Outbound,
                profile,
                clock,
                config.queue_high_water,
            )),
            protector,
            stats: Arc::new(RouterStats::new()),
            table: SessionTable::new(),
            events: events_tx,
            reject_tcp_ports: config.reject_tcp_ports.clone(),
        });

        (
            Self {
                tun,
                ctx,
                config,
                commands: commands_rx,
                shutdown: Arc::new(shutdown_tx),
            },
            RouterHandle {
                commands: commands_tx,
            },
            events_rx,
        )
    }

    /// Direct access to the flow context (statistics, shapers)
    ///
    /// Mostly useful for tests; production callers go through the handle.
    #[must_use]
    pub fn context(&self) -> Arc<FlowContext> {
        Arc::clone(&self.ctx)
    }

    /// Run until stopped or the tun closes
    ///
    /// Spawns the worker tasks, then serves the control loop. On exit all
    /// workers are stopped within [`SHUTDOWN_GRACE`], every session's
    /// native socket is closed, and the tun goes down last.
    pub async fn run(mut self) -> Result<()> {
        info!(tun_addr = %self.config.tun_addr, "router starting");

        let mut workers: Vec<JoinHandle<()>> = vec![
            tokio::spawn(run_tun_reader(
                Arc::clone(&self.tun),
                Arc::clone(&self.ctx),
                Arc::clone(&self.shutdown),
            )),
            tokio::spawn(run_inbound_drainer(
                Arc::clone(&self.tun),
                Arc::clone(&self.ctx),
                self.shutdown.subscribe(),
            )),
            tokio::spawn(run_outbound_drainer(
                Arc::clone(&self.ctx),
                self.shutdown.subscribe(),
            )),
            tokio::spawn(run_sweeper(
                Arc::clone(&self.ctx),
                self.config.idle_timeout,
                self.config.sweep_interval,
                self.shutdown.subscribe(),
            )),
            tokio::spawn(run_loss_logger(
                Arc::clone(&self.ctx),
                self.config.stats_log_interval,
                self.shutdown.subscribe(),
            )),
        ];

        self.ctx.emit(RouterEvent::Started);

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(RouterCommand::UpdateProfile(profile)) => {
                        let profile = Arc::new(profile);
                        self.ctx.inbound.set_profile(Arc::clone(&profile));
                        self.ctx.outbound.set_profile(profile);
                        info!("impairment profile replaced");
                    }
                    Some(RouterCommand::GetStats(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                    Some(RouterCommand::Stop) | None => break,
                },
                _ = shutdown_rx.changed() => break, // tun reader hit EOF
            }
        }

        // Phase 1: break every blocking wait.
        let _ = self.shutdown.send(true);
        for worker in workers.drain(..) {
            if tokio::time::timeout(SHUTDOWN_GRACE, worker).await.is_err() {
                warn!("worker did not stop within grace period");
            }
        }

        // Phase 2: drop and close all native sockets.
        let closed = self.ctx.table.clear();
        self.ctx.inbound.clear();
        self.ctx.outbound.clear();
        debug!(sessions = closed, "all sessions closed");

        // Phase 3: the tun fd goes last, when `self.tun` drops below.
        self.ctx.emit(RouterEvent::ShutdownComplete);
        info!("router stopped");
        Ok(())
    }

    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sent_bytes: self.ctx.stats.sent_bytes(),
            sent_packets: self.ctx.stats.sent_packets(),
            received_bytes: self.ctx.stats.received_bytes(),
            received_packets: self.ctx.stats.received_packets(),
            rejected_frames: self.ctx.stats.rejected_frames(),
            outbound_queue_size: self.ctx.outbound.queue_len(),
            inbound_queue_size: self.ctx.inbound.queue_len(),
            outbound_loss: self.ctx.outbound.stats(),
            inbound_loss: self.ctx.inbound.stats(),
            udp_sessions: self.ctx.table.udp_len(),
            tcp_sessions: self.ctx.table.tcp_len(),
        }
    }
}

/// Read frames off the tun and dispatch them to the flow handlers
async fn run_tun_reader(
    tun: Arc<dyn TunInterface>,
    ctx: Arc<FlowContext>,
    shutdown: Arc<watch::Sender<bool>>,
) {
    let mut shutdown_rx = shutdown.subscribe();
    let mut buf = vec![0u8; MAX_FRAME];
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            read = tun.recv_frame(&mut buf) => match read {
                Ok(0) => {
                    warn!("tun read returned EOF, shutting down");
                    ctx.emit(RouterEvent::TunClosed { fatal: true });
                    let _ = shutdown.send(true);
                    break;
                }
                Ok(len) => dispatch_frame(&ctx, &buf[..len]).await,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!(error = %e, "tun read failed, shutting down");
                    ctx.emit(RouterEvent::TunClosed { fatal: true });
                    let _ = shutdown.send(true);
                    break;
                }
            }
        }
    }
}

/// Decode one outbound frame and hand it to the right protocol handler
async fn dispatch_frame(ctx: &Arc<FlowContext>, frame: &[u8]) {
    let ip = match Ipv4Packet::parse(frame) {
        Ok(ip) => ip,
        Err(e) => {
            debug!(error = %e, len = frame.len(), "undecodable frame dropped");
            ctx.stats.record_rejected_frame();
            return;
        }
    };

    if ip.src() != ctx.tun_addr {
        warn!(src = %ip.src(), expected = %ctx.tun_addr, "frame with foreign source dropped");
        ctx.stats.record_rejected_frame();
        return;
    }

    match ip.protocol() {
        PROTO_UDP => match UdpDatagram::parse(ip.payload()) {
            Ok(udp) => handle_udp_datagram(ctx, &ip, &udp).await,
            Err(e) => {
                debug!(error = %e, "undecodable UDP datagram dropped");
                ctx.stats.record_rejected_frame();
            }
        },
        PROTO_TCP => match TcpSegment::parse(ip.payload()) {
            Ok(seg) => handle_tcp_segment(ctx, &ip, &seg),
            Err(e) => {
                debug!(error = %e, "undecodable TCP segment dropped");
                ctx.stats.record_rejected_frame();
            }
        },
        PROTO_ICMP => handle_icmp(ctx, frame, &ip),
        proto => {
            debug!(proto, "unsupported protocol dropped");
            ctx.stats.record_rejected_frame();
        }
    }
}

/// Write released inbound frames back to the tun
async fn run_inbound_drainer(
    tun: Arc<dyn TunInterface>,
    ctx: Arc<FlowContext>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            released = ctx.inbound.drain(DRAIN_WAIT_MS) => {
                if let Some(frame) = released {
                    trace!(len = frame.len(), "frame released to tun");
                    if let Err(e) = tun.send_frame(&frame).await {
                        debug!(error = %e, "tun write failed, frame dropped");
                    }
                }
            }
        }
    }
}

/// Write released outbound payloads to their flows' native sockets
///
/// A payload whose session has meanwhile closed is dropped: the client
/// either retransmits (TCP) or re-opens the flow (UDP).
async fn run_outbound_drainer(ctx: Arc<FlowContext>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            released = ctx.outbound.drain(DRAIN_WAIT_MS) => {
                let Some(packet) = released else { continue };
                match packet.key.proto {
                    FlowProto::Udp => {
                        let Some(session) = ctx.table.get_udp(&packet.key) else {
                            trace!(flow = %packet.key, "released payload for closed flow dropped");
                            continue;
                        };
                        match session.send(&packet.payload).await {
                            Ok(sent) => ctx.stats.record_native_egress(sent),
                            Err(e) => {
                                debug!(flow = %packet.key, error = %e, "native send failed, closing session");
                                udp::close_session(&ctx, &packet.key);
                            }
                        }
                    }
                    FlowProto::Tcp => {
                        // The sender travels with the packet so bytes the
                        // stack already ACKed survive session teardown.
                        match packet.sink {
                            Some(sink) => {
                                let _ = sink.send(packet.payload);
                            }
                            None => {
                                trace!(flow = %packet.key, "TCP payload without writer dropped");
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Evict idle sessions on a fixed cadence
async fn run_sweeper(
    ctx: Arc<FlowContext>,
    idle_timeout: Duration,
    sweep_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(sweep_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await; // the immediate first tick
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = ticker.tick() => {
                let closed = ctx
                    .table
                    .sweep_idle(ctx.now_ms(), idle_timeout.as_millis() as u64);
                if closed > 0 {
                    info!(closed, "idle sessions evicted");
                }
            }
        }
    }
}

/// Periodically log target vs observed loss per direction
async fn run_loss_logger(
    ctx: Arc<FlowContext>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = ticker.tick() => {
                let profile = ctx.outbound.profile();
                let out = ctx.outbound.stats();
                let inb = ctx.inbound.stats();
                info!(
                    out_target = profile.loss_rate(Direction::Outbound) * 100.0,
                    out_observed = out.observed_percent(),
                    out_total = out.total,
                    in_target = profile.loss_rate(Direction::Inbound) * 100.0,
                    in_observed = inb.observed_percent(),
                    in_total = inb.total,
                    "loss target vs observed"
                );
            }
        }
    }
}
