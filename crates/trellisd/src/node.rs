//! A single mesh node
//!
//! [`Node`] is a synchronous state machine. Callers feed it frames from the
//! wire, packets from the device and clock ticks, each stamped with the
//! current time in milliseconds. Frames for the wire collect in an outbox and
//! packets for the device in a queue; the daemon runtime and the simulator
//! drain both the same way.

use crate::discovery::{self, Beacon};
use crate::node_table::{NodeTable, Route, RoutePolicy, Sighting};
use crate::router::{self, Router};
use crate::tun::{self, DeviceEndpoint, DeviceSink, TunAdapter, TunError, TunMode};
use crate::wire::{self, SessionStage, TransportEndpoint};
use rand::Rng;
use std::net::{Ipv6Addr, SocketAddr};
use thiserror::Error;
use tracing::{debug, info, trace, warn};
use trellis_core::{Message, NodeKey, DEFAULT_PADDING};
use trellis_net::{
    Frame, FrameType, KeyPair, PeerTable, Pipeline, PortId, RouteHeader, SessionConfig,
    SessionEvent, SessionManager, SessionState, TransportError,
};

/// Node errors
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Packet error: {0}")]
    Packet(#[from] trellis_core::Error),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Device error: {0}")]
    Tun(#[from] TunError),
    #[error("Node is not started")]
    NotStarted,
    #[error("Node runtime stopped")]
    Stopped,
}

impl NodeError {
    /// Whether the error only cost one packet
    pub fn is_drop(&self) -> bool {
        match self {
            NodeError::Packet(e) => e.is_drop(),
            NodeError::NotStarted => true,
            _ => false,
        }
    }
}

/// Node settings
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Time between beacons, before jitter
    pub beacon_interval_ms: u64,
    /// Time between periodic announcements to confirmed peers
    pub announce_interval_ms: u64,
    /// Time between session and table maintenance passes
    pub maintenance_interval_ms: u64,
    /// Node table entries older than this are evicted
    pub node_ttl_ms: u64,
    pub tun_mode: TunMode,
    pub route_policy: RoutePolicy,
    pub session: SessionConfig,
    /// Addresses beaconed from start-up
    pub peers: Vec<SocketAddr>,
    /// Extra beacon target, usually a broadcast address
    pub broadcast: Option<SocketAddr>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            beacon_interval_ms: 2_000,
            announce_interval_ms: 10_000,
            maintenance_interval_ms: 1_000,
            node_ttl_ms: 300_000,
            tun_mode: TunMode::default(),
            route_policy: RoutePolicy::default(),
            session: SessionConfig::default(),
            peers: Vec::new(),
            broadcast: None,
        }
    }
}

/// Counters
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeStats {
    pub beacons_sent: u64,
    pub beacons_received: u64,
    pub frames_in: u64,
    pub frames_out: u64,
    pub packets_from_device: u64,
    pub packets_to_device: u64,
    pub packets_forwarded: u64,
    pub announcements_sent: u64,
    pub dropped: u64,
    /// Packets whose source address the sending peer cannot own
    pub spoofed: u64,
}

/// Snapshot published to observers
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeStatus {
    pub started: bool,
    pub node_count: usize,
    pub established: usize,
}

/// State shared by every pipeline stage of one node
pub struct NodeCore {
    pub(crate) local: NodeKey,
    pub(crate) address: Ipv6Addr,
    pub(crate) now_ms: u64,
    pub(crate) table: NodeTable,
    pub(crate) peers: PeerTable,
    pub(crate) sessions: SessionManager,
    pub(crate) outbox: Vec<(SocketAddr, Frame)>,
    pub(crate) device_out: Vec<Message>,
    pub(crate) stats: NodeStats,
    /// Set when the table gained or rerouted an entry
    pub(crate) routes_changed: bool,
}

impl NodeCore {
    pub(crate) fn queue_frame(&mut self, addr: SocketAddr, frame: Frame) {
        trace!("queue {:?} frame ({} bytes) for {}", frame.frame_type, frame.payload.len(), addr);
        self.stats.frames_out += 1;
        self.outbox.push((addr, frame));
    }
}

impl DeviceSink for NodeCore {
    fn deliver_to_device(&mut self, packet: Message) {
        self.stats.packets_to_device += 1;
        self.device_out.push(packet);
    }
}

/// A mesh node: identity, tables, sessions and the packet pipeline
pub struct Node {
    config: NodeConfig,
    keypair: KeyPair,
    core: NodeCore,
    pipeline: Pipeline<NodeCore>,
    device_port: PortId,
    wire_port: PortId,
    session_port: PortId,
    beacon_targets: Vec<SocketAddr>,
    started: bool,
    next_beacon_ms: u64,
    next_announce_ms: u64,
    next_maintenance_ms: u64,
    last_beacon_ms: Option<u64>,
}

impl Node {
    /// Build a node and plumb its pipeline:
    /// device - tun - router - session - wire.
    pub fn new(keypair: KeyPair, config: NodeConfig) -> Result<Self, NodeError> {
        let local = keypair.node_key();
        let core = NodeCore {
            local,
            address: local.address(),
            now_ms: 0,
            table: NodeTable::new(local, config.route_policy, 0),
            peers: PeerTable::new(),
            sessions: SessionManager::new(keypair.clone(), config.session.clone()),
            outbox: Vec::new(),
            device_out: Vec::new(),
            stats: NodeStats::default(),
            routes_changed: false,
        };

        let mut pipeline = Pipeline::new();
        let device = pipeline.add_stage(DeviceEndpoint);
        let tun = pipeline.add_stage(TunAdapter::new(config.tun_mode));
        let router = pipeline.add_stage(Router);
        let session = pipeline.add_stage(SessionStage);
        let wire = pipeline.add_stage(TransportEndpoint);

        let device_port = pipeline.port(device, 0)?;
        let tun_device = pipeline.port(tun, tun::DEVICE_PORT)?;
        let tun_router = pipeline.port(tun, tun::ROUTER_PORT)?;
        let router_tun = pipeline.port(router, router::TUN_PORT)?;
        let router_session = pipeline.port(router, router::SESSION_PORT)?;
        let session_port = pipeline.port(session, wire::ROUTER_PORT)?;
        let session_wire = pipeline.port(session, wire::WIRE_PORT)?;
        let wire_port = pipeline.port(wire, 0)?;

        pipeline.plumb(device_port, tun_device)?;
        pipeline.plumb(tun_router, router_tun)?;
        pipeline.plumb(router_session, session_port)?;
        pipeline.plumb(session_wire, wire_port)?;
        debug!("node {} pipeline: {:?}", local, pipeline);

        Ok(Self {
            beacon_targets: config.peers.clone(),
            config,
            keypair,
            core,
            pipeline,
            device_port,
            wire_port,
            session_port,
            started: false,
            next_beacon_ms: 0,
            next_announce_ms: 0,
            next_maintenance_ms: 0,
            last_beacon_ms: None,
        })
    }

    pub fn key(&self) -> NodeKey {
        self.core.local
    }

    /// Mesh IPv6 address
    pub fn address(&self) -> Ipv6Addr {
        self.core.address
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn table(&self) -> &NodeTable {
        &self.core.table
    }

    pub fn peers(&self) -> &PeerTable {
        &self.core.peers
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.core.sessions
    }

    pub fn stats(&self) -> &NodeStats {
        &self.core.stats
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Known nodes, self included
    pub fn node_count(&self) -> usize {
        self.core.table.count()
    }

    pub fn beacon_targets(&self) -> &[SocketAddr] {
        &self.beacon_targets
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            started: self.started,
            node_count: self.core.table.count(),
            established: self.core.sessions.established().count(),
        }
    }

    /// Start beaconing. Idempotent.
    pub fn start(&mut self, now_ms: u64) {
        if self.started {
            return;
        }
        self.started = true;
        self.core.now_ms = now_ms;
        self.core.table.touch(&self.core.local, now_ms);
        self.next_announce_ms = now_ms + self.config.announce_interval_ms;
        self.next_maintenance_ms = now_ms + self.config.maintenance_interval_ms;
        info!(
            "node {} started at {} with {} beacon targets",
            self.core.local,
            self.core.address,
            self.beacon_targets.len()
        );
        self.send_beacons(now_ms);
        self.next_beacon_ms = now_ms + self.beacon_delay();
    }

    /// Add a beacon target. A started node beacons it right away.
    pub fn add_peer(&mut self, addr: SocketAddr, now_ms: u64) -> Result<(), NodeError> {
        if !self.beacon_targets.contains(&addr) {
            self.beacon_targets.push(addr);
            debug!("added beacon target {}", addr);
        }
        if self.started {
            self.core.now_ms = now_ms;
            let timestamp_ms = self.beacon_timestamp(now_ms);
            let frame = Beacon::new(&self.keypair, timestamp_ms)?.to_frame()?;
            self.core.stats.beacons_sent += 1;
            self.core.queue_frame(addr, frame);
        }
        Ok(())
    }

    /// Handle one frame from the wire.
    pub fn handle_frame(&mut self, from: SocketAddr, frame: Frame, now_ms: u64) -> Result<(), NodeError> {
        if !self.started {
            return Err(NodeError::NotStarted);
        }
        self.core.now_ms = now_ms;
        self.core.stats.frames_in += 1;
        let frame_type = frame.frame_type;

        let result = match frame_type {
            FrameType::Beacon => {
                discovery::handle_beacon(&mut self.core, from, &frame, now_ms).map(|outcome| {
                    trace!("beacon from {}: {:?}", from, outcome);
                })
            }
            _ => {
                let mut msg = Message::from_payload(&frame.payload, DEFAULT_PADDING);
                RouteHeader::from_wire(from, frame_type as u8)
                    .push(&mut msg)
                    .and_then(|()| self.pipeline.send(&mut self.core, self.wire_port, msg))
            }
        };
        self.settle();

        result.map_err(|e| {
            self.core.stats.dropped += 1;
            debug!("dropped {:?} frame from {}: {}", frame_type, from, e);
            e.into()
        })
    }

    /// Route one tagged packet written by the host.
    pub fn send_from_device(&mut self, packet: &[u8], now_ms: u64) -> Result<(), NodeError> {
        if !self.started {
            return Err(NodeError::NotStarted);
        }
        self.core.now_ms = now_ms;
        self.core.stats.packets_from_device += 1;

        let msg = Message::from_payload(packet, DEFAULT_PADDING);
        let result = self.pipeline.send(&mut self.core, self.device_port, msg);
        self.settle();

        result.map_err(|e| {
            self.core.stats.dropped += 1;
            debug!("dropped device packet: {}", e);
            e.into()
        })
    }

    /// Run timers: beacons, session maintenance, eviction, announcements.
    pub fn tick(&mut self, now_ms: u64) {
        if !self.started {
            return;
        }
        self.core.now_ms = now_ms;

        if now_ms >= self.next_beacon_ms {
            self.send_beacons(now_ms);
            self.next_beacon_ms = now_ms + self.beacon_delay();
        }
        if now_ms >= self.next_maintenance_ms {
            self.maintain(now_ms);
            self.next_maintenance_ms = now_ms + self.config.maintenance_interval_ms;
        }
        if now_ms >= self.next_announce_ms {
            self.core.routes_changed = true;
            self.next_announce_ms = now_ms + self.config.announce_interval_ms;
        }
        self.settle();
    }

    /// Drain frames waiting for the wire
    pub fn take_outbox(&mut self) -> Vec<(SocketAddr, Frame)> {
        std::mem::take(&mut self.core.outbox)
    }

    /// Drain tagged packets waiting for the device
    pub fn take_device_output(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.core.device_out)
            .into_iter()
            .map(Message::into_vec)
            .collect()
    }

    fn beacon_delay(&self) -> u64 {
        let base = self.config.beacon_interval_ms;
        let jitter = base / 4;
        if jitter == 0 {
            return base;
        }
        base - rand::thread_rng().gen_range(0..=jitter)
    }

    /// Beacon timestamps strictly increase; receivers drop anything older
    fn beacon_timestamp(&mut self, now_ms: u64) -> u64 {
        let timestamp_ms = self
            .last_beacon_ms
            .map_or(now_ms, |last| now_ms.max(last.saturating_add(1)));
        self.last_beacon_ms = Some(timestamp_ms);
        timestamp_ms
    }

    fn send_beacons(&mut self, now_ms: u64) {
        let timestamp_ms = self.beacon_timestamp(now_ms);
        let frame = match Beacon::new(&self.keypair, timestamp_ms).and_then(|b| b.to_frame()) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("could not build beacon: {}", e);
                return;
            }
        };
        let targets = self.beacon_targets.iter().chain(self.config.broadcast.iter());
        for addr in targets {
            self.core.stats.beacons_sent += 1;
            self.core.queue_frame(*addr, frame.clone());
        }
    }

    fn maintain(&mut self, now_ms: u64) {
        for out in self.core.sessions.maintain(now_ms) {
            self.core.queue_frame(out.addr, out.frame);
        }

        let sessions = &self.core.sessions;
        let evicted = self.core.table.evict_stale(now_ms, self.config.node_ttl_ms, |key| {
            sessions.state(key) == SessionState::Established
        });
        for key in &evicted {
            info!(node = %key, "evicted stale node");
        }
    }

    /// React to session events and send announcements if routes changed.
    fn settle(&mut self) {
        for event in self.core.sessions.take_events() {
            self.on_session_event(event);
        }
        if std::mem::take(&mut self.core.routes_changed) {
            self.announce();
        }
    }

    fn on_session_event(&mut self, event: SessionEvent) {
        let now_ms = self.core.now_ms;
        match event {
            SessionEvent::Established { peer, role } => {
                debug!(peer = %peer, ?role, "session established");
            }
            SessionEvent::Confirmed { peer } => {
                let Some(addr) = self.core.sessions.get(&peer).map(|s| s.addr()) else {
                    return;
                };
                self.core.peers.upsert(peer, addr, now_ms);
                let Some(label) = self.core.peers.get(&peer).map(|p| p.label) else {
                    return;
                };
                let sighting = self
                    .core
                    .table
                    .record_sighting(peer, Route::direct(peer, label), now_ms);
                if matches!(sighting, Sighting::Inserted | Sighting::Replaced) {
                    self.core.routes_changed = true;
                }
                info!(
                    "peer {} confirmed at {} ({} nodes known)",
                    peer,
                    addr,
                    self.core.table.count()
                );
            }
            SessionEvent::Expired { peer } => {
                info!(peer = %peer, "session expired");
            }
            SessionEvent::Failed { peer, reason } => {
                debug!(peer = %peer, "handshake failed: {}", reason);
            }
        }
    }

    fn announce(&mut self) {
        let peers: Vec<NodeKey> = self.core.sessions.established().collect();
        for peer in peers {
            let msg = match router::announcement(&self.core.table, peer) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("could not build announcement for {}: {}", peer, e);
                    continue;
                }
            };
            match self.pipeline.inject(&mut self.core, self.session_port, msg) {
                Ok(()) => self.core.stats.announcements_sent += 1,
                Err(e) => debug!("announcement to {} dropped: {}", peer, e),
            }
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("key", &self.core.local)
            .field("address", &self.core.address)
            .field("started", &self.started)
            .field("nodes", &self.core.table.count())
            .field("sessions", &self.core.sessions.len())
            .finish()
    }
}
