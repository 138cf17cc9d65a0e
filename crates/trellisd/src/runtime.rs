//! Tokio driver for a [`Node`]
//!
//! One task owns the node and selects over inbound frames, device packets,
//! commands and a tick interval. After every event the node's outbox goes to
//! the transport and its device queue to the device.

use crate::convergence::LinkEndpoint;
use crate::node::{Node, NodeError, NodeStatus};
use crate::tun::{TunDevice, TunError};
use std::net::{Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use trellis_core::NodeKey;
use trellis_net::{Transport, TransportEvent};

/// Requests to a running node
#[derive(Debug)]
pub enum NodeCommand {
    /// Start beaconing an address
    AddPeer(SocketAddr),
    Shutdown,
}

/// Control handle for a spawned node
#[derive(Clone, Debug)]
pub struct NodeHandle {
    key: NodeKey,
    address: Ipv6Addr,
    commands: mpsc::Sender<NodeCommand>,
    status: watch::Receiver<NodeStatus>,
}

impl NodeHandle {
    pub fn key(&self) -> NodeKey {
        self.key
    }

    pub fn address(&self) -> Ipv6Addr {
        self.address
    }

    /// Latest published status
    pub fn status(&self) -> NodeStatus {
        self.status.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<NodeStatus> {
        self.status.clone()
    }

    pub fn add_peer(&self, addr: SocketAddr) -> Result<(), NodeError> {
        self.commands
            .try_send(NodeCommand::AddPeer(addr))
            .map_err(|_| NodeError::Stopped)
    }

    pub async fn shutdown(&self) {
        if self.commands.send(NodeCommand::Shutdown).await.is_err() {
            debug!("node {} already stopped", self.key);
        }
    }
}

impl LinkEndpoint for NodeHandle {
    fn is_started(&self) -> bool {
        self.status.borrow().started
    }

    fn node_count(&self) -> usize {
        self.status.borrow().node_count
    }
}

/// Spawn `node` on the current runtime.
pub fn spawn_node<T, D>(
    node: Node,
    transport: T,
    events: mpsc::Receiver<TransportEvent>,
    device: D,
    tick: Duration,
) -> (NodeHandle, JoinHandle<Result<(), NodeError>>)
where
    T: Transport + Send + Sync + 'static,
    D: TunDevice + Send + 'static,
{
    let (command_tx, command_rx) = mpsc::channel(64);
    let (status_tx, status_rx) = watch::channel(node.status());
    let handle = NodeHandle {
        key: node.key(),
        address: node.address(),
        commands: command_tx,
        status: status_rx,
    };
    let task = tokio::spawn(run_node(node, transport, events, device, command_rx, status_tx, tick));
    (handle, task)
}

/// Run `node` until shutdown or until every input is gone.
pub async fn run_node<T, D>(
    mut node: Node,
    transport: T,
    mut events: mpsc::Receiver<TransportEvent>,
    mut device: D,
    mut commands: mpsc::Receiver<NodeCommand>,
    status: watch::Sender<NodeStatus>,
    tick: Duration,
) -> Result<(), NodeError>
where
    T: Transport,
    D: TunDevice,
{
    let clock = Instant::now();
    let now_ms = || u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);

    node.start(now_ms());
    write_device(&mut node, &device);
    send_outbox(&mut node, &transport).await;
    publish(&node, &status);
    info!(
        "node {} running on {} with device {}",
        node.key(),
        transport.local_addr(),
        device.name()
    );

    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut wire_open = true;
    let mut device_open = true;

    loop {
        tokio::select! {
            event = events.recv(), if wire_open => match event {
                Some(TransportEvent::FrameReceived { from, frame }) => {
                    if let Err(e) = node.handle_frame(from, frame, now_ms()) {
                        if !e.is_drop() {
                            warn!("frame from {} failed: {}", from, e);
                        }
                    }
                }
                None => {
                    info!("transport closed");
                    wire_open = false;
                }
            },
            packet = device.read_packet(), if device_open => match packet {
                Some(packet) => {
                    if let Err(e) = node.send_from_device(&packet, now_ms()) {
                        if !e.is_drop() {
                            warn!("device packet failed: {}", e);
                        }
                    }
                }
                None => {
                    info!("device {} closed", device.name());
                    device_open = false;
                }
            },
            command = commands.recv() => match command {
                Some(NodeCommand::AddPeer(addr)) => node.add_peer(addr, now_ms())?,
                Some(NodeCommand::Shutdown) | None => {
                    info!("node {} shutting down", node.key());
                    break;
                }
            },
            _ = interval.tick() => node.tick(now_ms()),
        }

        write_device(&mut node, &device);
        send_outbox(&mut node, &transport).await;
        publish(&node, &status);
    }
    Ok(())
}

async fn send_outbox<T: Transport>(node: &mut Node, transport: &T) {
    for (addr, frame) in node.take_outbox() {
        if let Err(e) = transport.send_frame(addr, frame).await {
            debug!("send to {} failed: {}", addr, e);
        }
    }
}

fn write_device<D: TunDevice>(node: &mut Node, device: &D) {
    for packet in node.take_device_output() {
        match device.write_packet(packet) {
            Ok(()) => {}
            Err(e @ TunError::Full(_)) => debug!("{}", e),
            Err(e) => warn!("{}", e),
        }
    }
}

fn publish(node: &Node, status: &watch::Sender<NodeStatus>) {
    let next = node.status();
    status.send_if_modified(|current| {
        if *current == next {
            return false;
        }
        *current = next;
        true
    });
}
