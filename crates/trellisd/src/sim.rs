//! Deterministic in-process network
//!
//! [`SimNetwork`] runs any number of nodes on one thread against a virtual
//! millisecond clock. Frames travel only over connected pairs and are
//! delivered until every outbox is empty, so a run is reproducible apart from
//! beacon jitter and session key material.

use crate::convergence::{LinkSupervisor, Step};
use crate::node::{Node, NodeConfig, NodeError};
use std::collections::{HashMap, HashSet};
use std::net::{Ipv6Addr, SocketAddr};
use tracing::{debug, trace};
use trellis_core::{pop_tag, push_tag, EtherType, Ip6Header, Message, DEFAULT_PADDING};
use trellis_net::KeyPair;

/// Port every simulated node listens on
pub const SIM_PORT: u16 = 7000;

/// Delivery rounds before `deliver` gives up on a chatty network
const MAX_ROUNDS: usize = 1_000;

/// Nodes, the wires between them and a shared clock
pub struct SimNetwork {
    nodes: Vec<Node>,
    addrs: Vec<SocketAddr>,
    by_addr: HashMap<SocketAddr, usize>,
    wires: HashSet<(usize, usize)>,
    received: Vec<Vec<Vec<u8>>>,
    now_ms: u64,
    frames_delivered: u64,
    frames_lost: u64,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            addrs: Vec::new(),
            by_addr: HashMap::new(),
            wires: HashSet::new(),
            received: Vec::new(),
            now_ms: 0,
            frames_delivered: 0,
            frames_lost: 0,
        }
    }

    /// Add a node with a seed derived from its index, at `10.0.0.<n>:7000`.
    pub fn add_node(&mut self, config: NodeConfig) -> Result<usize, NodeError> {
        let n = u8::try_from(self.nodes.len() + 1).unwrap_or(u8::MAX);
        self.add_node_with(KeyPair::from_seed(&[n; 32]), config)
    }

    pub fn add_node_with(&mut self, keypair: KeyPair, config: NodeConfig) -> Result<usize, NodeError> {
        let index = self.nodes.len();
        let n = u8::try_from(index + 1).unwrap_or(u8::MAX);
        let addr = SocketAddr::from(([10, 0, 0, n], SIM_PORT));
        let node = Node::new(keypair, config)?;
        debug!("sim node {} is {} at {}", index, node.key(), addr);

        self.nodes.push(node);
        self.addrs.push(addr);
        self.by_addr.insert(addr, index);
        self.received.push(Vec::new());
        Ok(index)
    }

    pub fn node(&self, index: usize) -> &Node {
        &self.nodes[index]
    }

    pub fn node_mut(&mut self, index: usize) -> &mut Node {
        &mut self.nodes[index]
    }

    pub fn addr(&self, index: usize) -> SocketAddr {
        self.addrs[index]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    pub fn frames_delivered(&self) -> u64 {
        self.frames_delivered
    }

    pub fn frames_lost(&self) -> u64 {
        self.frames_lost
    }

    pub fn start(&mut self, index: usize) {
        let now = self.now_ms;
        self.nodes[index].start(now);
        self.deliver();
    }

    pub fn start_all(&mut self) {
        for index in 0..self.nodes.len() {
            self.start(index);
        }
    }

    /// Lay a wire between two nodes
    pub fn connect(&mut self, a: usize, b: usize) {
        self.wires.insert((a, b));
        self.wires.insert((b, a));
    }

    pub fn disconnect(&mut self, a: usize, b: usize) {
        self.wires.remove(&(a, b));
        self.wires.remove(&(b, a));
    }

    /// Make two nodes beacon each other
    pub fn link(&mut self, a: usize, b: usize) -> Result<(), NodeError> {
        let now = self.now_ms;
        let (addr_a, addr_b) = (self.addrs[a], self.addrs[b]);
        self.nodes[a].add_peer(addr_b, now)?;
        self.nodes[b].add_peer(addr_a, now)?;
        self.deliver();
        Ok(())
    }

    /// Move every queued frame until the network is quiet.
    /// Returns the number of frames handed to a node.
    pub fn deliver(&mut self) -> usize {
        let mut delivered = 0;
        for _ in 0..MAX_ROUNDS {
            let mut in_flight = Vec::new();
            for (from, node) in self.nodes.iter_mut().enumerate() {
                for (to, frame) in node.take_outbox() {
                    in_flight.push((from, to, frame));
                }
            }
            self.collect_device_output();
            if in_flight.is_empty() {
                return delivered;
            }

            let now = self.now_ms;
            for (from, to_addr, frame) in in_flight {
                let to = match self.by_addr.get(&to_addr) {
                    Some(&to) if self.wires.contains(&(from, to)) => to,
                    _ => {
                        trace!("sim: {} -> {} lost", self.addrs[from], to_addr);
                        self.frames_lost += 1;
                        continue;
                    }
                };
                delivered += 1;
                self.frames_delivered += 1;
                let from_addr = self.addrs[from];
                if let Err(e) = self.nodes[to].handle_frame(from_addr, frame, now) {
                    trace!("sim: node {} dropped frame: {}", to, e);
                }
            }
        }
        debug!("sim: network still busy after {} rounds", MAX_ROUNDS);
        delivered
    }

    /// Advance the clock one millisecond at a time, ticking every node.
    pub fn advance(&mut self, ms: u64) {
        for _ in 0..ms {
            self.now_ms += 1;
            let now = self.now_ms;
            for node in &mut self.nodes {
                node.tick(now);
            }
            self.deliver();
        }
    }

    /// Send `payload` from one node's device to another's mesh address.
    pub fn send_packet(&mut self, from: usize, to: usize, payload: &[u8]) -> Result<(), NodeError> {
        let source = self.nodes[from].address();
        self.send_packet_from(from, source, to, payload)
    }

    /// Like `send_packet`, with the IPv6 source chosen by the caller
    pub fn send_packet_from(
        &mut self,
        from: usize,
        source: Ipv6Addr,
        to: usize,
        payload: &[u8],
    ) -> Result<(), NodeError> {
        let dest = self.nodes[to].address();
        let mut msg = Message::from_payload(payload, DEFAULT_PADDING);
        Ip6Header::craft(&mut msg, source, dest)?;
        push_tag(&mut msg, EtherType::Ip6)?;

        let now = self.now_ms;
        let result = self.nodes[from].send_from_device(msg.as_slice(), now);
        self.deliver();
        result
    }

    /// Drain the tagged packets node `index` wrote to its device
    pub fn take_received(&mut self, index: usize) -> Vec<Vec<u8>> {
        self.collect_device_output();
        std::mem::take(&mut self.received[index])
    }

    /// Drain received IPv6 payloads, without tag and header
    pub fn take_payloads(&mut self, index: usize) -> Vec<Vec<u8>> {
        self.take_received(index)
            .into_iter()
            .filter_map(|packet| {
                let mut msg = Message::from_payload(&packet, 0);
                match pop_tag(&mut msg) {
                    Ok(EtherType::Ip6) => {}
                    _ => return None,
                }
                Ip6Header::parse(msg.as_slice()).ok()?;
                Some(msg.as_slice()[Ip6Header::SIZE..].to_vec())
            })
            .collect()
    }

    /// Link `a` and `b` under a supervisor and run the clock until the pair
    /// converges or `deadline_ms` passes. Returns the time it took.
    pub fn converge(&mut self, a: usize, b: usize, deadline_ms: u64) -> trellis_core::Result<u64> {
        let start = self.now_ms;
        let mut supervisor = LinkSupervisor::new(start, deadline_ms, 2);
        loop {
            match supervisor.check(self.now_ms, &self.nodes[a], &self.nodes[b])? {
                Step::Link => {
                    if let Err(e) = self.link(a, b) {
                        debug!("sim: linking {} and {} failed: {}", a, b, e);
                    }
                }
                Step::Pending => self.advance(1),
                Step::Converged => return Ok(self.now_ms - start),
            }
        }
    }

    fn collect_device_output(&mut self) {
        for (index, node) in self.nodes.iter_mut().enumerate() {
            self.received[index].extend(node.take_device_output());
        }
    }
}

impl Default for SimNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unconnected_frames_are_lost() {
        let mut sim = SimNetwork::new();
        sim.add_node(NodeConfig::default()).unwrap();
        sim.add_node(NodeConfig::default()).unwrap();
        sim.start_all();
        sim.link(0, 1).unwrap();

        assert_eq!(sim.frames_delivered(), 0);
        assert_eq!(sim.frames_lost(), 2);
        assert_eq!(sim.node(0).node_count(), 1);
    }

    #[test]
    fn test_addresses() {
        let mut sim = SimNetwork::new();
        let a = sim.add_node(NodeConfig::default()).unwrap();
        assert_eq!(sim.addr(a), "10.0.0.1:7000".parse().unwrap());
        assert_eq!(sim.node(a).key(), KeyPair::from_seed(&[1; 32]).node_key());
    }
}
