//! Directly reachable peers and their link addresses

use std::collections::HashMap;
use std::net::SocketAddr;
use trellis_core::{Label, NodeKey};

/// First label handed to a discovered peer. `Label::SELF` is reserved.
const FIRST_PEER_LABEL: u64 = 0x13;

/// Information about a peer heard on the wire
#[derive(Clone, Debug)]
pub struct PeerRecord {
    /// Peer identity
    pub key: NodeKey,
    /// Last address a valid frame came from
    pub addr: SocketAddr,
    /// Link label assigned on discovery
    pub label: Label,
    /// When the peer was first heard (node clock, ms)
    pub first_seen_ms: u64,
    /// When the peer was last heard (node clock, ms)
    pub last_seen_ms: u64,
    /// Beacons received from this peer
    pub beacons: u64,
    /// Timestamp of the newest beacon accepted, on the peer's clock
    pub beacon_timestamp_ms: Option<u64>,
}

impl PeerRecord {
    /// Update last seen time
    pub fn touch(&mut self, now_ms: u64) {
        self.last_seen_ms = self.last_seen_ms.max(now_ms);
    }

    /// Whether a beacon stamped `timestamp_ms` is newer than every beacon
    /// accepted so far
    pub fn is_fresh_beacon(&self, timestamp_ms: u64) -> bool {
        self.beacon_timestamp_ms.map_or(true, |last| timestamp_ms > last)
    }
}

/// Peers keyed by identity, with an address index
#[derive(Debug)]
pub struct PeerTable {
    peers: HashMap<NodeKey, PeerRecord>,
    by_addr: HashMap<SocketAddr, NodeKey>,
    next_label: u64,
}

impl PeerTable {
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
            by_addr: HashMap::new(),
            next_label: FIRST_PEER_LABEL,
        }
    }

    /// Record that `key` was heard from `addr`. Returns `true` for a new peer.
    pub fn upsert(&mut self, key: NodeKey, addr: SocketAddr, now_ms: u64) -> bool {
        let known = match self.peers.get_mut(&key) {
            Some(record) => {
                if record.addr != addr {
                    self.by_addr.remove(&record.addr);
                    record.addr = addr;
                }
                record.touch(now_ms);
                true
            }
            None => false,
        };

        // An address can only belong to one identity
        if let Some(previous) = self.by_addr.insert(addr, key) {
            if previous != key {
                self.peers.remove(&previous);
            }
        }
        if known {
            return false;
        }

        let label = Label(self.next_label);
        self.next_label += 1;
        self.peers.insert(
            key,
            PeerRecord {
                key,
                addr,
                label,
                first_seen_ms: now_ms,
                last_seen_ms: now_ms,
                beacons: 0,
                beacon_timestamp_ms: None,
            },
        );
        true
    }

    pub fn get(&self, key: &NodeKey) -> Option<&PeerRecord> {
        self.peers.get(key)
    }

    pub fn get_mut(&mut self, key: &NodeKey) -> Option<&mut PeerRecord> {
        self.peers.get_mut(key)
    }

    pub fn get_by_addr(&self, addr: &SocketAddr) -> Option<&PeerRecord> {
        self.by_addr.get(addr).and_then(|key| self.peers.get(key))
    }

    pub fn remove(&mut self, key: &NodeKey) -> Option<PeerRecord> {
        let record = self.peers.remove(key)?;
        if self.by_addr.get(&record.addr) == Some(key) {
            self.by_addr.remove(&record.addr);
        }
        Some(record)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    #[test]
    fn test_upsert_assigns_labels() {
        let mut table = PeerTable::new();
        assert!(table.upsert(NodeKey([1; 32]), addr(1), 10));
        assert!(table.upsert(NodeKey([2; 32]), addr(2), 10));
        assert!(!table.upsert(NodeKey([1; 32]), addr(1), 20));

        let first = table.get(&NodeKey([1; 32])).unwrap();
        assert_eq!(first.label, Label(0x13));
        assert_eq!(first.first_seen_ms, 10);
        assert_eq!(first.last_seen_ms, 20);
        assert_eq!(table.get(&NodeKey([2; 32])).unwrap().label, Label(0x14));
    }

    #[test]
    fn test_address_change() {
        let mut table = PeerTable::new();
        let key = NodeKey([1; 32]);
        table.upsert(key, addr(1), 0);
        table.upsert(key, addr(9), 5);

        assert!(table.get_by_addr(&addr(1)).is_none());
        assert_eq!(table.get_by_addr(&addr(9)).unwrap().key, key);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_address_taken_over() {
        let mut table = PeerTable::new();
        table.upsert(NodeKey([1; 32]), addr(1), 0);
        table.upsert(NodeKey([2; 32]), addr(1), 0);

        assert_eq!(table.len(), 1);
        assert_eq!(table.get_by_addr(&addr(1)).unwrap().key, NodeKey([2; 32]));
    }

    #[test]
    fn test_beacon_freshness() {
        let mut table = PeerTable::new();
        let key = NodeKey([4; 32]);
        table.upsert(key, addr(4), 0);
        let record = table.get_mut(&key).unwrap();
        assert!(record.is_fresh_beacon(0));

        record.beacon_timestamp_ms = Some(100);
        assert!(!record.is_fresh_beacon(99));
        assert!(!record.is_fresh_beacon(100));
        assert!(record.is_fresh_beacon(101));
    }

    #[test]
    fn test_remove() {
        let mut table = PeerTable::new();
        let key = NodeKey([3; 32]);
        table.upsert(key, addr(3), 0);
        assert!(table.remove(&key).is_some());
        assert!(table.is_empty());
        assert!(table.get_by_addr(&addr(3)).is_none());
    }
}
