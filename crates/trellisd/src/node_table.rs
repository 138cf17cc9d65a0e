//! Known nodes and the route to each
//!
//! Entry zero is always the local node. Direct peers are recorded when their
//! session is confirmed; third parties arrive through announcements and are
//! reached through the direct peer that announced them.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::net::Ipv6Addr;
use tracing::debug;
use trellis_core::{Label, NodeKey};

/// Where a route was learned
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteSource {
    /// The local node itself
    Local,
    /// A confirmed session with the node
    Direct,
    /// Heard from a direct peer's announcement
    Announced,
}

/// How to reach a node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Route {
    /// Direct peer that packets are handed to
    pub next_hop: NodeKey,
    /// Link label of the next hop
    pub label: Label,
    /// Distance in links (0 = self, 1 = direct)
    pub hops: u8,
    pub source: RouteSource,
}

impl Route {
    pub fn direct(peer: NodeKey, label: Label) -> Self {
        Self {
            next_hop: peer,
            label,
            hops: 1,
            source: RouteSource::Direct,
        }
    }

    pub fn announced(via: NodeKey, label: Label, hops: u8) -> Self {
        Self {
            next_hop: via,
            label,
            hops,
            source: RouteSource::Announced,
        }
    }

    fn is_direct(&self) -> bool {
        self.source != RouteSource::Announced
    }
}

/// Tie-break between a new sighting and the current route
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum RoutePolicy {
    /// Direct routes always win; then fewer hops
    #[default]
    PreferDirect,
    /// Fewer hops win; direct breaks ties
    FewestHops,
}

/// What `record_sighting` did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sighting {
    Inserted,
    Refreshed,
    Replaced,
    Ignored,
}

/// One known node
#[derive(Clone, Debug)]
pub struct NodeEntry {
    pub key: NodeKey,
    pub address: Ipv6Addr,
    pub route: Route,
    pub first_seen_ms: u64,
    pub last_seen_ms: u64,
}

/// Per-node table of known nodes
#[derive(Debug)]
pub struct NodeTable {
    local: NodeKey,
    policy: RoutePolicy,
    entries: HashMap<NodeKey, NodeEntry>,
    by_address: HashMap<Ipv6Addr, NodeKey>,
}

impl NodeTable {
    pub fn new(local: NodeKey, policy: RoutePolicy, now_ms: u64) -> Self {
        let address = local.address();
        let entry = NodeEntry {
            key: local,
            address,
            route: Route {
                next_hop: local,
                label: Label::SELF,
                hops: 0,
                source: RouteSource::Local,
            },
            first_seen_ms: now_ms,
            last_seen_ms: now_ms,
        };
        Self {
            local,
            policy,
            entries: HashMap::from([(local, entry)]),
            by_address: HashMap::from([(address, local)]),
        }
    }

    pub fn local(&self) -> NodeKey {
        self.local
    }

    pub fn policy(&self) -> RoutePolicy {
        self.policy
    }

    /// Record that `key` is reachable over `route`.
    pub fn record_sighting(&mut self, key: NodeKey, route: Route, now_ms: u64) -> Sighting {
        if key == self.local {
            return Sighting::Ignored;
        }

        let Some(entry) = self.entries.get_mut(&key) else {
            let address = key.address();
            self.entries.insert(
                key,
                NodeEntry {
                    key,
                    address,
                    route,
                    first_seen_ms: now_ms,
                    last_seen_ms: now_ms,
                },
            );
            self.by_address.insert(address, key);
            debug!("node table: inserted {} via {} ({} hops)", key, route.next_hop, route.hops);
            return Sighting::Inserted;
        };

        // Same path reported again; take its current distance
        if entry.route.next_hop == route.next_hop && entry.route.source == route.source {
            entry.route = route;
            entry.last_seen_ms = entry.last_seen_ms.max(now_ms);
            return Sighting::Refreshed;
        }

        match compare(self.policy, &route, &entry.route) {
            Ordering::Less => {
                debug!(
                    "node table: {} now via {} ({} hops, was {} hops)",
                    key, route.next_hop, route.hops, entry.route.hops
                );
                entry.route = route;
                entry.last_seen_ms = entry.last_seen_ms.max(now_ms);
                Sighting::Replaced
            }
            Ordering::Equal => {
                entry.last_seen_ms = entry.last_seen_ms.max(now_ms);
                Sighting::Refreshed
            }
            Ordering::Greater => Sighting::Ignored,
        }
    }

    /// Refresh the freshness of an existing entry.
    pub fn touch(&mut self, key: &NodeKey, now_ms: u64) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.last_seen_ms = entry.last_seen_ms.max(now_ms);
                true
            }
            None => false,
        }
    }

    /// Known nodes, the local node included
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn lookup(&self, key: &NodeKey) -> Option<&NodeEntry> {
        self.entries.get(key)
    }

    pub fn lookup_by_address(&self, address: &Ipv6Addr) -> Option<&NodeEntry> {
        self.by_address.get(address).and_then(|key| self.entries.get(key))
    }

    pub fn direct_peers(&self) -> impl Iterator<Item = &NodeEntry> {
        self.entries
            .values()
            .filter(|e| e.route.source == RouteSource::Direct)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeEntry> {
        self.entries.values()
    }

    /// Entries worth telling `recipient` about, with our distance to each.
    ///
    /// Leaves out the local node, the recipient, and anything routed through
    /// the recipient.
    pub fn announceable(&self, recipient: &NodeKey) -> Vec<(NodeKey, u8)> {
        let mut out: Vec<_> = self
            .entries
            .values()
            .filter(|e| e.key != self.local && e.key != *recipient)
            .filter(|e| e.route.next_hop != *recipient)
            .map(|e| (e.key, e.route.hops))
            .collect();
        out.sort_by_key(|(key, hops)| (*hops, *key));
        out
    }

    /// Remove a node and every route that went through it.
    pub fn remove(&mut self, key: &NodeKey) -> Vec<NodeKey> {
        if *key == self.local || !self.entries.contains_key(key) {
            return Vec::new();
        }
        let mut removed = vec![*key];
        removed.extend(
            self.entries
                .values()
                .filter(|e| e.key != *key && e.route.next_hop == *key)
                .map(|e| e.key),
        );
        for gone in &removed {
            if let Some(entry) = self.entries.remove(gone) {
                self.by_address.remove(&entry.address);
            }
        }
        removed
    }

    /// Drop entries not seen within `ttl_ms`, except the local node and
    /// anything `pinned` returns true for. Routes through an evicted next hop
    /// go with it. Returns the evicted keys.
    pub fn evict_stale(
        &mut self,
        now_ms: u64,
        ttl_ms: u64,
        pinned: impl Fn(&NodeKey) -> bool,
    ) -> Vec<NodeKey> {
        let stale: Vec<NodeKey> = self
            .entries
            .values()
            .filter(|e| e.key != self.local)
            .filter(|e| now_ms.saturating_sub(e.last_seen_ms) > ttl_ms)
            .filter(|e| !pinned(&e.key))
            .map(|e| e.key)
            .collect();

        let mut evicted = Vec::new();
        for key in stale {
            for gone in self.remove(&key) {
                if !evicted.contains(&gone) {
                    evicted.push(gone);
                }
            }
        }
        if !evicted.is_empty() {
            debug!("node table: evicted {} stale entries", evicted.len());
        }
        evicted
    }
}

/// `Less` when `candidate` is the better route.
fn compare(policy: RoutePolicy, candidate: &Route, incumbent: &Route) -> Ordering {
    let direct = incumbent.is_direct().cmp(&candidate.is_direct());
    let hops = candidate.hops.cmp(&incumbent.hops);
    match policy {
        RoutePolicy::PreferDirect => direct.then(hops),
        RoutePolicy::FewestHops => hops.then(direct),
    }
}
