//! Router stage
//!
//! Sits between the tunnel adapter (port 0) and the session stage (port 1).
//! Outbound IPv6 packets are looked up by destination and handed to the
//! session of the next hop. Decrypted session payloads start with a one-byte
//! content type: packets for us go up to the device, packets for others are
//! forwarded, announcements update the node table.

use crate::node::NodeCore;
use crate::node_table::{NodeTable, Route, Sighting};
use serde::{Deserialize, Serialize};
use std::net::Ipv6Addr;
use tracing::{debug, trace};
use trellis_core::canonical::{canonical_bytes, from_canonical_bytes};
use trellis_core::{Error, Ip6Header, Message, NodeKey, Result, DEFAULT_PADDING};
use trellis_net::{Disposition, RouteHeader, Stage};

/// Router port facing the tunnel adapter
pub const TUN_PORT: usize = 0;
/// Router port facing the session stage
pub const SESSION_PORT: usize = 1;

/// Most nodes listed in one announcement
pub const MAX_ANNOUNCED_NODES: usize = 64;

/// Announced routes at or beyond this distance are ignored
pub const MAX_HOPS: u8 = 16;

/// First byte of every session payload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ContentType {
    Keepalive = 0,
    Packet = 1,
    Announce = 2,
}

impl TryFrom<u8> for ContentType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ContentType::Keepalive),
            1 => Ok(ContentType::Packet),
            2 => Ok(ContentType::Announce),
            other => Err(Error::InvalidProtocol(u16::from(other))),
        }
    }
}

/// One announced node and the sender's distance to it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnouncedNode {
    pub key: NodeKey,
    pub hops: u8,
}

/// Nodes a peer can reach
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub nodes: Vec<AnnouncedNode>,
}

/// Build the announcement for `recipient`, ready for the session stage.
pub fn announcement(table: &NodeTable, recipient: NodeKey) -> Result<Message> {
    let nodes = table
        .announceable(&recipient)
        .into_iter()
        .take(MAX_ANNOUNCED_NODES)
        .map(|(key, hops)| AnnouncedNode { key, hops })
        .collect();
    let body = canonical_bytes(&Announcement { nodes })?;

    let mut msg = Message::from_payload(&body, DEFAULT_PADDING);
    msg.push(&[ContentType::Announce as u8])?;
    RouteHeader::for_peer(recipient).push(&mut msg)?;
    Ok(msg)
}

/// Record the routes announced by `via`. Returns how many were new or better.
pub(crate) fn apply_announcement(core: &mut NodeCore, via: NodeKey, announcement: &Announcement) -> usize {
    let Some(label) = core.peers.get(&via).map(|p| p.label) else {
        debug!("announcement from unknown peer {} ignored", via);
        return 0;
    };
    let now_ms = core.now_ms;

    let mut learned = 0;
    for node in announcement.nodes.iter().take(MAX_ANNOUNCED_NODES) {
        if node.key == core.local || node.key == via || node.hops >= MAX_HOPS {
            continue;
        }
        let route = Route::announced(via, label, node.hops + 1);
        match core.table.record_sighting(node.key, route, now_ms) {
            Sighting::Inserted | Sighting::Replaced => learned += 1,
            Sighting::Refreshed | Sighting::Ignored => {}
        }
    }
    if learned > 0 {
        debug!(peer = %via, learned, "announcement updated routes");
        core.routes_changed = true;
    }
    learned
}

/// A peer may send packets from its own address, or from a node we route
/// through that peer.
fn source_matches(ctx: &NodeCore, source: Ipv6Addr, sender: NodeKey) -> bool {
    if source == sender.address() {
        return true;
    }
    ctx.table
        .lookup_by_address(&source)
        .is_some_and(|entry| entry.key != ctx.local && entry.route.next_hop == sender)
}

/// Routes packets by mesh address
#[derive(Debug, Default)]
pub struct Router;

impl Router {
    fn outbound(&self, ctx: &mut NodeCore, msg: Message) -> Result<Disposition> {
        let dest = Ip6Header::dest_of(msg.as_slice())?;
        if dest == ctx.address {
            trace!("looping packet for {} back to the device", dest);
            return Ok(Disposition::Forward(TUN_PORT, msg));
        }
        self.toward(ctx, dest, None, msg)
    }

    fn inbound(&self, ctx: &mut NodeCore, mut msg: Message) -> Result<Disposition> {
        let header = RouteHeader::pop(&mut msg)?;
        msg.require(1)?;
        let [content] = msg.pop_array::<1>()?;

        match ContentType::try_from(content)? {
            ContentType::Keepalive => Ok(Disposition::Consumed),
            ContentType::Packet => {
                let ip = Ip6Header::parse(msg.as_slice())?;
                if !source_matches(ctx, ip.source, header.key) {
                    ctx.stats.spoofed += 1;
                    debug!(peer = %header.key, source = %ip.source, dest = %ip.dest, "spoofed source dropped");
                    return Ok(Disposition::Consumed);
                }
                if ip.dest == ctx.address {
                    return Ok(Disposition::Forward(TUN_PORT, msg));
                }
                let hop_limit = Ip6Header::decrement_hop_limit(msg.as_mut_slice())?;
                if hop_limit == 0 {
                    debug!("hop limit exhausted for {} from {}", ip.dest, ip.source);
                    return Ok(Disposition::Consumed);
                }
                ctx.stats.packets_forwarded += 1;
                self.toward(ctx, ip.dest, Some(header.key), msg)
            }
            ContentType::Announce => {
                let announcement: Announcement = from_canonical_bytes(msg.as_slice())?;
                apply_announcement(ctx, header.key, &announcement);
                Ok(Disposition::Consumed)
            }
        }
    }

    /// Hand `msg` to the next hop for `dest`, never back to `arrived_from`.
    fn toward(
        &self,
        ctx: &mut NodeCore,
        dest: Ipv6Addr,
        arrived_from: Option<NodeKey>,
        mut msg: Message,
    ) -> Result<Disposition> {
        let entry = ctx.table.lookup_by_address(&dest).ok_or(Error::NoRoute(dest))?;
        let next_hop = entry.route.next_hop;
        if next_hop == ctx.local || Some(next_hop) == arrived_from {
            debug!("no onward route to {} (next hop {})", dest, next_hop);
            return Err(Error::NoRoute(dest));
        }

        msg.push(&[ContentType::Packet as u8])?;
        RouteHeader::for_peer(next_hop).push(&mut msg)?;
        trace!("routing packet for {} via {}", dest, next_hop);
        Ok(Disposition::Forward(SESSION_PORT, msg))
    }
}

impl Stage<NodeCore> for Router {
    fn name(&self) -> &'static str {
        "router"
    }

    fn receive(&mut self, ctx: &mut NodeCore, port: usize, msg: Message) -> Result<Disposition> {
        match port {
            TUN_PORT => self.outbound(ctx, msg),
            _ => self.inbound(ctx, msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_table::RoutePolicy;
    use trellis_core::Label;

    fn key(n: u8) -> NodeKey {
        NodeKey([n; 32])
    }

    #[test]
    fn test_content_type() {
        assert_eq!(ContentType::try_from(1).unwrap(), ContentType::Packet);
        assert_eq!(ContentType::try_from(2).unwrap(), ContentType::Announce);
        assert!(matches!(ContentType::try_from(7), Err(Error::InvalidProtocol(7))));
    }

    #[test]
    fn test_announcement_layout() {
        let mut table = NodeTable::new(key(0), RoutePolicy::PreferDirect, 0);
        table.record_sighting(key(1), Route::direct(key(1), Label(0x13)), 0);
        table.record_sighting(key(2), Route::direct(key(2), Label(0x14)), 0);

        let mut msg = announcement(&table, key(1)).unwrap();
        let header = RouteHeader::pop(&mut msg).unwrap();
        assert_eq!(header.key, key(1));
        assert_eq!(msg.pop_array::<1>().unwrap(), [ContentType::Announce as u8]);

        let decoded: Announcement = from_canonical_bytes(msg.as_slice()).unwrap();
        assert_eq!(decoded.nodes, vec![AnnouncedNode { key: key(2), hops: 1 }]);
    }

    #[test]
    fn test_announcement_is_capped() {
        let mut table = NodeTable::new(key(0), RoutePolicy::PreferDirect, 0);
        for n in 1..=100u8 {
            table.record_sighting(key(n), Route::announced(key(200), Label(0x13), 2), 0);
        }
        let mut msg = announcement(&table, key(201)).unwrap();
        RouteHeader::pop(&mut msg).unwrap();
        msg.pop_array::<1>().unwrap();
        let decoded: Announcement = from_canonical_bytes(msg.as_slice()).unwrap();
        assert_eq!(decoded.nodes.len(), MAX_ANNOUNCED_NODES);
    }
}
