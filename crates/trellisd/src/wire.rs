//! Session and wire stages
//!
//! The session stage turns routed plaintext into session frames and back.
//! The wire stage is the far end of the chain: whatever reaches it lands in
//! the node outbox with the address from its route header.

use crate::node::NodeCore;
use tracing::trace;
use trellis_core::{Error, Message, Result, DEFAULT_PADDING};
use trellis_net::{Disposition, Frame, FrameType, Outbound, RouteHeader, Stage};

/// Session stage port facing the router
pub const ROUTER_PORT: usize = 0;
/// Session stage port facing the wire
pub const WIRE_PORT: usize = 1;

/// Encrypts toward the wire, decrypts toward the router
#[derive(Debug, Default)]
pub struct SessionStage;

impl SessionStage {
    fn seal(&self, ctx: &mut NodeCore, mut msg: Message) -> Result<Disposition> {
        let header = RouteHeader::pop(&mut msg)?;
        let now_ms = ctx.now_ms;
        let frames = ctx.sessions.send(&header.key, msg.as_slice(), now_ms)?;
        if frames.is_empty() {
            trace!("payload for {} queued until the session is up", header.key);
        }
        to_wire(frames)
    }

    fn open(&self, ctx: &mut NodeCore, mut msg: Message) -> Result<Disposition> {
        let header = RouteHeader::pop(&mut msg)?;
        let from = header.addr.ok_or(Error::MalformedFrame {
            needed: RouteHeader::SIZE,
            got: 0,
        })?;
        let frame_type = FrameType::try_from(header.frame_type)
            .map_err(|_| Error::InvalidProtocol(u16::from(header.frame_type)))?;

        let now_ms = ctx.now_ms;
        let received = ctx
            .sessions
            .receive(from, &Frame::new(frame_type, msg.into_vec()), now_ms)?;

        let mut out = match to_wire(received.replies)? {
            Disposition::Fanout(batch) => batch,
            _ => Vec::new(),
        };
        if let Some((peer, plaintext)) = received.delivered {
            ctx.peers.upsert(peer, from, now_ms);
            let mut up = Message::from_payload(&plaintext, DEFAULT_PADDING);
            RouteHeader::for_peer(peer).push(&mut up)?;
            out.push((ROUTER_PORT, up));
        }

        Ok(if out.is_empty() {
            Disposition::Consumed
        } else {
            Disposition::Fanout(out)
        })
    }
}

/// Frames for the wire stage, each carrying its destination in a route header
fn to_wire(frames: Vec<Outbound>) -> Result<Disposition> {
    if frames.is_empty() {
        return Ok(Disposition::Consumed);
    }
    let mut batch = Vec::with_capacity(frames.len());
    for out in frames {
        let mut msg = Message::from_payload(&out.frame.payload, RouteHeader::SIZE);
        RouteHeader {
            key: out.peer,
            addr: Some(out.addr),
            frame_type: out.frame.frame_type as u8,
        }
        .push(&mut msg)?;
        batch.push((WIRE_PORT, msg));
    }
    Ok(Disposition::Fanout(batch))
}

impl Stage<NodeCore> for SessionStage {
    fn name(&self) -> &'static str {
        "session"
    }

    fn receive(&mut self, ctx: &mut NodeCore, port: usize, msg: Message) -> Result<Disposition> {
        match port {
            ROUTER_PORT => self.seal(ctx, msg),
            _ => self.open(ctx, msg),
        }
    }
}

/// Hands frames to the node outbox
#[derive(Debug, Default)]
pub struct TransportEndpoint;

impl Stage<NodeCore> for TransportEndpoint {
    fn name(&self) -> &'static str {
        "wire"
    }

    fn port_count(&self) -> usize {
        1
    }

    fn receive(&mut self, ctx: &mut NodeCore, _port: usize, mut msg: Message) -> Result<Disposition> {
        let header = RouteHeader::pop(&mut msg)?;
        let addr = header.addr.ok_or(Error::MalformedFrame {
            needed: RouteHeader::SIZE,
            got: 0,
        })?;
        let frame_type = FrameType::try_from(header.frame_type)
            .map_err(|_| Error::InvalidProtocol(u16::from(header.frame_type)))?;
        ctx.queue_frame(addr, Frame::new(frame_type, msg.into_vec()));
        Ok(Disposition::Consumed)
    }
}
