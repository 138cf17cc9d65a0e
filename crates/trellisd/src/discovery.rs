//! Beacon discovery
//!
//! Every node periodically sends a signed beacon to its configured peer
//! addresses. Hearing a beacon from an unknown identity creates a peer record
//! and starts a handshake; hearing it again only refreshes the record.

use crate::node::NodeCore;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tracing::{debug, info};
use trellis_core::canonical::{canonical_bytes, from_canonical_bytes, signing_bytes, DOMAIN_BEACON};
use trellis_core::{Error, NodeKey, Result};
use trellis_net::{Frame, FrameType, KeyPair, SessionState};

/// Beacon format version
pub const BEACON_VERSION: u32 = 1;

/// Signed self-announcement
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beacon {
    pub version: u32,
    pub key: NodeKey,
    pub timestamp_ms: u64,
    pub signature: Vec<u8>,
}

impl Beacon {
    /// Create and sign a beacon for `keypair`
    pub fn new(keypair: &KeyPair, timestamp_ms: u64) -> Result<Self> {
        let key = keypair.node_key();
        let signed = signing_bytes(DOMAIN_BEACON, &(BEACON_VERSION, key, timestamp_ms))?;
        Ok(Self {
            version: BEACON_VERSION,
            key,
            timestamp_ms,
            signature: keypair.sign(&signed).to_vec(),
        })
    }

    /// Check the version and the signature against the claimed key
    pub fn verify(&self) -> Result<()> {
        if self.version != BEACON_VERSION {
            return Err(Error::InvalidProtocol(
                u16::try_from(self.version).unwrap_or(u16::MAX),
            ));
        }
        let signed = signing_bytes(DOMAIN_BEACON, &(self.version, self.key, self.timestamp_ms))?;
        KeyPair::verify(self.key.as_bytes(), &signed, &self.signature)
            .map_err(|e| Error::HandshakeFailure(format!("beacon from {}: {}", self.key, e)))
    }

    pub fn to_frame(&self) -> Result<Frame> {
        Ok(Frame::new(FrameType::Beacon, canonical_bytes(self)?))
    }

    pub fn from_frame(frame: &Frame) -> Result<Self> {
        if frame.frame_type != FrameType::Beacon {
            return Err(Error::InvalidProtocol(frame.frame_type as u16));
        }
        from_canonical_bytes(&frame.payload)
    }
}

/// What a received beacon did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BeaconOutcome {
    /// Our own beacon came back
    Own,
    /// First beacon from this identity
    NewPeer { handshake: bool },
    /// Known identity
    Refreshed { handshake: bool },
}

/// Verify a beacon and update peer and session state.
pub(crate) fn handle_beacon(
    core: &mut NodeCore,
    from: SocketAddr,
    frame: &Frame,
    now_ms: u64,
) -> Result<BeaconOutcome> {
    let beacon = Beacon::from_frame(frame)?;
    beacon.verify()?;

    let key = beacon.key;
    if key == core.local {
        return Ok(BeaconOutcome::Own);
    }
    if let Some(record) = core.peers.get(&key) {
        if !record.is_fresh_beacon(beacon.timestamp_ms) {
            debug!(peer = %key, %from, timestamp = beacon.timestamp_ms, "stale beacon dropped");
            return Err(Error::Replay(beacon.timestamp_ms));
        }
    }

    // A handshake in flight or a live session owns its address
    let bound = |state: SessionState| matches!(state, SessionState::Handshaking | SessionState::Established);
    if let Some(owner) = core.peers.get_by_addr(&from).map(|r| r.key) {
        if owner != key && bound(core.sessions.state(&owner)) {
            return Err(Error::HandshakeFailure(format!(
                "beacon for {} from {}, the address of {}",
                key, from, owner
            )));
        }
    }
    core.stats.beacons_received += 1;

    let pinned = bound(core.sessions.state(&key)) && core.peers.get(&key).is_some();
    let created = if pinned {
        false
    } else {
        core.peers.upsert(key, from, now_ms)
    };
    if let Some(record) = core.peers.get_mut(&key) {
        record.touch(now_ms);
        record.beacons += 1;
        record.beacon_timestamp_ms = Some(beacon.timestamp_ms);
    }
    core.table.touch(&key, now_ms);

    // No-op while a handshake is running or the session is up
    let hello = core.sessions.initiate(key, from, now_ms)?;
    let handshake = hello.is_some();
    if let Some(out) = hello {
        core.queue_frame(out.addr, out.frame);
    }

    if created {
        info!("discovered peer {} at {}", key, from);
        Ok(BeaconOutcome::NewPeer { handshake })
    } else {
        debug!(peer = %key, %from, handshake, "beacon refreshed peer");
        Ok(BeaconOutcome::Refreshed { handshake })
    }
}
