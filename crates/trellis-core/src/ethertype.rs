//! Protocol tag framing
//!
//! Buffers exchanged with the virtual device carry a 2-byte big-endian tag in
//! front of the IP packet naming the payload protocol, the way a link-layer
//! ethertype does.

use crate::error::Result;
use crate::message::Message;
use std::fmt;

/// Width of the tag on the wire
pub const TAG_SIZE: usize = 2;

/// Tag value for IPv4 payloads
pub const ETHERTYPE_IP4: u16 = 0x0800;

/// Tag value for IPv6 payloads
pub const ETHERTYPE_IP6: u16 = 0x86DD;

/// Payload protocol named by a frame tag
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EtherType {
    Ip4,
    Ip6,
    /// Any other value, kept so the caller can log and drop it
    Unknown(u16),
}

impl EtherType {
    pub fn from_u16(value: u16) -> Self {
        match value {
            ETHERTYPE_IP4 => Self::Ip4,
            ETHERTYPE_IP6 => Self::Ip6,
            other => Self::Unknown(other),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Self::Ip4 => ETHERTYPE_IP4,
            Self::Ip6 => ETHERTYPE_IP6,
            Self::Unknown(other) => other,
        }
    }

    /// Tag matching the version nibble of a raw IP packet.
    pub fn for_packet(packet: &[u8]) -> Self {
        match packet.first().map(|b| b >> 4) {
            Some(4) => Self::Ip4,
            Some(6) => Self::Ip6,
            _ => Self::Unknown(0),
        }
    }
}

impl fmt::Display for EtherType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip4 => write!(f, "ipv4"),
            Self::Ip6 => write!(f, "ipv6"),
            Self::Unknown(v) => write!(f, "unknown({:#06x})", v),
        }
    }
}

/// Prepend the tag to `msg`.
pub fn push_tag(msg: &mut Message, tag: EtherType) -> Result<()> {
    msg.push_u16_be(tag.to_u16())
}

/// Remove and return the tag at the front of `msg`.
pub fn pop_tag(msg: &mut Message) -> Result<EtherType> {
    msg.require(TAG_SIZE)?;
    Ok(EtherType::from_u16(msg.pop_u16_be()?))
}
