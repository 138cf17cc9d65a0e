//! Fixed IPv4 and IPv6 header layouts
//!
//! The node only reads addresses and the hop limit; everything else is
//! carried through untouched.

use crate::error::{Error, Result};
use crate::message::Message;
use std::net::{Ipv4Addr, Ipv6Addr};

/// "No Next Header", used for crafted packets that carry raw bytes
pub const IP6_NO_NEXT_HEADER: u8 = 59;

/// UDP protocol number
pub const IP_PROTO_UDP: u8 = 17;

/// Default hop limit for crafted packets
pub const DEFAULT_HOP_LIMIT: u8 = 64;

/// IPv6 fixed header
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ip6Header {
    pub payload_len: u16,
    pub next_header: u8,
    pub hop_limit: u8,
    pub source: Ipv6Addr,
    pub dest: Ipv6Addr,
}

impl Ip6Header {
    pub const SIZE: usize = 40;
    pub const SOURCE_OFFSET: usize = 8;
    pub const DEST_OFFSET: usize = 24;
    pub const HOP_LIMIT_OFFSET: usize = 7;

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::MalformedFrame {
                needed: Self::SIZE,
                got: bytes.len(),
            });
        }
        if bytes[0] >> 4 != 6 {
            return Err(Error::InvalidProtocol(u16::from(bytes[0] >> 4)));
        }
        Ok(Self {
            payload_len: u16::from_be_bytes([bytes[4], bytes[5]]),
            next_header: bytes[6],
            hop_limit: bytes[Self::HOP_LIMIT_OFFSET],
            source: Ipv6Addr::from(read16(bytes, Self::SOURCE_OFFSET)),
            dest: Ipv6Addr::from(read16(bytes, Self::DEST_OFFSET)),
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0] = 6 << 4;
        out[4..6].copy_from_slice(&self.payload_len.to_be_bytes());
        out[6] = self.next_header;
        out[7] = self.hop_limit;
        out[8..24].copy_from_slice(&self.source.octets());
        out[24..40].copy_from_slice(&self.dest.octets());
        out
    }

    /// Prepend an IPv6 header sized for the current contents of `msg`.
    pub fn craft(msg: &mut Message, source: Ipv6Addr, dest: Ipv6Addr) -> Result<()> {
        let payload_len = u16::try_from(msg.len()).map_err(|_| Error::MalformedFrame {
            needed: usize::from(u16::MAX),
            got: msg.len(),
        })?;
        let header = Self {
            payload_len,
            next_header: IP6_NO_NEXT_HEADER,
            hop_limit: DEFAULT_HOP_LIMIT,
            source,
            dest,
        };
        msg.push(&header.to_bytes())
    }

    /// Destination address of a raw IPv6 packet.
    pub fn dest_of(packet: &[u8]) -> Result<Ipv6Addr> {
        Ok(Self::parse(packet)?.dest)
    }

    /// Decrement the hop limit in place, returning the new value.
    pub fn decrement_hop_limit(packet: &mut [u8]) -> Result<u8> {
        if packet.len() < Self::SIZE {
            return Err(Error::MalformedFrame {
                needed: Self::SIZE,
                got: packet.len(),
            });
        }
        let hops = packet[Self::HOP_LIMIT_OFFSET].saturating_sub(1);
        packet[Self::HOP_LIMIT_OFFSET] = hops;
        Ok(hops)
    }
}

/// IPv4 header without options
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ip4Header {
    pub total_len: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub source: Ipv4Addr,
    pub dest: Ipv4Addr,
}

impl Ip4Header {
    pub const SIZE: usize = 20;
    pub const SOURCE_OFFSET: usize = 12;
    pub const DEST_OFFSET: usize = 16;

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::MalformedFrame {
                needed: Self::SIZE,
                got: bytes.len(),
            });
        }
        if bytes[0] >> 4 != 4 {
            return Err(Error::InvalidProtocol(u16::from(bytes[0] >> 4)));
        }
        Ok(Self {
            total_len: u16::from_be_bytes([bytes[2], bytes[3]]),
            ttl: bytes[8],
            protocol: bytes[9],
            source: Ipv4Addr::new(bytes[12], bytes[13], bytes[14], bytes[15]),
            dest: Ipv4Addr::new(bytes[16], bytes[17], bytes[18], bytes[19]),
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0] = 0x45;
        out[2..4].copy_from_slice(&self.total_len.to_be_bytes());
        out[8] = self.ttl;
        out[9] = self.protocol;
        out[12..16].copy_from_slice(&self.source.octets());
        out[16..20].copy_from_slice(&self.dest.octets());
        let checksum = checksum(&out);
        out[10..12].copy_from_slice(&checksum.to_be_bytes());
        out
    }

    /// Prepend an IPv4 header covering the current contents of `msg`.
    pub fn craft(msg: &mut Message, protocol: u8, source: Ipv4Addr, dest: Ipv4Addr) -> Result<()> {
        let total = msg.len() + Self::SIZE;
        let total_len = u16::try_from(total).map_err(|_| Error::MalformedFrame {
            needed: usize::from(u16::MAX),
            got: total,
        })?;
        let header = Self {
            total_len,
            ttl: DEFAULT_HOP_LIMIT,
            protocol,
            source,
            dest,
        };
        msg.push(&header.to_bytes())
    }
}

/// RFC 1071 ones' complement checksum over a header with a zeroed checksum field.
fn checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = header
        .chunks(2)
        .map(|c| u32::from(u16::from_be_bytes([c[0], *c.get(1).unwrap_or(&0)])))
        .sum();
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn read16(bytes: &[u8], offset: usize) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&bytes[offset..offset + 16]);
    out
}
