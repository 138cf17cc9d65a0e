//! In-pipeline routing header
//!
//! Stages between the router and the wire carry their metadata in front of
//! the payload instead of in a side channel. Layout (`SIZE` bytes):
//!
//! | off | len | field                                      |
//! |-----|-----|--------------------------------------------|
//! | 0   | 32  | peer key (next hop outbound, sender inbound) |
//! | 32  | 16  | peer IP (v4 addresses mapped into v6)      |
//! | 48  | 2   | peer port, big-endian                      |
//! | 50  | 1   | flags                                      |
//! | 51  | 1   | frame type                                 |

use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use trellis_core::{Message, NodeKey, Result};

const FLAG_HAS_ADDR: u8 = 0x01;
const FLAG_IPV4: u8 = 0x02;

/// Routing metadata carried between pipeline stages
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RouteHeader {
    pub key: NodeKey,
    pub addr: Option<SocketAddr>,
    pub frame_type: u8,
}

impl RouteHeader {
    pub const SIZE: usize = 52;

    /// Header naming only a peer key
    pub fn for_peer(key: NodeKey) -> Self {
        Self {
            key,
            addr: None,
            frame_type: 0,
        }
    }

    /// Header for a frame that arrived from `addr`
    pub fn from_wire(addr: SocketAddr, frame_type: u8) -> Self {
        Self {
            key: NodeKey([0; 32]),
            addr: Some(addr),
            frame_type,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..32].copy_from_slice(self.key.as_bytes());
        let mut flags = 0u8;
        if let Some(addr) = self.addr {
            flags |= FLAG_HAS_ADDR;
            let ip = match addr.ip() {
                IpAddr::V4(v4) => {
                    flags |= FLAG_IPV4;
                    v4.to_ipv6_mapped()
                }
                IpAddr::V6(v6) => v6,
            };
            out[32..48].copy_from_slice(&ip.octets());
            out[48..50].copy_from_slice(&addr.port().to_be_bytes());
        }
        out[50] = flags;
        out[51] = self.frame_type;
        out
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes[..32]);
        let flags = bytes[50];
        let addr = (flags & FLAG_HAS_ADDR != 0).then(|| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&bytes[32..48]);
            let v6 = Ipv6Addr::from(octets);
            let ip = match v6.to_ipv4_mapped() {
                Some(v4) if flags & FLAG_IPV4 != 0 => IpAddr::V4(v4),
                _ => IpAddr::V6(v6),
            };
            SocketAddr::new(ip, u16::from_be_bytes([bytes[48], bytes[49]]))
        });
        Self {
            key: NodeKey(key),
            addr,
            frame_type: bytes[51],
        }
    }

    /// Prepend this header to `msg`.
    pub fn push(&self, msg: &mut Message) -> Result<()> {
        msg.push(&self.to_bytes())
    }

    /// Strip the header from the front of `msg`.
    pub fn pop(msg: &mut Message) -> Result<Self> {
        msg.require(Self::SIZE)?;
        Ok(Self::from_bytes(&msg.pop_array::<{ RouteHeader::SIZE }>()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::Error;

    #[test]
    fn test_push_pop_v4() {
        let addr: SocketAddr = "10.0.0.7:7000".parse().unwrap();
        let header = RouteHeader::from_wire(addr, 4);
        let mut msg = Message::from_payload(b"payload", 64);
        header.push(&mut msg).unwrap();
        assert_eq!(msg.len(), RouteHeader::SIZE + 7);

        let popped = RouteHeader::pop(&mut msg).unwrap();
        assert_eq!(popped, header);
        assert_eq!(popped.addr, Some(addr));
        assert_eq!(msg.as_slice(), b"payload");
    }

    #[test]
    fn test_v6_and_no_addr() {
        let addr: SocketAddr = "[fc00::1]:9".parse().unwrap();
        let header = RouteHeader {
            key: NodeKey([7; 32]),
            addr: Some(addr),
            frame_type: 2,
        };
        assert_eq!(RouteHeader::from_bytes(&header.to_bytes()), header);

        let bare = RouteHeader::for_peer(NodeKey([1; 32]));
        assert_eq!(RouteHeader::from_bytes(&bare.to_bytes()).addr, None);
    }

    #[test]
    fn test_short_message_is_malformed() {
        let mut msg = Message::from_payload(&[0u8; 10], 0);
        assert!(matches!(
            RouteHeader::pop(&mut msg),
            Err(Error::MalformedFrame { needed: 52, got: 10 })
        ));
    }
}
