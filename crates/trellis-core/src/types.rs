//! Identity and routing types
//!
//! A node is named by its 32-byte Ed25519 public key. Its mesh IPv6 address
//! is derived from that key, so an address can be checked against the key
//! that claims it.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::fmt;
use std::net::Ipv6Addr;

/// First byte of every mesh address
pub const ADDRESS_PREFIX: u8 = 0xfc;

/// Stable node identity (Ed25519 verifying key bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey(pub [u8; 32]);

impl NodeKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Mesh IPv6 address: first 16 bytes of SHA-512(SHA-512(key)).
    pub fn address(&self) -> Ipv6Addr {
        address_for_key(&self.0)
    }

    /// Whether the derived address falls inside `fc00::/8`.
    pub fn has_mesh_address(&self) -> bool {
        self.address().octets()[0] == ADDRESS_PREFIX
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeKey({})", self)
    }
}

/// Derive the mesh address for a raw public key.
pub fn address_for_key(key: &[u8; 32]) -> Ipv6Addr {
    let hash = Sha512::digest(Sha512::digest(key));
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&hash[..16]);
    Ipv6Addr::from(octets)
}

/// Link label naming the interface a direct peer is reached through.
///
/// Announced routes inherit the label of the next hop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Label(pub u64);

impl Label {
    /// Label of the local node
    pub const SELF: Label = Label(1);
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.0;
        write!(
            f,
            "{:04x}.{:04x}.{:04x}.{:04x}",
            (v >> 48) & 0xffff,
            (v >> 32) & 0xffff,
            (v >> 16) & 0xffff,
            v & 0xffff
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_display() {
        assert_eq!(Label(0x1d).to_string(), "0000.0000.0000.001d");
        assert_eq!(Label::SELF.to_string(), "0000.0000.0000.0001");
    }

    #[test]
    fn test_key_display_is_short_hex() {
        let key = NodeKey([0xab; 32]);
        assert_eq!(key.to_string(), "abababababababab");
        assert_eq!(format!("{:?}", key), "NodeKey(abababababababab)");
    }

    #[test]
    fn test_address_is_stable() {
        let key = NodeKey([7; 32]);
        assert_eq!(key.address(), key.address());
        assert_ne!(key.address(), NodeKey([8; 32]).address());
    }
}
