//! Canonical encoding for signed and hashed objects
//!
//! Beacons and handshake messages are signed over postcard bytes of their
//! unsigned fields. Field order is Rust struct field order.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Domain prefix for beacon signatures
pub const DOMAIN_BEACON: &[u8] = b"trellis-beacon-v1";
/// Domain prefix for handshake Hello signatures
pub const DOMAIN_HELLO: &[u8] = b"trellis-hello-v1";
/// Domain prefix for handshake Key signatures
pub const DOMAIN_KEY: &[u8] = b"trellis-key-v1";

/// Serialize a value to canonical bytes using postcard.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(Error::from)
}

/// Decode a value produced by [`canonical_bytes`].
pub fn from_canonical_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    postcard::from_bytes(bytes).map_err(Error::from)
}

/// Bytes a signature covers: `domain || canonical_bytes(value)`.
pub fn signing_bytes<T: Serialize>(domain: &[u8], value: &T) -> Result<Vec<u8>> {
    let body = canonical_bytes(value)?;
    let mut out = Vec::with_capacity(domain.len() + body.len());
    out.extend_from_slice(domain);
    out.extend_from_slice(&body);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeKey;

    #[derive(Serialize, serde::Deserialize, Debug, PartialEq)]
    struct Sample {
        version: u32,
        key: NodeKey,
    }

    #[test]
    fn test_canonical_bytes_deterministic() {
        let sample = Sample {
            version: 1,
            key: NodeKey([3; 32]),
        };
        let bytes1 = canonical_bytes(&sample).unwrap();
        let bytes2 = canonical_bytes(&sample).unwrap();
        assert_eq!(bytes1, bytes2);
        assert_eq!(from_canonical_bytes::<Sample>(&bytes1).unwrap(), sample);
    }

    #[test]
    fn test_signing_bytes_are_domain_separated() {
        let sample = Sample {
            version: 1,
            key: NodeKey([3; 32]),
        };
        let beacon = signing_bytes(DOMAIN_BEACON, &sample).unwrap();
        let hello = signing_bytes(DOMAIN_HELLO, &sample).unwrap();
        assert_ne!(beacon, hello);
        assert!(beacon.starts_with(DOMAIN_BEACON));
    }

    #[test]
    fn test_truncated_bytes_fail() {
        let sample = Sample {
            version: 1,
            key: NodeKey([3; 32]),
        };
        let bytes = canonical_bytes(&sample).unwrap();
        assert!(from_canonical_bytes::<Sample>(&bytes[..bytes.len() - 1]).is_err());
    }
}
