//! Fixed vectors for the wire constants and address derivation
//!
//! These pin bytes other implementations must reproduce exactly.

use crate::ethertype::{push_tag, EtherType};
use crate::message::Message;
use crate::types::address_for_key;
use serde::Serialize;

/// Test vector output format (JSON serializable)
#[derive(Serialize)]
pub struct TestVector {
    pub name: String,
    pub description: String,
    pub input_hex: String,
    pub output_hex: String,
}

/// Generate all test vectors
pub fn generate_test_vectors() -> Vec<TestVector> {
    vec![
        address_vector("address_zero_key", [0u8; 32]),
        address_vector("address_counting_key", counting_key()),
        tag_vector("tag_ip6", EtherType::Ip6),
        tag_vector("tag_ip4", EtherType::Ip4),
    ]
}

fn counting_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    for (i, b) in key.iter_mut().enumerate() {
        *b = i as u8;
    }
    key
}

fn address_vector(name: &str, key: [u8; 32]) -> TestVector {
    TestVector {
        name: name.into(),
        description: "address = SHA512(SHA512(key))[..16]".into(),
        input_hex: hex::encode(key),
        output_hex: hex::encode(address_for_key(&key).octets()),
    }
}

fn tag_vector(name: &str, tag: EtherType) -> TestVector {
    let mut msg = Message::from_payload(b"x", 2);
    push_tag(&mut msg, tag).unwrap();
    TestVector {
        name: name.into(),
        description: "2-byte big-endian tag prepended to payload \"x\"".into(),
        input_hex: hex::encode(b"x"),
        output_hex: hex::encode(msg.as_slice()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Label, NodeKey};

    #[test]
    fn test_address_vectors() {
        assert_eq!(
            hex::encode(address_for_key(&[0u8; 32]).octets()),
            "6d78a62a9362b617001acb6d280ad5ba"
        );
        assert_eq!(
            hex::encode(NodeKey(counting_key()).address().octets()),
            "572b248e700450517708c76f6e73b3a4"
        );
    }

    #[test]
    fn test_tag_vectors() {
        let vectors = generate_test_vectors();
        let ip6 = vectors.iter().find(|v| v.name == "tag_ip6").unwrap();
        assert_eq!(ip6.output_hex, "86dd78");
        let ip4 = vectors.iter().find(|v| v.name == "tag_ip4").unwrap();
        assert_eq!(ip4.output_hex, "080078");
    }

    #[test]
    fn test_vectors_serialize() {
        let json = serde_json::to_string_pretty(&generate_test_vectors()).unwrap();
        assert!(json.contains("address_zero_key"));
        assert_eq!(Label(0x13).to_string(), "0000.0000.0000.0013");
    }
}
