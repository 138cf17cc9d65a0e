//! Trellis Core Library
//!
//! This crate provides the types every stage of the Trellis mesh node
//! shares.
//!
//! # Modules
//!
//! - [`message`]: Message buffer with a movable read window
//! - [`ethertype`]: 2-byte protocol tag framing
//! - [`headers`]: IPv4/IPv6 header layouts
//! - [`types`]: Node identity, mesh addresses and link labels
//! - [`canonical`]: Deterministic serialization for signing
//! - [`error`]: Error taxonomy

pub mod canonical;
pub mod error;
pub mod ethertype;
pub mod headers;
pub mod message;
pub mod types;

#[cfg(test)]
mod test_vectors;

pub use error::{Error, Result};
pub use ethertype::{pop_tag, push_tag, EtherType};
pub use headers::{Ip4Header, Ip6Header};
pub use message::{Message, DEFAULT_PADDING};
pub use types::{address_for_key, Label, NodeKey, ADDRESS_PREFIX};
