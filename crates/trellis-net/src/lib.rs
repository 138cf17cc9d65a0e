//! Trellis Networking Layer
//!
//! Packet pipeline, encrypted sessions and datagram transports.
//!
//! # Modules
//!
//! - [`iface`]: Stage/port pipeline that carries `Message`s
//! - [`route`]: Routing header carried between pipeline stages
//! - [`crypto`]: Identity keys, ECDH and AEAD
//! - [`replay`]: Nonce replay window
//! - [`session`]: Handshake and session state machine
//! - [`framing`]: Datagram frame codec
//! - [`peer`]: Directly reachable peers
//! - [`transport`]: UDP and in-memory transports

pub mod crypto;
pub mod framing;
pub mod iface;
pub mod peer;
pub mod replay;
pub mod route;
pub mod session;
pub mod transport;

pub use crypto::{CryptoError, KeyPair};
pub use framing::{Frame, FrameCodec, FrameError, FrameType};
pub use iface::{Disposition, Pipeline, PortId, Stage, StageId};
pub use peer::{PeerRecord, PeerTable};
pub use route::RouteHeader;
pub use session::{
    Outbound, Received, Role, SessionConfig, SessionEvent, SessionManager, SessionState,
};
pub use transport::{MemoryHub, MemoryTransport, Transport, TransportError, TransportEvent, UdpTransport};
