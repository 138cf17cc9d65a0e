//! trellisd - Trellis mesh node
//!
//! This crate provides:
//! - Beacon discovery and link supervision
//! - The node/route table and the router stage
//! - The tunnel adapter and virtual device
//! - A synchronous `Node` plus a tokio runtime and an in-process simulator

pub mod config;
pub mod convergence;
pub mod discovery;
pub mod node;
pub mod node_table;
pub mod router;
pub mod runtime;
pub mod sim;
pub mod tun;
pub mod wire;

pub use config::{Config, NodeState};
pub use convergence::{converge, LinkEndpoint, LinkState, LinkSupervisor, Step};
pub use discovery::{Beacon, BeaconOutcome};
pub use node::{Node, NodeConfig, NodeError, NodeStats, NodeStatus};
pub use node_table::{NodeEntry, NodeTable, Route, RoutePolicy, RouteSource, Sighting};
pub use runtime::{spawn_node, NodeCommand, NodeHandle};
pub use sim::SimNetwork;
pub use tun::{channel_device, ChannelDevice, DeviceHandle, TunAdapter, TunDevice, TunMode};
