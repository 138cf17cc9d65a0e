//! Tunnel adapter and the virtual device behind it
//!
//! Packets from the device carry a 2-byte ethertype in front of the IP
//! header. The adapter strips it on the way in, checks it against the
//! protocols the node speaks, and restores it on the way out.

use std::future::Future;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;
use trellis_core::{pop_tag, push_tag, EtherType, Message, Result};
use trellis_net::{Disposition, Stage};

/// Adapter port facing the device
pub const DEVICE_PORT: usize = 0;
/// Adapter port facing the router
pub const ROUTER_PORT: usize = 1;

/// Protocols accepted from the device
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum TunMode {
    /// IPv6 only
    #[default]
    Ip6Only,
    /// IPv6 and IPv4
    Dual,
}

impl TunMode {
    pub fn accepts(self, tag: EtherType) -> bool {
        match tag {
            EtherType::Ip6 => true,
            EtherType::Ip4 => self == TunMode::Dual,
            EtherType::Unknown(_) => false,
        }
    }
}

/// Stage translating between tagged device packets and bare IP packets
#[derive(Debug)]
pub struct TunAdapter {
    mode: TunMode,
}

impl TunAdapter {
    pub fn new(mode: TunMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> TunMode {
        self.mode
    }
}

impl<C> Stage<C> for TunAdapter {
    fn name(&self) -> &'static str {
        "tun"
    }

    fn receive(&mut self, _ctx: &mut C, port: usize, mut msg: Message) -> Result<Disposition> {
        let tag = match port {
            DEVICE_PORT => {
                let tag = pop_tag(&mut msg)?;
                if !self.mode.accepts(tag) {
                    debug!("spurious packet with ethertype {} ({} bytes)", tag, msg.len());
                    return Err(trellis_core::Error::InvalidProtocol(tag.to_u16()));
                }
                return Ok(Disposition::Forward(ROUTER_PORT, msg));
            }
            _ => EtherType::for_packet(msg.as_slice()),
        };

        if !self.mode.accepts(tag) {
            let version = msg.as_slice().first().map_or(0, |b| b >> 4);
            debug!("refusing to write IPv{} packet to the device", version);
            return Err(trellis_core::Error::InvalidProtocol(tag.to_u16()));
        }
        push_tag(&mut msg, tag)?;
        Ok(Disposition::Forward(DEVICE_PORT, msg))
    }
}

/// Host side of the device endpoint stage
pub trait DeviceSink {
    /// Queue a tagged packet for the device
    fn deliver_to_device(&mut self, packet: Message);
}

/// Last stage of the chain: hands packets to the host's device queue
#[derive(Debug, Default)]
pub struct DeviceEndpoint;

impl<C: DeviceSink> Stage<C> for DeviceEndpoint {
    fn name(&self) -> &'static str {
        "device"
    }

    fn port_count(&self) -> usize {
        1
    }

    fn receive(&mut self, ctx: &mut C, _port: usize, msg: Message) -> Result<Disposition> {
        ctx.deliver_to_device(msg);
        Ok(Disposition::Consumed)
    }
}

/// Device errors
#[derive(Debug, Error)]
pub enum TunError {
    #[error("device {0} is closed")]
    Closed(String),
    #[error("device {0} is full, packet dropped")]
    Full(String),
}

/// A virtual network device exchanging tagged packets
pub trait TunDevice {
    fn name(&self) -> &str;

    /// Next packet written by the host, or `None` once the device is gone
    fn read_packet(&mut self) -> impl Future<Output = Option<Vec<u8>>> + Send;

    /// Hand a packet to the host
    fn write_packet(&self, packet: Vec<u8>) -> std::result::Result<(), TunError>;
}

/// Device backed by tokio channels
#[derive(Debug)]
pub struct ChannelDevice {
    name: String,
    inbound: mpsc::Receiver<Vec<u8>>,
    outbound: mpsc::Sender<Vec<u8>>,
}

/// The host end of a [`ChannelDevice`]
#[derive(Debug)]
pub struct DeviceHandle {
    /// Packets for the node to route
    pub to_node: mpsc::Sender<Vec<u8>>,
    /// Packets the node delivered
    pub from_node: mpsc::Receiver<Vec<u8>>,
}

/// Create a channel device and its host handle.
///
/// Both directions hold at most `capacity` packets. Packets for a host that
/// has fallen behind are dropped.
pub fn channel_device(name: &str, capacity: usize) -> (ChannelDevice, DeviceHandle) {
    let (to_node, inbound) = mpsc::channel(capacity);
    let (outbound, from_node) = mpsc::channel(capacity);
    (
        ChannelDevice {
            name: name.to_string(),
            inbound,
            outbound,
        },
        DeviceHandle { to_node, from_node },
    )
}

impl TunDevice for ChannelDevice {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_packet(&mut self) -> Option<Vec<u8>> {
        self.inbound.recv().await
    }

    fn write_packet(&self, packet: Vec<u8>) -> std::result::Result<(), TunError> {
        self.outbound.try_send(packet).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TunError::Full(self.name.clone()),
            mpsc::error::TrySendError::Closed(_) => TunError::Closed(self.name.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use trellis_core::headers::IP_PROTO_UDP;
    use trellis_core::{Error, Ip4Header, Ip6Header, DEFAULT_PADDING};
    use trellis_net::{Pipeline, PortId};

    #[derive(Default)]
    struct Host {
        device: Vec<Message>,
        routed: Vec<Message>,
    }

    impl DeviceSink for Host {
        fn deliver_to_device(&mut self, packet: Message) {
            self.device.push(packet);
        }
    }

    /// Records packets that reach the router side
    struct Capture;

    impl Stage<Host> for Capture {
        fn name(&self) -> &'static str {
            "capture"
        }

        fn port_count(&self) -> usize {
            1
        }

        fn receive(&mut self, ctx: &mut Host, _port: usize, msg: Message) -> Result<Disposition> {
            ctx.routed.push(msg);
            Ok(Disposition::Consumed)
        }
    }

    /// Sends IPv4 packets back with source and destination swapped
    struct Ip4Echo;

    impl Stage<Host> for Ip4Echo {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn port_count(&self) -> usize {
            1
        }

        fn receive(&mut self, _ctx: &mut Host, _port: usize, mut msg: Message) -> Result<Disposition> {
            let header = Ip4Header::parse(msg.as_slice())?;
            let bytes = msg.as_mut_slice();
            bytes[Ip4Header::SOURCE_OFFSET..Ip4Header::SOURCE_OFFSET + 4]
                .copy_from_slice(&header.dest.octets());
            bytes[Ip4Header::DEST_OFFSET..Ip4Header::DEST_OFFSET + 4]
                .copy_from_slice(&header.source.octets());
            Ok(Disposition::Forward(0, msg))
        }
    }

    fn chain<S: Stage<Host> + Send + 'static>(mode: TunMode, inner: S) -> (Pipeline<Host>, PortId, PortId) {
        let mut pipeline = Pipeline::new();
        let device = pipeline.add_stage(DeviceEndpoint);
        let tun = pipeline.add_stage(TunAdapter::new(mode));
        let router = pipeline.add_stage(inner);
        let device_port = pipeline.port(device, 0).unwrap();
        let router_port = pipeline.port(router, 0).unwrap();
        pipeline.plumb(device_port, pipeline.port(tun, DEVICE_PORT).unwrap()).unwrap();
        pipeline.plumb(pipeline.port(tun, ROUTER_PORT).unwrap(), router_port).unwrap();
        (pipeline, device_port, router_port)
    }

    fn ip6_packet(body: &[u8]) -> Message {
        let mut msg = Message::from_payload(body, DEFAULT_PADDING);
        Ip6Header::craft(&mut msg, "fc00::1".parse().unwrap(), "fc00::2".parse().unwrap()).unwrap();
        msg
    }

    #[test]
    fn test_ip6_from_device_strips_tag() {
        let (mut pipeline, device_port, _) = chain(TunMode::Ip6Only, Capture);
        let mut host = Host::default();

        let packet = ip6_packet(b"hello");
        let expected = packet.as_slice().to_vec();
        let mut tagged = packet;
        push_tag(&mut tagged, EtherType::Ip6).unwrap();

        pipeline.send(&mut host, device_port, tagged).unwrap();
        assert_eq!(host.routed.len(), 1);
        assert_eq!(host.routed[0].as_slice(), &expected[..]);
    }

    #[test]
    fn test_ip6_to_device_adds_tag() {
        let (mut pipeline, _, router_port) = chain(TunMode::Ip6Only, Capture);
        let mut host = Host::default();

        let packet = ip6_packet(b"inbound");
        let expected = packet.as_slice().to_vec();
        pipeline.send(&mut host, router_port, packet).unwrap();

        assert_eq!(host.device.len(), 1);
        let mut out = host.device.remove(0);
        assert_eq!(pop_tag(&mut out).unwrap(), EtherType::Ip6);
        assert_eq!(out.as_slice(), &expected[..]);
    }

    #[test]
    fn test_ip4_rejected_in_ip6_mode() {
        let (mut pipeline, device_port, _) = chain(TunMode::Ip6Only, Capture);
        let mut host = Host::default();

        let mut msg = Message::from_payload(b"v4", DEFAULT_PADDING);
        Ip4Header::craft(&mut msg, IP_PROTO_UDP, Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2))
            .unwrap();
        push_tag(&mut msg, EtherType::Ip4).unwrap();

        let err = pipeline.send(&mut host, device_port, msg).unwrap_err();
        assert!(matches!(err, Error::InvalidProtocol(0x0800)));
        assert!(host.routed.is_empty());
    }

    #[test]
    fn test_spurious_tag_dropped() {
        let (mut pipeline, device_port, _) = chain(TunMode::Dual, Capture);
        let mut host = Host::default();

        let mut msg = ip6_packet(b"odd");
        push_tag(&mut msg, EtherType::Unknown(0x1234)).unwrap();
        let err = pipeline.send(&mut host, device_port, msg).unwrap_err();
        assert!(matches!(err, Error::InvalidProtocol(0x1234)));
        assert!(host.routed.is_empty());
    }

    #[test]
    fn test_short_device_packet() {
        let (mut pipeline, device_port, _) = chain(TunMode::Ip6Only, Capture);
        let mut host = Host::default();

        let err = pipeline
            .send(&mut host, device_port, Message::from_payload(&[0x86], 8))
            .unwrap_err();
        assert!(matches!(err, Error::MalformedFrame { needed: 2, got: 1 }));
    }

    #[test]
    fn test_ipv4_echo_in_dual_mode() {
        let (mut pipeline, device_port, _) = chain(TunMode::Dual, Ip4Echo);
        let mut host = Host::default();

        let ours = Ipv4Addr::new(11, 0, 0, 1);
        let theirs = Ipv4Addr::new(11, 0, 0, 2);
        let mut msg = Message::from_payload(b"Hello World", DEFAULT_PADDING);
        Ip4Header::craft(&mut msg, IP_PROTO_UDP, ours, theirs).unwrap();
        push_tag(&mut msg, EtherType::Ip4).unwrap();

        pipeline.send(&mut host, device_port, msg).unwrap();

        assert_eq!(host.device.len(), 1);
        let mut reply = host.device.remove(0);
        assert_eq!(pop_tag(&mut reply).unwrap(), EtherType::Ip4);
        let header = Ip4Header::parse(reply.as_slice()).unwrap();
        assert_eq!(header.source, theirs);
        assert_eq!(header.dest, ours);
        assert_eq!(&reply.as_slice()[Ip4Header::SIZE..], b"Hello World");
    }

    #[test]
    fn test_garbage_from_router() {
        let (mut pipeline, _, router_port) = chain(TunMode::Ip6Only, Capture);
        let mut host = Host::default();

        let err = pipeline
            .send(&mut host, router_port, Message::from_payload(&[0x20, 0, 0], 8))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidProtocol(_)));
        assert!(host.device.is_empty());
    }

    #[tokio::test]
    async fn test_channel_device() {
        let (mut device, mut handle) = channel_device("tun0", 4);
        assert_eq!(device.name(), "tun0");

        handle.to_node.send(vec![1, 2, 3]).await.unwrap();
        assert_eq!(device.read_packet().await, Some(vec![1, 2, 3]));

        device.write_packet(vec![4, 5]).unwrap();
        assert_eq!(handle.from_node.recv().await, Some(vec![4, 5]));

        drop(handle);
        assert_eq!(device.read_packet().await, None);
        assert!(matches!(device.write_packet(vec![6]), Err(TunError::Closed(_))));
    }

    #[tokio::test]
    async fn test_slow_host_drops_packets() {
        let (device, mut handle) = channel_device("tun0", 2);
        device.write_packet(vec![1]).unwrap();
        device.write_packet(vec![2]).unwrap();
        assert!(matches!(device.write_packet(vec![3]), Err(TunError::Full(_))));

        assert_eq!(handle.from_node.recv().await, Some(vec![1]));
        device.write_packet(vec![4]).unwrap();
        assert_eq!(handle.from_node.recv().await, Some(vec![2]));
        assert_eq!(handle.from_node.recv().await, Some(vec![4]));
    }
}
