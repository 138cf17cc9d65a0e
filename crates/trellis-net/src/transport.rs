//! Datagram transports between nodes
//!
//! [`UdpTransport`] carries frames over a real socket; [`MemoryHub`] wires
//! transports together in-process for tests and simulations.

use crate::framing::{Frame, FrameCodec, FrameError, MAX_FRAME_SIZE};
use bytes::BytesMut;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, info, warn};

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Transport closed")]
    Closed,
    #[error("No endpoint bound at {0}")]
    Unreachable(SocketAddr),
}

/// Event from the transport layer
#[derive(Debug)]
pub enum TransportEvent {
    /// Frame received from a remote address
    FrameReceived { from: SocketAddr, frame: Frame },
}

/// Something that can put frames on the wire
pub trait Transport {
    /// Address peers reach this transport on
    fn local_addr(&self) -> SocketAddr;

    /// Send one frame to `to`
    fn send_frame(
        &self,
        to: SocketAddr,
        frame: Frame,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

impl<T: Transport + Send + Sync> Transport for Arc<T> {
    fn local_addr(&self) -> SocketAddr {
        (**self).local_addr()
    }

    fn send_frame(
        &self,
        to: SocketAddr,
        frame: Frame,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        (**self).send_frame(to, frame)
    }
}

/// UDP transport, one frame per datagram
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl UdpTransport {
    /// Bind a socket on `listen_addr`
    pub async fn bind(listen_addr: SocketAddr) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(listen_addr).await?;
        socket.set_broadcast(true)?;
        let local_addr = socket.local_addr()?;
        info!("UDP transport bound to {}", local_addr);
        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
        })
    }

    /// Receive loop: decodes datagrams and hands them to `event_tx` until
    /// the receiver is dropped.
    pub async fn run(&self, event_tx: mpsc::Sender<TransportEvent>) -> Result<(), TransportError> {
        let mut codec = FrameCodec::new();
        let mut buf = vec![0u8; MAX_FRAME_SIZE];
        loop {
            let (len, from) = self.socket.recv_from(&mut buf).await?;
            let mut datagram = BytesMut::from(&buf[..len]);
            match codec.decode(&mut datagram) {
                Ok(Some(frame)) => {
                    if event_tx
                        .send(TransportEvent::FrameReceived { from, frame })
                        .await
                        .is_err()
                    {
                        debug!("event receiver dropped, stopping UDP receive loop");
                        return Ok(());
                    }
                }
                Ok(None) => {}
                Err(e) => debug!("dropping bad datagram from {}: {}", from, e),
            }
        }
    }
}

impl Transport for UdpTransport {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn send_frame(&self, to: SocketAddr, frame: Frame) -> Result<(), TransportError> {
        let mut buf = BytesMut::with_capacity(frame.wire_len());
        FrameCodec::new().encode(frame, &mut buf)?;
        self.socket.send_to(&buf, to).await?;
        Ok(())
    }
}

/// In-process switchboard connecting [`MemoryTransport`]s
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

#[derive(Default)]
struct HubInner {
    endpoints: RwLock<HashMap<SocketAddr, mpsc::Sender<TransportEvent>>>,
    /// Directed pairs whose frames are dropped
    cut: RwLock<HashSet<(SocketAddr, SocketAddr)>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a transport at `addr`. Frames for it arrive on the receiver.
    pub fn bind(&self, addr: SocketAddr) -> (MemoryTransport, mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = mpsc::channel(1024);
        self.inner.endpoints.write().insert(addr, tx);
        (
            MemoryTransport {
                hub: self.clone(),
                local_addr: addr,
            },
            rx,
        )
    }

    /// Drop frames between `a` and `b` in both directions
    pub fn partition(&self, a: SocketAddr, b: SocketAddr) {
        let mut cut = self.inner.cut.write();
        cut.insert((a, b));
        cut.insert((b, a));
    }

    /// Undo [`MemoryHub::partition`]
    pub fn heal(&self, a: SocketAddr, b: SocketAddr) {
        let mut cut = self.inner.cut.write();
        cut.remove(&(a, b));
        cut.remove(&(b, a));
    }

    fn deliver(&self, from: SocketAddr, to: SocketAddr, frame: Frame) -> Result<(), TransportError> {
        if self.inner.cut.read().contains(&(from, to)) {
            return Ok(());
        }
        let tx = self
            .inner
            .endpoints
            .read()
            .get(&to)
            .cloned()
            .ok_or(TransportError::Unreachable(to))?;
        if tx
            .try_send(TransportEvent::FrameReceived { from, frame })
            .is_err()
        {
            // Full or closed queues behave like a lossy link
            warn!("memory link {} -> {} dropped a frame", from, to);
        }
        Ok(())
    }
}

/// Transport endpoint attached to a [`MemoryHub`]
#[derive(Clone)]
pub struct MemoryTransport {
    hub: MemoryHub,
    local_addr: SocketAddr,
}

impl Transport for MemoryTransport {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn send_frame(&self, to: SocketAddr, frame: Frame) -> Result<(), TransportError> {
        self.hub.deliver(self.local_addr, to, frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::FrameType;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn test_memory_delivery() {
        let hub = MemoryHub::new();
        let (a, _a_rx) = hub.bind(addr(1));
        let (_b, mut b_rx) = hub.bind(addr(2));

        a.send_frame(addr(2), Frame::new(FrameType::Beacon, vec![1, 2]))
            .await
            .unwrap();
        let TransportEvent::FrameReceived { from, frame } = b_rx.recv().await.unwrap();
        assert_eq!(from, addr(1));
        assert_eq!(frame.payload, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_memory_partition() {
        let hub = MemoryHub::new();
        let (a, _a_rx) = hub.bind(addr(1));
        let (_b, mut b_rx) = hub.bind(addr(2));

        hub.partition(addr(1), addr(2));
        a.send_frame(addr(2), Frame::new(FrameType::Beacon, vec![]))
            .await
            .unwrap();
        assert!(b_rx.try_recv().is_err());

        hub.heal(addr(1), addr(2));
        a.send_frame(addr(2), Frame::new(FrameType::Beacon, vec![]))
            .await
            .unwrap();
        assert!(b_rx.try_recv().is_ok());

        assert!(matches!(
            a.send_frame(addr(9), Frame::new(FrameType::Beacon, vec![])).await,
            Err(TransportError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_udp_roundtrip() {
        let a = UdpTransport::bind(addr(0)).await.unwrap();
        let b = Arc::new(UdpTransport::bind(addr(0)).await.unwrap());
        let (tx, mut rx) = mpsc::channel(8);

        let receiver = b.clone();
        let task = tokio::spawn(async move { receiver.run(tx).await });

        let frame = Frame::new(FrameType::Data, b"over udp".to_vec());
        a.send_frame(b.local_addr(), frame.clone()).await.unwrap();

        let TransportEvent::FrameReceived { from, frame: got } = rx.recv().await.unwrap();
        assert_eq!(from, a.local_addr());
        assert_eq!(got, frame);
        task.abort();
    }
}
