//! Spawned nodes over the in-memory transport

use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::timeout;
use trellis_core::{push_tag, EtherType, Ip6Header, Message, DEFAULT_PADDING};
use trellis_net::{KeyPair, MemoryHub};
use trellisd::convergence::{converge, LinkSupervisor};
use trellisd::tun::DeviceHandle;
use trellisd::{channel_device, spawn_node, Node, NodeConfig, NodeHandle};

type Task = tokio::task::JoinHandle<Result<(), trellisd::NodeError>>;

fn spawn(hub: &MemoryHub, seed: u8) -> (NodeHandle, DeviceHandle, Task, SocketAddr) {
    let addr = SocketAddr::from(([10, 0, 0, seed], 7000));
    let (transport, events) = hub.bind(addr);
    let (device, host) = channel_device(&format!("tun{seed}"), 16);
    let node = Node::new(KeyPair::from_seed(&[seed; 32]), NodeConfig::default()).unwrap();
    let (handle, task) = spawn_node(node, transport, events, device, Duration::from_millis(1));
    (handle, host, task, addr)
}

fn packet(from: &NodeHandle, to: &NodeHandle, body: &[u8]) -> Vec<u8> {
    let mut msg = Message::from_payload(body, DEFAULT_PADDING);
    Ip6Header::craft(&mut msg, from.address(), to.address()).unwrap();
    push_tag(&mut msg, EtherType::Ip6).unwrap();
    msg.into_vec()
}

#[tokio::test(start_paused = true)]
async fn test_spawned_nodes_converge_and_route() {
    let hub = MemoryHub::new();
    let (a, mut host_a, task_a, addr_a) = spawn(&hub, 1);
    let (b, mut host_b, task_b, addr_b) = spawn(&hub, 2);

    converge(
        LinkSupervisor::starting_at(0),
        &a,
        &b,
        Duration::from_millis(1),
        || {
            a.add_peer(addr_b).unwrap();
            b.add_peer(addr_a).unwrap();
        },
    )
    .await
    .unwrap();
    assert!(a.status().node_count >= 2);
    assert_eq!(b.status().established, 1);

    let sent = packet(&a, &b, b"Hello World!");
    host_a.to_node.send(sent.clone()).await.unwrap();
    let got = timeout(Duration::from_secs(5), host_b.from_node.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, sent);

    let reply = packet(&b, &a, b"Hello cjdns!");
    host_b.to_node.send(reply.clone()).await.unwrap();
    let got = timeout(Duration::from_secs(5), host_a.from_node.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, reply);

    a.shutdown().await;
    b.shutdown().await;
    task_a.await.unwrap().unwrap();
    task_b.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_partitioned_nodes_time_out() {
    let hub = MemoryHub::new();
    let (a, _host_a, task_a, addr_a) = spawn(&hub, 1);
    let (b, _host_b, task_b, addr_b) = spawn(&hub, 2);
    hub.partition(addr_a, addr_b);

    let result = converge(
        LinkSupervisor::starting_at(0),
        &a,
        &b,
        Duration::from_millis(1),
        || {
            a.add_peer(addr_b).unwrap();
            b.add_peer(addr_a).unwrap();
        },
    )
    .await;
    assert!(matches!(
        result,
        Err(trellis_core::Error::ConvergenceTimeout { deadline_ms: 5_000 })
    ));
    assert_eq!(a.status().node_count, 1);

    a.shutdown().await;
    b.shutdown().await;
    task_a.await.unwrap().unwrap();
    task_b.await.unwrap().unwrap();
}
