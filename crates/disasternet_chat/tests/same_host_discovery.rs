use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use disasternet_chat::ChatRoom;
use disasternet_network::discovery::DiscoveryState;
use disasternet_network::{MeshNode, NetworkConfig, NodeIdentity};

fn discovering_config(discovery_port: u16) -> NetworkConfig {
    NetworkConfig {
        listen_addrs: vec![
            "tcp://127.0.0.1:0".parse().unwrap(),
            "ws://127.0.0.1:0".parse().unwrap(),
        ],
        discovery_enabled: true,
        discovery_port,
        broadcast_ip: IpAddr::V4(Ipv4Addr::new(127, 255, 255, 255)),
        service_tag: "same-host-test".to_string(),
        announce_interval: Duration::from_millis(100),
        ..NetworkConfig::default()
    }
}

fn free_udp_port() -> u16 {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_two_nodes_on_one_host_discover_each_other() {
    let port = free_udp_port();
    let mut a = MeshNode::new(NodeIdentity::generate(), discovering_config(port));
    let mut b = MeshNode::new(NodeIdentity::generate(), discovering_config(port));
    a.start().await.unwrap();
    b.start().await.unwrap();
    assert_ne!(a.discovery_state(), DiscoveryState::Idle);
    assert_ne!(b.discovery_state(), DiscoveryState::Idle);

    let room_a = ChatRoom::new(a.router().clone(), "alpha", "Alice");
    let room_b = ChatRoom::new(b.router().clone(), "alpha", "Bob");
    room_a.subscribe();
    room_b.subscribe();

    let topic = room_a.topic().to_string();
    let b_id = *b.peer_id();
    eventually(|| a.router().peers_for_topic(&topic) == vec![b_id]).await;

    room_a.send_message("hello").unwrap();
    eventually(|| room_b.messages().len() == 1).await;
    assert_eq!(room_b.messages()[0].sender, "Alice");

    a.stop().await;
    b.stop().await;
}
