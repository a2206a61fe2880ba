use std::time::Duration;

use disasternet_chat::{ChatRoom, TranscriptWriter, transcript};
use disasternet_network::{MeshNode, NetworkConfig, NodeIdentity};

fn local_config() -> NetworkConfig {
    NetworkConfig {
        listen_addrs: vec![
            "tcp://127.0.0.1:0".parse().unwrap(),
            "ws://127.0.0.1:0".parse().unwrap(),
        ],
        discovery_enabled: false,
        ..NetworkConfig::default()
    }
}

async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_chat_between_two_nodes() {
    let mut a = MeshNode::new(NodeIdentity::generate(), local_config());
    let mut b = MeshNode::new(NodeIdentity::generate(), local_config());
    a.start().await.unwrap();
    b.start().await.unwrap();

    let room_a = ChatRoom::new(a.router().clone(), "alpha", "Alice");
    let room_b = ChatRoom::new(b.router().clone(), "alpha", "Bob");
    room_a.subscribe();
    room_b.subscribe();

    let dir = tempfile::tempdir().unwrap();
    let transcript_path = dir.path().join("messages.txt");
    let writer = TranscriptWriter::spawn(&transcript_path).unwrap();
    writer.attach(&room_b);

    a.connect(b.listen_addrs()[0]).await.unwrap();
    let (a_id, b_id) = (*a.peer_id(), *b.peer_id());
    let topic = room_a.topic().to_string();
    eventually(|| a.router().peers_for_topic(&topic) == vec![b_id]).await;
    eventually(|| b.router().peers_for_topic(&topic) == vec![a_id]).await;

    let sent = room_a.send_message("hello").unwrap();
    eventually(|| room_b.messages().len() == 1).await;

    let received = &room_b.messages()[0];
    assert_eq!(received, &sent);
    assert_eq!(received.sender, "Alice");
    assert_eq!(received.sender_id, a_id.short());
    assert_eq!(room_b.peers_in_room(), vec!["Bob", "Alice"]);

    room_b.send_message("copy that").unwrap();
    eventually(|| room_a.messages().len() == 2).await;
    assert_eq!(room_a.messages()[1].message, "copy that");
    assert_eq!(room_a.info().peers, 2);

    writer.close().await;
    let entries = transcript::read_entries(&transcript_path).unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries[0].ends_with("] Alice: hello"));
    assert!(entries[1].ends_with("] Bob: copy that"));

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_remote_messages_observed_in_send_order() {
    let mut a = MeshNode::new(NodeIdentity::generate(), local_config());
    let mut b = MeshNode::new(NodeIdentity::generate(), local_config());
    a.start().await.unwrap();
    b.start().await.unwrap();

    let room_a = ChatRoom::new(a.router().clone(), "alpha", "Alice");
    let room_b = ChatRoom::new(b.router().clone(), "alpha", "Bob");
    room_a.subscribe();
    room_b.subscribe();
    let (_observer, mut observed) = room_b.message_stream();

    a.connect(b.listen_addrs()[1]).await.unwrap();
    let b_id = *b.peer_id();
    let topic = room_a.topic().to_string();
    eventually(|| a.router().peers_for_topic(&topic) == vec![b_id]).await;

    let sent: Vec<String> = (0..50).map(|i| format!("update {i}")).collect();
    for body in &sent {
        room_a.send_message(body).unwrap();
    }

    let mut received = Vec::new();
    while received.len() < sent.len() {
        let msg = tokio::time::timeout(Duration::from_secs(2), observed.recv())
            .await
            .unwrap()
            .unwrap();
        received.push(msg.message);
    }
    assert_eq!(received, sent);
    let logged: Vec<String> = room_b.messages().into_iter().map(|m| m.message).collect();
    assert_eq!(logged, sent);

    a.stop().await;
    b.stop().await;
}
