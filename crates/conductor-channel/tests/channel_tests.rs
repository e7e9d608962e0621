//! Loopback integration tests for the Unix-socket channel and protocol.

use conductor_channel::{ChannelClient, ChannelServer, Protocol};
use conductor_core::ids::AgentId;
use conductor_core::message::{AgentMessage, MessageType};
use serde_json::{json, Map};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const RECV_TIMEOUT: Duration = Duration::from_secs(2);

fn coordinator() -> AgentId {
    AgentId::coordinator()
}

fn payload(key: &str, value: &str) -> Map<String, serde_json::Value> {
    let mut map = Map::new();
    map.insert(key.to_string(), json!(value));
    map
}

/// Announce the client to the broker so routing knows its identity.
async fn announce(client: &ChannelClient) {
    let hello = AgentMessage::new(
        client.local_id().clone(),
        coordinator(),
        MessageType::StatusUpdate,
        payload("event", "connected"),
    );
    client.send(hello).await.expect("announce");
}

async fn wait_for_peers(server: &ChannelServer, count: usize) {
    for _ in 0..100 {
        if server.peer_count() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("broker never saw {count} peers");
}

#[tokio::test]
async fn test_client_to_server_delivery() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broker.sock");
    let server = ChannelServer::bind(&path, coordinator()).await.unwrap();

    let client = ChannelClient::connect(&path, AgentId::numbered(1), CONNECT_TIMEOUT)
        .await
        .unwrap();
    announce(&client).await;

    let received = server.receive(RECV_TIMEOUT).await.expect("message");
    assert_eq!(received.sender_id, AgentId::numbered(1));
    assert_eq!(received.message_type, MessageType::StatusUpdate);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_server_to_client_delivery() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broker.sock");
    let server = ChannelServer::bind(&path, coordinator()).await.unwrap();

    let client = ChannelClient::connect(&path, AgentId::numbered(1), CONNECT_TIMEOUT)
        .await
        .unwrap();
    announce(&client).await;
    wait_for_peers(&server, 1).await;
    // Drain the announcement.
    server.receive(RECV_TIMEOUT).await.expect("announce");

    let message = AgentMessage::new(
        coordinator(),
        AgentId::numbered(1),
        MessageType::Coordination,
        payload("directive", "pause"),
    );
    server.send(message).await.unwrap();

    let received = client.receive(RECV_TIMEOUT).await.expect("message");
    assert_eq!(received.message_type, MessageType::Coordination);
    assert_eq!(received.payload.get("directive"), Some(&json!("pause")));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_peer_to_peer_routing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broker.sock");
    let server = ChannelServer::bind(&path, coordinator()).await.unwrap();

    let alice = ChannelClient::connect(&path, AgentId::numbered(1), CONNECT_TIMEOUT)
        .await
        .unwrap();
    let bob = ChannelClient::connect(&path, AgentId::numbered(2), CONNECT_TIMEOUT)
        .await
        .unwrap();
    announce(&alice).await;
    announce(&bob).await;
    wait_for_peers(&server, 2).await;

    let direct = AgentMessage::new(
        AgentId::numbered(1),
        AgentId::numbered(2),
        MessageType::Coordination,
        payload("note", "hi bob"),
    );
    alice.send(direct).await.unwrap();

    let received = bob.receive(RECV_TIMEOUT).await.expect("routed message");
    assert_eq!(received.sender_id, AgentId::numbered(1));
    assert_eq!(received.payload.get("note"), Some(&json!("hi bob")));

    // Alice must not get her own direct message back.
    assert!(alice.receive(Duration::from_millis(100)).await.is_none());

    alice.close().await;
    bob.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_broadcast_excludes_sender() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broker.sock");
    let server = ChannelServer::bind(&path, coordinator()).await.unwrap();

    let alice = ChannelClient::connect(&path, AgentId::numbered(1), CONNECT_TIMEOUT)
        .await
        .unwrap();
    let bob = ChannelClient::connect(&path, AgentId::numbered(2), CONNECT_TIMEOUT)
        .await
        .unwrap();
    let carol = ChannelClient::connect(&path, AgentId::numbered(3), CONNECT_TIMEOUT)
        .await
        .unwrap();
    for client in [&alice, &bob, &carol] {
        announce(client).await;
    }
    wait_for_peers(&server, 3).await;

    let shout = AgentMessage::new(
        AgentId::numbered(1),
        AgentId::broadcast(),
        MessageType::StatusUpdate,
        payload("event", "done"),
    );
    alice.send(shout).await.unwrap();

    assert!(bob.receive(RECV_TIMEOUT).await.is_some());
    assert!(carol.receive(RECV_TIMEOUT).await.is_some());
    assert!(alice.receive(Duration::from_millis(100)).await.is_none());

    alice.close().await;
    bob.close().await;
    carol.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_broadcast_with_zero_peers_is_ok() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broker.sock");
    let server = ChannelServer::bind(&path, coordinator()).await.unwrap();

    let message = AgentMessage::new(
        coordinator(),
        AgentId::broadcast(),
        MessageType::StatusUpdate,
        Map::new(),
    );
    assert!(server.broadcast(message, None).await.is_ok());

    server.close().await;
}

#[tokio::test]
async fn test_receive_timeout_returns_none() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broker.sock");
    let server = ChannelServer::bind(&path, coordinator()).await.unwrap();

    assert!(server.receive(Duration::from_millis(50)).await.is_none());

    server.close().await;
}

#[tokio::test]
async fn test_bind_unlinks_stale_socket_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broker.sock");
    std::fs::write(&path, b"stale").unwrap();

    let server = ChannelServer::bind(&path, coordinator()).await.unwrap();
    server.close().await;
    assert!(!path.exists());
}

#[tokio::test]
async fn test_peer_request_response_correlation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broker.sock");
    let server = ChannelServer::bind(&path, coordinator()).await.unwrap();

    let alice = Arc::new(
        ChannelClient::connect(&path, AgentId::numbered(1), CONNECT_TIMEOUT)
            .await
            .unwrap(),
    );
    let bob = Arc::new(
        ChannelClient::connect(&path, AgentId::numbered(2), CONNECT_TIMEOUT)
            .await
            .unwrap(),
    );
    announce(&alice).await;
    announce(&bob).await;
    wait_for_peers(&server, 2).await;

    let alice_protocol = Arc::new(Protocol::new(alice.clone()));
    let bob_protocol = Arc::new(Protocol::new(bob.clone()));

    // Bob answers every task request with an echo of the command.
    {
        let responder = Arc::clone(&bob_protocol);
        bob_protocol.register_handler(
            MessageType::TaskRequest,
            conductor_channel::protocol::handler(move |request| {
                let responder = Arc::clone(&responder);
                async move {
                    let echoed = request
                        .payload
                        .get("description")
                        .cloned()
                        .unwrap_or(json!(null));
                    let mut reply = Map::new();
                    reply.insert("echo".to_string(), echoed);
                    let _ = responder.send_response(&request, reply).await;
                }
            }),
        );
    }

    let fired = Arc::new(AtomicUsize::new(0));
    let fired_in_callback = Arc::clone(&fired);
    let request_id = alice_protocol
        .send_request(
            AgentId::numbered(2),
            payload("description", "analyze logs"),
            Some(conductor_channel::protocol::handler(move |response| {
                let fired = Arc::clone(&fired_in_callback);
                async move {
                    assert_eq!(response.payload.get("echo"), Some(&json!("analyze logs")));
                    fired.fetch_add(1, Ordering::SeqCst);
                }
            })),
        )
        .await
        .unwrap();

    // Pump both peers until the callback fires.
    for _ in 0..100 {
        let _ = bob_protocol.process_messages(Duration::from_millis(10)).await;
        let _ = alice_protocol
            .process_messages(Duration::from_millis(10))
            .await;
        if fired.load(Ordering::SeqCst) > 0 {
            break;
        }
    }

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(alice_protocol.pending_requests(), 0);
    assert!(request_id.as_str().starts_with("agent_001_"));

    alice.close().await;
    bob.close().await;
    server.close().await;
}
