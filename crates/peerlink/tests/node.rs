//! End-to-end tests: whole nodes talking over an in-memory network.

use std::time::Duration;

use peerlink::prelude::*;
use peerlink_crypto::MIN_KEY_BITS;
use tokio::sync::{broadcast, watch};
use tokio::time::timeout;

// -- Helpers --------------------------------------------------------------

fn pid(id: &str) -> PeerId {
    PeerId::from(id)
}

fn node(network: &MemoryNetwork, id: &str) -> Node<MemoryTransport> {
    Node::builder()
        .peer_id(id)
        .key_pair(KeyPair::generate_with_bits(MIN_KEY_BITS).unwrap())
        .build_in_memory(network)
        .unwrap()
}

async fn recv<E: Clone>(rx: &mut broadcast::Receiver<E>) -> E {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("feed closed")
}

async fn recv_peer(rx: &mut PeerEvents) -> PeerEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for peer event")
        .expect("feed closed")
}

/// Waits for `PeerJoined` events naming each of `peers`, in any order.
async fn wait_joined(rx: &mut broadcast::Receiver<ChatEvent>, peers: &[&str]) {
    let mut pending: Vec<PeerId> = peers.iter().map(|p| pid(p)).collect();
    while !pending.is_empty() {
        if let ChatEvent::PeerJoined { peer_id, .. } = recv(rx).await {
            pending.retain(|p| p != &peer_id);
        }
    }
}

async fn next_chat_message(rx: &mut broadcast::Receiver<ChatEvent>) -> (PeerId, String) {
    loop {
        if let ChatEvent::Message { from, text, .. } = recv(rx).await {
            return (from, text);
        }
    }
}

// =========================================================================
// Chat
// =========================================================================

#[tokio::test]
async fn test_two_peer_chat_over_nodes() {
    let network = MemoryNetwork::new();
    let alice = node(&network, "alice");
    let bob = node(&network, "bob");
    let mut alice_chat = alice.chat_events();
    let mut bob_chat = bob.chat_events();

    alice.connect_to_peer(bob.local_id()).await.unwrap();
    wait_joined(&mut alice_chat, &["bob"]).await;
    wait_joined(&mut bob_chat, &["alice"]).await;

    assert_eq!(alice.send_chat_message("hi").await.unwrap(), 1);

    assert_eq!(next_chat_message(&mut bob_chat).await, (pid("alice"), "hi".to_string()));
    assert!(
        timeout(Duration::from_millis(150), next_chat_message(&mut bob_chat))
            .await
            .is_err(),
        "message delivered more than once"
    );
}

#[tokio::test]
async fn test_late_joiner_receives_only_new_messages() {
    let network = MemoryNetwork::new();
    let alice = node(&network, "alice");
    let bob = node(&network, "bob");
    let mut alice_chat = alice.chat_events();
    let mut bob_chat = bob.chat_events();
    alice.connect_to_peer(bob.local_id()).await.unwrap();
    wait_joined(&mut alice_chat, &["bob"]).await;
    wait_joined(&mut bob_chat, &["alice"]).await;
    alice.send_chat_message("old news").await.unwrap();
    next_chat_message(&mut bob_chat).await;

    let carol = node(&network, "carol");
    let mut carol_chat = carol.chat_events();
    carol.connect_to_peer(&pid("alice")).await.unwrap();
    carol.connect_to_peer(&pid("bob")).await.unwrap();
    wait_joined(&mut carol_chat, &["alice", "bob"]).await;
    wait_joined(&mut alice_chat, &["carol"]).await;

    assert_eq!(alice.send_chat_message("welcome").await.unwrap(), 2);

    assert_eq!(
        next_chat_message(&mut carol_chat).await,
        (pid("alice"), "welcome".to_string())
    );
    assert_eq!(
        next_chat_message(&mut bob_chat).await,
        (pid("alice"), "welcome".to_string())
    );
}

#[tokio::test]
async fn test_disconnect_emits_peer_left_on_both_sides() {
    let network = MemoryNetwork::new();
    let alice = node(&network, "alice");
    let bob = node(&network, "bob");
    let mut alice_chat = alice.chat_events();
    let mut bob_chat = bob.chat_events();
    let mut alice_peers = alice.peer_events();
    alice.connect_to_peer(bob.local_id()).await.unwrap();
    wait_joined(&mut alice_chat, &["bob"]).await;
    wait_joined(&mut bob_chat, &["alice"]).await;

    alice.disconnect_peer(&pid("bob")).await;

    assert!(matches!(
        recv(&mut alice_chat).await,
        ChatEvent::PeerLeft { peer_id, .. } if peer_id == pid("bob")
    ));
    assert!(matches!(
        recv(&mut bob_chat).await,
        ChatEvent::PeerLeft { peer_id, .. } if peer_id == pid("alice")
    ));
    assert_eq!(alice_peers.recv().await.unwrap(), PeerEvent::Added(pid("bob")));
    assert_eq!(alice_peers.recv().await.unwrap(), PeerEvent::Removed(pid("bob")));
    assert!(alice.peer_ids().await.is_empty());
}

#[tokio::test]
async fn test_chat_history_records_sent_and_received() {
    let network = MemoryNetwork::new();
    let alice = node(&network, "alice");
    let bob = node(&network, "bob");
    let mut alice_chat = alice.chat_events();
    let mut bob_chat = bob.chat_events();
    alice.connect_to_peer(bob.local_id()).await.unwrap();
    wait_joined(&mut alice_chat, &["bob"]).await;
    wait_joined(&mut bob_chat, &["alice"]).await;

    alice.send_chat_message("ping").await.unwrap();
    next_chat_message(&mut bob_chat).await;

    let texts: Vec<String> = bob
        .chat_history()
        .into_iter()
        .filter_map(|e| match e {
            ChatEvent::Message { text, .. } => Some(text),
            _ => None,
        })
        .collect();
    assert_eq!(texts, ["ping"]);
    assert!(matches!(
        alice.chat_history().last(),
        Some(ChatEvent::Message { from, .. }) if from == &pid("alice")
    ));
}

// =========================================================================
// Game relay
// =========================================================================

#[tokio::test]
async fn test_world_action_reaches_peer() {
    let network = MemoryNetwork::new();
    let alice = node(&network, "alice");
    let bob = node(&network, "bob");
    let mut bob_peers = bob.peer_events();
    let mut bob_game = bob.game_events();
    alice.connect_to_peer(bob.local_id()).await.unwrap();
    bob_peers.recv().await.unwrap();
    // Alice may announce bob a moment after bob announces alice.
    while !alice.peer_ids().await.contains(&pid("bob")) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let action = WorldAction::Vortex(Vortex {
        radius: 3.0,
        position: Vector3::new(0.0, 1.0, 0.0),
        strength: 2.0,
        height: 5.0,
        duration: 1.5,
    });

    alice.send_world_action(&action).await.unwrap();

    let event = recv(&mut bob_game).await;
    assert_eq!(event.from, pid("alice"));
    assert_eq!(event.payload, GamePayload::WorldAction(action));
}

#[tokio::test(start_paused = true)]
async fn test_position_ticker_relays_movement() {
    let network = MemoryNetwork::new();
    let alice = node(&network, "alice");
    let bob = node(&network, "bob");
    let mut alice_peers = alice.peer_events();
    let mut bob_game = bob.game_events();
    alice.connect_to_peer(bob.local_id()).await.unwrap();
    alice_peers.recv().await.unwrap();
    let (position_tx, position_rx) = watch::channel(Vector3::new(1.0, 2.0, 3.0));

    let ticker = alice.spawn_position_ticker(position_rx).unwrap();

    assert_eq!(
        recv(&mut bob_game).await.payload,
        GamePayload::PlayerPosition(Vector3::new(1.0, 2.0, 3.0))
    );
    position_tx.send(Vector3::new(4.0, 2.0, 3.0)).unwrap();
    assert_eq!(
        recv(&mut bob_game).await.payload,
        GamePayload::PlayerPosition(Vector3::new(4.0, 2.0, 3.0))
    );
    ticker.abort();
}

// =========================================================================
// Building
// =========================================================================

#[tokio::test]
async fn test_build_in_memory_generates_prefixed_id() {
    let network = MemoryNetwork::new();
    let config = NodeConfig::from_json(r#"{"session": {"id_prefix": "racer"}}"#).unwrap();

    let node = Node::builder()
        .config(config)
        .key_pair(KeyPair::generate_with_bits(MIN_KEY_BITS).unwrap())
        .build_in_memory(&network)
        .unwrap();

    let id = node.local_id().as_str();
    assert!(id.starts_with("racer-"), "unexpected id {id}");
    assert_eq!(id.len(), "racer-".len() + 32);
}

#[tokio::test]
async fn test_build_in_memory_duplicate_id_rejected() {
    let network = MemoryNetwork::new();
    let _alice = node(&network, "alice");

    let result = Node::builder()
        .peer_id("alice")
        .key_pair(KeyPair::generate_with_bits(MIN_KEY_BITS).unwrap())
        .build_in_memory(&network);

    assert!(matches!(result, Err(PeerlinkError::Transport(_))));
}

#[tokio::test]
async fn test_dropped_node_id_can_be_reused() {
    let network = MemoryNetwork::new();
    let bob = node(&network, "bob");
    let mut bob_peers = bob.peer_events();
    let alice = node(&network, "alice");
    alice.connect_to_peer(bob.local_id()).await.unwrap();
    assert_eq!(recv_peer(&mut bob_peers).await, PeerEvent::Added(pid("alice")));

    drop(alice);

    assert_eq!(recv_peer(&mut bob_peers).await, PeerEvent::Removed(pid("alice")));
    let mut rebuilt = None;
    for _ in 0..100 {
        if let Ok(node) = Node::builder()
            .peer_id("alice")
            .key_pair(KeyPair::generate_with_bits(MIN_KEY_BITS).unwrap())
            .build_in_memory(&network)
        {
            rebuilt = Some(node);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let alice = rebuilt.expect("id should be released after the node is dropped");
    alice.connect_to_peer(bob.local_id()).await.unwrap();
    assert_eq!(recv_peer(&mut bob_peers).await, PeerEvent::Added(pid("alice")));
}

#[tokio::test]
async fn test_shutdown_chat_sees_departures_before_returning() {
    let network = MemoryNetwork::new();
    let alice = node(&network, "alice");
    let bob = node(&network, "bob");
    let mut alice_chat = alice.chat_events();
    alice.connect_to_peer(bob.local_id()).await.unwrap();
    wait_joined(&mut alice_chat, &["bob"]).await;

    alice.shutdown().await;

    assert!(matches!(
        alice_chat.try_recv(),
        Ok(ChatEvent::PeerLeft { peer_id, .. }) if peer_id == pid("bob")
    ));
    assert!(alice.chat().known_peers().await.is_empty());
}

#[tokio::test]
async fn test_connect_to_self_rejected() {
    let network = MemoryNetwork::new();
    let alice = node(&network, "alice");

    let result = alice.connect_to_peer(&pid("alice")).await;

    assert!(matches!(result, Err(PeerlinkError::Session(_))));
}

#[tokio::test]
async fn test_send_chat_message_too_long_rejected() {
    let network = MemoryNetwork::new();
    let alice = node(&network, "alice");
    let bob = node(&network, "bob");
    let mut alice_chat = alice.chat_events();
    alice.connect_to_peer(bob.local_id()).await.unwrap();
    wait_joined(&mut alice_chat, &["bob"]).await;

    let result = alice.send_chat_message(&"x".repeat(100)).await;

    assert!(matches!(
        result,
        Err(PeerlinkError::Chat(ChatError::MessageTooLong { .. }))
    ));
}
