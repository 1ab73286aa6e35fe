//! Two in-memory peers connect, exchange keys, chat, and trade positions.
//!
//! Run with `RUST_LOG=debug` to watch the session lifecycle.

use std::time::Duration;

use peerlink::prelude::*;
use tokio::sync::{broadcast, watch};

/// Waits until `rx` reports `PeerJoined` for `peer_id`.
async fn joined(rx: &mut broadcast::Receiver<ChatEvent>, peer_id: &PeerId) -> Result<(), PeerlinkError> {
    loop {
        match rx.recv().await {
            Ok(ChatEvent::PeerJoined { peer_id: id, .. }) if &id == peer_id => return Ok(()),
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => {
                return Err(ChatError::KeysUnavailable.into());
            }
        }
    }
}

fn print_event(owner: &PeerId, event: &ChatEvent) {
    match serde_json::to_string(event) {
        Ok(json) => println!("[{owner}] {json}"),
        Err(e) => tracing::warn!(error = %e, "unprintable chat event"),
    }
}

#[tokio::main]
async fn main() -> Result<(), PeerlinkError> {
    init_tracing();

    let network = MemoryNetwork::new();
    let alice = Node::builder().build_in_memory(&network)?;
    let bob = Node::builder().build_in_memory(&network)?;
    let mut alice_chat = alice.chat_events();
    let mut bob_chat = bob.chat_events();
    let mut bob_game = bob.game_events();

    alice.connect_to_peer(bob.local_id()).await?;
    joined(&mut alice_chat, bob.local_id()).await?;
    joined(&mut bob_chat, alice.local_id()).await?;
    println!("{} and {} exchanged keys", alice.local_id(), bob.local_id());

    alice.send_chat_message("hello bob").await?;
    bob.send_chat_message("hi alice, loud and clear").await?;

    let (position_tx, position_rx) = watch::channel(Vector3::default());
    let ticker = alice.spawn_position_ticker(position_rx)?;
    for step in 1..=3 {
        let _ = position_tx.send(Vector3::new(f64::from(step), 0.0, 0.0));
        tokio::time::sleep(Duration::from_millis(150)).await;
    }
    ticker.abort();

    alice
        .send_world_action(&WorldAction::RadialExplosion(RadialExplosion {
            radius: 5.0,
            position: Vector3::new(3.0, 0.0, 0.0),
            strength: 12.0,
        }))
        .await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    while let Ok(event) = bob_game.try_recv() {
        println!("[{}] {} from {}", bob.local_id(), event.kind(), event.from);
    }
    for event in alice.chat_history() {
        print_event(alice.local_id(), &event);
    }
    for event in bob.chat_history() {
        print_event(bob.local_id(), &event);
    }

    alice.shutdown().await;
    bob.shutdown().await;
    Ok(())
}
