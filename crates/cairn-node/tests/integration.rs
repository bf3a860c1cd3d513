//! Integration tests for the Cairn node
//!
//! Several nodes share an in-memory signaling network, each with its own
//! store and keyring, and talk over the real wire protocol.

use bytes::Bytes;
use cairn_core::chain::{self, ChainBreak};
use cairn_core::erasure::ErasureConfig;
use cairn_core::keys::Keyring;
use cairn_core::proto::{self, Envelope, Payload};
use cairn_core::store::{load_block, save_block, BlockStore, MemoryStore};
use cairn_core::transport::memory::MemoryNetwork;
use cairn_core::{Block, Error, PeerId, Signaling};
use cairn_mesh::session::ConnectionState;
use cairn_node::{BlockSource, Node, NodeEvent, NodeHandle, NodeSettings, SqliteStore};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast::{self, error::RecvError};

struct TestNode {
    handle: NodeHandle,
    store: MemoryStore,
}

fn settings(chunk_size: usize) -> NodeSettings {
    let mut settings = NodeSettings {
        chunk_size,
        ..NodeSettings::default()
    };
    settings.mesh.gossip_jitter = Duration::from_millis(20);
    settings
}

fn spawn_node(network: &MemoryNetwork, id: &str, settings: NodeSettings) -> TestNode {
    let (signaling, incoming) = network.join(id).unwrap();
    let store = MemoryStore::new();
    let handle = Node::spawn(signaling, incoming, store.clone(), Keyring::generate(false), settings);
    TestNode { handle, store }
}

fn sample_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

async fn next_event(
    events: &mut broadcast::Receiver<NodeEvent>,
    mut matches: impl FnMut(&NodeEvent) -> bool,
) -> NodeEvent {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn open_peers(node: &NodeHandle) -> Vec<String> {
    let mut peers: Vec<String> = node
        .list_peers()
        .await
        .unwrap()
        .into_iter()
        .filter(|p| p.connection_state == ConnectionState::Open)
        .map(|p| p.id.to_string())
        .collect();
    peers.sort();
    peers
}

async fn wait_for_peers(node: &NodeHandle, expected: &[&str]) {
    for _ in 0..500 {
        if open_peers(node).await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "{} expected open peers {:?}, has {:?}",
        node.local_id(),
        expected,
        open_peers(node).await
    );
}

/// Upload of 1 MiB with 256 KiB chunks yields four chained blocks
#[tokio::test]
async fn test_upload_builds_chain() {
    let network = MemoryNetwork::new();
    let alice = spawn_node(&network, "alice", NodeSettings::default());

    let data = sample_data(1024 * 1024);
    let record = alice.handle.upload(data.clone(), "archive.bin").await.unwrap();
    assert_eq!(record.block_ids.len(), 4);
    assert_eq!(record.size, 1024 * 1024);

    let blocks: Vec<_> = record
        .block_ids
        .iter()
        .map(|id| load_block(&alice.store, id).unwrap().unwrap())
        .collect();
    assert!(blocks[0].previous_hash.is_none());
    for i in 1..blocks.len() {
        assert_eq!(blocks[i].previous_hash, Some(blocks[i - 1].hash));
        assert_eq!(blocks[i].sequence_index, i as u32);
    }
    assert!(chain::verify(&blocks).is_ok());

    assert_eq!(alice.handle.download(record.id).await.unwrap(), data);
}

/// Connected peers receive every block of an upload without asking
#[tokio::test]
async fn test_upload_replicates_by_broadcast() {
    let network = MemoryNetwork::new();
    let alice = spawn_node(&network, "alice", settings(1024));
    let bob = spawn_node(&network, "bob", settings(1024));

    alice.handle.connect(PeerId::from("bob")).await.unwrap();
    wait_for_peers(&bob.handle, &["alice"]).await;

    let mut alice_events = alice.handle.subscribe();
    let mut bob_events = bob.handle.subscribe();

    let record = alice.handle.upload(sample_data(3000), "notes.txt").await.unwrap();
    assert_eq!(record.block_ids.len(), 3);

    for _ in 0..record.block_ids.len() {
        next_event(&mut bob_events, |e| {
            matches!(e, NodeEvent::BlockReceived { source: BlockSource::Broadcast, .. })
        })
        .await;
    }
    for id in &record.block_ids {
        assert!(bob.store.has_block(id).unwrap());
    }

    // Nothing was requested from alice
    while let Ok(event) = alice_events.try_recv() {
        assert!(!matches!(event, NodeEvent::BlockRequested { .. }), "{:?}", event);
    }
    let stats = bob.handle.get_stats().await.unwrap();
    assert_eq!(stats.block_count, 3);
    assert_eq!(stats.peer_count, 1);
}

/// A block missing locally is fetched from a peer that holds it
#[tokio::test]
async fn test_missing_block_fetched_from_peer() {
    let network = MemoryNetwork::new();
    let mut alice = spawn_node(&network, "alice", settings(1024));
    let bob = spawn_node(&network, "bob", settings(1024));

    alice.handle.connect(PeerId::from("bob")).await.unwrap();
    wait_for_peers(&bob.handle, &["alice"]).await;

    let mut bob_events = bob.handle.subscribe();
    let data = sample_data(4000);
    let record = alice.handle.upload(data.clone(), "a.bin").await.unwrap();
    for _ in 0..record.block_ids.len() {
        next_event(&mut bob_events, |e| matches!(e, NodeEvent::BlockReceived { .. })).await;
    }

    let lost = record.block_ids[2];
    alice.store.delete_block(&lost).unwrap();

    let mut alice_events = alice.handle.subscribe();
    assert_eq!(alice.handle.download(record.id).await.unwrap(), data);

    let served = next_event(&mut bob_events, |e| matches!(e, NodeEvent::BlockRequested { .. })).await;
    assert!(matches!(served, NodeEvent::BlockRequested { block_id, found: true, .. } if block_id == lost));
    let received = next_event(&mut alice_events, |e| matches!(e, NodeEvent::BlockReceived { .. })).await;
    assert!(matches!(
        received,
        NodeEvent::BlockReceived { block_id, source: BlockSource::Response, .. } if block_id == lost
    ));
    assert!(alice.store.has_block(&lost).unwrap());
}

/// A peer that does not hold a block stays silent and the request times out
#[tokio::test]
async fn test_unknown_block_is_unavailable() {
    let network = MemoryNetwork::new();
    let mut settings_fast = settings(1024);
    settings_fast.mesh.request_timeout = Duration::from_millis(200);
    let mut alice = spawn_node(&network, "alice", settings_fast);
    let bob = spawn_node(&network, "bob", settings(1024));

    let record = alice.handle.upload(sample_data(2000), "a.bin").await.unwrap();
    alice.handle.connect(PeerId::from("bob")).await.unwrap();
    wait_for_peers(&bob.handle, &["alice"]).await;

    let mut bob_events = bob.handle.subscribe();
    alice.store.delete_block(&record.block_ids[0]).unwrap();

    let result = alice.handle.download(record.id).await;
    assert!(matches!(result, Err(Error::BlockUnavailable(id)) if id == record.block_ids[0]));
    let asked = next_event(&mut bob_events, |e| matches!(e, NodeEvent::BlockRequested { .. })).await;
    assert!(matches!(asked, NodeEvent::BlockRequested { found: false, .. }));
}

/// With k=10, m=4, losing two data blocks and one parity block is survivable
#[tokio::test]
async fn test_erasure_recovery() {
    let network = MemoryNetwork::new();
    let mut node_settings = settings(1024);
    node_settings.erasure = Some(ErasureConfig {
        data_shards: 10,
        parity_shards: 4,
    });
    let mut alice = spawn_node(&network, "alice", node_settings);

    let data = sample_data(10 * 1024);
    let record = alice.handle.upload(data.clone(), "video.bin").await.unwrap();
    let layout = record.erasure.clone().unwrap();
    assert_eq!(record.block_ids.len(), 10);
    assert_eq!(layout.groups.len(), 1);
    assert_eq!(layout.groups[0].parity_block_ids.len(), 4);
    assert_eq!(record.all_block_ids().len(), 14);

    alice.store.delete_block(&record.block_ids[1]).unwrap();
    alice.store.delete_block(&record.block_ids[7]).unwrap();
    alice.store.delete_block(&layout.groups[0].parity_block_ids[2]).unwrap();

    assert_eq!(alice.handle.download(record.id).await.unwrap(), data);
}

#[tokio::test]
async fn test_erasure_too_many_losses() {
    let network = MemoryNetwork::new();
    let mut node_settings = settings(1024);
    node_settings.erasure = Some(ErasureConfig {
        data_shards: 4,
        parity_shards: 2,
    });
    let mut alice = spawn_node(&network, "alice", node_settings);

    let record = alice.handle.upload(sample_data(4096), "a.bin").await.unwrap();
    for id in &record.block_ids[..3] {
        alice.store.delete_block(id).unwrap();
    }

    let result = alice.handle.download(record.id).await;
    assert!(matches!(result, Err(Error::InsufficientShards { have: 3, need: 4 })));
}

/// A tampered hash is caught before anything is decrypted
#[tokio::test]
async fn test_tampered_block_fails_integrity() {
    let network = MemoryNetwork::new();
    let mut alice = spawn_node(&network, "alice", settings(1024));

    let record = alice.handle.upload(sample_data(5000), "a.bin").await.unwrap();
    let target = record.block_ids[2];
    let mut block = load_block(&alice.store, &target).unwrap().unwrap();
    block.hash[0] ^= 0xff;
    save_block(&mut alice.store, &block).unwrap();

    let result = alice.handle.download(record.id).await;
    assert!(matches!(
        result,
        Err(Error::ChainIntegrity {
            index: 2,
            reason: ChainBreak::HashMismatch
        })
    ));
}

/// An unresponsive peer exhausts the retry budget with backoff
#[tokio::test(start_paused = true)]
async fn test_unreachable_peer() {
    let network = MemoryNetwork::new();
    let alice = spawn_node(&network, "alice", settings(1024));
    let _bob = spawn_node(&network, "bob", settings(1024));
    network.set_unresponsive(&PeerId::from("bob"), true).unwrap();

    let mut events = alice.handle.subscribe();
    let started = tokio::time::Instant::now();
    let result = alice.handle.connect(PeerId::from("bob")).await;

    assert!(matches!(result, Err(Error::Unreachable { attempts: 3, .. })));
    // Three 30 s timeouts plus 5 s and 10 s of backoff
    assert!(started.elapsed() >= Duration::from_secs(105));

    let mut delays = vec![];
    let mut unreachable = false;
    while let Ok(event) = events.try_recv() {
        match event {
            NodeEvent::ConnectFailed { retry_in, .. } => delays.push(retry_in),
            NodeEvent::PeerUnreachable { attempts, .. } => {
                assert_eq!(attempts, 3);
                unreachable = true;
            }
            _ => {}
        }
    }
    assert_eq!(
        delays,
        vec![Some(Duration::from_secs(5)), Some(Duration::from_secs(10)), None]
    );
    assert!(unreachable);
    assert!(alice.handle.list_peers().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_self_connection_rejected() {
    let network = MemoryNetwork::new();
    let alice = spawn_node(&network, "alice", settings(1024));
    let result = alice.handle.connect(PeerId::from("alice")).await;
    assert!(matches!(result, Err(Error::SelfConnection)));
}

#[tokio::test]
async fn test_connect_twice_yields_one_session() {
    let network = MemoryNetwork::new();
    let alice = spawn_node(&network, "alice", settings(1024));
    let bob = spawn_node(&network, "bob", settings(1024));

    let (first, second) = tokio::join!(
        alice.handle.connect(PeerId::from("bob")),
        alice.handle.connect(PeerId::from("bob"))
    );
    first.unwrap();
    second.unwrap();
    alice.handle.connect(PeerId::from("bob")).await.unwrap();

    assert_eq!(alice.handle.list_peers().await.unwrap().len(), 1);
    wait_for_peers(&bob.handle, &["alice"]).await;
}

#[tokio::test]
async fn test_simultaneous_connect_settles_on_one_session() {
    let network = MemoryNetwork::new();
    let alice = spawn_node(&network, "alice", settings(1024));
    let bob = spawn_node(&network, "bob", settings(1024));

    let (a, b) = tokio::join!(
        alice.handle.connect(PeerId::from("bob")),
        bob.handle.connect(PeerId::from("alice"))
    );
    a.unwrap();
    b.unwrap();

    wait_for_peers(&alice.handle, &["bob"]).await;
    wait_for_peers(&bob.handle, &["alice"]).await;
    assert_eq!(alice.handle.list_peers().await.unwrap().len(), 1);
    assert_eq!(bob.handle.list_peers().await.unwrap().len(), 1);
}

/// A newcomer learns about existing peers through peer exchange
#[tokio::test]
async fn test_gossip_discovers_peers() {
    let network = MemoryNetwork::new();
    let alice = spawn_node(&network, "alice", settings(1024));
    let bob = spawn_node(&network, "bob", settings(1024));
    let carol = spawn_node(&network, "carol", settings(1024));

    alice.handle.connect(PeerId::from("bob")).await.unwrap();
    wait_for_peers(&bob.handle, &["alice"]).await;

    // carol only knows bob; bob's peer list leads her to alice
    carol.handle.connect(PeerId::from("bob")).await.unwrap();
    wait_for_peers(&carol.handle, &["alice", "bob"]).await;
    wait_for_peers(&alice.handle, &["bob", "carol"]).await;
}

#[tokio::test]
async fn test_relayed_path_reported() {
    let network = MemoryNetwork::new();
    let alice = spawn_node(&network, "alice", settings(1024));
    let _bob = spawn_node(&network, "bob", settings(1024));
    network.set_relay_only(&PeerId::from("bob"), true).unwrap();

    let mut events = alice.handle.subscribe();
    alice.handle.connect(PeerId::from("bob")).await.unwrap();
    let connected = next_event(&mut events, |e| matches!(e, NodeEvent::PeerConnected { .. })).await;
    assert!(matches!(connected, NodeEvent::PeerConnected { path, .. } if !path.is_direct()));

    let peers = alice.handle.list_peers().await.unwrap();
    assert!(!peers[0].is_direct);
}

#[tokio::test]
async fn test_disconnect_closes_both_sides() {
    let network = MemoryNetwork::new();
    let alice = spawn_node(&network, "alice", settings(1024));
    let bob = spawn_node(&network, "bob", settings(1024));

    alice.handle.connect(PeerId::from("bob")).await.unwrap();
    wait_for_peers(&bob.handle, &["alice"]).await;

    let mut bob_events = bob.handle.subscribe();
    alice.handle.disconnect(PeerId::from("bob")).await.unwrap();
    assert!(alice.handle.list_peers().await.unwrap().is_empty());

    let gone = next_event(&mut bob_events, |e| matches!(e, NodeEvent::PeerDisconnected { .. })).await;
    assert!(matches!(gone, NodeEvent::PeerDisconnected { peer } if peer.as_str() == "alice"));
    assert!(bob.handle.list_peers().await.unwrap().is_empty());

    assert!(matches!(
        alice.handle.disconnect(PeerId::from("bob")).await,
        Err(Error::NotFound(_))
    ));
}

/// Losing the only asked peer fails a pending fetch without waiting out the timeout
#[tokio::test(start_paused = true)]
async fn test_session_close_fails_pending_fetch() {
    let network = MemoryNetwork::new();
    let mut alice_settings = settings(1024);
    alice_settings.mesh.request_timeout = Duration::from_secs(60);
    let mut alice = spawn_node(&network, "alice", alice_settings);
    let bob = spawn_node(&network, "bob", settings(1024));

    // Uploaded before connecting, so bob never holds it
    let record = alice.handle.upload(sample_data(2000), "a.bin").await.unwrap();
    alice.handle.connect(PeerId::from("bob")).await.unwrap();
    wait_for_peers(&bob.handle, &["alice"]).await;

    let lost = record.block_ids[0];
    alice.store.delete_block(&lost).unwrap();
    let mut bob_events = bob.handle.subscribe();

    let file_id = record.id;
    let started = tokio::time::Instant::now();
    let download = tokio::spawn({
        let handle = alice.handle.clone();
        async move { handle.download(file_id).await }
    });

    let asked = next_event(&mut bob_events, |e| matches!(e, NodeEvent::BlockRequested { .. })).await;
    assert!(matches!(asked, NodeEvent::BlockRequested { block_id, found: false, .. } if block_id == lost));
    bob.handle.disconnect(PeerId::from("alice")).await.unwrap();

    let result = download.await.unwrap();
    assert!(matches!(result, Err(Error::BlockUnavailable(id)) if id == lost));
    assert!(started.elapsed() < Duration::from_secs(60));
    assert!(alice.handle.list_peers().await.unwrap().is_empty());
}

/// A broadcast block whose hash does not cover its payload is dropped
#[tokio::test]
async fn test_tampered_broadcast_not_stored() {
    let network = MemoryNetwork::new();
    let bob = spawn_node(&network, "bob", settings(1024));
    let (mallory, _incoming) = network.join("mallory").unwrap();
    let mut bob_events = bob.handle.subscribe();

    let channel = mallory.dial(&PeerId::from("bob")).await.unwrap();
    next_event(&mut bob_events, |e| matches!(e, NodeEvent::PeerConnected { .. })).await;

    let mut tampered = Block::new(b"tampered payload".to_vec(), 0).unwrap();
    tampered.payload[0] ^= 0x01;
    let intact = Block::new(b"intact payload".to_vec(), 0).unwrap();
    for envelope in [
        proto::handshake("mallory"),
        proto::block_broadcast(&tampered),
        proto::block_broadcast(&intact),
    ] {
        channel.tx.send(Bytes::from(envelope.to_bytes())).unwrap();
    }

    // The tampered block never produces an event, so the first is the intact one
    let received = next_event(&mut bob_events, |e| matches!(e, NodeEvent::BlockReceived { .. })).await;
    assert!(matches!(
        received,
        NodeEvent::BlockReceived { block_id, source: BlockSource::Broadcast, .. } if block_id == intact.id
    ));
    assert!(bob.store.has_block(&intact.id).unwrap());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!bob.store.has_block(&tampered.id).unwrap());
    while let Ok(event) = bob_events.try_recv() {
        assert!(!matches!(event, NodeEvent::BlockReceived { .. }), "{:?}", event);
    }
    assert_eq!(open_peers(&bob.handle).await, vec!["mallory"]);
}

/// A peer dialing again over an open session swaps the channel silently
#[tokio::test]
async fn test_replaced_channel_reported_once() {
    let network = MemoryNetwork::new();
    let bob = spawn_node(&network, "bob", settings(1024));
    let (alice, _incoming) = network.join("alice").unwrap();
    let mut bob_events = bob.handle.subscribe();

    let mut first = alice.dial(&PeerId::from("bob")).await.unwrap();
    let mut second = alice.dial(&PeerId::from("bob")).await.unwrap();

    // Bob greets each channel after handling its open
    let greeting = tokio::time::timeout(Duration::from_secs(10), second.rx.recv())
        .await
        .unwrap()
        .unwrap();
    let envelope = Envelope::from_bytes(&greeting).unwrap();
    assert!(matches!(envelope.payload, Some(Payload::Handshake(_))));

    // The replaced channel is dropped by bob
    tokio::time::timeout(Duration::from_secs(10), async {
        while first.rx.recv().await.is_some() {}
    })
    .await
    .unwrap();

    assert_eq!(open_peers(&bob.handle).await, vec!["alice"]);
    let mut connected = 0;
    while let Ok(event) = bob_events.try_recv() {
        match event {
            NodeEvent::PeerConnected { .. } => connected += 1,
            NodeEvent::PeerDisconnected { .. } => panic!("replacement reported as disconnect"),
            _ => {}
        }
    }
    assert_eq!(connected, 1);
}

#[tokio::test]
async fn test_peer_stats_exchanged() {
    let network = MemoryNetwork::new();
    let alice = spawn_node(&network, "alice", settings(1024));
    let bob = spawn_node(&network, "bob", settings(1024));

    bob.handle.upload(sample_data(2500), "a.bin").await.unwrap();
    alice.handle.connect(PeerId::from("bob")).await.unwrap();

    for _ in 0..500 {
        let peers = alice.handle.list_peers().await.unwrap();
        if let Some(stats) = peers.first().and_then(|p| p.remote_stats) {
            assert_eq!(stats.block_count, 3);
            assert!(stats.storage_used > 2500);
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("storage stats never arrived");
}

/// Files survive a restart of a node backed by SQLite
#[tokio::test]
async fn test_sqlite_node_restart() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("cairn.db");
    let keyring = Keyring::generate(false);
    let data = sample_data(3000);

    let file_id = {
        let network = MemoryNetwork::new();
        let (signaling, incoming) = network.join("alice").unwrap();
        let store = SqliteStore::open(&db_path).unwrap();
        let node = Node::spawn(signaling, incoming, store, keyring.clone(), settings(1024));
        let record = node.upload(data.clone(), "keep.txt").await.unwrap();
        node.shutdown().await.unwrap();
        record.id
    };

    let network = MemoryNetwork::new();
    let (signaling, incoming) = network.join("alice").unwrap();
    let store = SqliteStore::open(&db_path).unwrap();
    let node = Node::spawn(signaling, incoming, store, keyring, settings(1024));

    let files = node.list_files().await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].name, "keep.txt");
    assert_eq!(node.download(file_id).await.unwrap(), data);
}
