//! End-to-end tests against live managers on loopback sockets.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use quartz_core::{BlockSummary, ChainParams, OnlineAccountData};
use rand::RngCore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use quartz_network::handshake::proof_digest;
use quartz_network::message::{PeerId, Payload, PEER_ID_LENGTH, PROOF_NONCE_LENGTH};
use quartz_network::{
    Clock, Controller, FrameCodec, MemoryPeerRepository, Message, MessageType, NetworkConfig,
    NetworkManager, PeerAddress, PeerData, RepositoryManager, TESTNET_MAGIC,
};

fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Test clock: system time, with a switch to simulate lost synchronisation.
struct TestClock {
    synced: AtomicBool,
}

impl TestClock {
    fn synced() -> Arc<Self> {
        Arc::new(TestClock {
            synced: AtomicBool::new(true),
        })
    }

    fn unsynced() -> Arc<Self> {
        Arc::new(TestClock {
            synced: AtomicBool::new(false),
        })
    }
}

impl Clock for TestClock {
    fn now(&self) -> Option<i64> {
        self.synced
            .load(Ordering::SeqCst)
            .then(|| chrono::Utc::now().timestamp_millis())
    }
}

/// Controller that records everything it is told.
#[derive(Default)]
struct RecordingController {
    handshakes: Mutex<Vec<String>>,
    messages: Mutex<Vec<(String, MessageType)>>,
    /// First byte of every TRANSACTION body, in delivery order.
    transaction_tags: Mutex<Vec<u8>>,
}

impl Controller for RecordingController {
    fn on_peer_disconnect(&self, _peer: &Arc<quartz_network::Peer>) {}

    fn on_peer_handshake_completed(
        &self,
        _network: &Arc<NetworkManager>,
        peer: &Arc<quartz_network::Peer>,
    ) {
        self.handshakes.lock().unwrap().push(peer.to_string());
    }

    fn on_network_message(
        &self,
        _network: &Arc<NetworkManager>,
        peer: &Arc<quartz_network::Peer>,
        message: Message,
    ) {
        if let Payload::Transaction(data) = &message.payload {
            if let Some(first) = data.first() {
                self.transaction_tags.lock().unwrap().push(*first);
            }
        }
        self.messages
            .lock()
            .unwrap()
            .push((peer.to_string(), message.message_type()));
    }

    fn do_network_broadcast(&self, _network: &Arc<NetworkManager>) {}

    fn chain_tip(&self) -> BlockSummary {
        BlockSummary::new(42, vec![0x11; 128], 1_700_000_000_000, vec![0x22; 32])
    }

    fn online_accounts(&self) -> Vec<OnlineAccountData> {
        Vec::new()
    }
}

struct Node {
    network: Arc<NetworkManager>,
    controller: Arc<RecordingController>,
    repository: RepositoryManager,
}

async fn start_node(config: NetworkConfig, clock: Arc<TestClock>) -> Node {
    let controller = Arc::new(RecordingController::default());
    let repository = RepositoryManager::new(Box::new(MemoryPeerRepository::new()));
    let network = NetworkManager::start(
        config,
        ChainParams::testnet(),
        Arc::clone(&controller) as Arc<dyn Controller>,
        clock as Arc<dyn Clock>,
        repository.clone(),
    )
    .await
    .expect("network starts");
    Node {
        network,
        controller,
        repository,
    }
}

async fn seed_peer(repository: &RepositoryManager, address: &str) {
    let mut repo = repository.repository().await;
    let address = PeerAddress::parse(address, 20392).unwrap();
    repo.save(&PeerData::new(
        address,
        chrono::Utc::now().timestamp_millis(),
        "test",
    ))
    .unwrap();
    repo.save_changes().unwrap();
}

async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let poll = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(10), poll)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

fn random_peer_id() -> PeerId {
    let mut id = [0u8; PEER_ID_LENGTH];
    rand::rngs::OsRng.fill_bytes(&mut id);
    id[PEER_ID_LENGTH - 1] |= 0x01;
    id
}

fn proof_for(id: &PeerId) -> Payload {
    let mut nonce = [0u8; PROOF_NONCE_LENGTH];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    Payload::Proof {
        nonce,
        digest: proof_digest(id, &nonce),
    }
}

/// A hand-driven remote node speaking the wire protocol directly.
struct Wire {
    framed: Framed<TcpStream, FrameCodec>,
}

impl Wire {
    async fn connect(address: SocketAddr, max_message_size: usize) -> Self {
        let stream = TcpStream::connect(address).await.expect("wire connect");
        Self::from_stream(stream, max_message_size)
    }

    fn from_stream(stream: TcpStream, max_message_size: usize) -> Self {
        Wire {
            framed: Framed::new(stream, FrameCodec::new(TESTNET_MAGIC, max_message_size)),
        }
    }

    async fn send(&mut self, message: Message) {
        self.framed.send(message).await.expect("wire send");
    }

    async fn recv(&mut self) -> Message {
        tokio::time::timeout(Duration::from_secs(5), self.framed.next())
            .await
            .expect("wire recv timed out")
            .expect("wire closed")
            .expect("wire decode failed")
    }

    async fn expect(&mut self, kind: MessageType) -> Message {
        let message = self.recv().await;
        assert_eq!(message.message_type(), kind, "unexpected {message:?}");
        message
    }

    /// Full handshake on a connection we initiated (we drive).
    async fn handshake_out(&mut self, our_id: &PeerId) {
        self.send(Message::new(Payload::Version { version: 2 })).await;
        self.expect(MessageType::Version).await;
        self.send(Message::new(Payload::PeerId(*our_id))).await;
        self.expect(MessageType::PeerId).await;
        self.send(Message::new(proof_for(our_id))).await;
        self.expect(MessageType::Proof).await;
    }

    /// Full handshake on a connection the manager initiated (we mirror).
    async fn handshake_in(&mut self, our_id: &PeerId) {
        self.expect(MessageType::Version).await;
        self.send(Message::new(Payload::Version { version: 2 })).await;
        self.expect(MessageType::PeerId).await;
        self.send(Message::new(Payload::PeerId(*our_id))).await;
        self.expect(MessageType::Proof).await;
        self.send(Message::new(proof_for(our_id))).await;
    }
}

#[tokio::test]
async fn test_two_nodes_handshake_and_gossip() {
    init_logging();
    // B only listens, so the peer counts below stay deterministic.
    let mut config_b = NetworkConfig::for_testing();
    config_b.min_outbound_peers = 0;
    let node_b = start_node(config_b, TestClock::synced()).await;
    let b_address = node_b.network.local_address();

    let node_a = start_node(NetworkConfig::for_testing(), TestClock::synced()).await;
    seed_peer(&node_a.repository, &b_address.to_string()).await;

    // A dials B and both sides complete the handshake.
    let a = Arc::clone(&node_a.network);
    let b = Arc::clone(&node_b.network);
    wait_for("outbound handshake on A", || {
        a.outbound_handshaked_peers().len() == 1
    })
    .await;
    wait_for("inbound handshake on B", || b.handshaked_peers().len() == 1).await;

    assert_eq!(node_a.controller.handshakes.lock().unwrap().len(), 1);
    assert_eq!(node_b.controller.handshakes.lock().unwrap().len(), 1);

    // A's post-handshake HEIGHT_V2 reaches B's controller.
    let b_controller = Arc::clone(&node_b.controller);
    wait_for("height delivered to B", move || {
        b_controller
            .messages
            .lock()
            .unwrap()
            .iter()
            .any(|(_, kind)| *kind == MessageType::HeightV2)
    })
    .await;

    // A's PEERS_V2 told B which port A actually listens on.
    let a_listen = PeerAddress::parse(
        &node_a.network.local_address().to_string(),
        20392,
    )
    .unwrap();
    let b_repository = node_b.repository.clone();
    wait_for("A's listen address merged into B", move || {
        let Some(repo) = b_repository.try_repository() else {
            return false;
        };
        repo.get_all_peers()
            .unwrap()
            .iter()
            .any(|peer| peer.address() == &a_listen)
    })
    .await;

    // B's record in A's repository now carries a successful connection.
    {
        let repo = node_a.repository.repository().await;
        let peers = repo.get_all_peers().unwrap();
        let record = peers
            .iter()
            .find(|peer| peer.address().port() == b_address.port())
            .expect("B still known to A");
        assert!(record.last_connected().is_some());
        assert!(record.last_attempted().unwrap() >= record.first_seen());
    }

    node_a.network.shutdown().await;
    wait_for("A fully disconnected", || a.connected_peers().is_empty()).await;
    wait_for("B noticed the disconnect", || {
        b.connected_peers().is_empty()
    })
    .await;
    node_b.network.shutdown().await;
}

#[tokio::test]
async fn test_self_connect_detection() {
    init_logging();
    let node = start_node(NetworkConfig::for_testing(), TestClock::synced()).await;
    let own_address = node.network.local_address();
    seed_peer(&node.repository, &own_address.to_string()).await;

    let network = Arc::clone(&node.network);
    wait_for("self peer noted", || !network.self_peers().is_empty()).await;
    wait_for("both ends dropped", || network.connected_peers().is_empty()).await;

    // The address is now blacklisted from candidate selection.
    let now = chrono::Utc::now().timestamp_millis();
    // Past the connect-failure backoff, the only exclusion left is "self".
    assert!(node
        .network
        .get_connectable_peer(now + 6 * 60 * 1000)
        .await
        .is_none());
    assert!(node.controller.handshakes.lock().unwrap().is_empty());

    node.network.shutdown().await;
}

#[tokio::test]
async fn test_ping_reply_and_in_order_delivery() {
    init_logging();
    let node = start_node(NetworkConfig::for_testing(), TestClock::synced()).await;
    let max = node.network.max_message_size();

    let our_id = random_peer_id();
    let mut wire = Wire::connect(node.network.local_address(), max).await;
    wire.handshake_out(&our_id).await;

    // Ping correlates by id.
    wire.send(Message::with_id(77, Payload::Ping)).await;
    let pong = wire.expect(MessageType::Ping).await;
    assert_eq!(pong.id, 77);

    // Messages on one connection reach the controller in arrival order.
    for index in 0..5u8 {
        wire.send(Message::new(Payload::Transaction(vec![index; 8])))
            .await;
    }
    let controller = Arc::clone(&node.controller);
    wait_for("all transactions delivered", move || {
        controller
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, kind)| *kind == MessageType::Transaction)
            .count()
            == 5
    })
    .await;
    // Arrival order is preserved end to end.
    assert_eq!(
        *node.controller.transaction_tags.lock().unwrap(),
        vec![0, 1, 2, 3, 4]
    );

    node.network.shutdown().await;
}

#[tokio::test]
async fn test_doppelganger_verification_success() {
    init_logging();
    let node = start_node(NetworkConfig::for_testing(), TestClock::synced()).await;
    let max = node.network.max_message_size();
    let shared_id = random_peer_id();

    // Inbound connection X claiming the shared id, fully handshaked.
    let mut x = Wire::connect(node.network.local_address(), max).await;
    x.handshake_out(&shared_id).await;
    let network = Arc::clone(&node.network);
    wait_for("X handshaked", || network.handshaked_peers().len() == 1).await;

    // Outbound connection Y to a scripted listener presenting the same id.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    seed_peer(
        &node.repository,
        &listener.local_addr().unwrap().to_string(),
    )
    .await;
    let (stream, _) = tokio::time::timeout(Duration::from_secs(10), listener.accept())
        .await
        .expect("manager dialled out")
        .unwrap();
    let mut y = Wire::from_stream(stream, max);
    y.handshake_in(&shared_id).await;

    // Ambiguity detected: Y gets challenge codes instead of completing.
    let codes = y.expect(MessageType::VerificationCodes).await;
    let (code_sent, code_expected) = match codes.payload {
        Payload::VerificationCodes {
            code_sent,
            code_expected,
        } => (code_sent, code_expected),
        other => panic!("unexpected payload {other:?}"),
    };

    // Prove we hold both ends: echo the sent code over X.
    x.send(Message::new(Payload::PeerVerify(code_sent))).await;

    // The expected code comes back over Y, and Y completes.
    let verify = y.expect(MessageType::PeerVerify).await;
    assert_eq!(verify.payload, Payload::PeerVerify(code_expected));
    wait_for("Y handshaked", || {
        network.outbound_handshaked_peers().len() == 1
    })
    .await;

    // Completion brings the usual outbound bootstrap traffic.
    y.expect(MessageType::HeightV2).await;
    y.expect(MessageType::PeersV2).await;
    y.expect(MessageType::GetPeers).await;

    node.network.shutdown().await;
}

#[tokio::test]
async fn test_doppelganger_verification_mismatch() {
    init_logging();
    let node = start_node(NetworkConfig::for_testing(), TestClock::synced()).await;
    let max = node.network.max_message_size();
    let shared_id = random_peer_id();

    let mut x = Wire::connect(node.network.local_address(), max).await;
    x.handshake_out(&shared_id).await;
    let network = Arc::clone(&node.network);
    wait_for("X handshaked", || network.handshaked_peers().len() == 1).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    seed_peer(
        &node.repository,
        &listener.local_addr().unwrap().to_string(),
    )
    .await;
    let (stream, _) = tokio::time::timeout(Duration::from_secs(10), listener.accept())
        .await
        .expect("manager dialled out")
        .unwrap();
    let mut y = Wire::from_stream(stream, max);
    y.handshake_in(&shared_id).await;
    y.expect(MessageType::VerificationCodes).await;

    // Wrong code: both connections must go.
    x.send(Message::new(Payload::PeerVerify([0xde; 32]))).await;
    wait_for("both ends dropped", || network.connected_peers().is_empty()).await;

    node.network.shutdown().await;
}

#[tokio::test]
async fn test_oversize_frame_disconnects() {
    init_logging();
    let node = start_node(NetworkConfig::for_testing(), TestClock::synced()).await;
    let max = node.network.max_message_size();

    let mut stream = TcpStream::connect(node.network.local_address())
        .await
        .unwrap();
    let network = Arc::clone(&node.network);
    wait_for("connection registered", || {
        network.connected_peers().len() == 1
    })
    .await;

    // Valid header declaring an oversize payload; no body follows.
    let mut header = Vec::new();
    header.extend_from_slice(&TESTNET_MAGIC);
    header.extend_from_slice(&8u32.to_be_bytes()); // TRANSACTION
    header.extend_from_slice(&0i32.to_be_bytes());
    header.extend_from_slice(&((max as u32) + 1).to_be_bytes());
    stream.write_all(&header).await.unwrap();

    wait_for("peer dropped", || network.connected_peers().is_empty()).await;

    // The socket is closed underneath us.
    let mut buffer = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buffer)).await;
    assert!(matches!(read, Ok(Ok(0)) | Ok(Err(_))));

    node.network.shutdown().await;
}

#[tokio::test]
async fn test_outbound_candidate_selection() {
    init_logging();
    let mut config = NetworkConfig::for_testing();
    // Keep the produce loop out of the way; we drive selection directly.
    config.min_outbound_peers = 0;
    let node = start_node(config, TestClock::synced()).await;

    for index in 0..5 {
        seed_peer(&node.repository, &format!("127.0.0.1:{}", 40000 + index)).await;
    }
    let now = chrono::Utc::now().timestamp_millis();

    // Each pick is distinct and persists its attempt before any dialling.
    let mut picked = Vec::new();
    for _ in 0..5 {
        let candidate = node
            .network
            .get_connectable_peer(now)
            .await
            .expect("candidate available");
        assert_eq!(candidate.last_attempted(), Some(now));
        assert!(!picked.contains(candidate.address()));
        picked.push(candidate.address().clone());

        let repo = node.repository.repository().await;
        let stored = repo
            .get_all_peers()
            .unwrap()
            .into_iter()
            .find(|peer| peer.address() == picked.last().unwrap())
            .unwrap();
        assert_eq!(stored.last_attempted(), Some(now));
    }

    // Every candidate is now inside the failure backoff window.
    assert!(node.network.get_connectable_peer(now).await.is_none());

    node.network.shutdown().await;
}

#[tokio::test]
async fn test_prune_drops_doubly_stale_records() {
    init_logging();
    let mut config = NetworkConfig::for_testing();
    config.min_outbound_peers = 0;
    let node = start_node(config, TestClock::synced()).await;

    let now = chrono::Utc::now().timestamp_millis();
    let day = 24 * 60 * 60 * 1000i64;

    let stale_address = PeerAddress::parse("203.0.113.1:4444", 20392).unwrap();
    let mut stale = PeerData::new(stale_address.clone(), now - 30 * day, "test");
    stale.record_connection(now - 10 * day);
    stale.record_attempt(now - 2 * day);

    let fresh_address = PeerAddress::parse("203.0.113.2:4444", 20392).unwrap();
    let mut fresh = PeerData::new(fresh_address.clone(), now - 30 * day, "test");
    fresh.record_connection(now - 60 * 60 * 1000);

    {
        let mut repo = node.repository.repository().await;
        repo.save(&stale).unwrap();
        repo.save(&fresh).unwrap();
        repo.save_changes().unwrap();
    }

    node.network.prune_peers().await;

    let repo = node.repository.repository().await;
    let remaining: Vec<PeerAddress> = repo
        .get_all_peers()
        .unwrap()
        .into_iter()
        .map(|peer| peer.address().clone())
        .collect();
    assert!(!remaining.contains(&stale_address), "stale peer pruned");
    assert!(remaining.contains(&fresh_address), "fresh peer kept");
    drop(repo);

    node.network.shutdown().await;
}

#[tokio::test]
async fn test_merge_peers_is_idempotent() {
    init_logging();
    let node = start_node(NetworkConfig::for_testing(), TestClock::synced()).await;

    let addresses = vec![
        PeerAddress::parse("203.0.113.1:4444", 20392).unwrap(),
        PeerAddress::parse("203.0.113.2:4444", 20392).unwrap(),
        // In-batch duplicate collapses too.
        PeerAddress::parse("203.0.113.1:4444", 20392).unwrap(),
    ];

    node.network
        .merge_peers("test".to_string(), addresses.clone())
        .await;
    node.network
        .merge_peers("test".to_string(), addresses)
        .await;

    let repo = node.repository.repository().await;
    assert_eq!(repo.get_all_peers().unwrap().len(), 2);
    drop(repo);

    node.network.shutdown().await;
}

#[tokio::test]
async fn test_unsynced_clock_suspends_scheduling() {
    init_logging();
    let node = start_node(NetworkConfig::for_testing(), TestClock::unsynced()).await;
    seed_peer(&node.repository, "127.0.0.1:40999").await;

    tokio::time::sleep(Duration::from_millis(1500)).await;

    // No connection attempts were made while time is unknown.
    let repo = node.repository.repository().await;
    let peers = repo.get_all_peers().unwrap();
    assert_eq!(peers.len(), 1);
    assert!(peers[0].last_attempted().is_none());
    drop(repo);

    // Inbound connections are discarded as well.
    let mut stream = TcpStream::connect(node.network.local_address())
        .await
        .unwrap();
    let mut buffer = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buffer)).await;
    assert!(matches!(read, Ok(Ok(0)) | Ok(Err(_))));
    assert!(node.network.connected_peers().is_empty());

    node.network.shutdown().await;
}
