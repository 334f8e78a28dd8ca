//! Top-level network coordinator.
//!
//! Owns the listen socket, the connected-peer set and the produce loop that
//! drives everything: delivering decoded messages, scheduling pings,
//! dialling outbound peers, inviting broadcasts, pruning stale records and
//! accepting new connections. All iteration over the peer set happens on
//! snapshot copies; the locks below are only ever held for the copy or the
//! mutation itself.
//!
//! Repository access follows two disciplines. Opportunistic paths (connect
//! candidate selection, merging, pruning) use `try_repository` and simply
//! skip their work when the store is busy. Critical paths (persisting a
//! completed outbound handshake, forgetting peers) wait for the store.
//! Repository handles are never taken while holding a peer lock.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::FutureExt;
use quartz_core::{BlockSummary, ChainParams, TransactionSignature};
use rand::{Rng, RngCore};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::address::{is_address_local, PeerAddress};
use crate::codec::{FrameCodec, MAINNET_MAGIC, TESTNET_MAGIC};
use crate::config::{
    NetworkConfig, BROADCAST_INTERVAL, CHANNEL_SELECT_TIMEOUT, CONNECT_FAILURE_BACKOFF,
    CONNECT_TIMEOUT, HANDSHAKE_TIMEOUT, LISTEN_BACKLOG, OLD_PEER_ATTEMPTED_PERIOD,
    OLD_PEER_CONNECTION_PERIOD, PING_TIMEOUT, PROTOCOL_VERSION, PRUNE_INTERVAL,
    RECENT_CONNECTION_THRESHOLD,
};
use crate::controller::{Clock, Controller};
use crate::epc::{ExecuteProduceConsume, ProducedTask, TaskProducer};
use crate::error::NetworkResult;
use crate::handshake::{self, Direction, HandshakeAction, HandshakeEnv, HandshakeState, Transition};
use crate::message::{
    Message, MessageType, Payload, PeerId, VerificationCode, PEER_ID_LENGTH,
};
use crate::peer::Peer;
use crate::peer_info::PeerData;
use crate::repository::RepositoryManager;

pub struct NetworkManager {
    config: NetworkConfig,
    magic: [u8; 4],
    max_message_size: usize,
    our_peer_id: PeerId,

    controller: Arc<dyn Controller>,
    clock: Arc<dyn Clock>,
    repository: RepositoryManager,

    /// Taken (and thereby closed) on shutdown; `try_lock` in the produce
    /// loop keeps accept polling from ever blocking shutdown for long.
    listener: tokio::sync::Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,

    connected_peers: Mutex<Vec<Arc<Peer>>>,
    self_peers: Mutex<Vec<PeerAddress>>,

    /// Serialises peer-list merging; contenders drop their batch.
    merge_peers_lock: tokio::sync::Mutex<()>,

    next_connect_at: AtomicI64,
    next_broadcast_at: AtomicI64,
    next_prune_at: AtomicI64,

    producer_wake: Notify,
    broadcast_tasks: Mutex<Vec<JoinHandle<()>>>,
    epc: Arc<ExecuteProduceConsume>,
    shutting_down: AtomicBool,
}

impl NetworkManager {
    /// Bind the listen socket, seed the repository if it is empty, and start
    /// the worker pool.
    pub async fn start(
        config: NetworkConfig,
        params: ChainParams,
        controller: Arc<dyn Controller>,
        clock: Arc<dyn Clock>,
        repository: RepositoryManager,
    ) -> NetworkResult<Arc<Self>> {
        let magic = if config.testnet {
            TESTNET_MAGIC
        } else {
            MAINNET_MAGIC
        };
        // Frame envelope on top of the largest block we could relay.
        let max_message_size = 4 + 1 + 4 + params.max_block_size;

        let mut our_peer_id = [0u8; PEER_ID_LENGTH];
        rand::rngs::OsRng.fill_bytes(&mut our_peer_id);
        // Low bit of the last byte set, so the id can never be all zeroes.
        our_peer_id[PEER_ID_LENGTH - 1] |= 0x01;

        let listener = bind_listener(&config)?;
        let local_addr = listener.local_addr()?;

        install_initial_peers(&repository, &config).await?;

        let network = Arc::new_cyclic(|weak: &Weak<NetworkManager>| {
            let processor = Arc::new(NetworkProcessor {
                network: weak.clone(),
            });
            NetworkManager {
                epc: ExecuteProduceConsume::new(
                    processor,
                    config.min_network_workers,
                    config.max_network_workers,
                ),
                config,
                magic,
                max_message_size,
                our_peer_id,
                controller,
                clock,
                repository,
                listener: tokio::sync::Mutex::new(Some(listener)),
                local_addr,
                connected_peers: Mutex::new(Vec::new()),
                self_peers: Mutex::new(Vec::new()),
                merge_peers_lock: tokio::sync::Mutex::new(()),
                next_connect_at: AtomicI64::new(0),
                next_broadcast_at: AtomicI64::new(0),
                next_prune_at: AtomicI64::new(0),
                producer_wake: Notify::new(),
                broadcast_tasks: Mutex::new(Vec::new()),
                shutting_down: AtomicBool::new(false),
            }
        });

        network.epc.start();
        info!(address = %local_addr, "network listening");
        Ok(network)
    }

    // Plain accessors

    pub fn our_peer_id(&self) -> &PeerId {
        &self.our_peer_id
    }

    pub fn local_address(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Nudge the produce loop out of its blocking select.
    pub(crate) fn wake_producer(&self) {
        self.producer_wake.notify_one();
    }

    // Peer set views, all snapshot copies

    pub fn connected_peers(&self) -> Vec<Arc<Peer>> {
        self.connected_peers.lock().unwrap().clone()
    }

    pub fn handshaked_peers(&self) -> Vec<Arc<Peer>> {
        self.connected_peers()
            .into_iter()
            .filter(|peer| peer.handshake_state().is_completed())
            .collect()
    }

    /// Handshaked peers with inbound duplicates removed: an inbound
    /// connection whose id matches an outbound one is the same node twice.
    pub fn unique_handshaked_peers(&self) -> Vec<Arc<Peer>> {
        let peers = self.handshaked_peers();
        let outbound_ids: Vec<PeerId> = peers
            .iter()
            .filter(|peer| peer.is_outbound())
            .filter_map(|peer| peer.remote_peer_id())
            .collect();
        peers
            .into_iter()
            .filter(|peer| {
                peer.is_outbound()
                    || peer
                        .remote_peer_id()
                        .map_or(true, |id| !outbound_ids.contains(&id))
            })
            .collect()
    }

    pub fn outbound_handshaked_peers(&self) -> Vec<Arc<Peer>> {
        self.handshaked_peers()
            .into_iter()
            .filter(|peer| peer.is_outbound())
            .collect()
    }

    pub fn inbound_peer_with_id(&self, id: &PeerId) -> Option<Arc<Peer>> {
        self.connected_peers()
            .into_iter()
            .find(|peer| !peer.is_outbound() && peer.remote_peer_id().as_ref() == Some(id))
    }

    pub fn self_peers(&self) -> Vec<PeerAddress> {
        self.self_peers.lock().unwrap().clone()
    }

    /// Record that this address loops back to ourselves.
    pub(crate) fn note_to_self(&self, peer: &Arc<Peer>) {
        let address = peer.peer_data().address().clone();
        info!(%address, "no longer considering peer address as it connects to self");
        let mut self_peers = self.self_peers.lock().unwrap();
        if !self_peers.contains(&address) {
            self_peers.push(address);
        }
    }

    // Task production, in strict priority order

    fn produce_message_task(self: &Arc<Self>) -> Option<ProducedTask> {
        for peer in self.connected_peers() {
            if let Some(message) = peer.take_message_task() {
                let network = Arc::clone(self);
                return Some(Box::pin(async move {
                    network.handle_message(&peer, message).await;
                    peer.finish_message_task();
                }));
            }
        }
        None
    }

    fn produce_ping_task(&self) -> Option<ProducedTask> {
        let now = self.clock.now()?;
        for peer in self.connected_peers() {
            if peer.take_ping_task(now) {
                return Some(Box::pin(async move {
                    let started = tokio::time::Instant::now();
                    match peer.request(Payload::Ping, PING_TIMEOUT).await {
                        Ok(_) => peer.record_rtt(started.elapsed()),
                        Err(crate::error::NetworkError::Timeout) => {
                            peer.disconnect("no ping reply");
                        }
                        Err(_) => {} // already going away
                    }
                }));
            }
        }
        None
    }

    async fn produce_connect_task(self: &Arc<Self>) -> Option<ProducedTask> {
        if self.outbound_handshaked_peers().len() >= self.config.min_outbound_peers {
            return None;
        }
        let now = self.clock.now()?;
        if now < self.next_connect_at.load(Ordering::SeqCst) {
            return None;
        }
        self.next_connect_at.store(now + 1000, Ordering::SeqCst);

        let peer_data = self.get_connectable_peer(now).await?;
        let network = Arc::clone(self);
        Some(Box::pin(async move {
            network.connect_peer(peer_data).await;
        }))
    }

    fn produce_broadcast_task(self: &Arc<Self>) -> Option<ProducedTask> {
        let now = self.clock.now()?;
        if now < self.next_broadcast_at.load(Ordering::SeqCst) {
            return None;
        }
        self.next_broadcast_at
            .store(now + BROADCAST_INTERVAL, Ordering::SeqCst);

        let network = Arc::clone(self);
        Some(Box::pin(async move {
            network.controller.do_network_broadcast(&network);
        }))
    }

    fn produce_prune_task(self: &Arc<Self>) -> Option<ProducedTask> {
        let now = self.clock.now()?;
        if now < self.next_prune_at.load(Ordering::SeqCst) {
            return None;
        }
        self.next_prune_at
            .store(now + PRUNE_INTERVAL, Ordering::SeqCst);

        let network = Arc::clone(self);
        Some(Box::pin(async move {
            network.prune_peers().await;
        }))
    }

    /// The only producer step allowed to wait: accept-readiness on the
    /// listen socket, bounded by the select timeout and interruptible by
    /// `wake_producer`. Per-peer reads are pumped by the peers' own reader
    /// tasks, so they surface through the message step instead.
    async fn produce_channel_task(self: &Arc<Self>, can_block: bool) -> Option<ProducedTask> {
        let guard = self.listener.try_lock().ok()?;
        let listener = guard.as_ref()?;

        let accepted = if can_block {
            tokio::select! {
                result = listener.accept() => Some(result),
                _ = self.producer_wake.notified() => None,
                _ = tokio::time::sleep(CHANNEL_SELECT_TIMEOUT) => None,
            }
        } else {
            listener.accept().now_or_never()
        };

        match accepted {
            Some(Ok((stream, address))) => {
                let network = Arc::clone(self);
                Some(Box::pin(async move {
                    network.accept_connection(stream, address).await;
                }))
            }
            Some(Err(error)) => {
                warn!(%error, "accept failed");
                None
            }
            None => None,
        }
    }

    // Connection setup

    async fn accept_connection(self: &Arc<Self>, stream: TcpStream, address: SocketAddr) {
        let Some(now) = self.clock.now() else {
            debug!(peer = %address, "inbound connection discarded, clock not synchronised");
            return;
        };

        let peer_address = match PeerAddress::new(address.ip().to_string(), address.port()) {
            Ok(peer_address) => peer_address,
            Err(_) => return,
        };
        let peer_data = PeerData::new(peer_address, now, "inbound");

        debug!(peer = %address, "inbound connection accepted");
        self.install_peer(stream, address, Direction::Inbound, peer_data, now)
            .await;
    }

    async fn connect_peer(self: &Arc<Self>, peer_data: PeerData) {
        let address = peer_data.address().clone();
        let resolved = match address.resolve().await {
            Ok(resolved) => resolved,
            Err(error) => {
                debug!(%address, %error, "could not resolve peer");
                return;
            }
        };

        debug!(%address, "attempting outbound connection");
        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(resolved)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(error)) => {
                debug!(%address, %error, "connection failed");
                return;
            }
            Err(_) => {
                debug!(%address, "connection timed out");
                return;
            }
        };

        let Some(now) = self.clock.now() else { return };
        self.install_peer(stream, resolved, Direction::Outbound, peer_data, now)
            .await;
    }

    async fn install_peer(
        self: &Arc<Self>,
        stream: TcpStream,
        resolved: SocketAddr,
        direction: Direction,
        peer_data: PeerData,
        now: i64,
    ) {
        if let Err(error) = configure_peer_socket(&stream) {
            debug!(peer = %resolved, %error, "could not configure peer socket");
            return;
        }

        let (peer, outbox_rx) = Peer::new(
            Arc::downgrade(self),
            Arc::clone(&self.clock),
            direction,
            peer_data,
            resolved,
            now,
        );

        {
            let mut connected = self.connected_peers.lock().unwrap();
            // Inbound accepts re-check the cap under the lock; concurrent
            // accepts could otherwise blow past it.
            if !direction.is_outbound() && connected.len() >= self.config.max_peers {
                debug!(peer = %resolved, "inbound connection discarded, at capacity");
                return;
            }
            connected.push(Arc::clone(&peer));
        }

        // Arm the handshake before any byte can arrive: the opening frames
        // just queue in the outbox until the writer starts.
        self.on_peer_ready(&peer).await;
        peer.spawn_io(
            stream,
            FrameCodec::new(self.magic, self.max_message_size),
            outbox_rx,
        );
        self.wake_producer();
    }

    async fn on_peer_ready(self: &Arc<Self>, peer: &Arc<Peer>) {
        let env = self.handshake_env(peer, false);
        let transition = handshake::on_ready(peer.direction(), &env);
        self.apply_handshake_transition(peer, transition).await;
    }

    // Message handling

    pub(crate) async fn handle_message(self: &Arc<Self>, peer: &Arc<Peer>, message: Message) {
        if peer.is_disconnected() {
            return;
        }
        trace!(peer = %peer, kind = %message.message_type(), id = message.id, "processing message");

        // A reply to one of our requests completes its waiter and goes no
        // further.
        let Some(message) = peer.try_complete_request(message) else {
            return;
        };

        let kind = message.message_type();
        let state = peer.handshake_state();

        // Doppelganger resolution crosses two connections and can arrive on
        // an already-completed one; route it before the handshake ladder.
        if matches!(state, HandshakeState::PeerVerify | HandshakeState::Completed) {
            match &message.payload {
                Payload::PeerVerify(code) => {
                    let code = *code;
                    self.handle_peer_verify(peer, code).await;
                    return;
                }
                Payload::VerificationCodes {
                    code_sent,
                    code_expected,
                } => {
                    let (code_sent, code_expected) = (*code_sent, *code_expected);
                    self.handle_verification_codes(peer, code_sent, code_expected)
                        .await;
                    return;
                }
                _ => {}
            }
        }

        if !state.is_completed() {
            // Eager v1 nodes ping mid-handshake; park it for afterwards.
            if kind == MessageType::Ping {
                peer.enqueue_inbound(message);
                return;
            }

            let inbound_claims_id = match &message.payload {
                Payload::PeerId(id) if peer.is_outbound() => {
                    self.inbound_peer_with_id(id).is_some()
                }
                _ => false,
            };
            let mut env = self.handshake_env(peer, inbound_claims_id);
            if let Payload::PeerId(id) = &message.payload {
                // The proof that follows is bound to the id presented here.
                env.remote_peer_id = Some(*id);
            }

            match handshake::advance(state, peer.direction(), &env, &message) {
                Ok(transition) => self.apply_handshake_transition(peer, transition).await,
                Err(error) => {
                    debug!(peer = %peer, %error, "handshake failure");
                    peer.disconnect("handshake failure");
                }
            }
            return;
        }

        match message.payload {
            Payload::Ping => {
                // Pong is a PING carrying the same id.
                if !peer.send(Message::with_id(message.id, Payload::Ping)).await {
                    debug!(peer = %peer, "failed to send ping reply");
                }
            }

            Payload::Version { .. } | Payload::PeerId(_) | Payload::Proof { .. } => {
                debug!(peer = %peer, kind = %kind, "unexpected handshaking message");
                peer.disconnect("unexpected handshaking message");
            }

            Payload::Peers(addresses) => {
                // v1 gossip has no ports; assume the network default. The
                // sender's own host rides along too.
                let default_port = self.config.default_peer_port();
                let mut merged: Vec<PeerAddress> = addresses
                    .into_iter()
                    .filter_map(|ip| PeerAddress::new(ip.to_string(), default_port).ok())
                    .collect();
                if let Ok(sender) =
                    PeerAddress::new(peer.peer_data().address().host(), default_port)
                {
                    merged.push(sender);
                }
                self.merge_peers(peer.to_string(), merged).await;
            }

            Payload::PeersV2 {
                listen_port,
                mut peers,
            } => {
                // For inbound connections the socket's remote port is an
                // ephemeral port; the advertised listen port is the one
                // worth remembering.
                if !peer.is_outbound() {
                    if let Ok(sender) =
                        PeerAddress::new(peer.peer_data().address().host(), listen_port)
                    {
                        trace!(sender = %sender, "peer advertised listen address");
                        peers.insert(0, sender);
                    }
                }
                self.merge_peers(peer.to_string(), peers).await;
            }

            Payload::GetPeers => {
                let reply = self.build_peers_payload(peer).await;
                if !peer.send(Message::with_id(message.id, reply)).await {
                    debug!(peer = %peer, "failed to send peers list");
                }
            }

            _ => self.controller.on_network_message(self, peer, message),
        }
    }

    fn handshake_env(&self, peer: &Peer, inbound_claims_id: bool) -> HandshakeEnv {
        HandshakeEnv {
            our_peer_id: self.our_peer_id,
            our_version: PROTOCOL_VERSION,
            our_proof_nonce: peer.proof_nonce(),
            remote_peer_id: peer.claimed_peer_id(),
            inbound_claims_id,
            has_pending_id: peer.pending_peer_id().is_some(),
        }
    }

    async fn apply_handshake_transition(self: &Arc<Self>, peer: &Arc<Peer>, transition: Transition) {
        peer.state().handshake = transition.next;
        for action in transition.actions {
            match action {
                HandshakeAction::Send(payload) => {
                    if !peer.send(Message::new(payload)).await {
                        return;
                    }
                }
                HandshakeAction::RecordVersion(version) => peer.state().version = version,
                HandshakeAction::RecordPeerId(id) => peer.state().remote_peer_id = Some(id),
                HandshakeAction::MarkPendingPeerId(id) => {
                    debug!(peer = %peer, "remote id already claimed by an inbound connection");
                    peer.state().pending_peer_id = Some(id);
                }
                HandshakeAction::MarkSelfPeer => self.note_to_self(peer),
                HandshakeAction::Disconnect(reason) => {
                    peer.disconnect(reason);
                    return;
                }
                HandshakeAction::BeginPeerVerify => self.begin_peer_verify(peer).await,
                HandshakeAction::Complete => self.finish_handshake(peer).await,
            }
        }
    }

    async fn finish_handshake(self: &Arc<Self>, peer: &Arc<Peer>) {
        info!(peer = %peer, version = peer.version(), "handshake completed");

        if let Some(now) = self.clock.now() {
            peer.update_peer_data(|data| data.record_connection(now));
            peer.start_pings(now);
        }

        // Outbound records are worth keeping: their address is a listen
        // address we managed to reach.
        if peer.is_outbound() {
            let mut repository = self.repository.repository().await;
            let data = peer.peer_data();
            if let Err(error) = repository
                .save(&data)
                .and_then(|_| repository.save_changes())
            {
                error!(peer = %peer, %error, "failed to persist peer record");
            }
        }

        // Only the outbound side speaks right away; anything the inbound
        // side sent here could cross the final handshake frame.
        if peer.is_outbound() {
            let tip = self.controller.chain_tip();
            if !peer
                .send(Message::new(self.build_height_payload(peer, &tip)))
                .await
            {
                return;
            }
            let peers_payload = self.build_peers_payload(peer).await;
            if !peer.send(Message::new(peers_payload)).await {
                return;
            }
            if !peer.send(Message::new(Payload::GetPeers)).await {
                return;
            }
        }

        self.controller.on_peer_handshake_completed(self, peer);
    }

    // Doppelganger verification

    async fn begin_peer_verify(self: &Arc<Self>, peer: &Arc<Peer>) {
        let mut code_sent: VerificationCode = Default::default();
        let mut code_expected: VerificationCode = Default::default();
        rand::rngs::OsRng.fill_bytes(&mut code_sent);
        rand::rngs::OsRng.fill_bytes(&mut code_expected);

        {
            let mut state = peer.state();
            state.verification_code_sent = Some(code_sent);
            state.verification_code_expected = Some(code_expected);
        }

        debug!(peer = %peer, "requesting doppelganger verification");
        peer.send(Message::new(Payload::VerificationCodes {
            code_sent,
            code_expected,
        }))
        .await;
    }

    /// A PEER_VERIFY carries one of two things: proof that the sender
    /// controls both ends of a doppelganger pair (the code we sent on our
    /// outbound connection, arriving on another), or the remote confirming
    /// the code we are owed on this one.
    async fn handle_peer_verify(self: &Arc<Self>, sender: &Arc<Peer>, code: VerificationCode) {
        let awaiting = self.connected_peers().into_iter().find(|candidate| {
            candidate.is_outbound()
                && candidate.handshake_state() == HandshakeState::PeerVerify
                && candidate.state().verification_code_sent == Some(code)
        });

        if let Some(candidate) = awaiting {
            let expected = {
                let mut state = candidate.state();
                state.verification_code_sent = None;
                state.verification_code_expected.take()
            };
            if let Some(expected) = expected {
                if !candidate
                    .send(Message::new(Payload::PeerVerify(expected)))
                    .await
                {
                    return;
                }
            }
            self.complete_peer_verification(&candidate).await;
            return;
        }

        let confirmed = {
            let mut state = sender.state();
            if state.verification_code_expected == Some(code) {
                state.verification_code_expected = None;
                state.verification_code_sent = None;
                true
            } else {
                false
            }
        };
        if confirmed {
            if !sender.handshake_state().is_completed() {
                self.complete_peer_verification(sender).await;
            }
            return;
        }

        // Wrong code: neither end of the pair can be trusted.
        debug!(peer = %sender, "peer verification failed");
        if let Some(claimed) = sender.claimed_peer_id() {
            for candidate in self.connected_peers() {
                if !Arc::ptr_eq(&candidate, sender)
                    && candidate.handshake_state() == HandshakeState::PeerVerify
                    && candidate.claimed_peer_id() == Some(claimed)
                {
                    candidate.disconnect("peer verification failed");
                }
            }
        }
        sender.disconnect("peer verification failed");
    }

    /// The remote is running its own doppelganger check on us: it sent the
    /// code it wants echoed over our outbound connection to it, plus the
    /// code it will answer with here.
    async fn handle_verification_codes(
        self: &Arc<Self>,
        sender: &Arc<Peer>,
        code_sent: VerificationCode,
        code_expected: VerificationCode,
    ) {
        sender.state().verification_code_expected = Some(code_expected);

        let Some(remote_id) = sender.claimed_peer_id() else {
            return;
        };
        let outbound = self.connected_peers().into_iter().find(|candidate| {
            candidate.is_outbound()
                && !Arc::ptr_eq(candidate, sender)
                && candidate.handshake_state().is_completed()
                && candidate.remote_peer_id() == Some(remote_id)
        });

        match outbound {
            Some(outbound) => {
                debug!(peer = %sender, via = %outbound, "answering doppelganger verification");
                outbound
                    .send(Message::new(Payload::PeerVerify(code_sent)))
                    .await;
            }
            None => {
                debug!(peer = %sender, "no outbound channel to answer verification codes");
            }
        }
    }

    async fn complete_peer_verification(self: &Arc<Self>, peer: &Arc<Peer>) {
        {
            let mut state = peer.state();
            if let Some(id) = state.pending_peer_id.take() {
                state.remote_peer_id = Some(id);
            }
            state.handshake = HandshakeState::Completed;
        }
        debug!(peer = %peer, "doppelganger verification completed");
        self.finish_handshake(peer).await;
    }

    // Outbound candidate selection

    /// Pick a connectable peer at random, excluding recent failures, known
    /// self addresses and anything already connected. The chosen record's
    /// `last_attempted` is persisted *before* the socket connect, so a
    /// crash mid-dial still backs the address off.
    pub async fn get_connectable_peer(&self, now: i64) -> Option<PeerData> {
        // Opportunistic: a new outbound peer is never urgent.
        let mut repository = self.repository.try_repository()?;
        let mut peers = match repository.get_all_peers() {
            Ok(peers) => peers,
            Err(error) => {
                error!(%error, "repository issue while finding a connectable peer");
                return None;
            }
        };

        // Recent connection failure: attempted lately, and that attempt did
        // not turn into a connection.
        let attempted_threshold = now - CONNECT_FAILURE_BACKOFF;
        peers.retain(|data| {
            !data.last_attempted().is_some_and(|attempted| {
                data.last_connected()
                    .map_or(true, |connected| connected < attempted)
                    && attempted > attempted_threshold
            })
        });

        let self_peers = self.self_peers();
        peers.retain(|data| !self_peers.contains(data.address()));

        let connected = self.connected_peers();
        peers.retain(|data| {
            !connected
                .iter()
                .any(|peer| peer.peer_data().address() == data.address())
        });

        // Resolved-address match: the same node may be known under several
        // names. Unresolvable addresses are not worth dialling either.
        let mut candidates = Vec::new();
        for data in peers {
            match data.address().resolve().await {
                Ok(resolved) => {
                    if !connected.iter().any(|peer| peer.resolved_address() == resolved) {
                        candidates.push(data);
                    }
                }
                Err(_) => {}
            }
        }

        if candidates.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..candidates.len());
        let mut peer_data = candidates.swap_remove(index);

        repository.discard_changes();
        peer_data.record_attempt(now);
        if let Err(error) = repository
            .save(&peer_data)
            .and_then(|_| repository.save_changes())
        {
            error!(%error, "failed to record connection attempt");
            return None;
        }

        Some(peer_data)
    }

    // Housekeeping

    /// Drop handshake stragglers and delete peer records that have gone
    /// stale on both counts: no connection attempt within a day and no
    /// successful connection within a week.
    pub async fn prune_peers(&self) {
        let Some(now) = self.clock.now() else { return };

        for peer in self.connected_peers() {
            let state = peer.handshake_state();
            if !state.is_completed() && peer.connected_at() < now - HANDSHAKE_TIMEOUT {
                peer.disconnect(&format!("handshake timeout at {}", state.name()));
            }
        }

        // Pruning is not critical, so don't wait for the store.
        let Some(mut repository) = self.repository.try_repository() else {
            return;
        };
        let peers = match repository.get_all_peers() {
            Ok(peers) => peers,
            Err(error) => {
                error!(%error, "repository issue while pruning peers");
                return;
            }
        };

        let connected = self.connected_peers();
        let doomed: Vec<PeerData> = peers
            .into_iter()
            .filter(|data| {
                data.last_attempted()
                    .map_or(true, |attempted| attempted < now - OLD_PEER_ATTEMPTED_PERIOD)
                    && data
                        .last_connected()
                        .map_or(true, |c| c < now - OLD_PEER_CONNECTION_PERIOD)
            })
            .filter(|data| {
                !connected
                    .iter()
                    .any(|peer| peer.peer_data().address() == data.address())
            })
            .collect();

        if doomed.is_empty() {
            return;
        }
        for data in &doomed {
            debug!(address = %data.address(), "deleting old peer from repository");
            if let Err(error) = repository.delete(data.address()) {
                error!(%error, "repository issue while pruning peers");
                return;
            }
        }
        if let Err(error) = repository.save_changes() {
            error!(%error, "repository issue while pruning peers");
        }
    }

    /// Fold newly learned addresses into the repository. Serialised by a
    /// try-lock: a concurrent merge wins and this batch is dropped, since
    /// gossip will bring the addresses round again.
    pub async fn merge_peers(&self, added_by: String, addresses: Vec<PeerAddress>) {
        let Some(now) = self.clock.now() else { return };
        let Ok(_merge_guard) = self.merge_peers_lock.try_lock() else {
            return;
        };
        let Some(mut repository) = self.repository.try_repository() else {
            return;
        };

        let known = match repository.get_all_peers() {
            Ok(known) => known,
            Err(error) => {
                error!(%error, "repository issue while merging peers");
                return;
            }
        };

        let mut fresh: Vec<PeerAddress> = Vec::new();
        for address in addresses {
            if known.iter().any(|data| data.address() == &address) {
                continue;
            }
            if fresh.contains(&address) {
                continue;
            }
            fresh.push(address);
        }
        if fresh.is_empty() {
            return;
        }

        repository.discard_changes();
        for address in fresh {
            info!(%address, added_by = %added_by, "adding new peer to repository");
            if let Err(error) = repository.save(&PeerData::new(address, now, added_by.clone())) {
                error!(%error, "repository issue while merging peers");
                return;
            }
        }
        if let Err(error) = repository.save_changes() {
            error!(%error, "repository issue while merging peers");
        }
    }

    // Message building

    /// PEERS or PEERS_V2 for this peer's dialect, made from recently
    /// connected repository records. Local addresses only go to local
    /// peers; v1 frames cannot carry IPv6 or hostnames.
    pub async fn build_peers_payload(&self, peer: &Peer) -> Payload {
        let known = {
            let repository = self.repository.repository().await;
            match repository.get_all_peers() {
                Ok(known) => known,
                Err(error) => {
                    error!(%error, "repository issue while building peers message");
                    Vec::new()
                }
            }
        };

        let threshold = self
            .clock
            .now()
            .map(|now| now - RECENT_CONNECTION_THRESHOLD);
        let recent = known.into_iter().filter(|data| {
            match (threshold, data.last_attempted(), data.last_connected()) {
                (Some(threshold), Some(attempted), Some(connected)) => {
                    connected >= attempted && connected >= threshold
                }
                _ => false,
            }
        });

        if peer.version() >= 2 {
            let mut peers = Vec::new();
            for data in recent {
                match data.address().resolve().await {
                    Ok(resolved) => {
                        if !peer.is_local() && is_address_local(&resolved.ip()) {
                            continue;
                        }
                        peers.push(data.address().clone());
                    }
                    Err(_) => {} // unresolvable, not worth advertising
                }
            }
            Payload::PeersV2 {
                listen_port: self.local_addr.port(),
                peers,
            }
        } else {
            let mut addresses = Vec::new();
            for data in recent {
                match data.address().resolve().await {
                    Ok(SocketAddr::V4(v4)) => {
                        if !peer.is_local() && is_address_local(&IpAddr::V4(*v4.ip())) {
                            continue;
                        }
                        addresses.push(*v4.ip());
                    }
                    _ => {} // v1 peers lists are IPv4 only
                }
            }
            Payload::Peers(addresses)
        }
    }

    /// HEIGHT or HEIGHT_V2 for this peer's dialect.
    pub fn build_height_payload(&self, peer: &Peer, tip: &BlockSummary) -> Payload {
        if peer.version() >= 2 && tip.is_well_formed() {
            Payload::HeightV2 {
                height: tip.height,
                signature: tip.signature.clone(),
                timestamp: tip.timestamp,
                minter_public_key: tip.minter_public_key.clone(),
            }
        } else {
            Payload::Height { height: tip.height }
        }
    }

    /// How to announce a new transaction to this peer: full body for v1,
    /// signature-only (pull model) for v2.
    pub fn build_transaction_announcement(
        &self,
        peer: &Peer,
        signature: TransactionSignature,
        serialized: &[u8],
    ) -> Payload {
        if peer.version() >= 2 {
            Payload::TransactionSignatures(vec![signature])
        } else {
            Payload::Transaction(serialized.to_vec())
        }
    }

    /// v2-only request for the remote's unconfirmed transactions.
    pub fn build_get_unconfirmed_transactions(&self, peer: &Peer) -> Option<Payload> {
        (peer.version() >= 2).then_some(Payload::GetUnconfirmedTransactions)
    }

    // Broadcast

    /// Send `build(peer)` to every unique handshaked peer from a dedicated
    /// task, with a short jittered delay between peers to spread the load.
    pub fn broadcast(
        self: &Arc<Self>,
        build: impl Fn(&Arc<Peer>) -> Option<Payload> + Send + Sync + 'static,
    ) {
        if self.is_shutting_down() {
            return;
        }
        let targets = self.unique_handshaked_peers();
        if targets.is_empty() {
            return;
        }

        let delay_min = self.config.broadcast_delay_min_ms;
        let delay_max = self.config.broadcast_delay_max_ms.max(delay_min);
        let handle = tokio::spawn(async move {
            for peer in targets {
                let delay = rand::thread_rng().gen_range(delay_min..=delay_max);
                tokio::time::sleep(Duration::from_millis(delay)).await;

                let Some(payload) = build(&peer) else { continue };
                if !peer.send(Message::new(payload)).await {
                    debug!(peer = %peer, "failed to broadcast message");
                }
            }
        });

        let mut tasks = self.broadcast_tasks.lock().unwrap();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    // Forget operations

    /// Delete a peer record and drop any live connection to that address.
    pub async fn forget_peer(&self, address: &PeerAddress) -> NetworkResult<bool> {
        let removed = {
            let mut repository = self.repository.repository().await;
            let removed = repository.delete(address)?;
            repository.save_changes()?;
            removed
        };

        if let Ok(resolved) = address.resolve().await {
            for peer in self.connected_peers() {
                if peer.resolved_address() == resolved {
                    peer.disconnect("to be forgotten");
                }
            }
        }
        Ok(removed != 0)
    }

    /// Delete every peer record and disconnect everyone.
    pub async fn forget_all_peers(&self) -> NetworkResult<u32> {
        let removed = {
            let mut repository = self.repository.repository().await;
            let removed = repository.delete_all()?;
            repository.save_changes()?;
            removed
        };
        for peer in self.connected_peers() {
            peer.disconnect("to be forgotten");
        }
        Ok(removed)
    }

    // Peer lifecycle callbacks

    pub(crate) fn on_peer_disconnected(&self, peer: &Arc<Peer>) {
        {
            let mut connected = self.connected_peers.lock().unwrap();
            connected.retain(|candidate| !Arc::ptr_eq(candidate, peer));
        }
        self.controller.on_peer_disconnect(peer);

        // An inbound record's port is the remote's ephemeral port, useless
        // for dialling back; drop it from the store.
        if !peer.is_outbound() && !self.is_shutting_down() {
            let repository_manager = self.repository.clone();
            let address = peer.peer_data().address().clone();
            tokio::spawn(async move {
                let mut repository = repository_manager.repository().await;
                if let Err(error) = repository
                    .delete(&address)
                    .and_then(|_| repository.save_changes())
                {
                    error!(%address, %error, "failed to delete inbound peer record");
                }
            });
        }
        self.wake_producer();
    }

    // Shutdown

    /// Close the listener, drain the worker pool, cancel broadcasts and
    /// disconnect every peer. After this returns no sockets owned by the
    /// subsystem remain open.
    pub async fn shutdown(&self) {
        info!("network shutting down");
        self.shutting_down.store(true, Ordering::SeqCst);
        self.wake_producer();

        // No more inbound connections.
        self.listener.lock().await.take();

        if !self.epc.shutdown(Duration::from_secs(5)).await {
            warn!("network workers failed to terminate");
        }

        let broadcasts: Vec<JoinHandle<()>> =
            self.broadcast_tasks.lock().unwrap().drain(..).collect();
        for task in &broadcasts {
            task.abort();
        }
        if tokio::time::timeout(
            Duration::from_secs(1),
            futures::future::join_all(broadcasts),
        )
        .await
        .is_err()
        {
            warn!("broadcast tasks failed to terminate");
        }

        for peer in self.connected_peers() {
            peer.disconnect("shutting down");
        }
    }
}

/// One produce pass in strict priority order: deliver decoded messages,
/// then pings, then outbound connects, then broadcast and prune windows,
/// and only then (optionally blocking) channel readiness.
struct NetworkProcessor {
    network: Weak<NetworkManager>,
}

#[async_trait::async_trait]
impl TaskProducer for NetworkProcessor {
    async fn produce_task(&self, can_block: bool) -> Option<ProducedTask> {
        let network = self.network.upgrade()?;
        if network.is_shutting_down() {
            return None;
        }

        if let Some(task) = network.produce_message_task() {
            return Some(task);
        }
        if let Some(task) = network.produce_ping_task() {
            return Some(task);
        }
        if let Some(task) = network.produce_connect_task().await {
            return Some(task);
        }
        if let Some(task) = network.produce_broadcast_task() {
            return Some(task);
        }
        if let Some(task) = network.produce_prune_task() {
            return Some(task);
        }
        network.produce_channel_task(can_block).await
    }
}

fn bind_listener(config: &NetworkConfig) -> std::io::Result<TcpListener> {
    let bind_ip: IpAddr = config.bind_address.parse().map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("can't bind listen socket to address {}", config.bind_address),
        )
    })?;
    let endpoint = SocketAddr::new(bind_ip, config.listen_port);

    let socket = Socket::new(
        Domain::for_address(endpoint),
        Type::STREAM,
        Some(Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&endpoint.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into())
}

fn configure_peer_socket(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(60))
        .with_interval(Duration::from_secs(30));
    socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

async fn install_initial_peers(
    repository: &RepositoryManager,
    config: &NetworkConfig,
) -> NetworkResult<()> {
    let mut repo = repository.repository().await;
    if !repo.get_all_peers()?.is_empty() {
        return Ok(());
    }

    let now = chrono::Utc::now().timestamp_millis();
    for entry in &config.initial_peers {
        match PeerAddress::parse(entry, config.default_peer_port()) {
            Ok(address) => repo.save(&PeerData::new(address, now, "INIT"))?,
            Err(error) => warn!(entry = %entry, %error, "skipping malformed initial peer"),
        }
    }
    repo.save_changes()?;
    Ok(())
}
