//! A live peer connection.
//!
//! Each peer owns its socket through a pair of I/O tasks: a reader that
//! decodes frames into the inbound queue, and a writer that drains the
//! bounded outbox. Decoded messages are *not* dispatched here: the network
//! processor pulls them one at a time (`take_message_task`), which is what
//! guarantees in-order, non-concurrent delivery per connection.
//!
//! Request/reply correlation is a waiter table keyed by message id: the
//! caller parks on a oneshot receiver rather than a thread.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::RngCore;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, trace};

use crate::codec::FrameCodec;
use crate::config::{PING_INTERVAL, WRITE_TIMEOUT};
use crate::controller::Clock;
use crate::error::{NetworkError, NetworkResult};
use crate::handshake::{Direction, HandshakeState};
use crate::manager::NetworkManager;
use crate::message::{Message, Payload, PeerId, VerificationCode, PROOF_NONCE_LENGTH};
use crate::peer_info::PeerData;

/// Capacity of the per-peer write queue before senders start waiting.
const OUTBOX_CAPACITY: usize = 64;

/// Mutable handshake-related state, all guarded together.
pub(crate) struct PeerState {
    pub handshake: HandshakeState,
    pub version: u32,
    pub remote_peer_id: Option<PeerId>,
    pub pending_peer_id: Option<PeerId>,
    pub verification_code_sent: Option<VerificationCode>,
    pub verification_code_expected: Option<VerificationCode>,
}

pub struct Peer {
    network: Weak<NetworkManager>,
    clock: Arc<dyn Clock>,
    direction: Direction,
    resolved_address: SocketAddr,
    is_local: bool,
    connected_at: i64,
    our_proof_nonce: [u8; PROOF_NONCE_LENGTH],

    peer_data: Mutex<PeerData>,
    state: Mutex<PeerState>,

    inbound: Mutex<VecDeque<Message>>,
    /// Set while a produced message task for this peer is in flight. Only
    /// the single producer flips it on, so plain load/store suffices.
    message_task_pending: AtomicBool,

    next_message_id: AtomicI32,
    pending_requests: Mutex<HashMap<i32, oneshot::Sender<Message>>>,

    /// Taken on disconnect; the writer then drains what is queued and
    /// exits, closing the socket.
    outbox: Mutex<Option<mpsc::Sender<Message>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
    disconnected: AtomicBool,

    /// Epoch millis of the last frame received.
    last_activity: AtomicI64,
    /// Epoch millis when the next ping is allowed; 0 until pings start.
    next_ping: AtomicI64,
    /// Last measured round-trip, in millis; -1 until known.
    last_rtt: AtomicI64,
}

impl Peer {
    /// Build the peer and its outbox; the caller follows up with
    /// [`Peer::spawn_io`] once it holds the `Arc`.
    pub(crate) fn new(
        network: Weak<NetworkManager>,
        clock: Arc<dyn Clock>,
        direction: Direction,
        peer_data: PeerData,
        resolved_address: SocketAddr,
        connected_at: i64,
    ) -> (Arc<Self>, mpsc::Receiver<Message>) {
        let (outbox, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);

        let mut our_proof_nonce = [0u8; PROOF_NONCE_LENGTH];
        rand::rngs::OsRng.fill_bytes(&mut our_proof_nonce);

        let peer = Arc::new(Peer {
            network,
            clock,
            direction,
            resolved_address,
            is_local: crate::address::is_address_local(&resolved_address.ip()),
            connected_at,
            our_proof_nonce,
            peer_data: Mutex::new(peer_data),
            state: Mutex::new(PeerState {
                handshake: HandshakeState::Started,
                version: 1,
                remote_peer_id: None,
                pending_peer_id: None,
                verification_code_sent: None,
                verification_code_expected: None,
            }),
            inbound: Mutex::new(VecDeque::new()),
            message_task_pending: AtomicBool::new(false),
            next_message_id: AtomicI32::new(1),
            pending_requests: Mutex::new(HashMap::new()),
            outbox: Mutex::new(Some(outbox)),
            reader_task: Mutex::new(None),
            writer_task: Mutex::new(None),
            disconnected: AtomicBool::new(false),
            last_activity: AtomicI64::new(connected_at),
            next_ping: AtomicI64::new(0),
            last_rtt: AtomicI64::new(-1),
        });
        (peer, outbox_rx)
    }

    /// Start the reader and writer tasks over the connected socket.
    pub(crate) fn spawn_io(
        self: &Arc<Self>,
        stream: TcpStream,
        codec: FrameCodec,
        outbox_rx: mpsc::Receiver<Message>,
    ) {
        if self.is_disconnected() {
            // Torn down before I/O ever started; dropping the stream is the
            // whole cleanup.
            return;
        }
        let framed = Framed::new(stream, codec);
        let (mut sink, mut frames) = framed.split();

        let reader = {
            let peer = Arc::clone(self);
            tokio::spawn(async move {
                loop {
                    match frames.next().await {
                        Some(Ok(message)) => {
                            trace!(peer = %peer, kind = %message.message_type(), id = message.id, "frame received");
                            if let Some(now) = peer.clock.now() {
                                peer.last_activity.store(now, Ordering::Relaxed);
                            }
                            peer.inbound.lock().unwrap().push_back(message);
                            if let Some(network) = peer.network.upgrade() {
                                network.wake_producer();
                            }
                        }
                        Some(Err(error)) => {
                            peer.disconnect(&format!("protocol error: {error}"));
                            return;
                        }
                        None => {
                            peer.disconnect("connection closed by remote");
                            return;
                        }
                    }
                }
            })
        };

        let writer = {
            let peer = Arc::clone(self);
            let mut outbox_rx = outbox_rx;
            tokio::spawn(async move {
                while let Some(message) = outbox_rx.recv().await {
                    match tokio::time::timeout(WRITE_TIMEOUT, sink.send(message)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(error)) => {
                            peer.disconnect(&format!("write failed: {error}"));
                            return;
                        }
                        Err(_) => {
                            peer.disconnect("write stalled");
                            return;
                        }
                    }
                }
                // Channel closed by disconnect; queued frames are flushed
                // and dropping the sink closes the socket.
            })
        };

        *self.reader_task.lock().unwrap() = Some(reader);
        *self.writer_task.lock().unwrap() = Some(writer);
    }

    // Plain accessors

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_outbound(&self) -> bool {
        self.direction.is_outbound()
    }

    pub fn resolved_address(&self) -> SocketAddr {
        self.resolved_address
    }

    /// Whether the remote sits on a non-routable (local) address.
    pub fn is_local(&self) -> bool {
        self.is_local
    }

    pub fn connected_at(&self) -> i64 {
        self.connected_at
    }

    pub fn peer_data(&self) -> PeerData {
        self.peer_data.lock().unwrap().clone()
    }

    pub(crate) fn update_peer_data(&self, update: impl FnOnce(&mut PeerData)) {
        update(&mut self.peer_data.lock().unwrap());
    }

    pub(crate) fn proof_nonce(&self) -> [u8; PROOF_NONCE_LENGTH] {
        self.our_proof_nonce
    }

    pub(crate) fn state(&self) -> std::sync::MutexGuard<'_, PeerState> {
        self.state.lock().unwrap()
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.state.lock().unwrap().handshake
    }

    /// Negotiated protocol version; meaningful once the VERSION step is done.
    pub fn version(&self) -> u32 {
        self.state.lock().unwrap().version
    }

    pub fn remote_peer_id(&self) -> Option<PeerId> {
        self.state.lock().unwrap().remote_peer_id
    }

    pub fn pending_peer_id(&self) -> Option<PeerId> {
        self.state.lock().unwrap().pending_peer_id
    }

    /// The id this connection asserts, adopted or still pending
    /// verification.
    pub fn claimed_peer_id(&self) -> Option<PeerId> {
        let state = self.state.lock().unwrap();
        state.remote_peer_id.or(state.pending_peer_id)
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// Last measured ping round-trip in milliseconds, if any.
    pub fn last_rtt_ms(&self) -> Option<i64> {
        match self.last_rtt.load(Ordering::Relaxed) {
            rtt if rtt >= 0 => Some(rtt),
            _ => None,
        }
    }

    // Inbound queue

    pub(crate) fn enqueue_inbound(&self, message: Message) {
        self.inbound.lock().unwrap().push_back(message);
    }

    /// Pop the next inbound message if no task for this peer is already in
    /// flight. Called only by the current producer.
    pub(crate) fn take_message_task(&self) -> Option<Message> {
        if self.is_disconnected() || self.message_task_pending.load(Ordering::SeqCst) {
            return None;
        }
        let message = self.inbound.lock().unwrap().pop_front()?;
        self.message_task_pending.store(true, Ordering::SeqCst);
        Some(message)
    }

    pub(crate) fn finish_message_task(&self) {
        self.message_task_pending.store(false, Ordering::SeqCst);
        if let Some(network) = self.network.upgrade() {
            network.wake_producer();
        }
    }

    // Pings

    /// Arm the ping schedule; called once the handshake completes.
    pub(crate) fn start_pings(&self, now: i64) {
        self.next_ping.store(now + PING_INTERVAL, Ordering::SeqCst);
    }

    /// Whether a ping is due: handshaked, armed, idle for a full interval.
    /// Reserves the next slot so the task is produced once.
    pub(crate) fn take_ping_task(&self, now: i64) -> bool {
        if self.is_disconnected() || !self.handshake_state().is_completed() {
            return false;
        }
        let due = self.next_ping.load(Ordering::SeqCst);
        if due == 0 || now < due {
            return false;
        }
        if now - self.last_activity.load(Ordering::Relaxed) < PING_INTERVAL {
            // Traffic is flowing; push the schedule along.
            self.next_ping.store(now + PING_INTERVAL, Ordering::SeqCst);
            return false;
        }
        self.next_ping.store(now + PING_INTERVAL, Ordering::SeqCst);
        true
    }

    pub(crate) fn record_rtt(&self, rtt: Duration) {
        self.last_rtt
            .store(rtt.as_millis() as i64, Ordering::Relaxed);
    }

    // Sending

    fn next_request_id(&self) -> i32 {
        loop {
            // Wrapping add; id 0 is reserved for "no reply expected".
            let id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Queue a message for the writer. On failure (queue jammed past
    /// `WRITE_TIMEOUT`, or writer gone) the connection is closed and
    /// `false` returned.
    pub async fn send(self: &Arc<Self>, message: Message) -> bool {
        if self.is_disconnected() {
            return false;
        }
        let Some(outbox) = self.outbox.lock().unwrap().clone() else {
            return false;
        };
        let message = match outbox.try_send(message) {
            Ok(()) => return true,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.disconnect("write queue closed");
                return false;
            }
            Err(mpsc::error::TrySendError::Full(message)) => message,
        };
        match outbox.send_timeout(message, WRITE_TIMEOUT).await {
            Ok(()) => true,
            Err(_) => {
                self.disconnect("write queue jammed");
                false
            }
        }
    }

    /// Send with a fresh non-zero id and wait for the correlated reply.
    pub async fn request(
        self: &Arc<Self>,
        payload: Payload,
        timeout: Duration,
    ) -> NetworkResult<Message> {
        let id = self.next_request_id();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending_requests.lock().unwrap().insert(id, reply_tx);

        // The waiter table is drained on disconnect; re-check so a racing
        // disconnect can't strand the sender we just registered.
        if self.is_disconnected() {
            self.pending_requests.lock().unwrap().remove(&id);
            return Err(self.closed_error());
        }

        if !self.send(Message::with_id(id, payload)).await {
            self.pending_requests.lock().unwrap().remove(&id);
            return Err(self.closed_error());
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(self.closed_error()),
            Err(_) => {
                self.pending_requests.lock().unwrap().remove(&id);
                Err(NetworkError::Timeout)
            }
        }
    }

    fn closed_error(&self) -> NetworkError {
        match self.network.upgrade() {
            Some(network) if network.is_shutting_down() => NetworkError::Shutdown,
            _ => NetworkError::Disconnected,
        }
    }

    /// Complete a registered waiter with this message, or give the message
    /// back for normal routing.
    pub(crate) fn try_complete_request(&self, message: Message) -> Option<Message> {
        if message.id != 0 {
            if let Some(waiter) = self.pending_requests.lock().unwrap().remove(&message.id) {
                let _ = waiter.send(message);
                return None;
            }
        }
        Some(message)
    }

    /// Tear the connection down. Idempotent: the first caller wins, later
    /// calls return immediately.
    ///
    /// The reader stops at once. The writer is left to flush whatever is
    /// already queued (a parting frame may still matter to the remote) and
    /// exits when the closed outbox drains, except during shutdown, where
    /// it is aborted outright.
    pub fn disconnect(self: &Arc<Self>, reason: &str) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(peer = %self, reason, "disconnecting peer");

        self.outbox.lock().unwrap().take();
        if let Some(reader) = self.reader_task.lock().unwrap().take() {
            reader.abort();
        }
        let network = self.network.upgrade();
        if network.as_ref().map_or(true, |n| n.is_shutting_down()) {
            if let Some(writer) = self.writer_task.lock().unwrap().take() {
                writer.abort();
            }
        }

        // Dropping the senders fails every outstanding request.
        self.pending_requests.lock().unwrap().clear();
        self.inbound.lock().unwrap().clear();

        if let Some(network) = network {
            network.on_peer_disconnected(self);
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let marker = if self.is_outbound() { "out" } else { "in" };
        write!(f, "{} ({marker})", self.resolved_address)
    }
}
