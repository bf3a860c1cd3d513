//! The long-lived node
//!
//! One task owns every table (sessions, gossip, quality, outstanding
//! requests, the store) and reacts to commands, peer frames, timers and
//! incoming connections in a single `select!` loop. Nothing is shared
//! between nodes, so many can run in one process.
//!
//! Encryption, hashing and erasure coding run on the blocking pool; their
//! results come back to the loop as internal events.

use crate::config::Config;
use crate::pipeline::{self, SealedFile};
use crate::replication::{BlockReply, PendingRequests, Registration};
use bytes::Bytes;
use cairn_core::crypto::CryptoEngine;
use cairn_core::erasure::ErasureConfig;
use cairn_core::keys::Keyring;
use cairn_core::proto::{self, Envelope, Payload};
use cairn_core::store::{self, BlockStore};
use cairn_core::{
    Block, BlockId, Channel, Error, FileId, FileRecord, IncomingConnection, ParityGroup, PathKind,
    PeerId, Result, Signaling,
};
use cairn_mesh::gossip::{self, PeerExchange};
use cairn_mesh::quality::{QualityLevel, QualityMonitor, QualitySample};
use cairn_mesh::retry::{Clock, RetryDecision, SystemClock};
use cairn_mesh::session::{ConnectPlan, ConnectionState, LinkOutcome, SessionTable};
use cairn_mesh::MeshConfig;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

const COMMAND_QUEUE: usize = 256;
const EVENT_QUEUE: usize = 1024;

/// Runtime settings of a node
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub chunk_size: usize,
    pub erasure: Option<ErasureConfig>,
    pub mesh: MeshConfig,
    /// Peers to connect to when the node starts
    pub bootstrap: Vec<PeerId>,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            chunk_size: cairn_core::CHUNK_SIZE,
            erasure: None,
            mesh: MeshConfig::default(),
            bootstrap: vec![],
        }
    }
}

impl NodeSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            chunk_size: config.storage.chunk_size,
            erasure: config.storage.erasure,
            mesh: config.network.mesh(),
            bootstrap: config
                .network
                .bootstrap_peers
                .iter()
                .filter_map(|p| p.parse().ok())
                .collect(),
        }
    }
}

/// How a block reached this node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSource {
    Broadcast,
    Response,
}

/// Notifications for observers; advisory, never needed for correctness
#[derive(Debug, Clone)]
pub enum NodeEvent {
    PeerConnected { peer: PeerId, path: PathKind },
    PeerDisconnected { peer: PeerId },
    ConnectFailed { peer: PeerId, attempt: u32, retry_in: Option<Duration> },
    PeerUnreachable { peer: PeerId, attempts: u32 },
    BlockRequested { peer: PeerId, block_id: BlockId, found: bool },
    BlockReceived { peer: PeerId, block_id: BlockId, source: BlockSource },
    FileStored { file_id: FileId, name: String, blocks: usize },
    QualitySampled(QualitySample),
}

/// What a peer last told us about its store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteStats {
    pub block_count: u64,
    pub storage_used: u64,
}

#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub id: PeerId,
    pub connection_state: ConnectionState,
    pub is_direct: bool,
    pub quality: Option<QualityLevel>,
    pub rtt: Option<Duration>,
    pub remote_stats: Option<RemoteStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStats {
    pub block_count: u64,
    pub peer_count: usize,
    pub storage_used: u64,
}

enum Command {
    Upload { data: Vec<u8>, name: String, reply: oneshot::Sender<Result<FileRecord>> },
    Download { file_id: FileId, reply: oneshot::Sender<Result<Vec<u8>>> },
    Delete { file_id: FileId, reply: oneshot::Sender<Result<()>> },
    ListFiles { reply: oneshot::Sender<Result<Vec<FileRecord>>> },
    ListPeers { reply: oneshot::Sender<Result<Vec<PeerInfo>>> },
    Connect { peer: PeerId, reply: oneshot::Sender<Result<()>> },
    Disconnect { peer: PeerId, reply: oneshot::Sender<Result<()>> },
    Stats { reply: oneshot::Sender<Result<NodeStats>> },
    FetchBlock { block_id: BlockId, reply: BlockReply },
    Shutdown { reply: oneshot::Sender<Result<()>> },
}

enum Internal {
    Frame { peer: PeerId, conn_id: u64, bytes: Bytes },
    LinkClosed { peer: PeerId, conn_id: u64 },
    DialFinished { peer: PeerId, conn_id: u64, result: Result<Channel> },
    RetryConnect { peer: PeerId },
    GossipConnect { peer: PeerId },
    RequestTimeout { request_id: u64 },
    BlockChecked { peer: PeerId, source: BlockSource, checked: Result<(Block, Vec<u8>)> },
    Sealed { result: Result<PreparedUpload>, reply: oneshot::Sender<Result<FileRecord>> },
}

/// A sealed file with its stored encoding and broadcast frames
struct PreparedUpload {
    sealed: SealedFile,
    encoded: Vec<Vec<u8>>,
    frames: Vec<Bytes>,
}

impl PreparedUpload {
    fn new(sealed: SealedFile) -> Result<Self> {
        let encoded = sealed
            .blocks()
            .map(|b| b.to_bytes())
            .collect::<Result<Vec<_>>>()?;
        let frames = sealed
            .blocks()
            .map(|b| Bytes::from(proto::block_broadcast(b).to_bytes()))
            .collect();
        Ok(Self {
            sealed,
            encoded,
            frames,
        })
    }
}

/// Sending half of a session's channel plus the task reading the other half
struct Link {
    tx: mpsc::UnboundedSender<Bytes>,
    reader: Option<JoinHandle<()>>,
}

impl Link {
    fn new(tx: mpsc::UnboundedSender<Bytes>) -> Self {
        Self { tx, reader: None }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Cloneable handle to a running node
#[derive(Clone)]
pub struct NodeHandle {
    local_id: PeerId,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<NodeEvent>,
}

impl NodeHandle {
    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<Result<T>>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| Error::NodeStopped)?;
        rx.await.map_err(|_| Error::NodeStopped)?
    }

    /// Store a file and replicate its blocks to every open peer
    pub async fn upload(&self, data: Vec<u8>, name: impl Into<String>) -> Result<FileRecord> {
        let name = name.into();
        self.request(|reply| Command::Upload { data, name, reply }).await
    }

    /// Rebuild a file from local blocks, peers and parity
    pub async fn download(&self, file_id: FileId) -> Result<Vec<u8>> {
        self.request(|reply| Command::Download { file_id, reply }).await
    }

    /// Remove a file record and its blocks
    pub async fn delete(&self, file_id: FileId) -> Result<()> {
        self.request(|reply| Command::Delete { file_id, reply }).await
    }

    pub async fn list_files(&self) -> Result<Vec<FileRecord>> {
        self.request(|reply| Command::ListFiles { reply }).await
    }

    pub async fn list_peers(&self) -> Result<Vec<PeerInfo>> {
        self.request(|reply| Command::ListPeers { reply }).await
    }

    /// Resolves once a session with `peer` is open
    pub async fn connect(&self, peer: PeerId) -> Result<()> {
        self.request(|reply| Command::Connect { peer, reply }).await
    }

    pub async fn disconnect(&self, peer: PeerId) -> Result<()> {
        self.request(|reply| Command::Disconnect { peer, reply }).await
    }

    pub async fn get_stats(&self) -> Result<NodeStats> {
        self.request(|reply| Command::Stats { reply }).await
    }

    /// A block from the local store, or else from the first peer to answer
    pub async fn fetch_block(&self, block_id: BlockId) -> Result<Block> {
        self.request(|reply| Command::FetchBlock { block_id, reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

pub struct Node<S: Signaling, B: BlockStore> {
    signaling: Arc<S>,
    incoming: mpsc::UnboundedReceiver<IncomingConnection>,
    store: B,
    engine: Arc<CryptoEngine>,
    settings: NodeSettings,
    clock: Arc<dyn Clock>,

    sessions: SessionTable<Link>,
    gossip: PeerExchange,
    quality: QualityMonitor,
    last_quality: HashMap<PeerId, QualitySample>,
    pending: PendingRequests,
    connect_waiters: HashMap<PeerId, Vec<oneshot::Sender<Result<()>>>>,

    commands: mpsc::Receiver<Command>,
    handle: mpsc::WeakSender<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    events: broadcast::Sender<NodeEvent>,
}

impl<S: Signaling, B: BlockStore + 'static> Node<S, B> {
    pub fn new(
        signaling: S,
        incoming: mpsc::UnboundedReceiver<IncomingConnection>,
        store: B,
        keyring: Keyring,
        settings: NodeSettings,
    ) -> (Self, NodeHandle) {
        let local_id = signaling.local_id().clone();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_QUEUE);

        let handle = NodeHandle {
            local_id: local_id.clone(),
            commands: command_tx.clone(),
            events: events.clone(),
        };

        let node = Self {
            signaling: Arc::new(signaling),
            incoming,
            store,
            engine: Arc::new(CryptoEngine::new(keyring)),
            sessions: SessionTable::new(local_id.clone(), settings.mesh.retry.clone()),
            gossip: PeerExchange::new(local_id, settings.mesh.gossip_jitter),
            quality: QualityMonitor::new(settings.mesh.ping_timeout),
            settings,
            clock: Arc::new(SystemClock),
            last_quality: HashMap::new(),
            pending: PendingRequests::new(),
            connect_waiters: HashMap::new(),
            commands: command_rx,
            handle: command_tx.downgrade(),
            internal_tx,
            internal_rx,
            events,
        };
        (node, handle)
    }

    /// Create a node and run it on the current runtime
    pub fn spawn(
        signaling: S,
        incoming: mpsc::UnboundedReceiver<IncomingConnection>,
        store: B,
        keyring: Keyring,
        settings: NodeSettings,
    ) -> NodeHandle {
        let (node, handle) = Self::new(signaling, incoming, store, keyring, settings);
        tokio::spawn(node.run());
        handle
    }

    /// Drive the node until shutdown or until every handle is dropped
    pub async fn run(mut self) {
        info!("Node {} running", self.sessions.local_id());
        let mut quality_tick = tokio::time::interval(self.settings.mesh.quality_interval);
        quality_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        for peer in self.settings.bootstrap.clone() {
            self.connect(peer, None);
        }

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.stop();
                        let _ = reply.send(Ok(()));
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.stop();
                        break;
                    }
                },
                Some(event) = self.internal_rx.recv() => self.handle_internal(event),
                Some(incoming) = self.incoming.recv() => self.handle_incoming(incoming),
                _ = quality_tick.tick() => self.sample_quality(),
            }
        }
        info!("Node {} stopped", self.sessions.local_id());
    }

    fn emit(&self, event: NodeEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Upload { data, name, reply } => self.start_upload(data, name, reply),
            Command::Download { file_id, reply } => self.start_download(file_id, reply),
            Command::Delete { file_id, reply } => {
                let _ = reply.send(self.delete_file(&file_id));
            }
            Command::ListFiles { reply } => {
                let _ = reply.send(self.store.list_file_records());
            }
            Command::ListPeers { reply } => {
                let _ = reply.send(Ok(self.peer_infos()));
            }
            Command::Connect { peer, reply } => self.connect(peer, Some(reply)),
            Command::Disconnect { peer, reply } => {
                let _ = reply.send(self.disconnect(&peer));
            }
            Command::Stats { reply } => {
                let stats = self.store.usage().map(|usage| NodeStats {
                    block_count: usage.block_count,
                    peer_count: self.sessions.open_sessions().count(),
                    storage_used: usage.bytes,
                });
                let _ = reply.send(stats);
            }
            Command::FetchBlock { block_id, reply } => self.fetch_block(block_id, reply),
            Command::Shutdown { reply } => {
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::Frame { peer, conn_id, bytes } => self.handle_frame(peer, conn_id, bytes),
            Internal::LinkClosed { peer, conn_id } => {
                if let Some(session) = self.sessions.close(&peer, conn_id) {
                    debug!("Channel to {} closed", session.peer);
                    self.on_closed(&peer);
                }
            }
            Internal::DialFinished { peer, conn_id, result } => {
                self.dial_finished(peer, conn_id, result)
            }
            Internal::RetryConnect { peer } => self.retry_connect(peer),
            Internal::GossipConnect { peer } => {
                let sessions = &self.sessions;
                if self.gossip.fire(&peer, |p| sessions.is_active(p)) {
                    self.connect(peer, None);
                }
            }
            Internal::RequestTimeout { request_id } => {
                self.pending.expire(request_id);
            }
            Internal::BlockChecked { peer, source, checked } => {
                self.block_checked(peer, source, checked)
            }
            Internal::Sealed { result, reply } => {
                let _ = reply.send(result.and_then(|prepared| self.persist_upload(prepared)));
            }
        }
    }

    // Connection management

    fn connect(&mut self, peer: PeerId, reply: Option<oneshot::Sender<Result<()>>>) {
        let now = self.clock.now();
        match self.sessions.begin_connect(&peer, now) {
            Err(e) => {
                debug!("Not connecting to {}: {}", peer, e);
                if let Some(reply) = reply {
                    let _ = reply.send(Err(e.into()));
                }
            }
            Ok(ConnectPlan::AlreadyOpen) => {
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
            }
            Ok(ConnectPlan::InProgress) => {
                if let Some(reply) = reply {
                    self.connect_waiters.entry(peer).or_default().push(reply);
                }
            }
            Ok(ConnectPlan::Dial { conn_id, attempt }) => {
                if let Some(reply) = reply {
                    self.connect_waiters.entry(peer.clone()).or_default().push(reply);
                }
                self.spawn_dial(peer, conn_id, attempt);
            }
        }
    }

    fn spawn_dial(&self, peer: PeerId, conn_id: u64, attempt: u32) {
        info!("Connecting to {} (attempt {})", peer, attempt);
        let signaling = self.signaling.clone();
        let events = self.internal_tx.clone();
        let timeout = self.settings.mesh.connect_timeout;
        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, signaling.dial(&peer)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout),
            };
            let _ = events.send(Internal::DialFinished {
                peer,
                conn_id,
                result,
            });
        });
    }

    fn dial_finished(&mut self, peer: PeerId, conn_id: u64, result: Result<Channel>) {
        let now = self.clock.now();
        match result {
            Ok(channel) => {
                let Channel { tx, rx, path } = channel;
                match self.sessions.dial_succeeded(&peer, conn_id, Link::new(tx), path, now) {
                    LinkOutcome::Opened { conn_id, replaced } => {
                        let was_open = replaced.is_some();
                        drop(replaced);
                        self.on_open(&peer, conn_id, rx, path, was_open);
                    }
                    LinkOutcome::Rejected(_) => {}
                }
            }
            Err(e) => {
                match self.sessions.dial_failed(&peer, conn_id) {
                    Ok(true) => {}
                    Ok(false) => return,
                    Err(e) => {
                        error!("{}", e);
                        return;
                    }
                }
                let decision = match self.sessions.get_mut(&peer) {
                    Some(session) => session.retry.on_failure(now),
                    None => return,
                };
                match decision {
                    RetryDecision::RetryAt { attempt, delay, .. } => {
                        warn!("Connection to {} failed: {}; retrying in {:?}", peer, e, delay);
                        self.emit(NodeEvent::ConnectFailed {
                            peer: peer.clone(),
                            attempt: attempt - 1,
                            retry_in: Some(delay),
                        });
                        let events = self.internal_tx.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = events.send(Internal::RetryConnect { peer });
                        });
                    }
                    RetryDecision::GiveUp { attempts } => {
                        warn!("Peer {} unreachable after {} attempts: {}", peer, attempts, e);
                        self.sessions.give_up(&peer);
                        self.gossip.forget(&peer);
                        self.emit(NodeEvent::ConnectFailed {
                            peer: peer.clone(),
                            attempt: attempts,
                            retry_in: None,
                        });
                        self.emit(NodeEvent::PeerUnreachable {
                            peer: peer.clone(),
                            attempts,
                        });
                        self.resolve_connect(&peer, || Err(Error::Unreachable {
                            peer: peer.clone(),
                            attempts,
                        }));
                    }
                }
            }
        }
    }

    fn retry_connect(&mut self, peer: PeerId) {
        let now = self.clock.now();
        let due = self
            .sessions
            .get(&peer)
            .is_some_and(|s| s.retry.is_due(now));
        if !due {
            return;
        }
        match self.sessions.begin_retry(&peer) {
            Ok(Some((conn_id, attempt))) => self.spawn_dial(peer, conn_id, attempt),
            Ok(None) => {}
            Err(e) => error!("{}", e),
        }
    }

    fn handle_incoming(&mut self, incoming: IncomingConnection) {
        let IncomingConnection { remote, channel } = incoming;
        let Channel { tx, rx, path } = channel;
        let now = self.clock.now();
        match self.sessions.accept(&remote, Link::new(tx), path, now) {
            Ok(LinkOutcome::Opened { conn_id, replaced }) => {
                let was_open = replaced.is_some();
                drop(replaced);
                if was_open {
                    debug!("Replacing existing channel to {}", remote);
                }
                self.on_open(&remote, conn_id, rx, path, was_open);
            }
            Ok(LinkOutcome::Rejected(_)) => {}
            Err(e) => warn!("Rejected incoming connection from {}: {}", remote, e),
        }
    }

    /// `was_open` marks a channel replacing one that was already open: the
    /// peer stays connected and observers hear nothing new.
    fn on_open(
        &mut self,
        peer: &PeerId,
        conn_id: u64,
        rx: mpsc::UnboundedReceiver<Bytes>,
        path: PathKind,
        was_open: bool,
    ) {
        let reader = spawn_reader(peer.clone(), conn_id, rx, self.internal_tx.clone());
        if let Some(session) = self.sessions.get_mut(peer) {
            if let Some(link) = session.link.as_mut() {
                link.reader = Some(reader);
            }
        }

        self.quality.add_link(peer, path);
        self.gossip.observe(peer, self.clock.now());
        if !was_open {
            self.emit(NodeEvent::PeerConnected {
                peer: peer.clone(),
                path,
            });
        }
        self.resolve_connect(peer, || Ok(()));

        let local = self.sessions.local_id().clone();
        self.send(peer, &proto::handshake(local.as_str()));
        self.send(peer, &proto::get_peer_list(0));
        match self.store.usage() {
            Ok(usage) => self.send(peer, &proto::storage_stats(usage.block_count, usage.bytes)),
            Err(e) => warn!("Could not read store usage: {}", e),
        }
    }

    fn on_closed(&mut self, peer: &PeerId) {
        info!("Session with {} closed", peer);
        self.quality.remove_link(peer);
        self.last_quality.remove(peer);
        self.gossip.forget(peer);
        let failed = self.pending.peer_closed(peer);
        if !failed.is_empty() {
            debug!("{} block requests lost their last peer", failed.len());
        }
        self.emit(NodeEvent::PeerDisconnected { peer: peer.clone() });
    }

    fn disconnect(&mut self, peer: &PeerId) -> Result<()> {
        let link = self.sessions.begin_close(peer).map_err(|e| Error::NotFound(e.to_string()))?;
        drop(link);
        let Some(session) = self.sessions.get(peer) else {
            return Ok(());
        };
        if session.state() == ConnectionState::Closing {
            let conn_id = session.conn_id();
            self.sessions.close(peer, conn_id);
            self.on_closed(peer);
        } else {
            // Abandoned while connecting or waiting to retry
            self.sessions.remove(peer);
            self.resolve_connect(peer, || Err(Error::ConnectionFailed("cancelled".to_string())));
        }
        Ok(())
    }

    fn resolve_connect(&mut self, peer: &PeerId, outcome: impl Fn() -> Result<()>) {
        if let Some(waiters) = self.connect_waiters.remove(peer) {
            for waiter in waiters {
                let _ = waiter.send(outcome());
            }
        }
    }

    fn close_session(&mut self, peer: &PeerId, conn_id: u64) {
        if self.sessions.close(peer, conn_id).is_some() {
            self.on_closed(peer);
        }
    }

    fn send(&mut self, peer: &PeerId, envelope: &Envelope) {
        self.send_bytes(peer, Bytes::from(envelope.to_bytes()));
    }

    fn send_bytes(&mut self, peer: &PeerId, bytes: Bytes) {
        let Some(link) = self
            .sessions
            .get(peer)
            .filter(|s| s.is_open())
            .and_then(|s| s.link.as_ref())
        else {
            return;
        };
        let len = bytes.len();
        if link.tx.send(bytes).is_ok() {
            self.quality.record_sent(peer, len);
        } else {
            // The reader will report the closed channel
            debug!("Send to {} failed, channel closed", peer);
        }
    }

    fn broadcast(&mut self, envelope: &Envelope) -> usize {
        self.broadcast_bytes(&Bytes::from(envelope.to_bytes()))
    }

    fn broadcast_bytes(&mut self, frame: &Bytes) -> usize {
        let peers = self.sessions.open_peers();
        for peer in &peers {
            self.send_bytes(peer, frame.clone());
        }
        peers.len()
    }

    // Message handling

    fn handle_frame(&mut self, peer: PeerId, conn_id: u64, bytes: Bytes) {
        let now = self.clock.now();
        match self.sessions.current(&peer, conn_id) {
            Some(session) => session.last_seen_at = now,
            None => return,
        }
        self.quality.record_received(&peer, bytes.len());

        let envelope = match Envelope::from_bytes(&bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Undecodable message from {}: {}", peer, e);
                return;
            }
        };
        let Some(payload) = envelope.payload else {
            debug!("Ignoring message of unknown type from {}", peer);
            return;
        };
        trace!("{} from {}", payload.kind(), peer);

        match payload {
            Payload::Handshake(handshake) => {
                if handshake.peer_id != peer.as_str()
                    || handshake.protocol_version != cairn_core::PROTOCOL_VERSION as u32
                {
                    warn!(
                        "Handshake mismatch from {}: claims {} v{}",
                        peer, handshake.peer_id, handshake.protocol_version
                    );
                    self.close_session(&peer, conn_id);
                    return;
                }
                if let Some(session) = self.sessions.get_mut(&peer) {
                    session.handshake_done = true;
                }
            }
            Payload::GetPeerList(_) => {
                let list = gossip::advertise(&self.sessions.open_peers(), &peer);
                self.send(&peer, &proto::peer_list(envelope.request_id, list));
            }
            Payload::PeerList(list) => self.handle_peer_list(list.peers),
            Payload::BlockRequest(request) => {
                self.handle_block_request(&peer, envelope.request_id, &request.block_id)
            }
            Payload::BlockResponse(response) => {
                if let Some(wire) = response.block {
                    self.handle_remote_block(&peer, wire, BlockSource::Response);
                }
            }
            Payload::BlockBroadcast(announce) => {
                if let Some(wire) = announce.block {
                    self.handle_remote_block(&peer, wire, BlockSource::Broadcast);
                }
            }
            Payload::StorageStats(stats) => {
                if let Some(session) = self.sessions.get_mut(&peer) {
                    session.remote_stats = Some((stats.block_count, stats.storage_used));
                }
            }
            Payload::Ping(ping) => self.send(&peer, &proto::pong(ping.nonce)),
            Payload::Pong(pong) => {
                if let Some(rtt) = self.quality.record_pong(&peer, pong.nonce, now) {
                    trace!("RTT to {}: {:?}", peer, rtt);
                }
            }
        }
    }

    fn handle_peer_list(&mut self, peers: Vec<String>) {
        let peers: Vec<PeerId> = peers.into_iter().filter_map(|p| p.parse().ok()).collect();
        let sessions = &self.sessions;
        let plans = self.gossip.plan(
            &peers,
            |p| sessions.is_active(p),
            self.clock.now(),
            &mut rand::thread_rng(),
        );
        for plan in plans {
            let events = self.internal_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(plan.delay).await;
                let _ = events.send(Internal::GossipConnect { peer: plan.peer });
            });
        }
    }

    fn handle_block_request(&mut self, peer: &PeerId, request_id: u64, raw_id: &[u8]) {
        let block_id = match BlockId::from_slice(raw_id) {
            Ok(id) => id,
            Err(e) => {
                warn!("Malformed block request from {}: {}", peer, e);
                return;
            }
        };
        let found = match store::load_block(&self.store, &block_id) {
            Ok(found) => found,
            Err(e) => {
                warn!("Could not read block {}: {}", block_id, e);
                None
            }
        };
        self.emit(NodeEvent::BlockRequested {
            peer: peer.clone(),
            block_id,
            found: found.is_some(),
        });
        match found {
            Some(block) => {
                debug!("Serving block {} to {}", block_id, peer);
                self.send(peer, &proto::block_response(request_id, &block));
            }
            // No forwarding
            None => debug!("Block {} requested by {} not held", block_id, peer),
        }
    }

    /// Hashing happens on the blocking pool; the verdict comes back as
    /// `Internal::BlockChecked`.
    fn handle_remote_block(&mut self, peer: &PeerId, wire: proto::WireBlock, source: BlockSource) {
        let events = self.internal_tx.clone();
        let peer = peer.clone();
        tokio::spawn(async move {
            let checked = tokio::task::spawn_blocking(move || check_block(wire))
                .await
                .map_err(|e| Error::Task(e.to_string()))
                .and_then(|r| r);
            let _ = events.send(Internal::BlockChecked {
                peer,
                source,
                checked,
            });
        });
    }

    fn block_checked(&mut self, peer: PeerId, source: BlockSource, checked: Result<(Block, Vec<u8>)>) {
        let (block, bytes) = match checked {
            Ok(checked) => checked,
            Err(e) => {
                warn!("Dropping block from {}: {}", peer, e);
                return;
            }
        };

        match self.store.has_block(&block.id) {
            Ok(true) => {}
            Ok(false) => {
                if let Err(e) = self.store.put_block(&block.id, &bytes) {
                    error!("Failed to store block {}: {}", block.id, e);
                    return;
                }
                debug!("Stored block {} from {} ({:?})", block.id, peer, source);
            }
            Err(e) => {
                error!("Store lookup for {} failed: {}", block.id, e);
                return;
            }
        }

        self.pending.resolve(&block);
        self.emit(NodeEvent::BlockReceived {
            peer,
            block_id: block.id,
            source,
        });
    }

    // Blocks and files

    fn fetch_block(&mut self, block_id: BlockId, reply: BlockReply) {
        match store::load_block(&self.store, &block_id) {
            Ok(Some(block)) => {
                let _ = reply.send(Ok(block));
                return;
            }
            Ok(None) => {}
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        }

        let peers = self.sessions.open_peers();
        if peers.is_empty() {
            let _ = reply.send(Err(Error::BlockUnavailable(block_id)));
            return;
        }

        if let Registration::New { request_id } = self.pending.register(block_id, reply) {
            debug!("Requesting block {} from {} peers", block_id, peers.len());
            self.broadcast(&proto::block_request(request_id, &block_id));
            self.pending.set_asked(request_id, peers);

            let events = self.internal_tx.clone();
            let timeout = self.settings.mesh.request_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = events.send(Internal::RequestTimeout { request_id });
            });
        }
    }

    fn start_upload(&mut self, data: Vec<u8>, name: String, reply: oneshot::Sender<Result<FileRecord>>) {
        let engine = self.engine.clone();
        let events = self.internal_tx.clone();
        let chunk_size = self.settings.chunk_size;
        let erasure = self.settings.erasure;
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || {
                pipeline::seal(&engine, &data, &name, chunk_size, erasure).and_then(PreparedUpload::new)
            })
            .await
            .map_err(|e| Error::Task(e.to_string()))
            .and_then(|r| r);
            let _ = events.send(Internal::Sealed { result, reply });
        });
    }

    /// Blocks first, record last; a failed write rolls the blocks back
    fn persist_upload(&mut self, prepared: PreparedUpload) -> Result<FileRecord> {
        let PreparedUpload {
            sealed,
            encoded,
            frames,
        } = prepared;
        let mut written = Vec::new();
        let mut outcome = Ok(());
        for (block, bytes) in sealed.blocks().zip(&encoded) {
            if let Err(e) = self.store.put_block(&block.id, bytes) {
                outcome = Err(e);
                break;
            }
            written.push(block.id);
        }
        if outcome.is_ok() {
            outcome = self.store.put_file_record(&sealed.record);
        }
        if let Err(e) = outcome {
            error!("Upload of {} failed: {}", sealed.record.name, e);
            for id in &written {
                if let Err(e) = self.store.delete_block(id) {
                    warn!("Rollback of block {} failed: {}", id, e);
                }
            }
            return Err(e);
        }

        let block_count = written.len();
        let mut reached = 0;
        for frame in &frames {
            reached = self.broadcast_bytes(frame);
        }
        info!(
            "Stored {} ({} bytes, {} blocks), broadcast to {} peers",
            sealed.record.name, sealed.record.size, block_count, reached
        );
        self.emit(NodeEvent::FileStored {
            file_id: sealed.record.id,
            name: sealed.record.name.clone(),
            blocks: block_count,
        });
        Ok(sealed.record)
    }

    fn start_download(&mut self, file_id: FileId, reply: oneshot::Sender<Result<Vec<u8>>>) {
        let record = match self.store.get_file_record(&file_id) {
            Ok(Some(record)) => record,
            Ok(None) => {
                let _ = reply.send(Err(Error::NotFound(format!("file {}", file_id))));
                return;
            }
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        let Some(commands) = self.handle.upgrade() else {
            let _ = reply.send(Err(Error::NodeStopped));
            return;
        };
        let handle = NodeHandle {
            local_id: self.sessions.local_id().clone(),
            commands,
            events: self.events.clone(),
        };
        let engine = self.engine.clone();
        tokio::spawn(async move {
            let result = download(handle, engine, record).await;
            let _ = reply.send(result);
        });
    }

    fn delete_file(&mut self, file_id: &FileId) -> Result<()> {
        let record = self
            .store
            .get_file_record(file_id)?
            .ok_or_else(|| Error::NotFound(format!("file {}", file_id)))?;
        // Record first so nothing ever references a deleted block
        self.store.delete_file_record(file_id)?;
        for id in record.all_block_ids() {
            self.store.delete_block(&id)?;
        }
        info!("Deleted {} ({})", record.name, file_id);
        Ok(())
    }

    // Diagnostics

    fn sample_quality(&mut self) {
        let now = self.clock.now();
        for sample in self.quality.sample_all(now) {
            trace!("Quality of {}: {} ({:?})", sample.peer, sample.level, sample.rtt);
            self.last_quality.insert(sample.peer.clone(), sample.clone());
            self.emit(NodeEvent::QualitySampled(sample));
        }
        for peer in self.sessions.open_peers() {
            if let Some(nonce) = self.quality.next_ping(&peer, now) {
                self.send(&peer, &proto::ping(nonce));
            }
        }
    }

    fn peer_infos(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self
            .sessions
            .iter()
            .map(|s| {
                let sample = self.last_quality.get(&s.peer);
                PeerInfo {
                    id: s.peer.clone(),
                    connection_state: s.state(),
                    is_direct: s.is_direct(),
                    quality: sample.map(|q| q.level),
                    rtt: sample.and_then(|q| q.rtt),
                    remote_stats: s.remote_stats.map(|(block_count, storage_used)| RemoteStats {
                        block_count,
                        storage_used,
                    }),
                }
            })
            .collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    fn stop(&mut self) {
        self.pending.fail_all();
        let waiting: Vec<PeerId> = self.connect_waiters.keys().cloned().collect();
        for peer in waiting {
            self.resolve_connect(&peer, || Err(Error::NodeStopped));
        }
        for peer in self.sessions.open_peers() {
            if let Ok(link) = self.sessions.begin_close(&peer) {
                drop(link);
            }
        }
    }
}

/// Decode a received block and confirm its hash covers its payload
fn check_block(wire: proto::WireBlock) -> Result<(Block, Vec<u8>)> {
    let block = Block::try_from(wire)?;
    if !block.is_intact() {
        return Err(Error::InvalidData(format!(
            "block {} hash does not match payload",
            block.id
        )));
    }
    let bytes = block.to_bytes()?;
    Ok((block, bytes))
}

fn spawn_reader(
    peer: PeerId,
    conn_id: u64,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::UnboundedSender<Internal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if events
                .send(Internal::Frame {
                    peer: peer.clone(),
                    conn_id,
                    bytes,
                })
                .is_err()
            {
                return;
            }
        }
        let _ = events.send(Internal::LinkClosed { peer, conn_id });
    })
}

/// Collect a file's blocks, recover what is missing from parity, then
/// verify and decrypt on the blocking pool
async fn download(handle: NodeHandle, engine: Arc<CryptoEngine>, record: FileRecord) -> Result<Vec<u8>> {
    let mut blocks = fetch_all(&handle, &record.block_ids).await?;

    let missing: Vec<BlockId> = record
        .block_ids
        .iter()
        .zip(&blocks)
        .filter(|(_, b)| b.is_none())
        .map(|(id, _)| *id)
        .collect();

    if !missing.is_empty() {
        let Some(layout) = record.erasure.clone() else {
            return Err(Error::BlockUnavailable(missing[0]));
        };
        info!(
            "{} of {} blocks unavailable, recovering from parity",
            missing.len(),
            record.block_ids.len()
        );

        let position: HashMap<BlockId, usize> = record
            .block_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, i))
            .collect();
        let groups: Vec<ParityGroup> = {
            let present = |id: &BlockId| position.get(id).is_some_and(|&i| blocks[i].is_some());
            pipeline::missing_by_group(&layout, present)
                .into_iter()
                .cloned()
                .collect()
        };

        for group in groups {
            let parity = fetch_all(&handle, &group.parity_block_ids).await?;
            let data: Vec<Option<Block>> = group
                .data_block_ids
                .iter()
                .map(|id| position.get(id).and_then(|&i| blocks[i].clone()))
                .collect();

            let layout = layout.clone();
            let group_ids = group.data_block_ids.clone();
            let recovered = tokio::task::spawn_blocking(move || {
                pipeline::recover_group(&layout, &group, &data, &parity)
            })
            .await
            .map_err(|e| Error::Task(e.to_string()))??;

            for (id, block) in group_ids.iter().zip(recovered) {
                if let Some(&i) = position.get(id) {
                    blocks[i] = Some(block);
                }
            }
        }
    }

    let blocks: Vec<Block> = blocks
        .into_iter()
        .zip(&record.block_ids)
        .map(|(b, id)| b.ok_or(Error::BlockUnavailable(*id)))
        .collect::<Result<_>>()?;

    tokio::task::spawn_blocking(move || pipeline::open(&engine, &record, &blocks))
        .await
        .map_err(|e| Error::Task(e.to_string()))?
}

/// Fetch blocks concurrently; unavailable blocks come back as `None`,
/// any other failure aborts
async fn fetch_all(handle: &NodeHandle, ids: &[BlockId]) -> Result<Vec<Option<Block>>> {
    let mut tasks = JoinSet::new();
    for (index, id) in ids.iter().enumerate() {
        let handle = handle.clone();
        let id = *id;
        tasks.spawn(async move { (index, handle.fetch_block(id).await) });
    }

    let mut blocks = vec![None; ids.len()];
    while let Some(joined) = tasks.join_next().await {
        let (index, result) = joined.map_err(|e| Error::Task(e.to_string()))?;
        match result {
            Ok(block) => blocks[index] = Some(block),
            Err(Error::BlockUnavailable(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::store::MemoryStore;
    use cairn_core::transport::memory::MemoryNetwork;

    fn spawn_node(network: &MemoryNetwork, id: &str, store: MemoryStore) -> NodeHandle {
        let (signaling, incoming) = network.join(id).unwrap();
        Node::spawn(
            signaling,
            incoming,
            store,
            Keyring::generate(false),
            NodeSettings {
                chunk_size: 1024,
                ..NodeSettings::default()
            },
        )
    }

    #[tokio::test]
    async fn test_upload_download_roundtrip() {
        let network = MemoryNetwork::new();
        let store = MemoryStore::new();
        let node = spawn_node(&network, "alice", store.clone());

        let data: Vec<u8> = (0..5000u32).map(|i| (i % 256) as u8).collect();
        let record = node.upload(data.clone(), "photo.png").await.unwrap();

        assert_eq!(record.block_ids.len(), 5);
        assert_eq!(record.mime_type.as_deref(), Some("image/png"));
        assert_eq!(node.download(record.id).await.unwrap(), data);
        assert_eq!(node.list_files().await.unwrap(), vec![record.clone()]);

        let stats = node.get_stats().await.unwrap();
        assert_eq!(stats.block_count, 5);
        assert_eq!(stats.peer_count, 0);
        assert!(stats.storage_used > 5000);
    }

    #[tokio::test]
    async fn test_delete_removes_record_and_blocks() {
        let network = MemoryNetwork::new();
        let store = MemoryStore::new();
        let node = spawn_node(&network, "alice", store.clone());

        let record = node.upload(vec![1u8; 3000], "a.bin").await.unwrap();
        node.delete(record.id).await.unwrap();

        assert!(node.list_files().await.unwrap().is_empty());
        assert!(store.block_ids().unwrap().is_empty());
        assert!(matches!(node.download(record.id).await, Err(Error::NotFound(_))));
        assert!(matches!(node.delete(record.id).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_missing_block_without_peers_is_unavailable() {
        let network = MemoryNetwork::new();
        let mut store = MemoryStore::new();
        let node = spawn_node(&network, "alice", store.clone());

        let record = node.upload(vec![9u8; 3000], "a.bin").await.unwrap();
        store.delete_block(&record.block_ids[1]).unwrap();

        let result = node.download(record.id).await;
        assert!(matches!(result, Err(Error::BlockUnavailable(id)) if id == record.block_ids[1]));
    }

    #[tokio::test]
    async fn test_self_connection_rejected() {
        let network = MemoryNetwork::new();
        let node = spawn_node(&network, "alice", MemoryStore::new());
        let result = node.connect(PeerId::from("alice")).await;
        assert!(matches!(result, Err(Error::SelfConnection)));
        assert!(node.list_peers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_handle() {
        let network = MemoryNetwork::new();
        let node = spawn_node(&network, "alice", MemoryStore::new());
        node.shutdown().await.unwrap();
        assert!(matches!(node.list_files().await, Err(Error::NodeStopped)));
    }
}
