//! Per-peer session lifecycle
//!
//! ```text
//! idle -> connecting -> open -> closing -> closed
//!            |           |
//!            +-> failed <+
//! ```
//!
//! A failed session may go back to connecting for a retry; a closed one
//! may be reconnected. At most one session exists per remote identifier.
//! Every dial or accept gets a fresh connection id, and events carrying a
//! superseded id are ignored.

use crate::retry::{RetryPolicy, RetryState};
use crate::{MeshError, Result};
use cairn_core::{PathKind, PeerId};
use std::collections::HashMap;
use std::fmt;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn can_transition_to(self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, to),
            (Idle, Connecting)
                | (Connecting, Open)
                | (Connecting, Failed)
                | (Connecting, Closed)
                | (Open, Closing)
                | (Open, Closed)
                | (Open, Failed)
                | (Closing, Closed)
                | (Failed, Connecting)
                | (Closed, Connecting)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transient state of one peer session, never persisted.
///
/// `L` is the caller's handle to the live channel.
#[derive(Debug)]
pub struct PeerSession<L> {
    pub peer: PeerId,
    state: ConnectionState,
    conn_id: u64,
    /// Whether we initiated the current connection
    pub outbound: bool,
    pub path: Option<PathKind>,
    pub last_seen_at: Instant,
    pub link: Option<L>,
    pub retry: RetryState,
    /// Peer sent a valid handshake on the current connection
    pub handshake_done: bool,
    /// Last `storage-stats` the peer reported
    pub remote_stats: Option<(u64, u64)>,
}

impl<L> PeerSession<L> {
    fn new(peer: PeerId, policy: RetryPolicy, now: Instant) -> Self {
        Self {
            peer,
            state: ConnectionState::Idle,
            conn_id: 0,
            outbound: false,
            path: None,
            last_seen_at: now,
            link: None,
            retry: RetryState::new(policy),
            handshake_done: false,
            remote_stats: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    pub fn is_direct(&self) -> bool {
        self.path.is_some_and(|p| p.is_direct())
    }

    fn transition(&mut self, to: ConnectionState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(MeshError::InvalidTransition {
                peer: self.peer.clone(),
                from: self.state,
                to,
            });
        }
        debug!("Session {}: {} -> {}", self.peer, self.state, to);
        self.state = to;
        Ok(())
    }

    fn open(&mut self, conn_id: u64, link: L, path: PathKind, outbound: bool, now: Instant) {
        self.state = ConnectionState::Open;
        self.conn_id = conn_id;
        self.link = Some(link);
        self.path = Some(path);
        self.outbound = outbound;
        self.last_seen_at = now;
        self.handshake_done = false;
        self.remote_stats = None;
        self.retry.reset();
    }
}

/// Outcome of asking for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPlan {
    /// A session is already open; nothing to do
    AlreadyOpen,
    /// A dial or retry is already under way
    InProgress,
    /// Issue a dial tagged with this connection id
    Dial { conn_id: u64, attempt: u32 },
}

/// Outcome of a finished dial or an incoming connection
#[derive(Debug)]
pub enum LinkOutcome<L> {
    /// The channel became the session's link
    Opened { conn_id: u64, replaced: Option<L> },
    /// The channel lost a race or belongs to a superseded attempt; drop it
    Rejected(L),
}

/// Every session of one node, keyed by remote identifier
pub struct SessionTable<L> {
    local: PeerId,
    policy: RetryPolicy,
    sessions: HashMap<PeerId, PeerSession<L>>,
    next_conn_id: u64,
}

impl<L> SessionTable<L> {
    pub fn new(local: PeerId, policy: RetryPolicy) -> Self {
        Self {
            local,
            policy,
            sessions: HashMap::new(),
            next_conn_id: 1,
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local
    }

    fn allocate_conn_id(&mut self) -> u64 {
        let id = self.next_conn_id;
        self.next_conn_id += 1;
        id
    }

    /// Decide whether a connect request needs a dial.
    ///
    /// Self-connection is rejected before anything is issued.
    pub fn begin_connect(&mut self, peer: &PeerId, now: Instant) -> Result<ConnectPlan> {
        if *peer == self.local {
            return Err(MeshError::SelfConnection);
        }
        let conn_id = self.allocate_conn_id();
        let policy = self.policy.clone();
        let session = self
            .sessions
            .entry(peer.clone())
            .or_insert_with(|| PeerSession::new(peer.clone(), policy.clone(), now));

        match session.state {
            ConnectionState::Open => return Ok(ConnectPlan::AlreadyOpen),
            ConnectionState::Connecting | ConnectionState::Failed => {
                return Ok(ConnectPlan::InProgress)
            }
            ConnectionState::Closing => {
                // The old link is being torn down; start over with a fresh record
                *session = PeerSession::new(peer.clone(), policy, now);
            }
            ConnectionState::Idle | ConnectionState::Closed => {}
        }

        session.retry.reset();
        let attempt = session.retry.start_attempt();
        session.transition(ConnectionState::Connecting)?;
        session.conn_id = conn_id;
        session.outbound = true;
        Ok(ConnectPlan::Dial { conn_id, attempt })
    }

    /// Move a failed session back to connecting for its next attempt
    pub fn begin_retry(&mut self, peer: &PeerId) -> Result<Option<(u64, u32)>> {
        let conn_id = self.allocate_conn_id();
        let Some(session) = self.sessions.get_mut(peer) else {
            return Ok(None);
        };
        if session.state != ConnectionState::Failed {
            return Ok(None);
        }
        session.transition(ConnectionState::Connecting)?;
        session.conn_id = conn_id;
        let attempt = session.retry.start_attempt();
        Ok(Some((conn_id, attempt)))
    }

    /// A dial we issued produced a channel
    pub fn dial_succeeded(
        &mut self,
        peer: &PeerId,
        conn_id: u64,
        link: L,
        path: PathKind,
        now: Instant,
    ) -> LinkOutcome<L> {
        match self.sessions.get_mut(peer) {
            Some(session)
                if session.conn_id == conn_id && session.state == ConnectionState::Connecting =>
            {
                session.open(conn_id, link, path, true, now);
                info!("Session open with {} ({:?}, outbound)", peer, path);
                LinkOutcome::Opened {
                    conn_id,
                    replaced: None,
                }
            }
            _ => {
                debug!("Dropping superseded dial {} to {}", conn_id, peer);
                LinkOutcome::Rejected(link)
            }
        }
    }

    /// A dial we issued failed or timed out. Returns false for stale attempts.
    pub fn dial_failed(&mut self, peer: &PeerId, conn_id: u64) -> Result<bool> {
        match self.sessions.get_mut(peer) {
            Some(session)
                if session.conn_id == conn_id && session.state == ConnectionState::Connecting =>
            {
                session.transition(ConnectionState::Failed)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// A remote peer opened a channel towards us.
    ///
    /// When both sides dial at once, the dial initiated by the smaller
    /// identifier wins on both ends.
    pub fn accept(&mut self, peer: &PeerId, link: L, path: PathKind, now: Instant) -> Result<LinkOutcome<L>> {
        if *peer == self.local {
            return Err(MeshError::SelfConnection);
        }
        let conn_id = self.allocate_conn_id();
        let remote_wins = *peer < self.local;
        let policy = self.policy.clone();
        let session = self
            .sessions
            .entry(peer.clone())
            .or_insert_with(|| PeerSession::new(peer.clone(), policy, now));

        let contested = match session.state {
            ConnectionState::Connecting => true,
            ConnectionState::Open => session.outbound,
            _ => false,
        };
        if contested && !remote_wins {
            debug!("Simultaneous connect with {}: keeping our dial", peer);
            return Ok(LinkOutcome::Rejected(link));
        }

        let replaced = session.link.take();
        session.open(conn_id, link, path, false, now);
        info!("Session open with {} ({:?}, inbound)", peer, path);
        Ok(LinkOutcome::Opened { conn_id, replaced })
    }

    /// Retry gave up; the session is destroyed
    pub fn give_up(&mut self, peer: &PeerId) -> Option<PeerSession<L>> {
        match self.sessions.get(peer) {
            Some(s) if s.state == ConnectionState::Failed => self.sessions.remove(peer),
            _ => None,
        }
    }

    /// Start an orderly local close of an open session and hand back its link
    pub fn begin_close(&mut self, peer: &PeerId) -> Result<Option<L>> {
        let session = self
            .sessions
            .get_mut(peer)
            .ok_or_else(|| MeshError::UnknownSession(peer.clone()))?;
        match session.state {
            ConnectionState::Open => {
                session.transition(ConnectionState::Closing)?;
                Ok(session.link.take())
            }
            ConnectionState::Connecting | ConnectionState::Failed => {
                // Abandon the attempt; any late dial result is stale
                session.state = ConnectionState::Closed;
                Ok(session.link.take())
            }
            _ => Ok(None),
        }
    }

    /// The connection went away, or a local close completed. The session
    /// is destroyed and returned; `None` for stale or unknown connections.
    pub fn close(&mut self, peer: &PeerId, conn_id: u64) -> Option<PeerSession<L>> {
        let session = self.sessions.get_mut(peer)?;
        if session.conn_id != conn_id {
            return None;
        }
        match session.state {
            ConnectionState::Open | ConnectionState::Closing | ConnectionState::Closed => {
                session.state = ConnectionState::Closed;
                session.link = None;
                self.sessions.remove(peer)
            }
            _ => None,
        }
    }

    /// Remove an abandoned or closed session outright
    pub fn remove(&mut self, peer: &PeerId) -> Option<PeerSession<L>> {
        self.sessions.remove(peer)
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PeerSession<L>> {
        self.sessions.get(peer)
    }

    pub fn get_mut(&mut self, peer: &PeerId) -> Option<&mut PeerSession<L>> {
        self.sessions.get_mut(peer)
    }

    /// Open session for this connection id, if current
    pub fn current(&mut self, peer: &PeerId, conn_id: u64) -> Option<&mut PeerSession<L>> {
        self.sessions
            .get_mut(peer)
            .filter(|s| s.conn_id == conn_id && s.state == ConnectionState::Open)
    }

    pub fn is_open(&self, peer: &PeerId) -> bool {
        self.sessions.get(peer).is_some_and(|s| s.is_open())
    }

    /// Open, connecting or waiting to retry
    pub fn is_active(&self, peer: &PeerId) -> bool {
        self.sessions.get(peer).is_some_and(|s| {
            matches!(
                s.state,
                ConnectionState::Open | ConnectionState::Connecting | ConnectionState::Failed
            )
        })
    }

    pub fn open_sessions(&self) -> impl Iterator<Item = &PeerSession<L>> {
        self.sessions.values().filter(|s| s.is_open())
    }

    pub fn open_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.open_sessions().map(|s| s.peer.clone()).collect();
        peers.sort();
        peers
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerSession<L>> {
        self.sessions.values()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
