//! Peer exchange
//!
//! When a session opens both sides ask for each other's peer list. Each
//! received list turns into connect attempts to peers we are not yet
//! talking to, spread over a random delay so a large list does not cause a
//! connection storm. Gossip is informational only: a peer missing from a
//! list may still exist, and hearing about a peer twice changes nothing.

use cairn_core::PeerId;
use rand::Rng;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Most peers remembered at once
pub const MAX_KNOWN_PEERS: usize = 1024;

/// A connect attempt to run after `delay`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectPlan {
    pub peer: PeerId,
    pub delay: Duration,
}

pub struct PeerExchange {
    local: PeerId,
    jitter: Duration,
    limit: usize,
    /// Peers we have heard of, with when we last heard of them
    known: BTreeMap<PeerId, Instant>,
    /// Peers with a connect attempt waiting on its delay
    scheduled: HashSet<PeerId>,
}

impl PeerExchange {
    pub fn new(local: PeerId, jitter: Duration) -> Self {
        Self::with_limit(local, jitter, MAX_KNOWN_PEERS)
    }

    /// Remember at most `limit` peers; past it the stalest is forgotten
    pub fn with_limit(local: PeerId, jitter: Duration, limit: usize) -> Self {
        Self {
            local,
            jitter,
            limit: limit.max(1),
            known: BTreeMap::new(),
            scheduled: HashSet::new(),
        }
    }

    /// Turn a received peer list into staggered connect attempts.
    ///
    /// `is_active` reports peers that already have an open or pending
    /// session; those, ourselves, duplicates and peers already scheduled
    /// are skipped.
    pub fn plan<R: Rng + ?Sized>(
        &mut self,
        peers: &[PeerId],
        is_active: impl Fn(&PeerId) -> bool,
        now: Instant,
        rng: &mut R,
    ) -> Vec<ConnectPlan> {
        let mut plans = Vec::new();
        for peer in peers {
            if *peer == self.local {
                continue;
            }
            self.remember(peer, now);
            if is_active(peer) || self.scheduled.contains(peer) {
                continue;
            }
            let jitter_ms = self.jitter.as_millis() as u64;
            let delay = Duration::from_millis(rng.gen_range(0..=jitter_ms));
            debug!("Scheduling gossip connect to {} in {:?}", peer, delay);
            self.scheduled.insert(peer.clone());
            plans.push(ConnectPlan {
                peer: peer.clone(),
                delay,
            });
        }
        plans
    }

    /// A scheduled delay elapsed. Returns whether the attempt should still run.
    pub fn fire(&mut self, peer: &PeerId, is_active: impl Fn(&PeerId) -> bool) -> bool {
        self.scheduled.remove(peer) && !is_active(peer)
    }

    /// Record a peer seen directly (session opened)
    pub fn observe(&mut self, peer: &PeerId, now: Instant) {
        if *peer != self.local {
            self.remember(peer, now);
        }
    }

    /// Drop a peer that left or was given up on, cancelling any scheduled attempt
    pub fn forget(&mut self, peer: &PeerId) {
        self.known.remove(peer);
        self.scheduled.remove(peer);
    }

    fn remember(&mut self, peer: &PeerId, now: Instant) {
        self.known.insert(peer.clone(), now);
        while self.known.len() > self.limit {
            let stalest = self
                .known
                .iter()
                .filter(|(p, _)| *p != peer)
                .min_by_key(|(_, heard)| **heard)
                .map(|(p, _)| p.clone());
            match stalest {
                Some(stalest) => {
                    debug!("Forgetting gossiped peer {}", stalest);
                    self.known.remove(&stalest);
                }
                None => break,
            }
        }
    }

    pub fn is_scheduled(&self, peer: &PeerId) -> bool {
        self.scheduled.contains(peer)
    }

    pub fn known_peers(&self) -> impl Iterator<Item = &PeerId> {
        self.known.keys()
    }
}

/// The list sent in reply to `get-peer-list`: our open peers minus the requester
pub fn advertise(open_peers: &[PeerId], requester: &PeerId) -> Vec<String> {
    open_peers
        .iter()
        .filter(|p| *p != requester)
        .map(|p| p.as_str().to_string())
        .collect()
}
