//! Outstanding block requests
//!
//! A missing block is requested from every open peer at once. The first
//! matching response wins. A request ends as unavailable when it times
//! out, or as soon as every peer it was sent to has disconnected.
//! Concurrent fetches of the same block share one request.

use cairn_core::{Block, BlockId, Error, PeerId, Result};
use std::collections::{HashMap, HashSet};
use tokio::sync::oneshot;
use tracing::debug;

pub type BlockReply = oneshot::Sender<Result<Block>>;

struct Pending {
    request_id: u64,
    asked: HashSet<PeerId>,
    waiters: Vec<BlockReply>,
}

/// Result of registering interest in a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// A request for this block is already in flight
    Joined,
    /// Send a new `block-request` with this id
    New { request_id: u64 },
}

#[derive(Default)]
pub struct PendingRequests {
    next_request_id: u64,
    by_block: HashMap<BlockId, Pending>,
    by_request: HashMap<u64, BlockId>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            next_request_id: 1,
            ..Default::default()
        }
    }

    pub fn register(&mut self, block_id: BlockId, waiter: BlockReply) -> Registration {
        if let Some(pending) = self.by_block.get_mut(&block_id) {
            pending.waiters.push(waiter);
            return Registration::Joined;
        }
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        self.by_block.insert(
            block_id,
            Pending {
                request_id,
                asked: HashSet::new(),
                waiters: vec![waiter],
            },
        );
        self.by_request.insert(request_id, block_id);
        Registration::New { request_id }
    }

    /// Record which peers a request went to
    pub fn set_asked(&mut self, request_id: u64, peers: impl IntoIterator<Item = PeerId>) {
        if let Some(block_id) = self.by_request.get(&request_id) {
            if let Some(pending) = self.by_block.get_mut(block_id) {
                pending.asked.extend(peers);
            }
        }
    }

    pub fn is_pending(&self, block_id: &BlockId) -> bool {
        self.by_block.contains_key(block_id)
    }

    pub fn len(&self) -> usize {
        self.by_block.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_block.is_empty()
    }

    fn take(&mut self, block_id: &BlockId) -> Option<Pending> {
        let pending = self.by_block.remove(block_id)?;
        self.by_request.remove(&pending.request_id);
        Some(pending)
    }

    /// Hand a received block to everyone waiting for it. Returns the number
    /// of waiters served.
    pub fn resolve(&mut self, block: &Block) -> usize {
        let Some(pending) = self.take(&block.id) else {
            return 0;
        };
        let count = pending.waiters.len();
        for waiter in pending.waiters {
            let _ = waiter.send(Ok(block.clone()));
        }
        count
    }

    /// The bounded wait for a request elapsed
    pub fn expire(&mut self, request_id: u64) -> bool {
        let Some(block_id) = self.by_request.get(&request_id).copied() else {
            return false;
        };
        debug!("Block request {} for {} timed out", request_id, block_id);
        self.fail(&block_id, || Error::BlockUnavailable(block_id));
        true
    }

    /// A session closed: drop it from every request and fail the requests
    /// nobody is left to answer. Returns the failed block ids.
    pub fn peer_closed(&mut self, peer: &PeerId) -> Vec<BlockId> {
        let orphaned: Vec<BlockId> = self
            .by_block
            .iter_mut()
            .filter_map(|(id, pending)| {
                (pending.asked.remove(peer) && pending.asked.is_empty()).then_some(*id)
            })
            .collect();
        for block_id in &orphaned {
            self.fail(block_id, || Error::BlockUnavailable(*block_id));
        }
        orphaned
    }

    /// Fail every outstanding request, used on shutdown
    pub fn fail_all(&mut self) {
        let ids: Vec<BlockId> = self.by_block.keys().copied().collect();
        for block_id in ids {
            self.fail(&block_id, || Error::NodeStopped);
        }
    }

    fn fail(&mut self, block_id: &BlockId, error: impl Fn() -> Error) {
        if let Some(pending) = self.take(block_id) {
            for waiter in pending.waiters {
                let _ = waiter.send(Err(error()));
            }
        }
    }
}
