//! Transport and signaling boundary
//!
//! Peer identifiers and channel negotiation come from an external
//! rendezvous service. The core only sees the [`Signaling`] trait: dial a
//! remote identifier and get back a reliable, message-oriented
//! bidirectional [`Channel`], or accept one from the incoming queue.
//! NAT traversal happens behind the trait; the negotiated path is reported
//! as [`PathKind`].

use crate::{Error, Result};
use bytes::Bytes;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use tokio::sync::mpsc;

/// Identifier of a peer as issued by the signaling service
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    /// Create a new PeerId from a string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

impl FromStr for PeerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidAddress("empty peer id".to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// How a negotiated channel reaches the peer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathKind {
    /// Peer-to-peer path after successful NAT traversal
    Direct,
    /// Forwarded through an intermediary
    Relayed,
}

impl PathKind {
    pub fn is_direct(&self) -> bool {
        matches!(self, PathKind::Direct)
    }
}

/// A reliable, ordered, message-oriented channel to one peer.
///
/// Dropping `tx` closes the channel for the remote side; `rx` yields `None`
/// once the remote side has gone away.
#[derive(Debug)]
pub struct Channel {
    pub tx: mpsc::UnboundedSender<Bytes>,
    pub rx: mpsc::UnboundedReceiver<Bytes>,
    pub path: PathKind,
}

/// A channel a remote peer opened towards us
#[derive(Debug)]
pub struct IncomingConnection {
    pub remote: PeerId,
    pub channel: Channel,
}

/// Rendezvous/signaling service
///
/// Implementations negotiate a channel out-of-band and prefer a direct path,
/// falling back to a relay. A dial may never resolve when the remote does
/// not answer; callers bound it with their own timeout.
pub trait Signaling: Send + Sync + 'static {
    /// Our own identifier
    fn local_id(&self) -> &PeerId;

    /// Negotiate a channel to `remote`
    fn dial(&self, remote: &PeerId) -> impl Future<Output = Result<Channel>> + Send;
}

pub mod memory {
    //! In-process signaling network for tests and offline use

    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    struct Member {
        incoming: mpsc::UnboundedSender<IncomingConnection>,
        unresponsive: bool,
        relay_only: bool,
    }

    enum DialOutcome {
        Ready(Channel),
        Hang,
    }

    /// A shared registry of peers that can dial each other
    #[derive(Clone, Default)]
    pub struct MemoryNetwork {
        members: Arc<Mutex<HashMap<PeerId, Member>>>,
    }

    impl MemoryNetwork {
        pub fn new() -> Self {
            Self::default()
        }

        /// Register a peer and return its signaling handle plus the queue of
        /// connections other peers open towards it
        pub fn join(
            &self,
            id: impl Into<PeerId>,
        ) -> Result<(MemorySignaling, mpsc::UnboundedReceiver<IncomingConnection>)> {
            let id = id.into();
            let (tx, rx) = mpsc::unbounded_channel();
            let mut members = self.lock()?;
            if members.contains_key(&id) {
                return Err(Error::InvalidAddress(format!("{} already joined", id)));
            }
            members.insert(
                id.clone(),
                Member {
                    incoming: tx,
                    unresponsive: false,
                    relay_only: false,
                },
            );
            Ok((
                MemorySignaling {
                    id,
                    network: self.clone(),
                },
                rx,
            ))
        }

        /// Remove a peer; later dials to it fail
        pub fn leave(&self, id: &PeerId) -> Result<()> {
            self.lock()?.remove(id);
            Ok(())
        }

        /// Dials to this peer never complete
        pub fn set_unresponsive(&self, id: &PeerId, unresponsive: bool) -> Result<()> {
            if let Some(member) = self.lock()?.get_mut(id) {
                member.unresponsive = unresponsive;
            }
            Ok(())
        }

        /// Channels involving this peer are reported as relayed
        pub fn set_relay_only(&self, id: &PeerId, relay_only: bool) -> Result<()> {
            if let Some(member) = self.lock()?.get_mut(id) {
                member.relay_only = relay_only;
            }
            Ok(())
        }

        /// Whether a peer is currently registered
        pub fn contains(&self, id: &PeerId) -> bool {
            self.lock().map(|m| m.contains_key(id)).unwrap_or(false)
        }

        fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<PeerId, Member>>> {
            self.members
                .lock()
                .map_err(|_| Error::ConnectionFailed("signaling registry poisoned".to_string()))
        }

        fn connect(&self, from: &PeerId, to: &PeerId) -> Result<DialOutcome> {
            let members = self.lock()?;
            let target = members
                .get(to)
                .ok_or_else(|| Error::ConnectionFailed(format!("{} is not registered", to)))?;
            if target.unresponsive {
                tracing::debug!("{} is unresponsive; dial from {} will hang", to, from);
                return Ok(DialOutcome::Hang);
            }
            let relayed = target.relay_only || members.get(from).map(|m| m.relay_only).unwrap_or(false);
            let path = if relayed {
                PathKind::Relayed
            } else {
                PathKind::Direct
            };

            let (to_remote_tx, to_remote_rx) = mpsc::unbounded_channel();
            let (to_local_tx, to_local_rx) = mpsc::unbounded_channel();
            target
                .incoming
                .send(IncomingConnection {
                    remote: from.clone(),
                    channel: Channel {
                        tx: to_local_tx,
                        rx: to_remote_rx,
                        path,
                    },
                })
                .map_err(|_| Error::ConnectionFailed(format!("{} is not accepting", to)))?;

            Ok(DialOutcome::Ready(Channel {
                tx: to_remote_tx,
                rx: to_local_rx,
                path,
            }))
        }
    }

    /// One peer's view of a [`MemoryNetwork`]
    #[derive(Clone)]
    pub struct MemorySignaling {
        id: PeerId,
        network: MemoryNetwork,
    }

    impl MemorySignaling {
        pub fn network(&self) -> &MemoryNetwork {
            &self.network
        }
    }

    impl Signaling for MemorySignaling {
        fn local_id(&self) -> &PeerId {
            &self.id
        }

        fn dial(&self, remote: &PeerId) -> impl Future<Output = Result<Channel>> + Send {
            let outcome = self.network.connect(&self.id, remote);
            async move {
                match outcome? {
                    DialOutcome::Ready(channel) => Ok(channel),
                    DialOutcome::Hang => std::future::pending().await,
                }
            }
        }
    }

}
