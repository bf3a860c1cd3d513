//! Cairn Node Library
//!
//! The long-lived storage node: event loop, block replication, the
//! upload/download pipeline and the SQLite block store.

pub mod config;
pub mod node;
pub mod pipeline;
pub mod replication;
pub mod sqlite_store;

pub use config::Config;
pub use node::{BlockSource, Node, NodeEvent, NodeHandle, NodeSettings, NodeStats, PeerInfo, RemoteStats};
pub use sqlite_store::SqliteStore;
