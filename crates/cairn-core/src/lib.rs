//! Cairn Core - Shared types, protocols, and engines
//!
//! This crate provides the building blocks for the Cairn peer-to-peer
//! encrypted block storage layer: the cryptographic engine, the block codec,
//! the hash chain, erasure coding, the wire protocol, the transport boundary
//! and the local store interface.

pub mod chain;
pub mod chunk;
pub mod crypto;
pub mod erasure;
pub mod error;
pub mod keys;
pub mod proto;
pub mod store;
pub mod transport;
pub mod types;

pub use error::{Error, Result};
pub use transport::{Channel, IncomingConnection, PathKind, PeerId, Signaling};
pub use types::*;

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Default chunk size: 256 KB
pub const CHUNK_SIZE: usize = 256 * 1024;
