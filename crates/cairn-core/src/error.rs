//! Error types for Cairn

use crate::chain::ChainBreak;
use crate::crypto::CryptoError;
use crate::erasure::ErasureError;
use crate::transport::PeerId;
use crate::types::BlockId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cryptographic failure: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Chain integrity failure at block {index}: {reason}")]
    ChainIntegrity { index: usize, reason: ChainBreak },

    #[error("Insufficient shards: have {have}, need {need}")]
    InsufficientShards { have: usize, need: usize },

    #[error("Erasure coding error: {0}")]
    Erasure(ErasureError),

    #[error("Block unavailable: {0}")]
    BlockUnavailable(BlockId),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u8, actual: u32 },

    #[error("Decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Peer {peer} unreachable after {attempts} attempts")]
    Unreachable { peer: PeerId, attempts: u32 },

    #[error("Refusing to connect to own identifier")]
    SelfConnection,

    #[error("Operation timed out")]
    Timeout,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Node is not running")]
    NodeStopped,

    #[error("Background task failed: {0}")]
    Task(String),
}

impl From<ErasureError> for Error {
    fn from(err: ErasureError) -> Self {
        match err {
            ErasureError::InsufficientShards { have, need } => {
                Error::InsufficientShards { have, need }
            }
            other => Error::Erasure(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
