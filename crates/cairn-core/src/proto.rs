//! Protocol buffer message definitions
//!
//! These are manually defined with prost derives, avoiding the need for
//! protoc at build time. The oneof tag doubles as the message type; a tag
//! this build does not know decodes to an envelope without payload and is
//! ignored by the receiver.

use crate::types::{Block, BlockId};
use crate::{Error, Result, PROTOCOL_VERSION};
use prost::Message;

/// Message envelope wrapping all protocol messages
#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    /// Protocol version
    #[prost(uint32, tag = "1")]
    pub version: u32,
    /// Request ID for correlation
    #[prost(uint64, tag = "2")]
    pub request_id: u64,
    /// The actual message payload
    #[prost(oneof = "Payload", tags = "10, 11, 12, 20, 21, 22, 30, 40, 41")]
    pub payload: Option<Payload>,
}

/// Payload variants for the envelope
#[derive(Clone, PartialEq, prost::Oneof)]
pub enum Payload {
    #[prost(message, tag = "10")]
    Handshake(Handshake),
    #[prost(message, tag = "11")]
    GetPeerList(GetPeerList),
    #[prost(message, tag = "12")]
    PeerList(PeerList),
    #[prost(message, tag = "20")]
    BlockRequest(BlockRequest),
    #[prost(message, tag = "21")]
    BlockResponse(BlockResponse),
    #[prost(message, tag = "22")]
    BlockBroadcast(BlockBroadcast),
    #[prost(message, tag = "30")]
    StorageStats(StorageStats),
    #[prost(message, tag = "40")]
    Ping(Ping),
    #[prost(message, tag = "41")]
    Pong(Pong),
}

impl Payload {
    /// Short message type name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Handshake(_) => "handshake",
            Payload::GetPeerList(_) => "get-peer-list",
            Payload::PeerList(_) => "peer-list",
            Payload::BlockRequest(_) => "block-request",
            Payload::BlockResponse(_) => "block-response",
            Payload::BlockBroadcast(_) => "block-broadcast",
            Payload::StorageStats(_) => "storage-stats",
            Payload::Ping(_) => "ping",
            Payload::Pong(_) => "pong",
        }
    }
}

// Session messages

#[derive(Clone, PartialEq, Message)]
pub struct Handshake {
    #[prost(string, tag = "1")]
    pub peer_id: String,
    #[prost(uint32, tag = "2")]
    pub protocol_version: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct GetPeerList {}

#[derive(Clone, PartialEq, Message)]
pub struct PeerList {
    #[prost(string, repeated, tag = "1")]
    pub peers: Vec<String>,
}

// Replication messages

/// A block as carried on the wire
#[derive(Clone, PartialEq, Message)]
pub struct WireBlock {
    #[prost(bytes, tag = "1")]
    pub id: Vec<u8>,
    #[prost(bytes, tag = "2")]
    pub payload: Vec<u8>,
    #[prost(uint32, tag = "3")]
    pub sequence_index: u32,
    /// Empty for the first block of a chain
    #[prost(bytes, tag = "4")]
    pub previous_hash: Vec<u8>,
    #[prost(bytes, tag = "5")]
    pub hash: Vec<u8>,
    #[prost(uint64, tag = "6")]
    pub created_at: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct BlockRequest {
    #[prost(bytes, tag = "1")]
    pub block_id: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct BlockResponse {
    #[prost(message, optional, tag = "1")]
    pub block: Option<WireBlock>,
}

#[derive(Clone, PartialEq, Message)]
pub struct BlockBroadcast {
    #[prost(message, optional, tag = "1")]
    pub block: Option<WireBlock>,
}

#[derive(Clone, PartialEq, Message)]
pub struct StorageStats {
    #[prost(uint64, tag = "1")]
    pub block_count: u64,
    #[prost(uint64, tag = "2")]
    pub storage_used: u64,
}

// Quality probes

#[derive(Clone, PartialEq, Message)]
pub struct Ping {
    #[prost(uint64, tag = "1")]
    pub nonce: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct Pong {
    #[prost(uint64, tag = "1")]
    pub nonce: u64,
}

// Helper implementations

impl Envelope {
    /// Create a new envelope with the current protocol version
    pub fn new(request_id: u64, payload: Payload) -> Self {
        Self {
            version: PROTOCOL_VERSION as u32,
            request_id,
            payload: Some(payload),
        }
    }

    /// Encode the envelope to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    /// Decode an envelope from bytes, checking version compatibility
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let envelope = Self::decode(buf)?;

        if envelope.version != PROTOCOL_VERSION as u32 {
            return Err(Error::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: envelope.version,
            });
        }

        Ok(envelope)
    }
}

impl From<&Block> for WireBlock {
    fn from(block: &Block) -> Self {
        Self {
            id: block.id.as_bytes().to_vec(),
            payload: block.payload.clone(),
            sequence_index: block.sequence_index,
            previous_hash: block.previous_hash.map(|h| h.to_vec()).unwrap_or_default(),
            hash: block.hash.to_vec(),
            created_at: block.created_at,
        }
    }
}

impl TryFrom<WireBlock> for Block {
    type Error = Error;

    fn try_from(wire: WireBlock) -> Result<Self> {
        let hash = wire
            .hash
            .as_slice()
            .try_into()
            .map_err(|_| Error::Protocol(format!("block hash must be 32 bytes, got {}", wire.hash.len())))?;
        let previous_hash = match wire.previous_hash.len() {
            0 => None,
            32 => {
                let mut prev = [0u8; 32];
                prev.copy_from_slice(&wire.previous_hash);
                Some(prev)
            }
            n => return Err(Error::Protocol(format!("previous hash must be 32 bytes, got {}", n))),
        };
        Ok(Block {
            id: BlockId::from_slice(&wire.id)?,
            payload: wire.payload,
            sequence_index: wire.sequence_index,
            previous_hash,
            hash,
            created_at: wire.created_at,
        })
    }
}

/// Helper functions to create common message types

pub fn handshake(peer_id: &str) -> Envelope {
    Envelope::new(
        0,
        Payload::Handshake(Handshake {
            peer_id: peer_id.to_string(),
            protocol_version: PROTOCOL_VERSION as u32,
        }),
    )
}

pub fn get_peer_list(request_id: u64) -> Envelope {
    Envelope::new(request_id, Payload::GetPeerList(GetPeerList {}))
}

pub fn peer_list(request_id: u64, peers: Vec<String>) -> Envelope {
    Envelope::new(request_id, Payload::PeerList(PeerList { peers }))
}

pub fn block_request(request_id: u64, block_id: &BlockId) -> Envelope {
    Envelope::new(
        request_id,
        Payload::BlockRequest(BlockRequest {
            block_id: block_id.as_bytes().to_vec(),
        }),
    )
}

pub fn block_response(request_id: u64, block: &Block) -> Envelope {
    Envelope::new(
        request_id,
        Payload::BlockResponse(BlockResponse {
            block: Some(block.into()),
        }),
    )
}

pub fn block_broadcast(block: &Block) -> Envelope {
    Envelope::new(
        0,
        Payload::BlockBroadcast(BlockBroadcast {
            block: Some(block.into()),
        }),
    )
}

pub fn storage_stats(block_count: u64, storage_used: u64) -> Envelope {
    Envelope::new(
        0,
        Payload::StorageStats(StorageStats {
            block_count,
            storage_used,
        }),
    )
}

pub fn ping(nonce: u64) -> Envelope {
    Envelope::new(0, Payload::Ping(Ping { nonce }))
}

pub fn pong(nonce: u64) -> Envelope {
    Envelope::new(0, Payload::Pong(Pong { nonce }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_roundtrip() {
        let original = peer_list(42, vec!["alice".to_string(), "bob".to_string()]);
        let bytes = original.to_bytes();
        let decoded = Envelope::from_bytes(&bytes).unwrap();

        assert_eq!(original, decoded);
        assert_eq!(decoded.payload.map(|p| p.kind()), Some("peer-list"));
    }

    #[test]
    fn test_block_survives_wire() {
        let mut blocks = vec![
            Block::new(b"first".to_vec(), 0).unwrap(),
            Block::new(b"second".to_vec(), 0).unwrap(),
        ];
        crate::chain::build(&mut blocks);

        for block in &blocks {
            let bytes = block_broadcast(block).to_bytes();
            let envelope = Envelope::from_bytes(&bytes).unwrap();
            let Some(Payload::BlockBroadcast(BlockBroadcast { block: Some(wire) })) = envelope.payload else {
                panic!("expected block broadcast");
            };
            assert_eq!(&Block::try_from(wire).unwrap(), block);
        }
    }

    #[test]
    fn test_malformed_wire_block_rejected() {
        let block = Block::new(b"data".to_vec(), 0).unwrap();
        let mut wire = WireBlock::from(&block);
        wire.hash.truncate(16);
        assert!(matches!(Block::try_from(wire), Err(Error::Protocol(_))));

        let mut wire = WireBlock::from(&block);
        wire.id.push(0);
        assert!(Block::try_from(wire).is_err());
    }

    #[test]
    fn test_version_mismatch() {
        let mut envelope = ping(7);
        envelope.version = 99;
        let result = Envelope::from_bytes(&envelope.to_bytes());
        assert!(matches!(
            result,
            Err(Error::VersionMismatch { actual: 99, .. })
        ));
    }

    #[test]
    fn test_unknown_type_decodes_without_payload() {
        // Hand-encode an envelope whose only payload field uses tag 99
        #[derive(Clone, PartialEq, Message)]
        struct FutureEnvelope {
            #[prost(uint32, tag = "1")]
            version: u32,
            #[prost(uint64, tag = "2")]
            request_id: u64,
            #[prost(message, optional, tag = "99")]
            future: Option<Ping>,
        }

        let bytes = FutureEnvelope {
            version: PROTOCOL_VERSION as u32,
            request_id: 5,
            future: Some(Ping { nonce: 1 }),
        }
        .encode_to_vec();

        let envelope = Envelope::from_bytes(&bytes).unwrap();
        assert_eq!(envelope.request_id, 5);
        assert!(envelope.payload.is_none());
    }
}
