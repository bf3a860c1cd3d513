//! Core data types for Cairn

use crate::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A 32-byte BLAKE3 hash
pub type ContentHash = [u8; 32];

/// A random 128-bit identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 16]);

/// Identifier of a stored block
pub type BlockId = ObjectId;

/// Identifier of a file record
pub type FileId = ObjectId;

impl ObjectId {
    /// Generate a fresh random identifier
    pub fn random() -> Result<Self> {
        let mut bytes = [0u8; 16];
        getrandom::getrandom(&mut bytes)
            .map_err(|e| Error::InvalidData(format!("random source unavailable: {}", e)))?;
        Ok(Self(bytes))
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Parse from a byte slice, rejecting anything that is not exactly 16 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 16] = bytes.try_into().map_err(|_| {
            Error::InvalidData(format!("identifier must be 16 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({}...)", &self.to_hex()[..8])
    }
}

impl FromStr for ObjectId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| Error::InvalidData(format!("bad id: {}", e)))?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// An encrypted content unit, chained to its predecessor by hash.
///
/// The serialized form is the persisted block format and must stay readable
/// across versions: field names are fixed, older snake_case names are accepted
/// and a missing `createdAt` defaults to zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub id: BlockId,
    /// Encrypted envelope bytes
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
    #[serde(alias = "sequence_index")]
    pub sequence_index: u32,
    #[serde(alias = "previous_hash", with = "hex_hash_opt", default)]
    pub previous_hash: Option<ContentHash>,
    /// BLAKE3 digest of the encrypted payload
    #[serde(with = "hex_hash")]
    pub hash: ContentHash,
    /// Unix timestamp in milliseconds
    #[serde(alias = "created_at", default)]
    pub created_at: u64,
}

impl Block {
    /// Create an unchained block over an encrypted payload
    pub fn new(payload: Vec<u8>, sequence_index: u32) -> Result<Self> {
        let hash = crate::crypto::hash(&payload);
        Ok(Self {
            id: BlockId::random()?,
            payload,
            sequence_index,
            previous_hash: None,
            hash,
            created_at: now_millis(),
        })
    }

    /// Whether `hash` matches the payload it claims to cover
    pub fn is_intact(&self) -> bool {
        crate::crypto::hash(&self.payload) == self.hash
    }

    /// Encode in the persisted block format
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from the persisted block format
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Metadata for a stored file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: FileId,
    /// Original file name
    pub name: String,
    /// File size in bytes before encryption
    pub size: u64,
    /// MIME type (if detected)
    #[serde(default)]
    pub mime_type: Option<String>,
    /// Data blocks in sequence order
    pub block_ids: Vec<BlockId>,
    /// Unix timestamp in milliseconds
    #[serde(default)]
    pub created_at: u64,
    /// Parity layout, present when the file was erasure coded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub erasure: Option<ErasureLayout>,
}

impl FileRecord {
    /// Every block the record owns, data first then parity
    pub fn all_block_ids(&self) -> Vec<BlockId> {
        let mut ids = self.block_ids.clone();
        if let Some(layout) = &self.erasure {
            for group in &layout.groups {
                ids.extend(group.parity_block_ids.iter().copied());
            }
        }
        ids
    }
}

/// How a file's data blocks were grouped into erasure coding windows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErasureLayout {
    pub data_shards: usize,
    pub parity_shards: usize,
    pub groups: Vec<ParityGroup>,
}

/// One coding window: up to `data_shards` data blocks and their parity blocks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParityGroup {
    pub data_block_ids: Vec<BlockId>,
    pub parity_block_ids: Vec<BlockId>,
    /// Length of every shard in the group
    pub shard_len: usize,
    /// Persisted length of each data block, for truncating recovered shards
    pub block_lens: Vec<usize>,
}

/// Current time as Unix milliseconds
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Helper to format a content hash as hex string
pub fn hash_to_hex(hash: &ContentHash) -> String {
    hex::encode(hash)
}

/// Helper to parse a hex string into a content hash
pub fn hex_to_hash(s: &str) -> std::result::Result<ContentHash, hex::FromHexError> {
    let bytes = hex::decode(s)?;
    if bytes.len() != 32 {
        return Err(hex::FromHexError::InvalidStringLength);
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&bytes);
    Ok(hash)
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

mod hex_hash {
    use super::{hex_to_hash, ContentHash};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(hash: &ContentHash, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(hash))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<ContentHash, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex_to_hash(&s).map_err(serde::de::Error::custom)
    }
}

mod hex_hash_opt {
    use super::{hex_to_hash, ContentHash};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        hash: &Option<ContentHash>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match hash {
            Some(h) => serializer.serialize_some(&hex::encode(h)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<ContentHash>, D::Error> {
        let s: Option<String> = Option::deserialize(deserializer)?;
        s.map(|s| hex_to_hash(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id_hex_roundtrip() {
        let id = ObjectId::random().unwrap();
        let parsed: ObjectId = id.to_hex().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("abcd".parse::<ObjectId>().is_err());
    }

    #[test]
    fn test_block_persisted_field_names() {
        let block = Block::new(vec![1, 2, 3], 0).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&block.to_bytes().unwrap()).unwrap();
        for field in ["id", "payload", "sequenceIndex", "previousHash", "hash", "createdAt"] {
            assert!(json.get(field).is_some(), "missing field {}", field);
        }
        assert!(json["previousHash"].is_null());
    }

    #[test]
    fn test_reads_older_block_format() {
        // Earlier stores wrote snake_case names and no timestamp
        let hash = crate::crypto::hash(b"abc");
        let legacy = format!(
            r#"{{"id":"000102030405060708090a0b0c0d0e0f","payload":"{}","sequence_index":3,"previous_hash":null,"hash":"{}"}}"#,
            hex::encode(b"abc"),
            hex::encode(hash)
        );
        let block = Block::from_bytes(legacy.as_bytes()).unwrap();
        assert_eq!(block.sequence_index, 3);
        assert_eq!(block.created_at, 0);
        assert!(block.is_intact());
    }

    #[test]
    fn test_record_without_erasure_layout() {
        let record = FileRecord {
            id: ObjectId::random().unwrap(),
            name: "notes.txt".to_string(),
            size: 10,
            mime_type: Some("text/plain".to_string()),
            block_ids: vec![ObjectId::random().unwrap()],
            created_at: 1,
            erasure: None,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("erasure"));
        let back: FileRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
        assert_eq!(back.all_block_ids(), record.block_ids);
    }
}
