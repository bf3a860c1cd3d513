//! Local block and file record store interface
//!
//! Any key-value store with these operations will do. Blocks are opaque
//! bytes in the persisted block format; typed helpers convert to and from
//! [`Block`].

use crate::types::{Block, BlockId, FileId, FileRecord};
use crate::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

/// Totals reported by [`BlockStore::usage`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreUsage {
    pub block_count: u64,
    pub bytes: u64,
}

pub trait BlockStore: Send {
    fn put_block(&mut self, id: &BlockId, bytes: &[u8]) -> Result<()>;
    fn get_block(&self, id: &BlockId) -> Result<Option<Vec<u8>>>;
    fn delete_block(&mut self, id: &BlockId) -> Result<()>;

    fn put_file_record(&mut self, record: &FileRecord) -> Result<()>;
    fn get_file_record(&self, id: &FileId) -> Result<Option<FileRecord>>;
    /// All records, oldest first
    fn list_file_records(&self) -> Result<Vec<FileRecord>>;
    fn delete_file_record(&mut self, id: &FileId) -> Result<()>;

    fn usage(&self) -> Result<StoreUsage>;

    fn has_block(&self, id: &BlockId) -> Result<bool> {
        Ok(self.get_block(id)?.is_some())
    }
}

/// Persist a block under its own id
pub fn save_block(store: &mut dyn BlockStore, block: &Block) -> Result<()> {
    store.put_block(&block.id, &block.to_bytes()?)
}

/// Load and decode a block, `None` if absent
pub fn load_block(store: &dyn BlockStore, id: &BlockId) -> Result<Option<Block>> {
    match store.get_block(id)? {
        Some(bytes) => {
            let block = Block::from_bytes(&bytes)?;
            if block.id != *id {
                return Err(Error::InvalidData(format!(
                    "block stored under {} claims id {}",
                    id, block.id
                )));
            }
            Ok(Some(block))
        }
        None => Ok(None),
    }
}

#[derive(Default)]
struct MemoryInner {
    blocks: HashMap<BlockId, Vec<u8>>,
    files: BTreeMap<FileId, FileRecord>,
}

/// In-memory store; clones share the same contents
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Database("memory store lock poisoned".to_string()))
    }

    /// Ids of every stored block
    pub fn block_ids(&self) -> Result<Vec<BlockId>> {
        Ok(self.lock()?.blocks.keys().copied().collect())
    }
}

impl BlockStore for MemoryStore {
    fn put_block(&mut self, id: &BlockId, bytes: &[u8]) -> Result<()> {
        self.lock()?.blocks.insert(*id, bytes.to_vec());
        Ok(())
    }

    fn get_block(&self, id: &BlockId) -> Result<Option<Vec<u8>>> {
        Ok(self.lock()?.blocks.get(id).cloned())
    }

    fn delete_block(&mut self, id: &BlockId) -> Result<()> {
        self.lock()?.blocks.remove(id);
        Ok(())
    }

    fn put_file_record(&mut self, record: &FileRecord) -> Result<()> {
        self.lock()?.files.insert(record.id, record.clone());
        Ok(())
    }

    fn get_file_record(&self, id: &FileId) -> Result<Option<FileRecord>> {
        Ok(self.lock()?.files.get(id).cloned())
    }

    fn list_file_records(&self) -> Result<Vec<FileRecord>> {
        let mut records: Vec<FileRecord> = self.lock()?.files.values().cloned().collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    fn delete_file_record(&mut self, id: &FileId) -> Result<()> {
        self.lock()?.files.remove(id);
        Ok(())
    }

    fn usage(&self) -> Result<StoreUsage> {
        let inner = self.lock()?;
        Ok(StoreUsage {
            block_count: inner.blocks.len() as u64,
            bytes: inner.blocks.values().map(|b| b.len() as u64).sum(),
        })
    }
}
