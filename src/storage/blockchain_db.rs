// Blockchain database using sled

use sled::{Batch, Db};
use std::path::Path;
use std::sync::Arc;

use super::{BlockStore, HeightIndex, StorageError};
use crate::chain::ChainItem;
use crate::core::{Block, BlockHeader, Hash256, Serializable};

const HEIGHT_KEY: &[u8] = b"chain_height";

/// Item record: height (4) + chain work (8) + header (80)
const ITEM_RECORD_LEN: usize = 4 + 8 + BlockHeader::SIZE;

/// Block store and height index over one sled tree.
///
/// Key layout:
/// - `b` + hash: serialized block
/// - `i` + hash: item record
/// - `t` + hash: branch tip marker
/// - `a` + height (big-endian): hash of the active block at that height
/// - `h` + height (big-endian) + hash: height index entry
/// - `chain_height`: active chain height
pub struct BlockchainDB {
    db: Db,
}

struct ItemRecord {
    height: u32,
    chain_work: f64,
    header: BlockHeader,
}

impl ItemRecord {
    fn encode(item: &ChainItem) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(ITEM_RECORD_LEN);
        bytes.extend_from_slice(&item.height().to_le_bytes());
        bytes.extend_from_slice(&item.chain_work().to_le_bytes());
        bytes.extend_from_slice(&item.header().to_bytes());
        bytes
    }

    fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        if bytes.len() != ITEM_RECORD_LEN {
            return Err(StorageError::Inconsistent(format!(
                "item record of {} bytes",
                bytes.len()
            )));
        }
        let mut height = [0u8; 4];
        height.copy_from_slice(&bytes[0..4]);
        let mut chain_work = [0u8; 8];
        chain_work.copy_from_slice(&bytes[4..12]);
        Ok(Self {
            height: u32::from_le_bytes(height),
            chain_work: f64::from_le_bytes(chain_work),
            header: BlockHeader::from_bytes(&bytes[12..])?,
        })
    }
}

impl BlockchainDB {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// In-memory database (for testing)
    pub fn memory() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    pub fn get_block(&self, hash: &Hash256) -> Result<Option<Block>, StorageError> {
        match self.db.get(Self::prefixed(b'b', hash))? {
            Some(data) => Ok(Some(Block::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    pub fn has_block(&self, hash: &Hash256) -> Result<bool, StorageError> {
        Ok(self.db.contains_key(Self::prefixed(b'i', hash))?)
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    fn record(&self, hash: &Hash256) -> Result<Option<ItemRecord>, StorageError> {
        match self.db.get(Self::prefixed(b'i', hash))? {
            Some(data) => Ok(Some(ItemRecord::decode(&data)?)),
            None => Ok(None),
        }
    }

    fn active_hash_at(&self, height: u32) -> Result<Option<Hash256>, StorageError> {
        match self.db.get(Self::active_key(height))? {
            Some(data) => Ok(Some(Hash256::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    /// Point the active-height entries at `item`'s branch, from its height
    /// down to the first height that already agrees
    fn rewrite_active_branch(&self, item: &ChainItem, batch: &mut Batch) -> Result<(), StorageError> {
        batch.insert(HEIGHT_KEY, item.height().to_le_bytes().to_vec());
        batch.insert(Self::active_key(item.height()), item.hash().as_bytes().as_slice());

        // A heavier branch can be shorter; drop entries above the new tip
        for entry in self.db.range(Self::active_key(item.height() + 1)..Self::active_key(u32::MAX)) {
            let (key, _) = entry?;
            batch.remove(key);
        }
        batch.remove(Self::active_key(u32::MAX));

        let mut hash = item.prev_hash();
        let mut height = item.height();
        while height > 1 {
            height -= 1;
            if self.active_hash_at(height)? == Some(hash) {
                break;
            }
            batch.insert(Self::active_key(height), hash.as_bytes().as_slice());
            let record = self.record(&hash)?.ok_or_else(|| {
                StorageError::Inconsistent(format!("missing predecessor {}", hash))
            })?;
            hash = record.header.prev_block_hash;
        }
        Ok(())
    }

    fn item_from_record(
        &self,
        hash: &Hash256,
        record: ItemRecord,
        include_transactions: bool,
    ) -> Result<ChainItem, StorageError> {
        if !include_transactions {
            return Ok(ChainItem::header_only(record.header, record.height, record.chain_work));
        }
        let block = self
            .get_block(hash)?
            .ok_or_else(|| StorageError::Inconsistent(format!("missing block body {}", hash)))?;
        Ok(ChainItem::new(Arc::new(block), record.height, record.chain_work))
    }

    fn prefixed(prefix: u8, hash: &Hash256) -> Vec<u8> {
        let mut key = Vec::with_capacity(33);
        key.push(prefix);
        key.extend_from_slice(hash.as_bytes());
        key
    }

    fn active_key(height: u32) -> Vec<u8> {
        let mut key = Vec::with_capacity(5);
        key.push(b'a');
        key.extend_from_slice(&height.to_be_bytes());
        key
    }

    fn height_index_prefix(height: u32) -> Vec<u8> {
        let mut key = Vec::with_capacity(37);
        key.push(b'h');
        key.extend_from_slice(&height.to_be_bytes());
        key
    }
}

impl BlockStore for BlockchainDB {
    fn height(&self) -> Result<u32, StorageError> {
        match self.db.get(HEIGHT_KEY)? {
            Some(data) => {
                let bytes: [u8; 4] = data.as_ref().try_into().map_err(|_| {
                    StorageError::Inconsistent(format!("height of {} bytes", data.len()))
                })?;
                Ok(u32::from_le_bytes(bytes))
            }
            None => Ok(0),
        }
    }

    fn find_chain_item(
        &self,
        hash: &Hash256,
        include_transactions: bool,
    ) -> Result<Option<ChainItem>, StorageError> {
        match self.record(hash)? {
            Some(record) => Ok(Some(self.item_from_record(hash, record, include_transactions)?)),
            None => Ok(None),
        }
    }

    fn active_chain_item_at(&self, height: u32) -> Result<Option<ChainItem>, StorageError> {
        match self.active_hash_at(height)? {
            Some(hash) => self.find_chain_item(&hash, false),
            None => Ok(None),
        }
    }

    fn save_new_chain_item(
        &self,
        item: &ChainItem,
        previous: &ChainItem,
        became_active_tip: bool,
    ) -> Result<(), StorageError> {
        let block = item.block().ok_or_else(|| {
            StorageError::Inconsistent(format!("block {} saved without transactions", item.hash()))
        })?;
        let hash = item.hash();

        let mut batch = Batch::default();
        batch.insert(Self::prefixed(b'b', &hash), block.serialize());
        batch.insert(Self::prefixed(b'i', &hash), ItemRecord::encode(item));
        batch.insert(Self::prefixed(b't', &hash), &[] as &[u8]);
        batch.remove(Self::prefixed(b't', &previous.hash()));

        if became_active_tip {
            self.rewrite_active_branch(item, &mut batch)?;
        }

        self.db.apply_batch(batch)?;
        Ok(())
    }

    fn tips(
        &self,
        min_height: u32,
        min_height_with_transactions: u32,
    ) -> Result<Vec<ChainItem>, StorageError> {
        let mut tips = Vec::new();
        for entry in self.db.scan_prefix([b't']) {
            let (key, _) = entry?;
            let hash = Hash256::from_slice(&key[1..])?;
            let Some(record) = self.record(&hash)? else {
                return Err(StorageError::Inconsistent(format!("tip {} has no record", hash)));
            };
            if record.height < min_height {
                continue;
            }
            let include_transactions = record.height >= min_height_with_transactions;
            tips.push(self.item_from_record(&hash, record, include_transactions)?);
        }
        Ok(tips)
    }
}

impl HeightIndex for BlockchainDB {
    fn block_hashes_at(&self, height: u32) -> Result<Vec<Hash256>, StorageError> {
        let prefix = Self::height_index_prefix(height);
        let mut hashes = Vec::new();
        for entry in self.db.scan_prefix(&prefix) {
            let (key, _) = entry?;
            hashes.push(Hash256::from_slice(&key[prefix.len()..])?);
        }
        Ok(hashes)
    }

    fn save_block_height(&self, hash: &Hash256, height: u32) -> Result<(), StorageError> {
        let mut key = Self::height_index_prefix(height);
        key.extend_from_slice(hash.as_bytes());
        self.db.insert(key, &[] as &[u8])?;
        Ok(())
    }
}
