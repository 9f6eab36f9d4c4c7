// Storage layer: block store, height index, confirmed transactions, UTXO set

mod blockchain_db;
mod transaction_db;
mod utxo_set;

pub use blockchain_db::BlockchainDB;
pub use transaction_db::TransactionDB;
pub use utxo_set::UtxoSet;

use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::chain::ChainItem;
use crate::core::{CodecError, Hash256, OutPoint, Transaction, UnspentOutput};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sled::Error),

    #[error("corrupt record: {0}")]
    Codec(#[from] CodecError),

    #[error("inconsistent store: {0}")]
    Inconsistent(String),
}

/// Persistent chain items and the active-branch bookkeeping around them
pub trait BlockStore: Send + Sync {
    /// Highest active height persisted, 0 when only genesis exists
    fn height(&self) -> Result<u32, StorageError>;

    fn find_chain_item(
        &self,
        hash: &Hash256,
        include_transactions: bool,
    ) -> Result<Option<ChainItem>, StorageError>;

    /// Item on the active branch at `height`, without transactions
    fn active_chain_item_at(&self, height: u32) -> Result<Option<ChainItem>, StorageError>;

    /// Persist `item`, replace `previous` by it in the tip set and, when it
    /// became the active tip, rewrite the active branch down to the fork
    fn save_new_chain_item(
        &self,
        item: &ChainItem,
        previous: &ChainItem,
        became_active_tip: bool,
    ) -> Result<(), StorageError>;

    /// Tips at or above `min_height`; transactions loaded for those at or
    /// above `min_height_with_transactions`
    fn tips(
        &self,
        min_height: u32,
        min_height_with_transactions: u32,
    ) -> Result<Vec<ChainItem>, StorageError>;
}

/// Every known block hash per height, across all branches
pub trait HeightIndex: Send + Sync {
    fn block_hashes_at(&self, height: u32) -> Result<Vec<Hash256>, StorageError>;

    fn save_block_height(&self, hash: &Hash256, height: u32) -> Result<(), StorageError>;
}

/// Transactions confirmed on the active branch
pub trait TransactionStore: Send + Sync {
    fn save(&self, transactions: &[Transaction]) -> Result<(), StorageError>;

    /// Returns how many of `transactions` were present
    fn delete(&self, transactions: &[Transaction]) -> Result<usize, StorageError>;

    fn find(&self, txid: &Hash256) -> Result<Option<Transaction>, StorageError>;
}

pub trait UtxoStore: Send + Sync {
    fn save(&self, outputs: &[UnspentOutput]) -> Result<(), StorageError>;

    /// Returns how many of `outputs` were present
    fn delete(&self, outputs: &[UnspentOutput]) -> Result<usize, StorageError>;

    /// Insert `save`, then remove `delete`, as one atomic write
    fn apply(&self, save: &[UnspentOutput], delete: &[UnspentOutput]) -> Result<(), StorageError>;

    fn find(&self, outpoint: &OutPoint) -> Result<Option<UnspentOutput>, StorageError>;

    fn count(&self) -> Result<usize, StorageError>;
}

/// The stores a chain is built on
#[derive(Clone)]
pub struct ChainStores {
    pub blocks: Arc<dyn BlockStore>,
    pub heights: Arc<dyn HeightIndex>,
    pub transactions: Arc<dyn TransactionStore>,
    pub utxos: Arc<dyn UtxoStore>,
}

/// Storage manager - sled databases behind every store contract
pub struct Storage {
    pub blockchain: Arc<BlockchainDB>,
    pub transactions: Arc<TransactionDB>,
    pub utxo_set: Arc<UtxoSet>,
}

impl Storage {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();
        Ok(Self {
            blockchain: Arc::new(BlockchainDB::new(path.join("blocks"))?),
            transactions: Arc::new(TransactionDB::new(path.join("transactions"))?),
            utxo_set: Arc::new(UtxoSet::new(path.join("utxo"))?),
        })
    }

    /// In-memory storage (for testing)
    pub fn memory() -> Result<Self, StorageError> {
        Ok(Self {
            blockchain: Arc::new(BlockchainDB::memory()?),
            transactions: Arc::new(TransactionDB::memory()?),
            utxo_set: Arc::new(UtxoSet::memory()?),
        })
    }

    pub fn stores(&self) -> ChainStores {
        ChainStores {
            blocks: self.blockchain.clone(),
            heights: self.blockchain.clone(),
            transactions: self.transactions.clone(),
            utxos: self.utxo_set.clone(),
        }
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.blockchain.flush()?;
        self.transactions.flush()?;
        self.utxo_set.flush()?;
        Ok(())
    }
}
