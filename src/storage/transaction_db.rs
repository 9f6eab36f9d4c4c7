// Confirmed transactions using sled

use sled::{Batch, Db};
use std::path::Path;

use super::{StorageError, TransactionStore};
use crate::core::{Hash256, Serializable, Transaction};

/// Transactions of the active branch, keyed by id
pub struct TransactionDB {
    db: Db,
}

impl TransactionDB {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// In-memory database (for testing)
    pub fn memory() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

impl TransactionStore for TransactionDB {
    fn save(&self, transactions: &[Transaction]) -> Result<(), StorageError> {
        let mut batch = Batch::default();
        for tx in transactions {
            batch.insert(tx.txid().as_bytes().as_slice(), tx.serialize());
        }
        self.db.apply_batch(batch)?;
        Ok(())
    }

    fn delete(&self, transactions: &[Transaction]) -> Result<usize, StorageError> {
        let mut deleted = 0;
        for tx in transactions {
            if self.db.remove(tx.txid().as_bytes())?.is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    fn find(&self, txid: &Hash256) -> Result<Option<Transaction>, StorageError> {
        match self.db.get(txid.as_bytes())? {
            Some(data) => Ok(Some(Transaction::deserialize(&data)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TxOutput;

    #[test]
    fn test_save_find_delete() {
        let db = TransactionDB::memory().unwrap();
        let a = Transaction::coinbase(1, b"", TxOutput::new(50, vec![1]));
        let b = Transaction::coinbase(2, b"", TxOutput::new(50, vec![1]));

        db.save(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(db.len(), 2);
        assert_eq!(db.find(&a.txid()).unwrap(), Some(a.clone()));

        assert_eq!(db.delete(&[a.clone()]).unwrap(), 1);
        assert_eq!(db.delete(&[a.clone(), b]).unwrap(), 1);
        assert!(db.find(&a.txid()).unwrap().is_none());
        assert!(db.is_empty());
    }
}
