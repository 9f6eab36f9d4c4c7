// UTXO (Unspent Transaction Output) set management

use sled::{Batch, Db};
use std::path::Path;

use super::{StorageError, UtxoStore};
use crate::core::{OutPoint, UnspentOutput};

/// UTXO set database, keyed by outpoint with the amount as value
pub struct UtxoSet {
    db: Db,
}

impl UtxoSet {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// In-memory UTXO set (for testing)
    pub fn memory() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    pub fn contains(&self, outpoint: &OutPoint) -> Result<bool, StorageError> {
        Ok(self.db.contains_key(outpoint.to_bytes())?)
    }

    /// Every unspent output, in outpoint order
    pub fn all(&self) -> Result<Vec<UnspentOutput>, StorageError> {
        let mut outputs = Vec::new();
        for entry in self.db.iter() {
            let (key, value) = entry?;
            let outpoint = OutPoint::from_bytes(&key)?;
            outputs.push(UnspentOutput {
                outpoint,
                amount: decode_amount(&value)?,
            });
        }
        Ok(outputs)
    }

    /// Sum of every unspent amount
    pub fn total_amount(&self) -> Result<u64, StorageError> {
        Ok(self.all()?.iter().map(|output| output.amount).sum())
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

fn decode_amount(bytes: &[u8]) -> Result<u64, StorageError> {
    let bytes: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StorageError::Inconsistent(format!("amount of {} bytes", bytes.len())))?;
    Ok(u64::from_le_bytes(bytes))
}

impl UtxoStore for UtxoSet {
    fn save(&self, outputs: &[UnspentOutput]) -> Result<(), StorageError> {
        self.apply(outputs, &[])
    }

    fn delete(&self, outputs: &[UnspentOutput]) -> Result<usize, StorageError> {
        let mut deleted = 0;
        for output in outputs {
            if self.db.remove(output.outpoint.to_bytes())?.is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    fn apply(&self, save: &[UnspentOutput], delete: &[UnspentOutput]) -> Result<(), StorageError> {
        let mut batch = Batch::default();
        for output in save {
            batch.insert(output.outpoint.to_bytes(), output.amount.to_le_bytes().to_vec());
        }
        // Later operations on a key win, so an output both created and
        // spent by the same delta ends up absent
        for output in delete {
            batch.remove(output.outpoint.to_bytes());
        }
        self.db.apply_batch(batch)?;
        Ok(())
    }

    fn find(&self, outpoint: &OutPoint) -> Result<Option<UnspentOutput>, StorageError> {
        match self.db.get(outpoint.to_bytes())? {
            Some(value) => Ok(Some(UnspentOutput {
                outpoint: *outpoint,
                amount: decode_amount(&value)?,
            })),
            None => Ok(None),
        }
    }

    fn count(&self) -> Result<usize, StorageError> {
        Ok(self.db.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Hash256;

    fn output(tag: u8, vout: u32, amount: u64) -> UnspentOutput {
        UnspentOutput::new(Hash256::new([tag; 32]), vout, amount)
    }

    #[test]
    fn test_save_and_find() {
        let utxo_set = UtxoSet::memory().unwrap();
        let out = output(1, 0, 5000);

        utxo_set.save(&[out]).unwrap();

        assert_eq!(utxo_set.find(&out.outpoint).unwrap(), Some(out));
        assert!(utxo_set.contains(&out.outpoint).unwrap());
        assert!(utxo_set.find(&OutPoint::new(Hash256::new([1; 32]), 1)).unwrap().is_none());
    }

    #[test]
    fn test_delete_counts_present_outputs() {
        let utxo_set = UtxoSet::memory().unwrap();
        let a = output(1, 0, 10);
        let b = output(2, 0, 20);
        utxo_set.save(&[a]).unwrap();

        assert_eq!(utxo_set.delete(&[a, b]).unwrap(), 1);
        assert_eq!(utxo_set.count().unwrap(), 0);
    }

    #[test]
    fn test_apply_removes_after_inserting() {
        let utxo_set = UtxoSet::memory().unwrap();
        let spent = output(1, 0, 10);
        let created_and_spent = output(2, 0, 20);
        let created = output(3, 1, 30);
        utxo_set.save(&[spent]).unwrap();

        utxo_set
            .apply(&[created_and_spent, created], &[spent, created_and_spent])
            .unwrap();

        assert_eq!(utxo_set.all().unwrap(), vec![created]);
        assert_eq!(utxo_set.total_amount().unwrap(), 30);
    }

    #[test]
    fn test_count() {
        let utxo_set = UtxoSet::memory().unwrap();
        assert_eq!(utxo_set.count().unwrap(), 0);

        utxo_set.save(&[output(1, 0, 1000), output(2, 0, 2000)]).unwrap();
        assert_eq!(utxo_set.count().unwrap(), 2);
    }
}
