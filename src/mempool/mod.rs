// Pending transaction pool

mod fifo;

pub use fifo::FifoTransactionPool;

use std::time::{Duration, SystemTime};

use crate::core::Transaction;

/// Transactions waiting to be included in a block
pub trait TransactionPool: Send + Sync {
    /// Returns how many were new to the pool
    fn add_transactions(&self, transactions: &[Transaction]) -> usize;

    fn remove_transactions(&self, transactions: &[Transaction]);

    /// Transactions in pool order whose serialized sizes add up to at most
    /// `max_size` bytes
    fn candidate_transactions(&self, max_size: usize) -> Vec<Transaction>;

    fn count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct PoolTransaction {
    pub transaction: Transaction,
    pub added_on: SystemTime,
}

impl PoolTransaction {
    pub fn is_expired(&self, now: SystemTime, expiry: Duration) -> bool {
        now.duration_since(self.added_on)
            .map(|age| age > expiry)
            .unwrap_or(false)
    }
}
