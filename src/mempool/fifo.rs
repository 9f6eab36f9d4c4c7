// First-in first-out transaction pool

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{PoolTransaction, TransactionPool};
use crate::config::PoolConfig;
use crate::core::{Hash256, Transaction};

const EXPIRED_CHANNEL_CAPACITY: usize = 256;

/// Pool that offers transactions to the miner in arrival order
pub struct FifoTransactionPool {
    transactions: Mutex<VecDeque<PoolTransaction>>,
    expiry: Duration,
    sweep_interval: Duration,
    expired_tx: broadcast::Sender<Transaction>,
}

impl FifoTransactionPool {
    pub fn new(config: &PoolConfig) -> Self {
        let (expired_tx, _) = broadcast::channel(EXPIRED_CHANNEL_CAPACITY);
        Self {
            transactions: Mutex::new(VecDeque::new()),
            expiry: config.transaction_expiry(),
            sweep_interval: config.expiry_check_interval(),
            expired_tx,
        }
    }

    /// Add one transaction; false if it is already pooled
    pub fn add_transaction(&self, transaction: Transaction) -> bool {
        self.add_at(transaction, SystemTime::now())
    }

    fn add_at(&self, transaction: Transaction, added_on: SystemTime) -> bool {
        let txid = transaction.txid();
        let mut transactions = self.transactions.lock();
        if transactions.iter().any(|pooled| pooled.transaction.txid() == txid) {
            return false;
        }
        transactions.push_back(PoolTransaction {
            transaction,
            added_on,
        });
        true
    }

    pub fn get(&self, txid: &Hash256) -> Option<PoolTransaction> {
        self.transactions
            .lock()
            .iter()
            .find(|pooled| pooled.transaction.txid() == *txid)
            .cloned()
    }

    /// Receives every transaction dropped for being too old
    pub fn subscribe_expired(&self) -> broadcast::Receiver<Transaction> {
        self.expired_tx.subscribe()
    }

    /// Drop transactions pooled for longer than the expiry period
    pub fn remove_expired(&self) -> usize {
        self.remove_expired_at(SystemTime::now())
    }

    fn remove_expired_at(&self, now: SystemTime) -> usize {
        let expired: Vec<Transaction> = {
            let mut transactions = self.transactions.lock();
            let (expired, kept): (VecDeque<_>, VecDeque<_>) = transactions
                .drain(..)
                .partition(|pooled| pooled.is_expired(now, self.expiry));
            *transactions = kept;
            expired.into_iter().map(|pooled| pooled.transaction).collect()
        };

        if !expired.is_empty() {
            log::info!("Removed {} expired transactions from the pool", expired.len());
        }
        for transaction in &expired {
            let _ = self.expired_tx.send(transaction.clone());
        }
        expired.len()
    }

    /// Periodically remove expired transactions until the pool is dropped.
    /// Sweeps run one after another; ticks missed while a sweep runs are
    /// skipped.
    pub fn spawn_expiry_sweep(self: &Arc<Self>) -> JoinHandle<()> {
        let pool: Weak<Self> = Arc::downgrade(self);
        let period = self.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match pool.upgrade() {
                    Some(pool) => {
                        pool.remove_expired();
                    }
                    None => break,
                }
            }
        })
    }
}

impl TransactionPool for FifoTransactionPool {
    fn add_transactions(&self, transactions: &[Transaction]) -> usize {
        transactions
            .iter()
            .filter(|tx| self.add_transaction((*tx).clone()))
            .count()
    }

    fn remove_transactions(&self, transactions: &[Transaction]) {
        let txids: Vec<_> = transactions.iter().map(Transaction::txid).collect();
        self.transactions
            .lock()
            .retain(|pooled| !txids.contains(&pooled.transaction.txid()));
    }

    fn candidate_transactions(&self, max_size: usize) -> Vec<Transaction> {
        let mut accumulated = 0;
        let mut candidates = Vec::new();
        for pooled in self.transactions.lock().iter() {
            let size = pooled.transaction.size();
            if accumulated + size <= max_size {
                accumulated += size;
                candidates.push(pooled.transaction.clone());
            }
        }
        candidates
    }

    fn count(&self) -> usize {
        self.transactions.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TxOutput;

    fn pool() -> FifoTransactionPool {
        FifoTransactionPool::new(&PoolConfig::default())
    }

    fn tx(tag: u32, script_len: usize) -> Transaction {
        Transaction::coinbase(tag, b"", TxOutput::new(1, vec![0; script_len]))
    }

    #[test]
    fn test_add_deduplicates() {
        let pool = pool();
        let a = tx(1, 10);
        assert_eq!(pool.add_transactions(&[a.clone(), tx(2, 10), a.clone()]), 2);
        assert!(!pool.add_transaction(a.clone()));
        assert_eq!(pool.count(), 2);
        assert!(pool.get(&a.txid()).unwrap().added_on <= SystemTime::now());
    }

    #[test]
    fn test_remove() {
        let pool = pool();
        let a = tx(1, 10);
        let b = tx(2, 10);
        pool.add_transactions(&[a.clone(), b.clone()]);

        pool.remove_transactions(&[a.clone(), tx(3, 10)]);
        assert_eq!(pool.count(), 1);
        assert!(pool.get(&a.txid()).is_none());
        assert!(pool.get(&b.txid()).is_some());
    }

    #[test]
    fn test_candidates_fit_size_in_order() {
        let pool = pool();
        let small = tx(1, 10);
        let large = tx(2, 500);
        let medium = tx(3, 100);
        pool.add_transactions(&[small.clone(), large.clone(), medium.clone()]);

        let budget = small.size() + medium.size();
        assert_eq!(pool.candidate_transactions(budget), vec![small.clone(), medium]);

        let all = pool.candidate_transactions(usize::MAX / 2);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0], small);
        assert_eq!(all[1], large);
        assert!(pool.candidate_transactions(1).is_empty());
    }

    #[test]
    fn test_expired_transactions_are_removed_and_announced() {
        let pool = pool();
        let mut expired_rx = pool.subscribe_expired();
        let old = tx(1, 10);
        let fresh = tx(2, 10);
        let now = SystemTime::now();
        let fifteen_days = Duration::from_secs(15 * 24 * 60 * 60);

        pool.add_at(old.clone(), now - fifteen_days);
        pool.add_at(fresh.clone(), now);

        assert_eq!(pool.remove_expired_at(now), 1);
        assert_eq!(pool.count(), 1);
        assert!(pool.get(&fresh.txid()).is_some());
        assert_eq!(expired_rx.try_recv().unwrap(), old);
    }

    #[tokio::test]
    async fn test_expiry_sweep_runs_periodically() {
        let pool = Arc::new(FifoTransactionPool::new(&PoolConfig {
            transaction_expiry_secs: 0,
            expiry_check_interval_secs: 1,
        }));
        let mut expired_rx = pool.subscribe_expired();
        let old = tx(3, 10);
        pool.add_at(old.clone(), SystemTime::now() - Duration::from_secs(10));

        let sweep = pool.spawn_expiry_sweep();
        let expired = tokio::time::timeout(Duration::from_secs(5), expired_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(expired, old);
        assert_eq!(pool.count(), 0);
        sweep.abort();
    }
}
