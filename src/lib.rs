// Proof-of-work chain engine: block tree, branch selection, UTXO
// bookkeeping and catch-up with the network

pub mod chain;
pub mod cli;
pub mod config;
pub mod consensus;
pub mod core;
pub mod mempool;
pub mod network;
pub mod storage;

#[cfg(test)]
mod test_utils;

// Re-exports for convenience
pub use chain::{
    BlockAddedEvent, Chain, ChainBlock, ChainError, ChainItem, ChainSynchronizer,
    ChainTransactionsMaintainer, OutputsUpdated, SyncError,
};
pub use cli::{Cli, CliHandler};
pub use config::NodeConfig;
pub use consensus::{DifficultyTarget, Miner, PuzzleSolver, TargetCalculator};
pub use crate::core::{Block, BlockHeader, Hash256, OutPoint, Transaction, TxInput, TxOutput, UnspentOutput};
pub use mempool::{FifoTransactionPool, TransactionPool};
pub use network::{NetworkInterface, OfflineNetwork};
pub use storage::{BlockchainDB, Storage, StorageError, TransactionDB, UtxoSet};
