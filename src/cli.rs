// CLI commands

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::chain::{Chain, ChainBlock, ChainError};
use crate::config::{ConfigError, NodeConfig};
use crate::consensus::{Miner, MinerError};
use crate::core::BlockHeader;
use crate::mempool::FifoTransactionPool;
use crate::network::{NetworkInterface, OfflineNetwork};
use crate::storage::{Storage, StorageError, UtxoStore};

const DEFAULT_DATA_DIR: &str = "./data";

#[derive(Parser)]
#[command(name = "powchain")]
#[command(about = "Proof-of-work chain node", long_about = None)]
pub struct Cli {
    /// JSON config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Data directory, overrides the config file
    #[arg(short, long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the chain height, tips and UTXO count
    Info,

    /// Show the active block at a height
    Block {
        height: u32,
    },

    /// Mine blocks on top of the local chain
    Mine {
        /// Number of blocks to mine
        #[arg(short, long, default_value = "1")]
        blocks: u32,
    },
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Miner(#[from] MinerError),
}

impl Cli {
    /// Config file contents with the command-line overrides applied
    pub fn node_config(&self) -> Result<NodeConfig, CliError> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::load(path)?,
            None => NodeConfig::default(),
        };
        if let Some(data_dir) = &self.data_dir {
            config.data_dir = data_dir.clone();
        }
        if config.data_dir.as_os_str().is_empty() {
            config.data_dir = PathBuf::from(DEFAULT_DATA_DIR);
        }
        Ok(config)
    }
}

/// CLI handler, running the chain on local storage without peers
pub struct CliHandler {
    storage: Storage,
    chain: Arc<Chain>,
    miner: Arc<Miner>,
}

impl CliHandler {
    pub fn new(config: &NodeConfig) -> Result<Self, CliError> {
        let storage = Storage::new(&config.data_dir)?;
        Self::with_storage(storage, config)
    }

    fn with_storage(storage: Storage, config: &NodeConfig) -> Result<Self, CliError> {
        let pool = Arc::new(FifoTransactionPool::new(&config.pool));
        let network: Arc<dyn NetworkInterface> = Arc::new(OfflineNetwork);
        let chain = Chain::new(storage.stores(), pool.clone(), network.clone(), config)?;
        let miner = Miner::new(chain.clone(), pool, network, &config.mining)?;
        Ok(Self {
            storage,
            chain,
            miner,
        })
    }

    /// Handle CLI command
    pub async fn handle(&self, command: Commands) -> Result<(), CliError> {
        match command {
            Commands::Info => self.info(),
            Commands::Block { height } => self.block(height),
            Commands::Mine { blocks } => self.mine(blocks).await,
        }
    }

    fn info(&self) -> Result<(), CliError> {
        let tip = self.chain.last_active_item();
        let tips = self.chain.tips();

        println!("Chain Info:");
        println!("  Height: {}", self.chain.height());
        println!("  Active tip: {}", tip.hash());
        println!("  Chain work: {:.2}", tip.chain_work());
        println!("  Tips ({}):", tips.len());
        for item in &tips {
            println!("    {} (height {}, work {:.2})", item.hash(), item.height(), item.chain_work());
        }
        println!("  UTXO count: {}", self.storage.utxo_set.count()?);
        println!("  Confirmed transactions: {}", self.storage.transactions.len());

        Ok(())
    }

    fn block(&self, height: u32) -> Result<(), CliError> {
        match self.chain.get_active_block(height)? {
            ChainBlock::Full(block) => {
                print_header(&block.header);
                println!("  Transactions: {}", block.transactions.len());
                for (i, tx) in block.transactions.iter().enumerate() {
                    println!("    [{}] {} ({} satoshis)", i, tx.txid(), tx.total_output_value());
                }
            }
            ChainBlock::HeaderOnly(header) => print_header(&header),
        }
        Ok(())
    }

    async fn mine(&self, blocks: u32) -> Result<(), CliError> {
        println!("Mining {} block(s) on height {}...", blocks, self.chain.height());
        for _ in 0..blocks {
            let block = self.miner.mine_block().await?;
            println!("✓ Block {} mined", self.chain.height());
            println!("  Hash: {}", block.hash());
            println!("  Nonce: {}", block.header.nonce);
        }
        self.storage.flush()?;
        Ok(())
    }
}

fn print_header(header: &BlockHeader) {
    println!("Block:");
    println!("  Hash: {}", header.hash());
    println!("  Previous: {}", header.prev_block_hash);
    println!("  Merkle root: {}", header.merkle_root);
    println!("  Timestamp: {}", header.timestamp);
    println!("  Bits: {:#010x}", header.bits);
    println!("  Nonce: {}", header.nonce);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::child;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_mine() {
        let cli = Cli::try_parse_from(["powchain", "mine", "--blocks", "3"]).unwrap();
        assert!(matches!(cli.command, Commands::Mine { blocks: 3 }));

        let cli = Cli::try_parse_from(["powchain", "block", "7", "-d", "/tmp/chain"]).unwrap();
        assert!(matches!(cli.command, Commands::Block { height: 7 }));
        assert_eq!(cli.node_config().unwrap().data_dir, PathBuf::from("/tmp/chain"));
    }

    #[test]
    fn test_default_data_dir() {
        let cli = Cli::try_parse_from(["powchain", "info"]).unwrap();
        assert_eq!(cli.node_config().unwrap().data_dir, PathBuf::from(DEFAULT_DATA_DIR));
    }

    #[tokio::test]
    async fn test_handle_info_and_block() {
        let handler = CliHandler::with_storage(Storage::memory().unwrap(), &NodeConfig::default()).unwrap();
        let b1 = child(handler.chain.genesis_item(), 1);
        handler.chain.add_block((*b1).clone(), false).await.unwrap();

        handler.handle(Commands::Info).await.unwrap();
        handler.handle(Commands::Block { height: 1 }).await.unwrap();
        assert!(matches!(
            handler.handle(Commands::Block { height: 2 }).await,
            Err(CliError::Chain(ChainError::HeightOutOfRange(2)))
        ));
    }
}
