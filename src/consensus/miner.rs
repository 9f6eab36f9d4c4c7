// Block production on top of the active tip

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;

use super::difficulty::DifficultyTarget;
use super::pow::{PuzzleSolver, SolveStatus, StopHandle};
use super::target_calculator::TargetCalculator;
use crate::chain::{Chain, ChainError, ChainItem};
use crate::config::MiningConfig;
use crate::core::{Block, BlockHeader, Transaction, TxOutput};
use crate::mempool::TransactionPool;
use crate::network::NetworkInterface;

/// Satoshis per coin
pub const COIN: u64 = 100_000_000;

const INITIAL_SUBSIDY: u64 = 50 * COIN;
const HALVING_INTERVAL: u32 = 210_000;

/// Room left for the transaction count varint
const MAX_TX_COUNT_VARINT_SIZE: usize = 3;

#[derive(Debug, Error)]
pub enum MinerError {
    #[error("invalid reward script: {0}")]
    RewardScript(#[from] hex::FromHexError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("solver was stopped")]
    Stopped,

    #[error("solver task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Reward for the block at `height`, halved every 210000 blocks
pub fn block_subsidy(height: u32) -> u64 {
    let mut halvings = 0u32;
    while height > HALVING_INTERVAL.saturating_mul(halvings + 1) {
        halvings += 1;
        if halvings >= 64 {
            return 0;
        }
    }
    INITIAL_SUBSIDY >> halvings
}

/// Mines candidate blocks on the active tip.
///
/// Only one solver runs at a time: starting a new candidate stops the
/// previous one. A solved block is relayed and added to the chain as mined
/// locally, after which mining continues on the new tip. Blocks arriving from
/// elsewhere that become the active tip restart mining on top of them.
pub struct Miner {
    chain: Arc<Chain>,
    pool: Arc<dyn TransactionPool>,
    network: Arc<dyn NetworkInterface>,
    target_calculator: TargetCalculator,
    reward_script: Vec<u8>,
    max_block_size: usize,
    solver: Mutex<Option<StopHandle>>,
    running: AtomicBool,
    me: Weak<Miner>,
}

impl Miner {
    pub fn new(
        chain: Arc<Chain>,
        pool: Arc<dyn TransactionPool>,
        network: Arc<dyn NetworkInterface>,
        config: &MiningConfig,
    ) -> Result<Arc<Self>, MinerError> {
        let reward_script = config.reward_script()?;
        let max_block_size = config.max_block_size;
        Ok(Arc::new_cyclic(|me: &Weak<Miner>| Miner {
            target_calculator: TargetCalculator::new(chain.clone()),
            chain,
            pool,
            network,
            reward_script,
            max_block_size,
            solver: Mutex::new(None),
            running: AtomicBool::new(false),
            me: me.clone(),
        }))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start mining and follow the chain. Must be called within a tokio
    /// runtime.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("Started miner");

        let mut blocks = self.chain.subscribe_blocks();
        let me = self.me.clone();
        tokio::spawn(async move {
            loop {
                let restart = match blocks.recv().await {
                    Ok(event) => !event.mined_locally && event.is_active_tip,
                    Err(RecvError::Lagged(skipped)) => {
                        log::debug!("Miner skipped {} block events", skipped);
                        true
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(miner) = me.upgrade() else { break };
                if !miner.is_running() {
                    break;
                }
                if restart {
                    miner.start_mining();
                }
            }
        });

        self.start_mining();
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.stop_solver();
        log::info!("Stopped miner");
    }

    fn stop_solver(&self) {
        if let Some(handle) = self.solver.lock().take() {
            handle.stop();
        }
    }

    /// Mine on the active tip, starting over if the tip moved while the
    /// candidate was being assembled
    fn start_mining(&self) {
        loop {
            let last = self.chain.last_active_item();
            if let Err(err) = self.start_mining_on(&last) {
                log::warn!("Could not start mining on block {}: {}", last.hash().short(), err);
                return;
            }
            if self.chain.last_active_item().hash() == last.hash() {
                return;
            }
        }
    }

    fn start_mining_on(&self, last: &ChainItem) -> Result<(), MinerError> {
        let block = self.create_candidate_block(last)?;
        let target = self.target_calculator.calculate_target()?;
        let height = last.height() + 1;

        let solver = PuzzleSolver::new();
        let handle = solver.stop_handle();
        if let Some(previous) = self.solver.lock().replace(handle) {
            previous.stop();
        }

        let me = self.me.clone();
        tokio::spawn(async move {
            let solved = solve_blocking(solver, block, target).await;
            let Some(miner) = me.upgrade() else { return };
            match solved {
                Ok(block) => miner.puzzle_solved(block).await,
                Err(MinerError::Stopped) => {
                    log::debug!("Stopped mining block ({})", height);
                }
                Err(err) => log::warn!("Mining block ({}) failed: {}", height, err),
            }
        });
        log::info!("Started mining block ({})", height);
        Ok(())
    }

    async fn puzzle_solved(&self, block: Block) {
        log::info!("Solved block (Hash: {})", block.hash());
        if let Err(err) = self.submit_block(block).await {
            log::warn!("Could not add mined block: {}", err);
        }
        if self.is_running() {
            self.start_mining();
        }
    }

    /// Relay a solved block and add it to the chain as mined locally
    pub async fn submit_block(&self, block: Block) -> Result<bool, ChainError> {
        self.network.relay_block(&block).await;
        self.chain.add_block(block, true).await
    }

    /// Mine a single block on the active tip and add it to the chain.
    ///
    /// Runs in the caller's task; used for offline mining.
    pub async fn mine_block(&self) -> Result<Block, MinerError> {
        let last = self.chain.last_active_item();
        let target = self.target_calculator.calculate_target()?;
        let block = self.create_candidate_block(&last)?;

        let solved = solve_blocking(PuzzleSolver::new(), block, target).await?;
        log::info!("Solved block ({}) (Hash: {})", last.height() + 1, solved.hash());
        self.submit_block(solved.clone()).await?;
        Ok(solved)
    }

    /// Coinbase paying the block subsidy to the reward script, followed by
    /// pool candidates that fit in the block
    pub fn create_candidate_block(&self, last: &ChainItem) -> Result<Block, MinerError> {
        let height = last.height() + 1;
        let coinbase = Transaction::coinbase(
            height,
            b"",
            TxOutput::new(block_subsidy(height), self.reward_script.clone()),
        );

        let max_size = self
            .max_block_size
            .saturating_sub(BlockHeader::SIZE + coinbase.size() + MAX_TX_COUNT_VARINT_SIZE);
        let mut transactions = vec![coinbase];
        transactions.extend(self.pool.candidate_transactions(max_size));

        let target = self.target_calculator.calculate_target()?;
        let header = BlockHeader::new(
            1,
            last.hash(),
            Block::calculate_merkle_root(&transactions),
            now_secs().max(last.header().timestamp),
            target.to_bits(),
            0,
        );
        Ok(Block::new(header, transactions))
    }
}

/// Search the nonce space on a blocking thread. An exhausted nonce space
/// bumps the timestamp and searches again.
async fn solve_blocking(
    solver: PuzzleSolver,
    mut block: Block,
    target: DifficultyTarget,
) -> Result<Block, MinerError> {
    tokio::task::spawn_blocking(move || loop {
        let result = solver.solve(&mut block.header, &target);
        match result.status {
            SolveStatus::Solved => {
                log::debug!(
                    "Solved after {} attempts ({:.1} KH/s)",
                    result.attempts,
                    result.hash_rate() / 1000.0
                );
                return Ok(block);
            }
            SolveStatus::Stopped => return Err(MinerError::Stopped),
            SolveStatus::Exhausted => {
                block.header.timestamp = block.header.timestamp.saturating_add(1);
            }
        }
    })
    .await?
}

fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as u32)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NodeConfig, PoolConfig};
    use crate::consensus::MAX_TARGET_BITS;
    use crate::mempool::FifoTransactionPool;
    use crate::network::OfflineNetwork;
    use crate::storage::Storage;
    use crate::test_utils::{MockNetwork, coinbase_output, spend};

    struct Fixture {
        chain: Arc<Chain>,
        pool: Arc<FifoTransactionPool>,
        miner: Arc<Miner>,
        _storage: Storage,
    }

    fn fixture() -> Fixture {
        let storage = Storage::memory().unwrap();
        let pool = Arc::new(FifoTransactionPool::new(&PoolConfig::default()));
        let network: Arc<dyn NetworkInterface> = Arc::new(OfflineNetwork);
        let config = NodeConfig::default();
        let chain = Chain::new(storage.stores(), pool.clone(), network.clone(), &config).unwrap();
        let miner = Miner::new(chain.clone(), pool.clone(), network, &config.mining).unwrap();
        Fixture {
            chain,
            pool,
            miner,
            _storage: storage,
        }
    }

    #[test]
    fn test_block_subsidy_halves() {
        assert_eq!(block_subsidy(1), 50 * COIN);
        assert_eq!(block_subsidy(210_000), 50 * COIN);
        assert_eq!(block_subsidy(210_001), 25 * COIN);
        assert_eq!(block_subsidy(420_001), 1_250_000_000);
        assert_eq!(block_subsidy(u32::MAX), 0);
    }

    #[test]
    fn test_invalid_reward_script() {
        let f = fixture();
        let config = MiningConfig {
            reward_script_hex: "zz".to_string(),
            ..MiningConfig::default()
        };
        let result = Miner::new(f.chain.clone(), f.pool.clone(), Arc::new(OfflineNetwork), &config);
        assert!(matches!(result, Err(MinerError::RewardScript(_))));
    }

    #[test]
    fn test_candidate_block() {
        let f = fixture();
        let funding = coinbase_output(7, 100);
        let payment = spend(&funding, 0, &[60, 40]);
        f.pool.add_transaction(payment.clone());

        let genesis = f.chain.genesis_item().clone();
        let block = f.miner.create_candidate_block(&genesis).unwrap();

        assert_eq!(block.prev_hash(), genesis.hash());
        assert_eq!(block.header.bits, MAX_TARGET_BITS);
        assert_eq!(block.transactions.len(), 2);
        assert!(block.transactions[0].is_coinbase());
        assert_eq!(block.transactions[0].total_output_value(), 50 * COIN);
        assert_eq!(block.transactions[1], payment);
        assert_eq!(block.header.merkle_root, Block::calculate_merkle_root(&block.transactions));
        assert!(block.header.timestamp >= genesis.header().timestamp);
    }

    #[test]
    fn test_candidate_block_respects_size() {
        let f = fixture();
        let config = MiningConfig {
            max_block_size: BlockHeader::SIZE + 100,
            ..MiningConfig::default()
        };
        let miner = Miner::new(f.chain.clone(), f.pool.clone(), Arc::new(OfflineNetwork), &config).unwrap();
        f.pool.add_transaction(spend(&coinbase_output(1, 10), 0, &[10]));

        let block = miner.create_candidate_block(f.chain.genesis_item()).unwrap();
        assert_eq!(block.transactions.len(), 1);
    }

    #[tokio::test]
    async fn test_submit_block_confirms_pool_transactions() {
        let f = fixture();
        let funding = coinbase_output(3, 100);
        f.pool.add_transaction(funding.clone());
        f.pool.add_transaction(spend(&funding, 0, &[100]));
        let mut events = f.chain.subscribe_blocks();
        let network = Arc::new(MockNetwork::new());
        let miner = Miner::new(f.chain.clone(), f.pool.clone(), network.clone(), &MiningConfig::default()).unwrap();

        let block = miner.create_candidate_block(f.chain.genesis_item()).unwrap();
        assert!(miner.submit_block(block.clone()).await.unwrap());
        assert_eq!(network.relayed(), vec![block.hash()]);

        assert_eq!(f.chain.height(), 1);
        assert_eq!(f.pool.count(), 0);
        let event = events.recv().await.unwrap();
        assert!(event.mined_locally);
        assert!(event.is_active_tip);
        assert_eq!(event.block.hash(), block.hash());
    }

    #[tokio::test]
    async fn test_remote_block_restarts_mining() {
        let f = fixture();
        f.miner.start();
        assert!(f.miner.is_running());
        let first = f.miner.solver.lock().clone().unwrap();

        let remote = f.miner.create_candidate_block(f.chain.genesis_item()).unwrap();
        assert!(f.chain.append_block(Arc::new(remote), false).unwrap());

        for _ in 0..100 {
            if first.is_stopped() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(first.is_stopped());
        let second = f.miner.solver.lock().clone().unwrap();
        assert!(!second.is_stopped());

        f.miner.stop();
        assert!(second.is_stopped());
        assert!(!f.miner.is_running());
    }

    #[tokio::test]
    async fn test_local_block_does_not_restart() {
        let f = fixture();
        f.miner.start();
        let first = f.miner.solver.lock().clone().unwrap();

        let local = f.miner.create_candidate_block(f.chain.genesis_item()).unwrap();
        f.chain.append_block(Arc::new(local), true).unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!first.is_stopped());

        f.miner.stop();
        assert!(first.is_stopped());
    }
}
