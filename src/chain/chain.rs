// Block tree with the active branch selected by chain work

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;

use super::events::{BlockAddedEvent, EVENT_CHANNEL_CAPACITY, OutputsUpdated};
use super::maintainer::{BranchLookup, ChainTransactionsMaintainer};
use super::synchronizer::ChainSynchronizer;
use super::{ChainBlock, ChainError, ChainItem, SyncError};
use crate::config::{ChainConfig, NodeConfig, SyncConfig};
use crate::consensus::ActiveChain;
use crate::core::{Block, BlockHeader, Hash256};
use crate::mempool::TransactionPool;
use crate::network::NetworkInterface;
use crate::storage::{ChainStores, StorageError};

/// In-memory window of the block tree
struct ChainState {
    blocks: HashMap<Hash256, ChainItem>,
    /// Items with no known successor
    tips: Vec<Hash256>,
    /// Tip with the most chain work
    active_tip: ChainItem,
}

impl ChainState {
    fn new(genesis: &ChainItem) -> Self {
        Self {
            blocks: HashMap::from([(genesis.hash(), genesis.clone())]),
            tips: vec![genesis.hash()],
            active_tip: genesis.clone(),
        }
    }
}

/// The node's view of the block tree.
///
/// Every known branch head is tracked as a tip and the tip with the most
/// chain work is the active one. Blocks older than the configured window are
/// dropped from memory but stay in storage, and transaction bodies are kept
/// in memory only for the most recent blocks.
pub struct Chain {
    genesis: ChainItem,
    state: RwLock<ChainState>,
    stores: ChainStores,
    maintainer: ChainTransactionsMaintainer,
    network: Arc<dyn NetworkInterface>,
    synchronizer: Arc<ChainSynchronizer>,
    config: ChainConfig,
    sync_config: SyncConfig,
    block_tx: broadcast::Sender<BlockAddedEvent>,
    me: Weak<Chain>,
}

impl Chain {
    /// Build the chain over `stores` and load its state
    pub fn new(
        stores: ChainStores,
        pool: Arc<dyn TransactionPool>,
        network: Arc<dyn NetworkInterface>,
        config: &NodeConfig,
    ) -> Result<Arc<Self>, ChainError> {
        let genesis = ChainItem::genesis();
        let (block_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let maintainer = ChainTransactionsMaintainer::new(
            pool,
            stores.transactions.clone(),
            stores.utxos.clone(),
        );

        let chain = Arc::new_cyclic(|me: &Weak<Chain>| Chain {
            state: RwLock::new(ChainState::new(&genesis)),
            genesis,
            stores,
            maintainer,
            synchronizer: ChainSynchronizer::new(me.clone(), network.clone(), config.sync, true),
            network,
            config: config.chain,
            sync_config: config.sync,
            block_tx,
            me: me.clone(),
        });
        chain.load()?;
        Ok(chain)
    }

    /// Start following the network: watch for peers and run a first
    /// synchronization
    pub async fn initialize(&self) -> Result<(), SyncError> {
        self.synchronizer.start();
        self.synchronizer.synch_chain_with_network().await
    }

    /// Replace the in-memory state with the window loaded from storage
    pub fn load(&self) -> Result<(), ChainError> {
        let mut state = self.state.write();
        *state = self.load_state()?;
        log::info!(
            "Loaded chain at height {} with {} blocks and {} tips",
            state.active_tip.height(),
            state.blocks.len(),
            state.tips.len()
        );
        Ok(())
    }

    fn load_state(&self) -> Result<ChainState, ChainError> {
        let height = self.stores.blocks.height()?;
        if height == 0 {
            return Ok(ChainState::new(&self.genesis));
        }

        let min_height = (height + 1).saturating_sub(self.config.max_height_offset_of_loaded_blocks);
        let min_height_with_transactions = (height + 1)
            .saturating_sub(self.config.max_height_offset_of_loaded_blocks_with_transactions);

        let tips = self.stores.blocks.tips(min_height, min_height_with_transactions)?;
        let Some(first_tip) = tips.first() else {
            return Err(StorageError::Inconsistent(format!("no tips stored at height {height}")).into());
        };

        // Ties go to the tip stored as active
        let stored_active = self.stores.blocks.active_chain_item_at(height)?.map(|item| item.hash());
        let mut active_tip = first_tip.clone();
        for tip in &tips {
            let work = tip.chain_work();
            if work > active_tip.chain_work()
                || (work == active_tip.chain_work() && Some(tip.hash()) == stored_active)
            {
                active_tip = tip.clone();
            }
        }

        let mut blocks: HashMap<Hash256, ChainItem> =
            tips.iter().map(|tip| (tip.hash(), tip.clone())).collect();
        for tip in &tips {
            let mut current = tip.clone();
            while current.height() > min_height && current.height() > 0 {
                let prev_hash = current.prev_hash();
                if blocks.contains_key(&prev_hash) {
                    break;
                }
                let previous = if current.height() == 1 {
                    self.genesis.clone()
                } else {
                    let include_transactions = current.height() > min_height_with_transactions;
                    self.stores
                        .blocks
                        .find_chain_item(&prev_hash, include_transactions)?
                        .ok_or(ChainError::UnknownPredecessor(prev_hash))?
                };
                blocks.insert(previous.hash(), previous.clone());
                current = previous;
            }
        }

        Ok(ChainState {
            blocks,
            tips: tips.iter().map(ChainItem::hash).collect(),
            active_tip,
        })
    }

    /// Add a block, downloading its missing ancestors first when its
    /// predecessor is unknown.
    ///
    /// Returns false if the block is already stored.
    pub async fn add_block(&self, block: Block, mined_locally: bool) -> Result<bool, ChainError> {
        let block = Arc::new(block);
        match self.append_block(block.clone(), mined_locally) {
            Err(ChainError::UnknownPredecessor(prev_hash)) => {
                log::info!(
                    "Predecessor {} of block {} is unknown, downloading it",
                    prev_hash.short(),
                    block.hash().short()
                );
                let synchronizer = ChainSynchronizer::new(
                    self.me.clone(),
                    self.network.clone(),
                    self.sync_config,
                    false,
                );
                let recovery = synchronizer
                    .synch_block_and_previous(ChainBlock::Full(block.clone()))
                    .await;

                // The synchronizer adds the block itself once its ancestors
                // are in, even if the catch-up that follows fails
                if self.is_block_known(&block.hash())? {
                    if let Err(err) = recovery {
                        log::info!(
                            "Block {} added, catching up afterwards failed: {}",
                            block.hash().short(),
                            err
                        );
                    }
                    return Ok(true);
                }
                recovery?;
                self.append_block(block, mined_locally)
            }
            result => result,
        }
    }

    /// Add a block whose predecessor must already be known.
    ///
    /// The whole update runs under the state lock: tip bookkeeping,
    /// persistence, transaction maintenance, the block-added event and the
    /// window cleanup.
    pub fn append_block(&self, block: Arc<Block>, mined_locally: bool) -> Result<bool, ChainError> {
        let hash = block.hash();
        let mut guard = self.state.write();
        let state = &mut *guard;

        if hash == self.genesis.hash() || self.stores.blocks.find_chain_item(&hash, false)?.is_some() {
            log::debug!("Block {} is already in the chain", hash.short());
            return Ok(false);
        }

        let prev_hash = block.prev_hash();
        let previous = self
            .find_item_in(state, &prev_hash, false)?
            .ok_or(ChainError::UnknownPredecessor(prev_hash))?;
        let item = previous.successor(block.clone())?;

        let initial_tip = state.active_tip.clone();
        let became_active_tip = item.chain_work() > initial_tip.chain_work();

        // Work out the transaction changes before writing anything
        let plan = if !became_active_tip {
            None
        } else if item.prev_hash() == initial_tip.hash() {
            Some(self.maintainer.plan_block_added(&block)?)
        } else {
            let view = StateView { chain: self, state };
            Some(self.maintainer.plan_branch_switch(&view, &initial_tip, &item)?)
        };

        self.stores
            .blocks
            .save_new_chain_item(&item, &previous, became_active_tip)?;
        self.stores.heights.save_block_height(&hash, item.height())?;
        if let Some(plan) = plan {
            self.maintainer.apply(plan)?;
        }

        state.tips.retain(|tip| *tip != prev_hash);
        state.tips.push(hash);
        state.blocks.insert(hash, item.clone());
        if became_active_tip {
            state.active_tip = item.clone();
        }

        log::info!(
            "Added block {} at height {} (work {:.3}, active: {})",
            hash.short(),
            item.height(),
            item.chain_work(),
            became_active_tip
        );
        let _ = self.block_tx.send(BlockAddedEvent {
            block,
            height: item.height(),
            chain_work: item.chain_work(),
            is_active_tip: became_active_tip,
            mined_locally,
        });

        self.clean_up_old_blocks(state);
        Ok(true)
    }

    /// Evict items below the loaded window and drop transaction bodies below
    /// the shorter transaction window
    fn clean_up_old_blocks(&self, state: &mut ChainState) {
        let height = state.active_tip.height();

        let offset = self.config.max_height_offset_of_loaded_blocks;
        if height > offset {
            let min_height = height - offset + 1;
            state.blocks.retain(|_, item| item.height() >= min_height);
            let blocks = &state.blocks;
            state.tips.retain(|tip| blocks.contains_key(tip));
        }

        let offset = self.config.max_height_offset_of_loaded_blocks_with_transactions;
        if height > offset {
            let min_height = height - offset + 1;
            for item in state.blocks.values_mut() {
                if item.height() > 0 && item.height() < min_height && item.has_transactions() {
                    *item = item.without_transactions();
                }
            }
        }
    }

    /// Look up an item in the window, then in storage
    fn find_item_in(
        &self,
        state: &ChainState,
        hash: &Hash256,
        include_transactions: bool,
    ) -> Result<Option<ChainItem>, ChainError> {
        if *hash == self.genesis.hash() {
            return Ok(Some(self.genesis.clone()));
        }
        if let Some(item) = state.blocks.get(hash) {
            if !include_transactions || item.has_transactions() {
                return Ok(Some(item.clone()));
            }
        }
        Ok(self.stores.blocks.find_chain_item(hash, include_transactions)?)
    }

    pub fn chain_item(
        &self,
        hash: &Hash256,
        include_transactions: bool,
    ) -> Result<Option<ChainItem>, ChainError> {
        let state = self.state.read();
        self.find_item_in(&state, hash, include_transactions)
    }

    pub fn is_block_known(&self, hash: &Hash256) -> Result<bool, ChainError> {
        Ok(self.chain_item(hash, false)?.is_some())
    }

    /// The full block behind `item`, read from storage if its transactions
    /// were dropped from memory
    pub fn ensure_loaded(&self, item: &ChainItem) -> Result<Arc<Block>, ChainError> {
        if let Some(block) = item.block() {
            return Ok(block.clone());
        }
        self.stores
            .blocks
            .find_chain_item(&item.hash(), true)?
            .and_then(|loaded| loaded.block().cloned())
            .ok_or_else(|| {
                StorageError::Inconsistent(format!("no body stored for block {}", item.hash())).into()
            })
    }

    /// Height of the active tip
    pub fn height(&self) -> u32 {
        self.state.read().active_tip.height()
    }

    pub fn genesis_item(&self) -> &ChainItem {
        &self.genesis
    }

    pub fn last_active_item(&self) -> ChainItem {
        self.state.read().active_tip.clone()
    }

    pub fn tips(&self) -> Vec<ChainItem> {
        let state = self.state.read();
        state
            .tips
            .iter()
            .filter_map(|hash| state.blocks.get(hash).cloned())
            .collect()
    }

    /// Number of items held in memory
    pub fn loaded_block_count(&self) -> usize {
        self.state.read().blocks.len()
    }

    /// Item at `height` on the active branch
    pub fn active_item_at(&self, height: u32) -> Result<ChainItem, ChainError> {
        let state = self.state.read();
        let tip = &state.active_tip;
        if height > tip.height() {
            return Err(ChainError::HeightOutOfRange(height));
        }
        if height == 0 {
            return Ok(self.genesis.clone());
        }

        let mut current = tip;
        while current.height() > height {
            match state.blocks.get(&current.prev_hash()) {
                Some(previous) => current = previous,
                None => break,
            }
        }
        if current.height() == height {
            return Ok(current.clone());
        }

        self.stores.blocks.active_chain_item_at(height)?.ok_or_else(|| {
            StorageError::Inconsistent(format!("no active block stored at height {height}")).into()
        })
    }

    pub fn get_active_block(&self, height: u32) -> Result<ChainBlock, ChainError> {
        Ok(self.active_item_at(height)?.chain_block().clone())
    }

    /// Items at `height` on every known branch
    pub fn get_chain_items(
        &self,
        height: u32,
        include_transactions: bool,
    ) -> Result<Vec<ChainItem>, ChainError> {
        let state = self.state.read();
        if height > state.active_tip.height() {
            return Err(ChainError::HeightOutOfRange(height));
        }
        if height == 0 {
            return Ok(vec![self.genesis.clone()]);
        }

        let mut items = Vec::new();
        for hash in self.stores.heights.block_hashes_at(height)? {
            let item = self
                .find_item_in(&state, &hash, include_transactions)?
                .ok_or_else(|| StorageError::Inconsistent(format!("indexed block {hash} is missing")))?;
            items.push(item);
        }
        Ok(items)
    }

    pub fn get_blocks(
        &self,
        height: u32,
        include_transactions: bool,
    ) -> Result<Vec<ChainBlock>, ChainError> {
        Ok(self
            .get_chain_items(height, include_transactions)?
            .iter()
            .map(|item| item.chain_block().clone())
            .collect())
    }

    /// The `count` most recent blocks of the active branch, newest first
    pub fn get_last_active_blocks(
        &self,
        count: u32,
        include_transactions: bool,
    ) -> Result<Vec<ChainBlock>, ChainError> {
        if count < 1 {
            return Err(ChainError::InvalidCount);
        }

        let state = self.state.read();
        let height = state.active_tip.height();
        if count > height + 1 {
            return Err(ChainError::TooManyBlocksRequested { available: height + 1 });
        }

        let mut blocks = Vec::with_capacity(count as usize);
        let mut hash = state.active_tip.hash();
        for _ in 0..count {
            let item = self
                .find_item_in(&state, &hash, include_transactions)?
                .ok_or(ChainError::UnknownPredecessor(hash))?;
            hash = item.prev_hash();
            blocks.push(item.chain_block().clone());
        }
        Ok(blocks)
    }

    pub fn subscribe_blocks(&self) -> broadcast::Receiver<BlockAddedEvent> {
        self.block_tx.subscribe()
    }

    pub fn subscribe_outputs(&self) -> broadcast::Receiver<OutputsUpdated> {
        self.maintainer.subscribe_outputs()
    }

    pub fn synchronizer(&self) -> &Arc<ChainSynchronizer> {
        &self.synchronizer
    }
}

impl ActiveChain for Chain {
    fn height(&self) -> u32 {
        Chain::height(self)
    }

    fn active_header_at(&self, height: u32) -> Result<BlockHeader, ChainError> {
        Ok(self.active_item_at(height)?.header().clone())
    }
}

/// Branch lookups against a locked state
struct StateView<'a> {
    chain: &'a Chain,
    state: &'a ChainState,
}

impl BranchLookup for StateView<'_> {
    fn find(&self, hash: &Hash256) -> Result<Option<ChainItem>, ChainError> {
        self.chain.find_item_in(self.state, hash, false)
    }

    fn ensure_loaded(&self, item: &ChainItem) -> Result<Arc<Block>, ChainError> {
        self.chain.ensure_loaded(item)
    }
}
