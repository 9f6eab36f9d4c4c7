// Block builders and a scripted network for unit tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use crate::chain::ChainItem;
use crate::consensus::MAX_TARGET_BITS;
use crate::core::{Block, BlockHeader, Hash256, Transaction, TxInput, TxOutput};
use crate::network::{GetResponse, NetworkError, NetworkInterface, NodeAvailabilitySubscriber};

/// Block on top of `parent` at the maximum target, ten minutes later
pub fn block_on(parent: &ChainItem, transactions: Vec<Transaction>) -> Arc<Block> {
    block_with_bits(parent, transactions, MAX_TARGET_BITS)
}

pub fn block_with_bits(parent: &ChainItem, transactions: Vec<Transaction>, bits: u32) -> Arc<Block> {
    let header = BlockHeader::new(
        1,
        parent.hash(),
        Block::calculate_merkle_root(&transactions),
        parent.header().timestamp + 600,
        bits,
        0,
    );
    Arc::new(Block::new(header, transactions))
}

/// Block holding a single reward tagged by `tag`
pub fn child(parent: &ChainItem, tag: u8) -> Arc<Block> {
    block_on(parent, vec![coinbase_output(tag as u32, 50)])
}

/// Coinbase paying `amount`; distinct tags give distinct transaction ids
pub fn coinbase_output(tag: u32, amount: u64) -> Transaction {
    Transaction::coinbase(tag, b"", TxOutput::new(amount, vec![tag as u8]))
}

/// Spend output `vout` of `tx` into one output per amount
pub fn spend(tx: &Transaction, vout: u32, amounts: &[u64]) -> Transaction {
    Transaction::new(
        vec![TxInput::new(tx.txid(), vout, Vec::new())],
        amounts
            .iter()
            .map(|amount| TxOutput::new(*amount, Vec::new()))
            .collect(),
    )
}

#[derive(Default)]
struct MockState {
    height: Option<u32>,
    by_height: HashMap<u32, Vec<Block>>,
    by_hash: HashMap<Hash256, Block>,
    insufficient_peers: bool,
    height_requests: usize,
    block_requests: usize,
    relayed: Vec<Hash256>,
    subscribers: Vec<Weak<dyn NodeAvailabilitySubscriber>>,
}

/// Network answering from blocks served up front. Anything not served gets
/// a response without replies.
#[derive(Default)]
pub struct MockNetwork {
    state: Mutex<MockState>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer height requests for `height` with `block`, and hash requests
    /// for its hash
    pub fn serve(&self, block: &Block, height: u32) {
        let mut state = self.state.lock();
        state.by_height.entry(height).or_default().push(block.clone());
        state.by_hash.insert(block.hash(), block.clone());
    }

    pub fn serve_by_hash(&self, block: &Block) {
        self.state.lock().by_hash.insert(block.hash(), block.clone());
    }

    pub fn set_height(&self, height: u32) {
        self.state.lock().height = Some(height);
    }

    pub fn set_insufficient_peers(&self, insufficient: bool) {
        self.state.lock().insufficient_peers = insufficient;
    }

    pub fn notify_available(&self) {
        let subscribers: Vec<_> = self
            .state
            .lock()
            .subscribers
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for subscriber in subscribers {
            subscriber.on_nodes_available();
        }
    }

    pub fn height_requests(&self) -> usize {
        self.state.lock().height_requests
    }

    /// Requests by height and by hash
    pub fn block_requests(&self) -> usize {
        self.state.lock().block_requests
    }

    pub fn relayed(&self) -> Vec<Hash256> {
        self.state.lock().relayed.clone()
    }

    fn check_peers(state: &MockState, min: usize) -> Result<(), NetworkError> {
        if state.insufficient_peers {
            return Err(NetworkError::InsufficientPeers {
                available: 0,
                required: min,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl NetworkInterface for MockNetwork {
    async fn get_chain_height(
        &self,
        _preferred: usize,
        min: usize,
    ) -> Result<GetResponse<u32>, NetworkError> {
        let mut state = self.state.lock();
        state.height_requests += 1;
        Self::check_peers(&state, min)?;
        Ok(match state.height {
            Some(height) => GetResponse::new(vec![height], 1),
            None => GetResponse::empty(),
        })
    }

    async fn get_block(
        &self,
        hash: &Hash256,
        _preferred: usize,
        min: usize,
    ) -> Result<GetResponse<Block>, NetworkError> {
        let mut state = self.state.lock();
        state.block_requests += 1;
        Self::check_peers(&state, min)?;
        Ok(match state.by_hash.get(hash) {
            Some(block) => GetResponse::new(vec![block.clone()], 1),
            None => GetResponse::empty(),
        })
    }

    async fn get_blocks(
        &self,
        height: u32,
        _preferred: usize,
        min: usize,
    ) -> Result<GetResponse<Vec<Block>>, NetworkError> {
        let mut state = self.state.lock();
        state.block_requests += 1;
        Self::check_peers(&state, min)?;
        Ok(match state.by_height.get(&height) {
            Some(blocks) => GetResponse::new(vec![blocks.clone()], 1),
            None => GetResponse::empty(),
        })
    }

    async fn relay_block(&self, block: &Block) {
        self.state.lock().relayed.push(block.hash());
    }

    fn subscribe_node_availability(
        &self,
        subscriber: Weak<dyn NodeAvailabilitySubscriber>,
        _min_nodes: usize,
    ) {
        self.state.lock().subscribers.push(subscriber);
    }
}
