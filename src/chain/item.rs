// Chain bookkeeping unit

use std::sync::Arc;

use crate::consensus::{DifficultyError, DifficultyTarget};
use crate::core::{Block, BlockHeader, Hash256};

/// Block data held by a [`ChainItem`]: the whole block, or only its header
/// once the transaction bodies have been dropped from memory.
#[derive(Debug, Clone)]
pub enum ChainBlock {
    Full(Arc<Block>),
    HeaderOnly(BlockHeader),
}

impl ChainBlock {
    pub fn header(&self) -> &BlockHeader {
        match self {
            ChainBlock::Full(block) => &block.header,
            ChainBlock::HeaderOnly(header) => header,
        }
    }
}

/// A block together with its position on its branch.
///
/// `height` counts the blocks between this one and genesis; `chain_work` is
/// the summed [`block_work`] of every block on the branch up to this one.
/// Items are never mutated once built.
#[derive(Debug, Clone)]
pub struct ChainItem {
    hash: Hash256,
    block: ChainBlock,
    height: u32,
    chain_work: f64,
}

impl ChainItem {
    pub fn new(block: Arc<Block>, height: u32, chain_work: f64) -> Self {
        Self {
            hash: block.hash(),
            block: ChainBlock::Full(block),
            height,
            chain_work,
        }
    }

    pub fn header_only(header: BlockHeader, height: u32, chain_work: f64) -> Self {
        Self {
            hash: header.hash(),
            block: ChainBlock::HeaderOnly(header),
            height,
            chain_work,
        }
    }

    /// The item every chain starts from
    pub fn genesis() -> Self {
        let block = Block::genesis();
        let work = DifficultyTarget::max().work();
        Self::new(Arc::new(block), 0, work)
    }

    /// Item for `block` placed directly on top of this one
    pub fn successor(&self, block: Arc<Block>) -> Result<Self, DifficultyError> {
        let work = block_work(&block.header)?;
        Ok(Self::new(block, self.height + 1, self.chain_work + work))
    }

    pub fn hash(&self) -> Hash256 {
        self.hash
    }

    pub fn header(&self) -> &BlockHeader {
        self.block.header()
    }

    pub fn prev_hash(&self) -> Hash256 {
        self.header().prev_block_hash
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn chain_work(&self) -> f64 {
        self.chain_work
    }

    pub fn chain_block(&self) -> &ChainBlock {
        &self.block
    }

    /// The full block, if its transactions are loaded
    pub fn block(&self) -> Option<&Arc<Block>> {
        match &self.block {
            ChainBlock::Full(block) => Some(block),
            ChainBlock::HeaderOnly(_) => None,
        }
    }

    pub fn has_transactions(&self) -> bool {
        matches!(self.block, ChainBlock::Full(_))
    }

    /// Copy of this item holding only the header
    pub fn without_transactions(&self) -> Self {
        Self {
            hash: self.hash,
            block: ChainBlock::HeaderOnly(self.header().clone()),
            height: self.height,
            chain_work: self.chain_work,
        }
    }
}

/// Expected hashing effort for one block with this header's target
pub fn block_work(header: &BlockHeader) -> Result<f64, DifficultyError> {
    Ok(DifficultyTarget::from_bits(header.bits)?.work())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Transaction;

    fn child_of(parent: &ChainItem, bits: u32) -> Arc<Block> {
        let header = BlockHeader::new(1, parent.hash(), Hash256::zero(), 1_617_033_710, bits, 7);
        Arc::new(Block::new(header, Vec::<Transaction>::new()))
    }

    #[test]
    fn test_genesis_item() {
        let genesis = ChainItem::genesis();
        assert_eq!(genesis.height(), 0);
        assert_eq!(genesis.chain_work(), 32.0);
        assert_eq!(genesis.hash(), Block::genesis().hash());
        assert!(genesis.prev_hash().is_zero());
    }

    #[test]
    fn test_successor_accumulates_work() {
        let genesis = ChainItem::genesis();
        let item = genesis.successor(child_of(&genesis, 0x1d00ffff)).unwrap();
        assert_eq!(item.height(), 1);
        assert_eq!(item.chain_work(), 64.0);
        assert_eq!(item.prev_hash(), genesis.hash());

        let harder = genesis.successor(child_of(&genesis, 0x1c7fffff)).unwrap();
        assert!(harder.chain_work() > item.chain_work());
    }

    #[test]
    fn test_successor_rejects_invalid_bits() {
        let genesis = ChainItem::genesis();
        assert!(genesis.successor(child_of(&genesis, 0x1e00ffff)).is_err());
    }

    #[test]
    fn test_without_transactions_keeps_identity() {
        let genesis = ChainItem::genesis();
        let item = genesis.successor(child_of(&genesis, 0x1d00ffff)).unwrap();
        let stripped = item.without_transactions();

        assert!(item.has_transactions());
        assert!(!stripped.has_transactions());
        assert!(stripped.block().is_none());
        assert_eq!(stripped.hash(), item.hash());
        assert_eq!(stripped.height(), item.height());
        assert_eq!(stripped.chain_work(), item.chain_work());
    }
}
