// Block data structures

use std::io::{Cursor, Read};

use super::serialize::{read_array, read_varint, write_varint};
use super::{CodecError, Hash256, Serializable, Transaction, hash256};

/// Fixed genesis header fields
const GENESIS_TIMESTAMP: u32 = 1_617_033_110;
const GENESIS_BITS: u32 = 0x1d00ffff;
const GENESIS_NONCE: u32 = 269_029_189;

/// Block header - 80 bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_block_hash: Hash256,
    /// Merkle root of all transactions in the block
    pub merkle_root: Hash256,
    /// Unix epoch seconds
    pub timestamp: u32,
    /// Difficulty target (compact format)
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub const SIZE: usize = 80;

    pub fn new(
        version: u32,
        prev_block_hash: Hash256,
        merkle_root: Hash256,
        timestamp: u32,
        bits: u32,
        nonce: u32,
    ) -> Self {
        Self {
            version,
            prev_block_hash,
            merkle_root,
            timestamp,
            bits,
            nonce,
        }
    }

    pub fn hash(&self) -> Hash256 {
        hash256(&self.to_bytes())
    }

    /// Always 80 bytes
    pub fn to_bytes(&self) -> [u8; 80] {
        let mut buf = [0u8; 80];
        buf[0..4].copy_from_slice(&self.version.to_le_bytes());
        buf[4..36].copy_from_slice(self.prev_block_hash.as_bytes());
        buf[36..68].copy_from_slice(self.merkle_root.as_bytes());
        buf[68..72].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[72..76].copy_from_slice(&self.bits.to_le_bytes());
        buf[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < Self::SIZE {
            return Err(CodecError::InvalidLength {
                what: "block header",
                expected: Self::SIZE,
                got: data.len(),
            });
        }
        Self::from_reader(&mut Cursor::new(data))
    }

    fn from_reader<R: Read + ?Sized>(reader: &mut R) -> Result<Self, CodecError> {
        Ok(Self {
            version: u32::from_le_bytes(read_array(reader)?),
            prev_block_hash: Hash256::new(read_array(reader)?),
            merkle_root: Hash256::new(read_array(reader)?),
            timestamp: u32::from_le_bytes(read_array(reader)?),
            bits: u32::from_le_bytes(read_array(reader)?),
            nonce: u32::from_le_bytes(read_array(reader)?),
        })
    }
}

/// Block - header and transactions
#[derive(Debug, Clone)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self {
            header,
            transactions,
        }
    }

    /// The hard-coded first block of every chain. It carries no transactions
    /// and is never written to storage.
    pub fn genesis() -> Self {
        let header = BlockHeader::new(
            1,
            Hash256::zero(),
            Hash256::zero(),
            GENESIS_TIMESTAMP,
            GENESIS_BITS,
            GENESIS_NONCE,
        );
        Self::new(header, Vec::new())
    }

    /// Merkle root over transaction ids; the last id is paired with itself
    /// on odd levels
    pub fn calculate_merkle_root(transactions: &[Transaction]) -> Hash256 {
        if transactions.is_empty() {
            return Hash256::zero();
        }

        let mut hashes: Vec<Hash256> = transactions.iter().map(Transaction::txid).collect();

        while hashes.len() > 1 {
            hashes = hashes
                .chunks(2)
                .map(|pair| {
                    let left = pair[0];
                    let right = pair.get(1).copied().unwrap_or(left);
                    let mut combined = [0u8; 64];
                    combined[..32].copy_from_slice(left.as_bytes());
                    combined[32..].copy_from_slice(right.as_bytes());
                    hash256(&combined)
                })
                .collect();
        }

        hashes[0]
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn prev_hash(&self) -> Hash256 {
        self.header.prev_block_hash
    }

    /// Serialized size in bytes
    pub fn size(&self) -> usize {
        let mut varint = Vec::with_capacity(9);
        let _ = write_varint(&mut varint, self.transactions.len() as u64);
        BlockHeader::SIZE
            + varint.len()
            + self.transactions.iter().map(Transaction::size).sum::<usize>()
    }
}

/// Blocks are identified by their hash
impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.hash() == other.hash()
    }
}

impl Eq for Block {}

impl Serializable for Block {
    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size());
        buf.extend_from_slice(&self.header.to_bytes());
        let _ = write_varint(&mut buf, self.transactions.len() as u64);
        for tx in &self.transactions {
            buf.extend_from_slice(&tx.serialize());
        }
        buf
    }

    fn deserialize(data: &[u8]) -> Result<Self, CodecError> {
        let mut cursor = Cursor::new(data);
        let header = BlockHeader::from_reader(&mut cursor)?;

        let tx_count = read_varint(&mut cursor)? as usize;
        let mut transactions = Vec::with_capacity(tx_count.min(4096));
        for _ in 0..tx_count {
            transactions.push(Transaction::from_reader(&mut cursor)?);
        }

        Ok(Self {
            header,
            transactions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TxOutput;

    fn coinbase(height: u32, value: u64) -> Transaction {
        Transaction::coinbase(height, b"", TxOutput::new(value, vec![1, 2, 3]))
    }

    #[test]
    fn test_block_header_serialization() {
        let header = BlockHeader::new(1, Hash256::zero(), Hash256::zero(), 1234567890, 0x1d00ffff, 0);

        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), 80);
        assert_eq!(BlockHeader::from_bytes(&bytes).unwrap(), header);
        assert!(BlockHeader::from_bytes(&bytes[..79]).is_err());
    }

    #[test]
    fn test_genesis_block() {
        let genesis = Block::genesis();
        assert!(genesis.prev_hash().is_zero());
        assert!(genesis.transactions.is_empty());
        assert_eq!(genesis.header.bits, 0x1d00ffff);
        assert_eq!(genesis.header.timestamp, 1_617_033_110);
        assert_eq!(genesis.hash(), Block::genesis().hash());
    }

    #[test]
    fn test_multi_transaction_block_decodes() {
        let txs = vec![coinbase(1, 50), coinbase(2, 60), coinbase(3, 70)];
        let merkle_root = Block::calculate_merkle_root(&txs);
        let header = BlockHeader::new(1, Hash256::new([7; 32]), merkle_root, 1000, 0x1d00ffff, 5);
        let block = Block::new(header, txs);

        let bytes = block.serialize();
        assert_eq!(bytes.len(), block.size());

        let decoded = Block::deserialize(&bytes).unwrap();
        assert_eq!(decoded.transactions, block.transactions);
        assert_eq!(decoded.hash(), block.hash());
    }

    #[test]
    fn test_merkle_root_single_tx() {
        let tx = coinbase(1, 50);
        assert_eq!(Block::calculate_merkle_root(std::slice::from_ref(&tx)), tx.txid());
    }

    #[test]
    fn test_merkle_root_depends_on_order() {
        let a = coinbase(1, 10);
        let b = coinbase(2, 20);
        assert_ne!(
            Block::calculate_merkle_root(&[a.clone(), b.clone()]),
            Block::calculate_merkle_root(&[b, a])
        );
    }
}
