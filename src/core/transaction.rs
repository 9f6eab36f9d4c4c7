// Transactions and the output coordinates they consume and produce

use std::io::{Cursor, Read, Write};

use super::serialize::{read_array, read_var_bytes, read_varint, write_var_bytes, write_varint};
use super::{CodecError, Hash256, Serializable, hash256};

/// Reference to an output of an earlier transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutPoint {
    pub txid: Hash256,
    pub vout: u32,
}

impl OutPoint {
    pub const ENCODED_LEN: usize = 36;

    pub fn new(txid: Hash256, vout: u32) -> Self {
        Self { txid, vout }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::ENCODED_LEN);
        bytes.extend_from_slice(self.txid.as_bytes());
        bytes.extend_from_slice(&self.vout.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() != Self::ENCODED_LEN {
            return Err(CodecError::InvalidLength {
                what: "outpoint",
                expected: Self::ENCODED_LEN,
                got: bytes.len(),
            });
        }
        let txid = Hash256::from_slice(&bytes[..32])?;
        let vout = u32::from_le_bytes([bytes[32], bytes[33], bytes[34], bytes[35]]);
        Ok(Self { txid, vout })
    }
}

/// UTXO coordinate: the owning transaction, the output index and its amount.
///
/// Two coordinates denote the same output when their outpoints match; the
/// amount rides along for observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnspentOutput {
    pub outpoint: OutPoint,
    pub amount: u64,
}

impl UnspentOutput {
    pub fn new(txid: Hash256, vout: u32, amount: u64) -> Self {
        Self {
            outpoint: OutPoint::new(txid, vout),
            amount,
        }
    }
}

/// Transaction input - spends a previous output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    pub prev_tx_hash: Hash256,
    pub prev_index: u32,
    /// Unlocking script; never executed by the chain engine
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl TxInput {
    const COINBASE_INDEX: u32 = 0xffff_ffff;

    pub fn new(prev_tx_hash: Hash256, prev_index: u32, script_sig: Vec<u8>) -> Self {
        Self {
            prev_tx_hash,
            prev_index,
            script_sig,
            sequence: 0xffff_ffff,
        }
    }

    /// Coinbase input. The block height leads the script so that coinbases
    /// paying the same output at different heights get distinct ids.
    pub fn coinbase(height: u32, extra: &[u8]) -> Self {
        let mut script_sig = height.to_le_bytes().to_vec();
        script_sig.extend_from_slice(extra);
        Self::new(Hash256::zero(), Self::COINBASE_INDEX, script_sig)
    }

    pub fn is_coinbase(&self) -> bool {
        self.prev_tx_hash.is_zero() && self.prev_index == Self::COINBASE_INDEX
    }

    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.prev_tx_hash, self.prev_index)
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.prev_tx_hash.as_bytes());
        buf.extend_from_slice(&self.prev_index.to_le_bytes());
        // Writes into a Vec cannot fail
        let _ = write_var_bytes(buf, &self.script_sig);
        buf.extend_from_slice(&self.sequence.to_le_bytes());
    }

    fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self, CodecError> {
        let prev_tx_hash = Hash256::new(read_array(reader)?);
        let prev_index = u32::from_le_bytes(read_array(reader)?);
        let script_sig = read_var_bytes(reader)?;
        let sequence = u32::from_le_bytes(read_array(reader)?);
        Ok(Self {
            prev_tx_hash,
            prev_index,
            script_sig,
            sequence,
        })
    }
}

/// Transaction output - an amount and its locking script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

impl TxOutput {
    pub fn new(value: u64, script_pubkey: Vec<u8>) -> Self {
        Self {
            value,
            script_pubkey,
        }
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.value.to_le_bytes());
        let _ = write_var_bytes(buf, &self.script_pubkey);
    }

    fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self, CodecError> {
        let value = u64::from_le_bytes(read_array(reader)?);
        let script_pubkey = read_var_bytes(reader)?;
        Ok(Self {
            value,
            script_pubkey,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn new(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Self {
        Self {
            version: 1,
            inputs,
            outputs,
            lock_time: 0,
        }
    }

    /// Reward transaction for the block at `height`
    pub fn coinbase(height: u32, extra: &[u8], output: TxOutput) -> Self {
        Self::new(vec![TxInput::coinbase(height, extra)], vec![output])
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].is_coinbase()
    }

    /// Double SHA256 of the serialized transaction
    pub fn txid(&self) -> Hash256 {
        hash256(&self.serialize())
    }

    /// Serialized size in bytes
    pub fn size(&self) -> usize {
        self.serialize().len()
    }

    pub fn total_output_value(&self) -> u64 {
        self.outputs.iter().map(|out| out.value).sum()
    }

    /// Outpoints this transaction spends; empty for a coinbase
    pub fn consumed_outpoints(&self) -> Vec<OutPoint> {
        if self.is_coinbase() {
            return Vec::new();
        }
        self.inputs.iter().map(TxInput::outpoint).collect()
    }

    /// Coordinates of every output this transaction creates
    pub fn produced_outputs(&self) -> Vec<UnspentOutput> {
        let txid = self.txid();
        self.outputs
            .iter()
            .enumerate()
            .map(|(index, output)| UnspentOutput::new(txid, index as u32, output.value))
            .collect()
    }

    /// Streaming decode; leaves the reader positioned after the transaction
    pub fn from_reader<R: Read + ?Sized>(reader: &mut R) -> Result<Self, CodecError> {
        let version = u32::from_le_bytes(read_array(reader)?);

        let input_count = read_varint(reader)? as usize;
        let mut inputs = Vec::with_capacity(input_count.min(1024));
        for _ in 0..input_count {
            inputs.push(TxInput::read_from(reader)?);
        }

        let output_count = read_varint(reader)? as usize;
        let mut outputs = Vec::with_capacity(output_count.min(1024));
        for _ in 0..output_count {
            outputs.push(TxOutput::read_from(reader)?);
        }

        let lock_time = u32::from_le_bytes(read_array(reader)?);

        Ok(Self {
            version,
            inputs,
            outputs,
            lock_time,
        })
    }
}

impl Serializable for Transaction {
    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.version.to_le_bytes());

        let _ = write_varint(&mut buf, self.inputs.len() as u64);
        for input in &self.inputs {
            input.write_to(&mut buf);
        }

        let _ = write_varint(&mut buf, self.outputs.len() as u64);
        for output in &self.outputs {
            output.write_to(&mut buf);
        }

        let _ = buf.write_all(&self.lock_time.to_le_bytes());
        buf
    }

    fn deserialize(data: &[u8]) -> Result<Self, CodecError> {
        let mut cursor = Cursor::new(data);
        Self::from_reader(&mut cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spend(prev: &Transaction, vout: u32, value: u64) -> Transaction {
        Transaction::new(
            vec![TxInput::new(prev.txid(), vout, vec![1, 2, 3])],
            vec![TxOutput::new(value, vec![4, 5, 6])],
        )
    }

    #[test]
    fn test_coinbase_ids_differ_by_height() {
        let output = TxOutput::new(50, vec![7]);
        let a = Transaction::coinbase(1, b"", output.clone());
        let b = Transaction::coinbase(2, b"", output);

        assert!(a.is_coinbase());
        assert_ne!(a.txid(), b.txid());
    }

    #[test]
    fn test_coinbase_consumes_nothing() {
        let tx = Transaction::coinbase(1, b"reward", TxOutput::new(50, vec![]));
        assert!(tx.consumed_outpoints().is_empty());
        assert_eq!(tx.produced_outputs().len(), 1);
    }

    #[test]
    fn test_consumed_and_produced_coordinates() {
        let coinbase = Transaction::coinbase(1, b"", TxOutput::new(50, vec![]));
        let tx = spend(&coinbase, 0, 40);

        assert_eq!(tx.consumed_outpoints(), vec![OutPoint::new(coinbase.txid(), 0)]);
        let produced = tx.produced_outputs();
        assert_eq!(produced, vec![UnspentOutput::new(tx.txid(), 0, 40)]);
    }

    #[test]
    fn test_decode_leaves_trailing_bytes() {
        let coinbase = Transaction::coinbase(3, b"x", TxOutput::new(50, vec![9; 25]));
        let mut bytes = coinbase.serialize();
        let len = bytes.len();
        bytes.extend_from_slice(&[0xaa, 0xbb]);

        let mut cursor = Cursor::new(bytes.as_slice());
        let decoded = Transaction::from_reader(&mut cursor).unwrap();
        assert_eq!(decoded, coinbase);
        assert_eq!(cursor.position() as usize, len);
    }

    #[test]
    fn test_outpoint_bytes() {
        let outpoint = OutPoint::new(Hash256::new([1; 32]), 42);
        let bytes = outpoint.to_bytes();
        assert_eq!(bytes.len(), OutPoint::ENCODED_LEN);
        assert_eq!(OutPoint::from_bytes(&bytes).unwrap(), outpoint);
        assert!(OutPoint::from_bytes(&bytes[..35]).is_err());
    }
}
