// Content hashes for blocks and transactions

use sha2::{Digest, Sha256};
use std::fmt;

use super::CodecError;

/// 256-bit content hash.
///
/// Block hashes and transaction ids are both `Hash256`. Bytes are kept in the
/// order SHA256 produced them; proof-of-work compares them big-endian as stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    pub const LEN: usize = 32;

    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Build a hash from a slice that must be exactly 32 bytes long
    pub fn from_slice(slice: &[u8]) -> Result<Self, CodecError> {
        let bytes: [u8; 32] = slice.try_into().map_err(|_| CodecError::InvalidLength {
            what: "hash",
            expected: Self::LEN,
            got: slice.len(),
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// All-zero hash; the genesis block links to it as its predecessor
    pub fn zero() -> Self {
        Self([0u8; 32])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Hex in display order (byte-reversed)
    pub fn to_hex(&self) -> String {
        let mut reversed = self.0;
        reversed.reverse();
        hex::encode(reversed)
    }

    /// Parse the display-order hex produced by [`Hash256::to_hex`]
    pub fn from_hex(hex_str: &str) -> Result<Self, CodecError> {
        let bytes = hex::decode(hex_str).map_err(|e| CodecError::InvalidHex(e.to_string()))?;
        let mut hash = Self::from_slice(&bytes)?;
        hash.0.reverse();
        Ok(hash)
    }

    /// First 8 hex chars, for log lines
    pub fn short(&self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(8);
        hex
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// SHA256(SHA256(data))
pub fn hash256(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    Hash256(second.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_uses_display_order() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xab;
        bytes[31] = 0x01;
        let hash = Hash256::new(bytes);

        let hex = hash.to_hex();
        assert!(hex.starts_with("01"));
        assert!(hex.ends_with("ab"));
        assert_eq!(Hash256::from_hex(&hex).unwrap(), hash);
    }

    #[test]
    fn test_from_slice_rejects_wrong_length() {
        assert!(Hash256::from_slice(&[0u8; 31]).is_err());
        assert!(Hash256::from_slice(&[0u8; 32]).is_ok());
    }

    #[test]
    fn test_zero() {
        assert!(Hash256::zero().is_zero());
        assert!(!hash256(b"").is_zero());
    }

    #[test]
    fn test_hash256_is_deterministic() {
        assert_eq!(hash256(b"hello world"), hash256(b"hello world"));
        assert_ne!(hash256(b"hello world"), hash256(b"hello world!"));
    }
}
