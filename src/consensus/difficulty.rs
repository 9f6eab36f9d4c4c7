// Proof-of-work target and its compact encoding

use num_bigint::BigUint;
use num_traits::{One, ToPrimitive, Zero};
use std::fmt;
use std::sync::LazyLock;
use thiserror::Error;

use crate::core::Hash256;

/// Compact encoding of [`DifficultyTarget::max`]
pub const MAX_TARGET_BITS: u32 = 0x1d00ffff;

static MAX_TARGET: LazyLock<BigUint> = LazyLock::new(|| BigUint::from(0xffffu32) << 208usize);

/// Number of distinct 256-bit hash values minus one
static MAX_HASHES: LazyLock<BigUint> = LazyLock::new(|| (BigUint::one() << 256usize) - 1u32);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DifficultyError {
    #[error("target must be within [1, max target]")]
    OutOfRange,

    #[error("compact bits {0:#010x} encode a negative coefficient")]
    NegativeCoefficient(u32),
}

/// Proof-of-work acceptance threshold: a block is valid when its hash,
/// read as a big-endian integer, does not exceed the target.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DifficultyTarget {
    value: BigUint,
}

impl DifficultyTarget {
    pub fn new(value: BigUint) -> Result<Self, DifficultyError> {
        if value.is_zero() || value > *MAX_TARGET {
            return Err(DifficultyError::OutOfRange);
        }
        Ok(Self { value })
    }

    /// Easiest permitted target
    pub fn max() -> Self {
        Self {
            value: MAX_TARGET.clone(),
        }
    }

    /// Decode the compact form: one exponent byte followed by a 3-byte
    /// coefficient, `value = coefficient << 8 * (exponent - 3)`
    pub fn from_bits(bits: u32) -> Result<Self, DifficultyError> {
        let exponent = (bits >> 24) as usize;
        let coefficient = bits & 0x00ff_ffff;
        if coefficient & 0x0080_0000 != 0 {
            return Err(DifficultyError::NegativeCoefficient(bits));
        }

        let coefficient = BigUint::from(coefficient);
        let value = if exponent >= 3 {
            coefficient << ((exponent - 3) * 8)
        } else {
            coefficient >> ((3 - exponent) * 8)
        };
        Self::new(value)
    }

    /// Encode into compact form. The coefficient keeps the three most
    /// significant bytes of the minimal signed big-endian representation.
    pub fn to_bits(&self) -> u32 {
        let mut bytes = self.value.to_bytes_be();
        if bytes[0] & 0x80 != 0 {
            bytes.insert(0, 0);
        }

        let exponent = bytes.len() as u32;
        let mut coefficient = [0u8; 3];
        if bytes.len() < 3 {
            coefficient[3 - bytes.len()..].copy_from_slice(&bytes);
        } else {
            coefficient.copy_from_slice(&bytes[..3]);
        }

        (exponent << 24)
            | (coefficient[0] as u32) << 16
            | (coefficient[1] as u32) << 8
            | coefficient[2] as u32
    }

    pub fn value(&self) -> &BigUint {
        &self.value
    }

    /// Whether `hash` satisfies this target
    pub fn is_met_by(&self, hash: &Hash256) -> bool {
        BigUint::from_bytes_be(hash.as_bytes()) <= self.value
    }

    /// Expected effort to find a block at this target, as
    /// `log2(MAX_HASHES / (target + 1))` rounded to three decimals
    pub fn work(&self) -> f64 {
        let expected_hashes = &*MAX_HASHES / (&self.value + 1u32);
        round_work(log2(&expected_hashes))
    }
}

impl fmt::Display for DifficultyTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:064x}", self.value)
    }
}

fn log2(value: &BigUint) -> f64 {
    value.to_f64().unwrap_or(f64::MAX).ln() / std::f64::consts::LN_2
}

/// Round half up to three decimal places
pub fn round_work(work: f64) -> f64 {
    (work * 1000.0 + 0.5).floor() / 1000.0
}
