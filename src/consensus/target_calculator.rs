// Periodic difficulty retargeting

use num_bigint::BigUint;
use std::sync::Arc;

use super::difficulty::DifficultyTarget;
use crate::chain::ChainError;
use crate::core::BlockHeader;

/// Blocks between two retargets
pub const RETARGET_INTERVAL: u32 = 2016;

/// Desired seconds between blocks
pub const TARGET_BLOCK_SPACING_SECS: i64 = 600;

const IDEAL_RETARGET_SPAN_SECS: i64 = TARGET_BLOCK_SPACING_SECS * RETARGET_INTERVAL as i64;

const MIN_ADJUSTMENT: f64 = 0.25;
const MAX_ADJUSTMENT: f64 = 4.0;

/// Read access to the active branch, enough to recompute the target
pub trait ActiveChain {
    fn height(&self) -> u32;

    fn active_header_at(&self, height: u32) -> Result<BlockHeader, ChainError>;
}

pub struct TargetCalculator {
    chain: Arc<dyn ActiveChain + Send + Sync>,
}

impl TargetCalculator {
    pub fn new(chain: Arc<dyn ActiveChain + Send + Sync>) -> Self {
        Self { chain }
    }

    /// Target for the next block on the active branch.
    ///
    /// Below the first retarget height this is the maximum target. After that
    /// the target set by the last retarget block is scaled by how far the
    /// previous interval's timespan strayed from the ideal, within [1/4, 4].
    pub fn calculate_target(&self) -> Result<DifficultyTarget, ChainError> {
        let height = self.chain.height();
        if height < RETARGET_INTERVAL {
            return Ok(DifficultyTarget::max());
        }

        let last_height = height / RETARGET_INTERVAL * RETARGET_INTERVAL;
        let first_height = last_height - RETARGET_INTERVAL;
        let first = self.chain.active_header_at(first_height)?;
        let last = self.chain.active_header_at(last_height)?;

        let span = last.timestamp as i64 - first.timestamp as i64;
        let ratio = (span as f64 / IDEAL_RETARGET_SPAN_SECS as f64).clamp(MIN_ADJUSTMENT, MAX_ADJUSTMENT);

        let current = DifficultyTarget::from_bits(last.bits)?;
        let scaled = scale(current.value(), ratio);

        if scaled > *DifficultyTarget::max().value() {
            return Ok(DifficultyTarget::max());
        }

        log::debug!(
            "Retarget at height {}: span {}s, ratio {}",
            last_height,
            span,
            ratio
        );

        Ok(DifficultyTarget::new(truncate_target(scaled))?)
    }
}

/// Multiply by the exact decimal rendering of `ratio`, truncating the result
fn scale(value: &BigUint, ratio: f64) -> BigUint {
    let rendered = ratio.to_string();
    let (integer, fraction) = rendered.split_once('.').unwrap_or((rendered.as_str(), ""));
    let digits = format!("{integer}{fraction}");

    match BigUint::parse_bytes(digits.as_bytes(), 10) {
        Some(numerator) => {
            let denominator = BigUint::from(10u32).pow(fraction.len() as u32);
            value * numerator / denominator
        }
        None => value.clone(),
    }
}

/// Zero every byte below the three most significant ones, matching the
/// precision of the compact encoding
fn truncate_target(target: BigUint) -> BigUint {
    let mut hex_len = target.to_str_radix(16).len();
    if hex_len % 2 != 0 {
        hex_len += 1;
    }
    if hex_len <= 6 {
        return target;
    }
    let shift = (hex_len - 6) / 2 * 8;
    (target >> shift) << shift
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Hash256;

    struct FixedChain {
        headers: Vec<BlockHeader>,
    }

    impl FixedChain {
        /// `height + 1` headers; the retarget block at 2016 lands `span`
        /// seconds after the one at 0
        fn new(height: u32, bits: u32, span: u32) -> Arc<Self> {
            let headers = (0..=height)
                .map(|h| {
                    let timestamp = if h >= RETARGET_INTERVAL { 1_000 + span } else { 1_000 };
                    BlockHeader::new(1, Hash256::zero(), Hash256::zero(), timestamp, bits, h)
                })
                .collect();
            Arc::new(Self { headers })
        }
    }

    impl ActiveChain for FixedChain {
        fn height(&self) -> u32 {
            self.headers.len() as u32 - 1
        }

        fn active_header_at(&self, height: u32) -> Result<BlockHeader, ChainError> {
            self.headers
                .get(height as usize)
                .cloned()
                .ok_or(ChainError::HeightOutOfRange(height))
        }
    }

    fn calculate(height: u32, bits: u32, span: u32) -> DifficultyTarget {
        TargetCalculator::new(FixedChain::new(height, bits, span))
            .calculate_target()
            .unwrap()
    }

    const IDEAL: u32 = IDEAL_RETARGET_SPAN_SECS as u32;

    #[test]
    fn test_max_target_before_first_retarget() {
        assert_eq!(calculate(0, 0x1d00ffff, 0), DifficultyTarget::max());
        assert_eq!(calculate(2015, 0x1d00ffff, 0), DifficultyTarget::max());
    }

    #[test]
    fn test_fast_interval_halves_target() {
        let target = calculate(RETARGET_INTERVAL, 0x1d00ffff, IDEAL / 2);
        assert_eq!(target.to_bits(), 0x1c7fff80);
    }

    #[test]
    fn test_adjustment_is_clamped() {
        // Ten times too slow: clamped to 4x, then capped at the maximum
        assert_eq!(calculate(RETARGET_INTERVAL, 0x1d00ffff, IDEAL * 10), DifficultyTarget::max());

        // Near-instant interval: clamped to 1/4
        let target = calculate(RETARGET_INTERVAL, 0x1d00ffff, 1);
        assert_eq!(target.to_bits(), 0x1c3fffc0);
    }

    #[test]
    fn test_result_within_bounds_of_previous() {
        let previous = DifficultyTarget::from_bits(0x1c7fff80).unwrap();
        for span in [1, IDEAL / 3, IDEAL, IDEAL * 2, IDEAL * 7] {
            let target = calculate(RETARGET_INTERVAL + 5, 0x1c7fff80, span);
            let value = target.value();
            assert!(*value >= previous.value() / 4u32);
            assert!(value <= DifficultyTarget::max().value());
            assert!(*value <= previous.value() * 4u32);
        }
    }

    #[test]
    fn test_truncation_keeps_three_significant_bytes() {
        let target = calculate(RETARGET_INTERVAL, 0x1c7fff80, IDEAL / 3);
        let value = target.value().clone();
        let shift = value.bits() as usize - 24;
        assert_eq!((value.clone() >> shift) << shift, value);
        assert_eq!(DifficultyTarget::from_bits(target.to_bits()).unwrap(), target);
    }

    #[test]
    fn test_scale_uses_decimal_rendering() {
        let value = BigUint::from(1_000_000u32);
        assert_eq!(scale(&value, 0.25), BigUint::from(250_000u32));
        assert_eq!(scale(&value, 4.0), BigUint::from(4_000_000u32));
        assert_eq!(scale(&value, 0.3333), BigUint::from(333_300u32));
    }

    #[test]
    fn test_truncate_small_values_untouched() {
        assert_eq!(truncate_target(BigUint::from(0xabcdefu32)), BigUint::from(0xabcdefu32));
        assert_eq!(truncate_target(BigUint::from(0x1abcdefu32)), BigUint::from(0x1abcd00u32));
    }
}
