// Proof of Work puzzle solving

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use super::difficulty::DifficultyTarget;
use crate::core::{BlockHeader, Hash256};

/// Searches header nonces until the hash meets the target.
///
/// The search is cooperative: the stop flag is polled before every attempt,
/// so a solver can be abandoned from another thread through [`StopHandle`].
pub struct PuzzleSolver {
    stop: Arc<AtomicBool>,
}

/// Cancels the solver it was taken from
#[derive(Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    Solved,
    /// Stop was requested before a solution turned up
    Stopped,
    /// Every nonce was tried
    Exhausted,
}

#[derive(Debug)]
pub struct MiningResult {
    pub status: SolveStatus,
    pub nonce: u32,
    pub hash: Hash256,
    pub attempts: u64,
    pub duration: Duration,
}

impl MiningResult {
    pub fn is_solved(&self) -> bool {
        self.status == SolveStatus::Solved
    }

    /// Hashes per second
    pub fn hash_rate(&self) -> f64 {
        self.attempts as f64 / self.duration.as_secs_f64().max(f64::EPSILON)
    }
}

impl PuzzleSolver {
    pub fn new() -> Self {
        Self {
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.stop.clone())
    }

    /// Set `header.bits` from `target` and search for a nonce
    pub fn solve(&self, header: &mut BlockHeader, target: &DifficultyTarget) -> MiningResult {
        header.bits = target.to_bits();
        self.solve_below(header, &target_bytes(target))
    }

    fn solve_below(&self, header: &mut BlockHeader, target_bytes: &[u8; 32]) -> MiningResult {
        let start_time = Instant::now();
        let mut attempts = 0u64;

        for nonce in 0..=u32::MAX {
            if self.stop.load(Ordering::Relaxed) {
                return MiningResult {
                    status: SolveStatus::Stopped,
                    nonce,
                    hash: Hash256::zero(),
                    attempts,
                    duration: start_time.elapsed(),
                };
            }

            header.nonce = nonce;
            let hash = header.hash();
            attempts += 1;

            if hash.as_bytes() <= target_bytes {
                return MiningResult {
                    status: SolveStatus::Solved,
                    nonce,
                    hash,
                    attempts,
                    duration: start_time.elapsed(),
                };
            }

            if attempts % 100_000 == 0 {
                let elapsed = start_time.elapsed();
                log::debug!(
                    "Mining attempts: {} ({:.1} KH/s)",
                    attempts,
                    attempts as f64 / elapsed.as_secs_f64() / 1000.0
                );
            }
        }

        MiningResult {
            status: SolveStatus::Exhausted,
            nonce: 0,
            hash: Hash256::zero(),
            attempts,
            duration: start_time.elapsed(),
        }
    }
}

impl Default for PuzzleSolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether the header's hash meets the target its own bits encode
pub fn meets_target(header: &BlockHeader) -> bool {
    DifficultyTarget::from_bits(header.bits)
        .map(|target| target.is_met_by(&header.hash()))
        .unwrap_or(false)
}

/// Target as 32 big-endian bytes, comparable directly against hash bytes
fn target_bytes(target: &DifficultyTarget) -> [u8; 32] {
    let bytes = target.value().to_bytes_be();
    let mut padded = [0u8; 32];
    padded[32 - bytes.len()..].copy_from_slice(&bytes);
    padded
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> BlockHeader {
        BlockHeader::new(1, Hash256::zero(), Hash256::zero(), 1234567890, 0, 0)
    }

    /// Roughly one in 256 hashes qualify
    fn easy_threshold() -> [u8; 32] {
        let mut threshold = [0xff; 32];
        threshold[0] = 0;
        threshold
    }

    #[test]
    fn test_target_bytes_match_value() {
        let bytes = target_bytes(&DifficultyTarget::max());
        assert_eq!(&bytes[..4], &[0, 0, 0, 0]);
        assert_eq!(&bytes[4..6], &[0xff, 0xff]);
        assert!(bytes[6..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_solve_easy_threshold() {
        let solver = PuzzleSolver::new();
        let mut header = header();

        let result = solver.solve_below(&mut header, &easy_threshold());
        assert!(result.is_solved());
        assert_eq!(header.nonce, result.nonce);
        assert_eq!(header.hash(), result.hash);
        assert_eq!(result.hash.as_bytes()[0], 0);
        assert_eq!(result.attempts, result.nonce as u64 + 1);
    }

    #[test]
    fn test_solve_sets_bits() {
        let solver = PuzzleSolver::new();
        solver.stop_handle().stop();
        let mut header = header();

        solver.solve(&mut header, &DifficultyTarget::max());
        assert_eq!(header.bits, 0x1d00ffff);
    }

    #[test]
    fn test_stopped_solver_returns_immediately() {
        let solver = PuzzleSolver::new();
        let handle = solver.stop_handle();
        handle.stop();
        assert!(handle.is_stopped());

        let result = solver.solve(&mut header(), &DifficultyTarget::max());
        assert_eq!(result.status, SolveStatus::Stopped);
        assert_eq!(result.attempts, 0);
    }

    #[test]
    fn test_meets_target_rejects_bad_bits() {
        let mut header = header();
        header.bits = 0x1d800000;
        assert!(!meets_target(&header));
    }
}
