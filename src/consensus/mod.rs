// Consensus rules: difficulty, retargeting and proof of work

pub mod difficulty;
pub mod miner;
pub mod pow;
pub mod target_calculator;

pub use difficulty::{DifficultyError, DifficultyTarget, MAX_TARGET_BITS, round_work};
pub use miner::{COIN, Miner, MinerError, block_subsidy};
pub use pow::{MiningResult, PuzzleSolver, SolveStatus, StopHandle, meets_target};
pub use target_calculator::{ActiveChain, RETARGET_INTERVAL, TargetCalculator};
