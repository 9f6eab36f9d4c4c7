use thiserror::Error;

use crate::consensus::DifficultyError;
use crate::core::Hash256;
use crate::network::NetworkError;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("predecessor {0} of the block is unknown")]
    UnknownPredecessor(Hash256),

    #[error("height {0} is above the chain height")]
    HeightOutOfRange(u32),

    #[error("too many blocks requested, only {available} available")]
    TooManyBlocksRequested { available: u32 },

    #[error("block count must be at least 1")]
    InvalidCount,

    #[error("invalid difficulty: {0}")]
    InvalidDifficulty(#[from] DifficultyError),

    #[error("transaction {0} not found")]
    MissingTransaction(Hash256),

    #[error("branches share no ancestor in the loaded window")]
    NoCommonAncestor,

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("synchronization failed: {0}")]
    Sync(#[from] SyncError),
}

impl ChainError {
    /// The block itself is malformed, as opposed to local state failing
    pub fn is_invalid_block(&self) -> bool {
        matches!(self, ChainError::InvalidDifficulty(_))
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("a synchronization is already running")]
    Busy,

    #[error("peers returned no data")]
    NoReplies,

    #[error(transparent)]
    InsufficientPeers(#[from] NetworkError),

    #[error("no progress towards network height {network}, still at {local}")]
    Stalled { local: u32, network: u32 },

    #[error("chain is no longer available")]
    ChainUnavailable,

    #[error("could not add downloaded block: {0}")]
    Chain(#[source] Box<ChainError>),
}

impl From<ChainError> for SyncError {
    fn from(err: ChainError) -> Self {
        SyncError::Chain(Box::new(err))
    }
}
