// Block tree, branch selection and catch-up with the network

#[allow(clippy::module_inception)]
mod chain;
mod error;
mod events;
mod item;
mod maintainer;
mod synchronizer;

pub use chain::Chain;
pub use error::{ChainError, SyncError};
pub use events::{BlockAddedEvent, OutputsUpdated};
pub use item::{ChainBlock, ChainItem, block_work};
pub use maintainer::{
    BranchLookup, ChainTransactionsMaintainer, MaintenancePlan, find_oldest_non_shared_parents,
};
pub use synchronizer::ChainSynchronizer;
