// Notifications published by the chain

use std::sync::Arc;

use crate::core::{Block, UnspentOutput};

pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct BlockAddedEvent {
    pub block: Arc<Block>,
    pub height: u32,
    pub chain_work: f64,
    /// The block became the head of the active branch
    pub is_active_tip: bool,
    pub mined_locally: bool,
}

/// Net change of the UTXO set caused by one chain update
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputsUpdated {
    pub added: Vec<UnspentOutput>,
    pub deleted: Vec<UnspentOutput>,
}

impl OutputsUpdated {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.deleted.is_empty()
    }
}
