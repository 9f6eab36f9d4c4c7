// Peer network contract used by the chain

use async_trait::async_trait;
use std::sync::Weak;
use thiserror::Error;

use crate::core::{Block, Hash256};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    /// Fewer reachable peers than the requested minimum; nothing was sent
    #[error("not enough peers: {available} available, {required} required")]
    InsufficientPeers { available: usize, required: usize },
}

/// Values gathered from the peers that answered a request
#[derive(Debug, Clone, PartialEq)]
pub struct GetResponse<T> {
    pub values: Vec<T>,
    pub respondents: usize,
}

impl<T> GetResponse<T> {
    pub fn new(values: Vec<T>, respondents: usize) -> Self {
        Self { values, respondents }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), 0)
    }

    /// Every preferred peer answered
    pub fn is_fully_successful(&self, preferred: usize) -> bool {
        self.respondents == preferred
    }

    /// Peers were reached but none returned data
    pub fn has_no_replies(&self) -> bool {
        self.values.is_empty()
    }
}

/// Notified when enough peers become reachable again
pub trait NodeAvailabilitySubscriber: Send + Sync {
    fn on_nodes_available(&self);
}

/// Requests fan out to up to `preferred` peers and are rejected up front
/// when fewer than `min` peers are reachable.
#[async_trait]
pub trait NetworkInterface: Send + Sync {
    async fn get_chain_height(
        &self,
        preferred: usize,
        min: usize,
    ) -> Result<GetResponse<u32>, NetworkError>;

    async fn get_block(
        &self,
        hash: &Hash256,
        preferred: usize,
        min: usize,
    ) -> Result<GetResponse<Block>, NetworkError>;

    /// Each value is one peer's list of blocks at `height`
    async fn get_blocks(
        &self,
        height: u32,
        preferred: usize,
        min: usize,
    ) -> Result<GetResponse<Vec<Block>>, NetworkError>;

    async fn relay_block(&self, block: &Block);

    fn subscribe_node_availability(
        &self,
        subscriber: Weak<dyn NodeAvailabilitySubscriber>,
        min_nodes: usize,
    );
}

/// Network with no peers, for a node running on local storage only
#[derive(Debug, Default)]
pub struct OfflineNetwork;

impl OfflineNetwork {
    fn reject(min: usize) -> NetworkError {
        NetworkError::InsufficientPeers {
            available: 0,
            required: min,
        }
    }
}

#[async_trait]
impl NetworkInterface for OfflineNetwork {
    async fn get_chain_height(
        &self,
        _preferred: usize,
        min: usize,
    ) -> Result<GetResponse<u32>, NetworkError> {
        Err(Self::reject(min))
    }

    async fn get_block(
        &self,
        _hash: &Hash256,
        _preferred: usize,
        min: usize,
    ) -> Result<GetResponse<Block>, NetworkError> {
        Err(Self::reject(min))
    }

    async fn get_blocks(
        &self,
        _height: u32,
        _preferred: usize,
        min: usize,
    ) -> Result<GetResponse<Vec<Block>>, NetworkError> {
        Err(Self::reject(min))
    }

    async fn relay_block(&self, block: &Block) {
        log::debug!("Offline, not relaying block {}", block.hash().short());
    }

    fn subscribe_node_availability(
        &self,
        _subscriber: Weak<dyn NodeAvailabilitySubscriber>,
        _min_nodes: usize,
    ) {
        // no peers ever become available
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_success() {
        let response = GetResponse::new(vec![5u32, 7], 2);
        assert!(response.is_fully_successful(2));
        assert!(!response.is_fully_successful(10));
        assert!(!response.has_no_replies());
        assert!(GetResponse::<u32>::empty().has_no_replies());
    }

    #[tokio::test]
    async fn test_offline_rejects_requests() {
        let network = OfflineNetwork;
        let err = network.get_chain_height(10, 1).await.unwrap_err();
        assert_eq!(
            err,
            NetworkError::InsufficientPeers {
                available: 0,
                required: 1
            }
        );
        assert!(network.get_blocks(1, 1, 1).await.is_err());
    }
}
