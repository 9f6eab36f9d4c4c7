// Catching up with the blocks known to the network

use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::{Chain, ChainBlock, SyncError};
use crate::config::SyncConfig;
use crate::core::{Block, Hash256};
use crate::network::{NetworkInterface, NodeAvailabilitySubscriber};

#[derive(Debug, Clone, PartialEq, Eq)]
enum DownloadTarget {
    Height(u32),
    Hash(Hash256),
}

/// One pending download.
///
/// `next` points at a request whose block could not be added yet because
/// this request's block is its missing predecessor.
#[derive(Debug, Clone)]
struct DownloadRequest {
    height: i64,
    target: DownloadTarget,
    next: Option<Box<DownloadRequest>>,
    downloaded: Vec<Block>,
    failures: u32,
    sequence: u64,
}

impl PartialEq for DownloadRequest {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for DownloadRequest {}

impl PartialOrd for DownloadRequest {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

// BinaryHeap pops the greatest element, so lower heights order higher
impl Ord for DownloadRequest {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .height
            .cmp(&self.height)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Clears the busy flag when a synchronization ends, however it ends
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Timer task for the next synchronization
struct ScheduledRun {
    id: u64,
    handle: JoinHandle<()>,
}

/// Downloads missing blocks and feeds them to the chain.
///
/// One synchronization runs at a time; starting another while one is in
/// progress fails with [`SyncError::Busy`]. The chain's own instance is
/// `always_running`: it schedules the next check after every run and retries
/// when peers become available again. At most one scheduled run is pending;
/// scheduling another replaces it, and a synchronization started on peer
/// availability cancels it. Short-lived instances recover the ancestors of a
/// single block.
pub struct ChainSynchronizer {
    chain: Weak<Chain>,
    network: Arc<dyn NetworkInterface>,
    config: SyncConfig,
    always_running: bool,
    busy: AtomicBool,
    /// Set when a run failed for lack of peers
    needs_update: AtomicBool,
    queue: Mutex<BinaryHeap<DownloadRequest>>,
    sequence: AtomicU64,
    scheduled: Mutex<Option<ScheduledRun>>,
    me: Weak<ChainSynchronizer>,
}

impl ChainSynchronizer {
    pub fn new(
        chain: Weak<Chain>,
        network: Arc<dyn NetworkInterface>,
        config: SyncConfig,
        always_running: bool,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            chain,
            network,
            config,
            always_running,
            busy: AtomicBool::new(false),
            needs_update: AtomicBool::new(false),
            queue: Mutex::new(BinaryHeap::new()),
            sequence: AtomicU64::new(0),
            scheduled: Mutex::new(None),
            me: me.clone(),
        })
    }

    /// Register for peer availability notifications
    pub fn start(&self) {
        let subscriber: Weak<dyn NodeAvailabilitySubscriber> = self.me.clone();
        self.network
            .subscribe_node_availability(subscriber, self.config.min_nodes);
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// A scheduled synchronization is waiting for its delay to pass
    pub fn has_scheduled_run(&self) -> bool {
        self.scheduled
            .lock()
            .as_ref()
            .is_some_and(|run| !run.handle.is_finished())
    }

    /// Waiting for enough peers to retry
    pub fn needs_update(&self) -> bool {
        self.needs_update.load(Ordering::SeqCst)
    }

    /// Download every block above the local height up to the highest height
    /// reported by the network
    pub async fn synch_chain_with_network(&self) -> Result<(), SyncError> {
        let busy = self.acquire()?;
        let result = self.run().await;
        drop(busy);
        self.finish(&result);
        result
    }

    /// Download the predecessors of `block` that are missing, then add the
    /// block itself. A header-only block is downloaded in full first.
    pub async fn synch_block_and_previous(&self, block: ChainBlock) -> Result<(), SyncError> {
        let busy = self.acquire()?;

        let request = match block {
            ChainBlock::HeaderOnly(header) => {
                self.request(-1, DownloadTarget::Hash(header.hash()), None, Vec::new())
            }
            ChainBlock::Full(block) => {
                let deferred =
                    self.request(-1, DownloadTarget::Hash(block.hash()), None, vec![(*block).clone()]);
                self.request(
                    -1,
                    DownloadTarget::Hash(block.prev_hash()),
                    Some(deferred),
                    Vec::new(),
                )
            }
        };
        self.queue.lock().push(request);

        let result = self.run().await;
        drop(busy);
        self.finish(&result);
        result
    }

    fn acquire(&self) -> Result<BusyGuard<'_>, SyncError> {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| SyncError::Busy)?;
        Ok(BusyGuard(&self.busy))
    }

    fn request(
        &self,
        height: i64,
        target: DownloadTarget,
        next: Option<DownloadRequest>,
        downloaded: Vec<Block>,
    ) -> DownloadRequest {
        DownloadRequest {
            height,
            target,
            next: next.map(Box::new),
            downloaded,
            failures: 0,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn chain(&self) -> Result<Arc<Chain>, SyncError> {
        self.chain.upgrade().ok_or(SyncError::ChainUnavailable)
    }

    /// Drain the queue, then compare heights with the network again, until
    /// the local chain is as high as the network's
    async fn run(&self) -> Result<(), SyncError> {
        let mut last_compared: Option<u32> = None;
        loop {
            loop {
                let next = self.queue.lock().pop();
                match next {
                    Some(request) => self.process_request(request).await?,
                    None => break,
                }
            }

            let network_height = self.network_height().await?;
            let local_height = self.chain()?.height();
            if local_height >= network_height {
                log::info!("Chain synchronized at height {}", local_height);
                return Ok(());
            }
            if last_compared == Some(local_height) {
                log::warn!(
                    "No progress towards network height {} from {}",
                    network_height,
                    local_height
                );
                return Err(SyncError::Stalled {
                    local: local_height,
                    network: network_height,
                });
            }
            last_compared = Some(local_height);

            log::info!(
                "Downloading blocks {} to {}",
                local_height + 1,
                network_height
            );
            let requests: Vec<_> = (local_height + 1..=network_height)
                .map(|height| {
                    self.request(height as i64, DownloadTarget::Height(height), None, Vec::new())
                })
                .collect();
            self.queue.lock().extend(requests);
        }
    }

    async fn network_height(&self) -> Result<u32, SyncError> {
        let response = self
            .network
            .get_chain_height(self.config.preferred_height_respondents, self.config.min_nodes)
            .await
            .map_err(|err| {
                self.needs_update.store(true, Ordering::SeqCst);
                log::info!("Could not get the network height: {}", err);
                SyncError::InsufficientPeers(err)
            })?;

        response.values.iter().max().copied().ok_or_else(|| {
            log::info!("Could not get the network height: no replies");
            SyncError::NoReplies
        })
    }

    async fn process_request(&self, mut request: DownloadRequest) -> Result<(), SyncError> {
        match self.download(&request).await {
            Ok(blocks) => {
                request.downloaded = blocks;
                self.add_blocks_to_chain(request)
            }
            Err(err) => {
                request.failures += 1;
                let insufficient_peers = matches!(err, SyncError::InsufficientPeers(_));
                if insufficient_peers {
                    self.needs_update.store(true, Ordering::SeqCst);
                }
                if insufficient_peers || request.failures >= self.config.max_allowed_failures {
                    log::warn!("Giving up on {:?}: {}", request.target, err);
                    return Err(err);
                }
                log::debug!(
                    "Download of {:?} failed ({} of {}): {}",
                    request.target,
                    request.failures,
                    self.config.max_allowed_failures,
                    err
                );
                self.queue.lock().push(request);
                Ok(())
            }
        }
    }

    async fn download(&self, request: &DownloadRequest) -> Result<Vec<Block>, SyncError> {
        let preferred = self.config.preferred_block_respondents;
        let min = self.config.min_block_respondents;
        match &request.target {
            DownloadTarget::Height(height) => {
                let response = self.network.get_blocks(*height, preferred, min).await?;
                match response.values.into_iter().next() {
                    Some(blocks) if !blocks.is_empty() => Ok(blocks),
                    _ => Err(SyncError::NoReplies),
                }
            }
            DownloadTarget::Hash(hash) => {
                let response = self.network.get_block(hash, preferred, min).await?;
                response
                    .values
                    .into_iter()
                    .next()
                    .map(|block| vec![block])
                    .ok_or(SyncError::NoReplies)
            }
        }
    }

    /// Add downloaded blocks whose predecessor is known, then the requests
    /// that were waiting on them. A block with an unknown predecessor is put
    /// back behind a download of that predecessor.
    fn add_blocks_to_chain(&self, request: DownloadRequest) -> Result<(), SyncError> {
        let chain = self.chain()?;
        let mut pending = vec![request];

        while let Some(mut request) = pending.pop() {
            let next = request.next.take();
            for block in std::mem::take(&mut request.downloaded) {
                let prev_hash = block.prev_hash();
                if chain.is_block_known(&prev_hash)? {
                    self.append(&chain, block)?;
                    if let Some(next) = &next {
                        pending.push((**next).clone());
                    }
                } else {
                    log::debug!(
                        "Predecessor {} of block {} is missing",
                        prev_hash.short(),
                        block.hash().short()
                    );
                    let deferred = DownloadRequest {
                        height: request.height,
                        target: request.target.clone(),
                        next: next.clone(),
                        downloaded: vec![block],
                        failures: 0,
                        sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
                    };
                    let predecessor = self.request(
                        request.height - 1,
                        DownloadTarget::Hash(prev_hash),
                        Some(deferred),
                        Vec::new(),
                    );
                    self.queue.lock().push(predecessor);
                }
            }
        }
        Ok(())
    }

    fn append(&self, chain: &Chain, block: Block) -> Result<(), SyncError> {
        let hash = block.hash();
        match chain.append_block(Arc::new(block), false) {
            Ok(_) => Ok(()),
            Err(err) if err.is_invalid_block() => {
                log::warn!("Skipping downloaded block {}: {}", hash.short(), err);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn finish(&self, result: &Result<(), SyncError>) {
        self.queue.lock().clear();
        match result {
            Ok(()) => self.schedule(self.config.resync_interval()),
            Err(err) => {
                log::warn!("Chain synchronization failed: {}", err);
                self.schedule(self.config.delay_after_failure());
            }
        }
    }

    /// Run a synchronization after `delay`, or push it back by the busy delay
    /// if one is still running then. Replaces the pending scheduled run.
    /// Only the always-running instance schedules.
    fn schedule(&self, delay: Duration) {
        if !self.always_running {
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            log::debug!("No runtime, next synchronization not scheduled");
            return;
        };
        let id = self.sequence.fetch_add(1, Ordering::Relaxed);
        let me = self.me.clone();
        let mut scheduled = self.scheduled.lock();
        let task = handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(synchronizer) = me.upgrade() else {
                return;
            };
            if synchronizer.take_scheduled(id) {
                synchronizer.run_scheduled().await;
            }
        });
        log::debug!("Next synchronization in {:?}", delay);
        if let Some(previous) = scheduled.replace(ScheduledRun { id, handle: task }) {
            previous.handle.abort();
        }
    }

    /// Clear the pending run if it is still `id`; false once superseded
    fn take_scheduled(&self, id: u64) -> bool {
        let mut scheduled = self.scheduled.lock();
        if scheduled.as_ref().is_some_and(|run| run.id == id) {
            *scheduled = None;
            true
        } else {
            false
        }
    }

    fn cancel_scheduled(&self) {
        if let Some(run) = self.scheduled.lock().take() {
            run.handle.abort();
        }
    }

    async fn run_scheduled(&self) {
        if self.is_busy() {
            self.schedule(self.config.delay_if_busy());
        } else {
            // failures are logged and rescheduled by the run itself
            let _ = self.synch_chain_with_network().await;
        }
    }
}

impl Drop for ChainSynchronizer {
    fn drop(&mut self) {
        self.cancel_scheduled();
    }
}

impl NodeAvailabilitySubscriber for ChainSynchronizer {
    fn on_nodes_available(&self) {
        if !self.needs_update.swap(false, Ordering::SeqCst) {
            return;
        }
        if self.is_busy() {
            self.schedule(self.config.delay_if_busy());
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            log::debug!("No runtime, synchronization on availability skipped");
            return;
        };
        // the run schedules its own follow-up
        self.cancel_scheduled();
        let me = self.me.clone();
        handle.spawn(async move {
            if let Some(synchronizer) = me.upgrade() {
                let _ = synchronizer.synch_chain_with_network().await;
            }
        });
    }
}
