// Keeps the transaction pool, confirmed transactions and the UTXO set in
// step with the active branch

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;

use super::events::{EVENT_CHANNEL_CAPACITY, OutputsUpdated};
use super::{ChainError, ChainItem};
use crate::core::{Block, Hash256, OutPoint, Transaction, UnspentOutput};
use crate::mempool::TransactionPool;
use crate::storage::{TransactionStore, UtxoStore};

/// Access to the blocks of the branches being reconciled
pub trait BranchLookup {
    /// Item for `hash`, with or without its transactions
    fn find(&self, hash: &Hash256) -> Result<Option<ChainItem>, ChainError>;

    /// The full block behind `item`, loading transactions if they were dropped
    fn ensure_loaded(&self, item: &ChainItem) -> Result<Arc<Block>, ChainError>;
}

/// Writes needed to bring the stores in line with a new active branch.
///
/// Computing a plan only reads; every write happens in
/// [`ChainTransactionsMaintainer::apply`].
#[derive(Debug, Default)]
pub struct MaintenancePlan {
    /// Transactions leaving the active branch that go back to the pool
    returned_to_pool: Vec<Transaction>,
    unconfirmed: Vec<Transaction>,
    confirmed: Vec<Transaction>,
    outputs: OutputsUpdated,
}

impl MaintenancePlan {
    pub fn outputs(&self) -> &OutputsUpdated {
        &self.outputs
    }
}

pub struct ChainTransactionsMaintainer {
    pool: Arc<dyn TransactionPool>,
    transactions: Arc<dyn TransactionStore>,
    utxos: Arc<dyn UtxoStore>,
    outputs_tx: broadcast::Sender<OutputsUpdated>,
}

impl ChainTransactionsMaintainer {
    pub fn new(
        pool: Arc<dyn TransactionPool>,
        transactions: Arc<dyn TransactionStore>,
        utxos: Arc<dyn UtxoStore>,
    ) -> Self {
        let (outputs_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            pool,
            transactions,
            utxos,
            outputs_tx,
        }
    }

    pub fn subscribe_outputs(&self) -> broadcast::Receiver<OutputsUpdated> {
        self.outputs_tx.subscribe()
    }

    pub fn maintain_after_adding_block_to_active_branch(
        &self,
        block: &Block,
    ) -> Result<OutputsUpdated, ChainError> {
        let plan = self.plan_block_added(block)?;
        self.apply(plan)
    }

    pub fn maintain_after_switching_branches(
        &self,
        lookup: &dyn BranchLookup,
        old_tip: &ChainItem,
        new_tip: &ChainItem,
    ) -> Result<OutputsUpdated, ChainError> {
        let plan = self.plan_branch_switch(lookup, old_tip, new_tip)?;
        self.apply(plan)
    }

    /// The block's transactions become confirmed: their consumed outputs are
    /// spent and their produced outputs become unspent
    pub fn plan_block_added(&self, block: &Block) -> Result<MaintenancePlan, ChainError> {
        let known = index_by_txid(&block.transactions);
        let (mut consumed, mut produced) = self.consumed_and_produced(&block.transactions, &known)?;
        remove_transient_outputs(&mut produced, &mut consumed);

        Ok(MaintenancePlan {
            returned_to_pool: Vec::new(),
            unconfirmed: Vec::new(),
            confirmed: block.transactions.clone(),
            outputs: OutputsUpdated {
                added: produced,
                deleted: consumed,
            },
        })
    }

    /// Undo the old branch back to the fork point and replay the new one,
    /// folded into one UTXO delta
    pub fn plan_branch_switch(
        &self,
        lookup: &dyn BranchLookup,
        old_tip: &ChainItem,
        new_tip: &ChainItem,
    ) -> Result<MaintenancePlan, ChainError> {
        let (old_first, new_first) = find_oldest_non_shared_parents(lookup, old_tip, new_tip)?;

        let mut old_transactions = collect_transactions(lookup, &old_first, old_tip)?;
        let mut new_transactions = collect_transactions(lookup, &new_first, new_tip)?;
        remove_shared_transactions(&mut old_transactions, &mut new_transactions);

        let mut known = index_by_txid(&old_transactions);
        known.extend(index_by_txid(&new_transactions));

        let (mut old_consumed, mut old_produced) =
            self.consumed_and_produced(&old_transactions, &known)?;
        let (mut new_consumed, mut new_produced) =
            self.consumed_and_produced(&new_transactions, &known)?;

        remove_shared_outputs(&mut old_consumed, &mut new_consumed);
        remove_shared_outputs(&mut old_produced, &mut new_produced);

        let mut added = distinct(old_consumed.into_iter().chain(new_produced));
        let mut deleted = distinct(old_produced.into_iter().chain(new_consumed));
        remove_transient_outputs(&mut added, &mut deleted);

        log::debug!(
            "Branch switch from {} to {}: {} transactions undone, {} applied",
            old_tip.hash().short(),
            new_tip.hash().short(),
            old_transactions.len(),
            new_transactions.len()
        );

        let returned_to_pool = old_transactions
            .iter()
            .filter(|tx| !tx.is_coinbase())
            .cloned()
            .collect();

        Ok(MaintenancePlan {
            returned_to_pool,
            unconfirmed: old_transactions,
            confirmed: new_transactions,
            outputs: OutputsUpdated { added, deleted },
        })
    }

    /// Perform the writes of `plan` and notify output subscribers
    pub fn apply(&self, plan: MaintenancePlan) -> Result<OutputsUpdated, ChainError> {
        if !plan.returned_to_pool.is_empty() {
            self.pool.add_transactions(&plan.returned_to_pool);
        }
        if !plan.unconfirmed.is_empty() {
            self.transactions.delete(&plan.unconfirmed)?;
        }
        self.pool.remove_transactions(&plan.confirmed);
        self.transactions.save(&plan.confirmed)?;
        self.utxos.apply(&plan.outputs.added, &plan.outputs.deleted)?;

        let _ = self.outputs_tx.send(plan.outputs.clone());
        Ok(plan.outputs)
    }

    fn consumed_and_produced(
        &self,
        transactions: &[Transaction],
        known: &HashMap<Hash256, &Transaction>,
    ) -> Result<(Vec<UnspentOutput>, Vec<UnspentOutput>), ChainError> {
        let mut consumed = Vec::new();
        let mut produced = Vec::new();
        for tx in transactions {
            for outpoint in tx.consumed_outpoints() {
                consumed.push(self.resolve_output(&outpoint, known)?);
            }
            produced.extend(tx.produced_outputs());
        }
        Ok((consumed, produced))
    }

    /// Amount of a spent output: from the branches themselves, then the
    /// confirmed transactions, then the UTXO set
    fn resolve_output(
        &self,
        outpoint: &OutPoint,
        known: &HashMap<Hash256, &Transaction>,
    ) -> Result<UnspentOutput, ChainError> {
        let amount_in = |tx: &Transaction| {
            tx.outputs
                .get(outpoint.vout as usize)
                .map(|output| output.value)
        };

        if let Some(amount) = known.get(&outpoint.txid).and_then(|tx| amount_in(*tx)) {
            return Ok(UnspentOutput { outpoint: *outpoint, amount });
        }
        if let Some(amount) = self.transactions.find(&outpoint.txid)?.as_ref().and_then(amount_in) {
            return Ok(UnspentOutput { outpoint: *outpoint, amount });
        }
        match self.utxos.find(outpoint)? {
            Some(output) => Ok(output),
            None => Err(ChainError::MissingTransaction(outpoint.txid)),
        }
    }
}

/// First blocks of each branch after the fork point: the pair of items, one
/// per branch, that share the same predecessor.
///
/// The branches are walked backwards one block at a time, alternating sides,
/// each step checked against every block already seen on the other side.
pub fn find_oldest_non_shared_parents(
    lookup: &dyn BranchLookup,
    old_tip: &ChainItem,
    new_tip: &ChainItem,
) -> Result<(ChainItem, ChainItem), ChainError> {
    if old_tip.prev_hash() == new_tip.prev_hash() {
        return Ok((old_tip.clone(), new_tip.clone()));
    }

    let mut seen_old: HashMap<Hash256, ChainItem> = HashMap::new();
    let mut seen_new: HashMap<Hash256, ChainItem> = HashMap::new();
    seen_old.insert(old_tip.prev_hash(), old_tip.clone());
    seen_new.insert(new_tip.prev_hash(), new_tip.clone());

    let mut old_cursor = Some(old_tip.clone());
    let mut new_cursor = Some(new_tip.clone());
    let mut step_old = true;

    while old_cursor.is_some() || new_cursor.is_some() {
        let (cursor, seen_own, seen_other) = if step_old {
            (&mut old_cursor, &mut seen_old, &seen_new)
        } else {
            (&mut new_cursor, &mut seen_new, &seen_old)
        };

        if let Some(item) = cursor.take() {
            // Genesis is shared by every branch, so never step onto it
            if item.height() > 1 {
                if let Some(previous) = lookup.find(&item.prev_hash())? {
                    if let Some(other) = seen_other.get(&previous.prev_hash()) {
                        let other = other.clone();
                        return Ok(if step_old {
                            (previous, other)
                        } else {
                            (other, previous)
                        });
                    }
                    seen_own.insert(previous.prev_hash(), previous.clone());
                    *cursor = Some(previous);
                }
            }
        }
        step_old = !step_old;
    }

    Err(ChainError::NoCommonAncestor)
}

/// Transactions from `first` up to `last` on one branch, oldest block first
fn collect_transactions(
    lookup: &dyn BranchLookup,
    first: &ChainItem,
    last: &ChainItem,
) -> Result<Vec<Transaction>, ChainError> {
    let mut items = vec![last.clone()];
    while items[items.len() - 1].hash() != first.hash() {
        let current = &items[items.len() - 1];
        if current.height() <= first.height() {
            return Err(ChainError::NoCommonAncestor);
        }
        let prev_hash = current.prev_hash();
        let previous = lookup
            .find(&prev_hash)?
            .ok_or(ChainError::UnknownPredecessor(prev_hash))?;
        items.push(previous);
    }

    let mut transactions = Vec::new();
    for item in items.iter().rev() {
        transactions.extend(lookup.ensure_loaded(item)?.transactions.iter().cloned());
    }
    Ok(transactions)
}

/// Drop the transactions present on both branches from both lists
fn remove_shared_transactions(old: &mut Vec<Transaction>, new: &mut Vec<Transaction>) {
    let old_ids: HashSet<Hash256> = old.iter().map(Transaction::txid).collect();
    let new_ids: HashSet<Hash256> = new.iter().map(Transaction::txid).collect();
    old.retain(|tx| !new_ids.contains(&tx.txid()));
    new.retain(|tx| !old_ids.contains(&tx.txid()));
}

/// Cancel coordinate-identical entries pairwise between the two lists
fn remove_shared_outputs(first: &mut Vec<UnspentOutput>, second: &mut Vec<UnspentOutput>) {
    first.retain(|output| {
        match second.iter().position(|other| other.outpoint == output.outpoint) {
            Some(index) => {
                second.remove(index);
                false
            }
            None => true,
        }
    });
}

/// Outputs both created and spent by the same delta are absent before and
/// after it, so neither set needs them
fn remove_transient_outputs(added: &mut Vec<UnspentOutput>, deleted: &mut Vec<UnspentOutput>) {
    let spent: HashSet<OutPoint> = deleted.iter().map(|output| output.outpoint).collect();
    let transient: HashSet<OutPoint> = added
        .iter()
        .map(|output| output.outpoint)
        .filter(|outpoint| spent.contains(outpoint))
        .collect();
    added.retain(|output| !transient.contains(&output.outpoint));
    deleted.retain(|output| !transient.contains(&output.outpoint));
}

fn distinct(outputs: impl Iterator<Item = UnspentOutput>) -> Vec<UnspentOutput> {
    let mut seen = HashSet::new();
    outputs.filter(|output| seen.insert(output.outpoint)).collect()
}

fn index_by_txid(transactions: &[Transaction]) -> HashMap<Hash256, &Transaction> {
    transactions.iter().map(|tx| (tx.txid(), tx)).collect()
}
