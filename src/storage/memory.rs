//! In-process store and cache, used by tests and embedded setups

use super::{closed_status, stamp_postings, wager_entry, LedgerStore, RoundCache};
use crate::errors::{EngineResult, StorageError, WagerError};
use crate::games::types::Variant;
use crate::ledger::{
    check_parent_chain, CommitReceipt, LedgerEntry, NodeId, OwnershipNode, ResolutionBatch, RoundResolution, Wager,
};
use crate::money::Money;
use crate::round::{RoundId, RoundRecord, RoundSnapshot};
use async_trait::async_trait;
use lru::LruCache;
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Tables {
    nodes: HashMap<NodeId, OwnershipNode>,
    wagers: BTreeMap<RoundId, Vec<Wager>>,
    entries: Vec<LedgerEntry>,
    resolutions: HashMap<RoundId, RoundResolution>,
    history: Vec<RoundRecord>,
}

/// Ledger store kept entirely in memory. Every operation takes one lock,
/// which makes each of them atomic.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    failing_commits: AtomicU32,
    failing_reads: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` resolution commits fail with a transient
    /// write error
    pub fn fail_next_commits(&self, count: u32) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` resolution lookups fail with a transient
    /// read error
    pub fn fail_next_reads(&self, count: u32) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    /// Sum of every node balance
    pub fn total_balance(&self) -> EngineResult<Money> {
        Ok(self.lock()?.nodes.values().map(|n| n.balance).sum())
    }

    fn lock(&self) -> EngineResult<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| StorageError::Unavailable("memory store lock poisoned".to_string()).into())
    }

    fn take_injected_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn upsert_node(&self, node: OwnershipNode) -> EngineResult<()> {
        let mut tables = self.lock()?;
        check_parent_chain(&node.id, node.parent.as_ref(), |id| {
            tables.nodes.get(id).map(|n| n.parent.clone())
        })?;
        tables.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    async fn node(&self, id: &NodeId) -> EngineResult<Option<OwnershipNode>> {
        Ok(self.lock()?.nodes.get(id).cloned())
    }

    async fn record_wager(&self, wager: &Wager) -> EngineResult<LedgerEntry> {
        let mut tables = self.lock()?;
        let node = tables.nodes.get_mut(&wager.bettor).ok_or_else(|| WagerError::UnknownBettor {
            user: wager.bettor.to_string(),
        })?;
        if node.balance < wager.stake {
            return Err(WagerError::InsufficientFunds {
                available: node.balance,
                requested: wager.stake,
            }
            .into());
        }

        let entry = wager_entry(wager, node.balance);
        node.balance = entry.balance_after;
        tables
            .wagers
            .entry(wager.round_id.clone())
            .or_default()
            .push(wager.clone());
        tables.entries.push(entry.clone());
        Ok(entry)
    }

    async fn wagers_for_round(&self, round_id: &RoundId) -> EngineResult<Vec<Wager>> {
        Ok(self.lock()?.wagers.get(round_id).cloned().unwrap_or_default())
    }

    async fn round_resolution(&self, round_id: &RoundId) -> EngineResult<Option<RoundResolution>> {
        if Self::take_injected_failure(&self.failing_reads) {
            return Err(StorageError::ReadFailed("injected read failure".to_string()).into());
        }
        Ok(self.lock()?.resolutions.get(round_id).cloned())
    }

    async fn commit_resolution(&self, batch: ResolutionBatch) -> EngineResult<CommitReceipt> {
        let mut tables = self.lock()?;
        if let Some(existing) = tables.resolutions.get(&batch.round_id) {
            return Ok(CommitReceipt::AlreadyResolved(existing.resolution));
        }
        if Self::take_injected_failure(&self.failing_commits) {
            return Err(StorageError::WriteFailed("injected commit failure".to_string()).into());
        }

        // Stage everything first so a missing node leaves no partial write
        let (entries, balances) = stamp_postings(&batch, |id| {
            tables
                .nodes
                .get(id)
                .map(|n| n.balance)
                .ok_or_else(|| StorageError::CorruptedData(format!("ledger owner {} missing", id)).into())
        })?;

        for (id, balance) in balances {
            if let Some(node) = tables.nodes.get_mut(&id) {
                node.balance = balance;
            }
        }
        let status = closed_status(batch.resolution);
        if let Some(wagers) = tables.wagers.get_mut(&batch.round_id) {
            for (wager_id, payout) in &batch.wagers {
                if let Some(wager) = wagers.iter_mut().find(|w| w.id == *wager_id) {
                    wager.payout = *payout;
                    wager.status = status;
                    wager.settled_at = Some(batch.resolved_at);
                }
            }
        }
        tables.entries.extend(entries.iter().cloned());
        tables.resolutions.insert(batch.round_id.clone(), batch.marker());
        Ok(CommitReceipt::Applied(entries))
    }

    async fn unresolved_rounds(&self) -> EngineResult<Vec<RoundId>> {
        let tables = self.lock()?;
        Ok(tables
            .wagers
            .keys()
            .filter(|id| !tables.resolutions.contains_key(*id))
            .cloned()
            .collect())
    }

    async fn archive_round(&self, record: &RoundRecord) -> EngineResult<()> {
        self.lock()?.history.push(record.clone());
        Ok(())
    }

    async fn round_history(&self, variant: Variant, limit: usize) -> EngineResult<Vec<RoundRecord>> {
        Ok(self
            .lock()?
            .history
            .iter()
            .rev()
            .filter(|r| r.variant == variant)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn entries_for_owner(&self, owner: &NodeId) -> EngineResult<Vec<LedgerEntry>> {
        Ok(self
            .lock()?
            .entries
            .iter()
            .filter(|e| e.owner == *owner)
            .cloned()
            .collect())
    }

    async fn entries_for_round(&self, round_id: &RoundId) -> EngineResult<Vec<LedgerEntry>> {
        Ok(self
            .lock()?
            .entries
            .iter()
            .filter(|e| e.round_id.as_ref() == Some(round_id))
            .cloned()
            .collect())
    }
}

/// Snapshot cache bounded by an LRU
pub struct MemoryRoundCache {
    snapshots: Mutex<LruCache<Variant, RoundSnapshot>>,
}

impl MemoryRoundCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            snapshots: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn lock(&self) -> EngineResult<MutexGuard<'_, LruCache<Variant, RoundSnapshot>>> {
        self.snapshots
            .lock()
            .map_err(|_| StorageError::Unavailable("round cache lock poisoned".to_string()).into())
    }
}

impl Default for MemoryRoundCache {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl RoundCache for MemoryRoundCache {
    async fn get(&self, variant: Variant) -> EngineResult<Option<RoundSnapshot>> {
        Ok(self.lock()?.get(&variant).cloned())
    }

    async fn put(&self, snapshot: &RoundSnapshot) -> EngineResult<()> {
        self.lock()?.put(snapshot.round.variant, snapshot.clone());
        Ok(())
    }

    async fn remove(&self, variant: Variant) -> EngineResult<()> {
        self.lock()?.pop(&variant);
        Ok(())
    }

    async fn list(&self) -> EngineResult<Vec<RoundSnapshot>> {
        Ok(self.lock()?.iter().map(|(_, s)| s.clone()).collect())
    }
}
