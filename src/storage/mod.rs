//! Durable ledger store and round snapshot cache
//!
//! Both are traits so the engine can run on RocksDB in production and on
//! memory in tests. The ledger store is authoritative; the round cache is
//! best-effort and only used to resume rounds after a restart.

pub mod memory;
pub mod rocks;

pub use memory::{MemoryRoundCache, MemoryStore};
pub use rocks::RocksStore;

use crate::errors::EngineResult;
use crate::games::types::Variant;
use crate::ledger::{
    CommitReceipt, EntryKind, LedgerEntry, NodeId, OwnershipNode, Resolution, ResolutionBatch, RoundResolution, Wager,
    WagerStatus,
};
use crate::money::Money;
use crate::round::{RoundId, RoundRecord, RoundSnapshot};
use async_trait::async_trait;
use std::collections::HashMap;
use uuid::Uuid;

/// Authoritative store for balances, wagers and ledger entries
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Inserts or replaces a node. The parent must exist and the chain
    /// above it must stay acyclic.
    async fn upsert_node(&self, node: OwnershipNode) -> EngineResult<()>;

    async fn node(&self, id: &NodeId) -> EngineResult<Option<OwnershipNode>>;

    /// Debits the stake, stores the wager and appends its WAGER entry in
    /// one atomic step. Fails with `InsufficientFunds` without writing.
    async fn record_wager(&self, wager: &Wager) -> EngineResult<LedgerEntry>;

    async fn wagers_for_round(&self, round_id: &RoundId) -> EngineResult<Vec<Wager>>;

    async fn round_resolution(&self, round_id: &RoundId) -> EngineResult<Option<RoundResolution>>;

    /// Applies every posting, closes the listed wagers and writes the
    /// resolution marker atomically. A round that already has a marker is
    /// left untouched.
    async fn commit_resolution(&self, batch: ResolutionBatch) -> EngineResult<CommitReceipt>;

    /// Rounds holding wagers that were never settled or refunded
    async fn unresolved_rounds(&self) -> EngineResult<Vec<RoundId>>;

    async fn archive_round(&self, record: &RoundRecord) -> EngineResult<()>;

    /// Most recent first
    async fn round_history(&self, variant: Variant, limit: usize) -> EngineResult<Vec<RoundRecord>>;

    /// Oldest first
    async fn entries_for_owner(&self, owner: &NodeId) -> EngineResult<Vec<LedgerEntry>>;

    async fn entries_for_round(&self, round_id: &RoundId) -> EngineResult<Vec<LedgerEntry>>;
}

/// Keyed snapshot of each variant's live round
#[async_trait]
pub trait RoundCache: Send + Sync {
    async fn get(&self, variant: Variant) -> EngineResult<Option<RoundSnapshot>>;

    async fn put(&self, snapshot: &RoundSnapshot) -> EngineResult<()>;

    async fn remove(&self, variant: Variant) -> EngineResult<()>;

    async fn list(&self) -> EngineResult<Vec<RoundSnapshot>>;
}

/// Stamps `postings` into ledger entries against running balances.
/// Returns the entries in order plus each touched node's final balance.
pub(crate) fn stamp_postings<F>(
    batch: &ResolutionBatch,
    mut balance_of: F,
) -> EngineResult<(Vec<LedgerEntry>, HashMap<NodeId, Money>)>
where
    F: FnMut(&NodeId) -> EngineResult<Money>,
{
    let mut balances: HashMap<NodeId, Money> = HashMap::new();
    let mut entries = Vec::with_capacity(batch.postings.len());

    for posting in &batch.postings {
        let before = match balances.get(&posting.owner) {
            Some(balance) => *balance,
            None => balance_of(&posting.owner)?,
        };
        let after = before + posting.balance_delta();
        balances.insert(posting.owner.clone(), after);
        entries.push(LedgerEntry {
            id: Uuid::new_v4(),
            owner: posting.owner.clone(),
            kind: posting.kind,
            amount: posting.amount,
            released_stake: posting.released_stake,
            balance_before: before,
            balance_after: after,
            round_id: Some(batch.round_id.clone()),
            wager_id: posting.wager_id,
            created_at: batch.resolved_at,
        });
    }

    Ok((entries, balances))
}

/// Status a closed wager ends in
pub(crate) fn closed_status(resolution: Resolution) -> WagerStatus {
    match resolution {
        Resolution::Settled => WagerStatus::Settled,
        Resolution::Voided => WagerStatus::Refunded,
    }
}

/// WAGER entry debiting `wager.stake` from a bettor holding `balance_before`
pub(crate) fn wager_entry(wager: &Wager, balance_before: Money) -> LedgerEntry {
    LedgerEntry {
        id: Uuid::new_v4(),
        owner: wager.bettor.clone(),
        kind: EntryKind::Wager,
        amount: -wager.stake,
        released_stake: Money::ZERO,
        balance_before,
        balance_after: balance_before - wager.stake,
        round_id: Some(wager.round_id.clone()),
        wager_id: Some(wager.id),
        created_at: wager.placed_at,
    }
}
