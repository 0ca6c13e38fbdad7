//! Settlement and hierarchical distribution
//!
//! Every wager of a completed round produces one WIN or LOSS entry for the
//! bettor, a commission and a profit share for each intermediary above it,
//! and one ADMIN_SETTLEMENT for the root that absorbs whatever is left.
//! The amounts of one wager's postings always sum to zero. The whole round
//! is committed in a single batch keyed by the round id, so a replay is a
//! no-op.

use crate::backoff::RetryPolicy;
use crate::errors::{EngineResult, HierarchyError, TransitionError};
use crate::events::EngineEvent;
use crate::games::strategy::OutcomeStrategy;
use crate::ledger::{
    CommitReceipt, EntryKind, LedgerEntry, NodeId, OwnershipNode, Posting, Resolution, ResolutionBatch, Wager,
    WagerStatus, MAX_HIERARCHY_DEPTH,
};
use crate::metrics::EngineMetrics;
use crate::money::Money;
use crate::round::{Round, RoundId};
use crate::services::PushChannel;
use crate::storage::LedgerStore;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

/// Postings for one wager. `ancestors` runs from the bettor's parent up to
/// and including the root.
///
/// Commission is `stake × commission` and is credited whether the bettor
/// wins or loses. The profit share always carries the sign opposite to the
/// bettor's net. An intermediary's ledger change is therefore the sum of
/// two entries that can point in different directions: a 50.00 wager paid
/// at 1.96 under a 10% share and 3% commission posts +1.50 and −4.80 to
/// the parent, a net change of −3.30 over 6.30 of gross movement.
pub fn distribute(wager: &Wager, payout: Money, ancestors: &[OwnershipNode]) -> Result<Vec<Posting>, HierarchyError> {
    let (root, intermediaries) = ancestors
        .split_last()
        .ok_or_else(|| HierarchyError::Orphan(wager.bettor.clone()))?;
    if !root.is_root() {
        return Err(HierarchyError::MissingNode(
            root.parent.clone().unwrap_or_else(|| root.id.clone()),
        ));
    }

    let net = payout - wager.stake;
    let kind = if net.is_positive() { EntryKind::Win } else { EntryKind::Loss };
    let mut postings = vec![Posting::new(wager.bettor.clone(), kind, net, wager.id).releasing(wager.stake)];

    // What the house side still owes (positive) or collects (negative)
    let mut remaining = -net;
    let mut commission_due = Money::ZERO;

    for node in intermediaries {
        let commission = wager.stake.apply_rate(node.commission);
        if !commission.is_zero() {
            postings.push(Posting::new(node.id.clone(), EntryKind::Commission, commission, wager.id));
            commission_due += commission;
        }

        let share = remaining.apply_rate(node.share);
        if !share.is_zero() {
            postings.push(Posting::new(node.id.clone(), EntryKind::ProfitShare, share, wager.id));
            remaining -= share;
        }
    }

    postings.push(Posting::new(
        root.id.clone(),
        EntryKind::AdminSettlement,
        remaining - commission_due,
        wager.id,
    ));
    Ok(postings)
}

/// Result of settling or refunding one round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementSummary {
    pub round_id: RoundId,
    pub wagers: usize,
    pub total_stake: Money,
    pub total_payout: Money,
    /// False when an earlier pass had already closed the round
    pub applied: bool,
    pub entries: Vec<LedgerEntry>,
}

pub struct SettlementEngine {
    store: Arc<dyn LedgerStore>,
    push: Arc<dyn PushChannel>,
    retry: RetryPolicy,
    metrics: Arc<EngineMetrics>,
}

impl SettlementEngine {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        push: Arc<dyn PushChannel>,
        retry: RetryPolicy,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            store,
            push,
            retry,
            metrics,
        }
    }

    /// The bettor's node and its ancestors, parent first, root last
    pub async fn lineage(&self, bettor: &NodeId) -> EngineResult<(OwnershipNode, Vec<OwnershipNode>)> {
        let node = self
            .store
            .node(bettor)
            .await?
            .ok_or_else(|| HierarchyError::MissingNode(bettor.clone()))?;
        let mut cursor = node.parent.clone().ok_or_else(|| HierarchyError::Orphan(bettor.clone()))?;

        let mut ancestors = Vec::new();
        for _ in 0..MAX_HIERARCHY_DEPTH {
            let ancestor = self
                .store
                .node(&cursor)
                .await?
                .ok_or_else(|| HierarchyError::MissingNode(cursor.clone()))?;
            let next = ancestor.parent.clone();
            ancestors.push(ancestor);
            match next {
                Some(parent) => cursor = parent,
                None => return Ok((node, ancestors)),
            }
        }
        Err(HierarchyError::Cycle(bettor.clone()).into())
    }

    /// Pays out every open wager of a completed round
    pub async fn settle_round(&self, round: &Round, strategy: &dyn OutcomeStrategy) -> EngineResult<SettlementSummary> {
        let outcome = round.outcome.as_ref().ok_or_else(|| TransitionError::MissingOutcome {
            round_id: round.id.to_string(),
        })?;

        let wagers: Vec<Wager> = self
            .store
            .wagers_for_round(&round.id)
            .await?
            .into_iter()
            .filter(|w| w.status == WagerStatus::Open)
            .collect();

        let mut lineages: HashMap<NodeId, Vec<OwnershipNode>> = HashMap::new();
        let mut postings = Vec::new();
        let mut closes = Vec::with_capacity(wagers.len());
        let mut total_stake = Money::ZERO;
        let mut total_payout = Money::ZERO;

        for wager in &wagers {
            let payout = if outcome.is_winner(wager.option) {
                strategy
                    .multiplier(wager.option)
                    .map(|rate| wager.stake.apply_rate(rate))
                    .unwrap_or(Money::ZERO)
            } else {
                Money::ZERO
            };

            if !lineages.contains_key(&wager.bettor) {
                let (_, ancestors) = self.lineage(&wager.bettor).await?;
                lineages.insert(wager.bettor.clone(), ancestors);
            }
            let ancestors = lineages.get(&wager.bettor).map(Vec::as_slice).unwrap_or(&[]);
            postings.extend(distribute(wager, payout, ancestors)?);

            closes.push((wager.id, Some(payout)));
            total_stake += wager.stake;
            total_payout += payout;
        }

        let batch = ResolutionBatch {
            round_id: round.id.clone(),
            resolution: Resolution::Settled,
            postings,
            wagers: closes,
            resolved_at: Utc::now(),
        };

        let receipt = self.commit_with_retry(batch).await?;
        let summary = SettlementSummary {
            round_id: round.id.clone(),
            wagers: wagers.len(),
            total_stake,
            total_payout,
            applied: matches!(receipt, CommitReceipt::Applied(_)),
            entries: self.announce(receipt),
        };

        info!(
            round_id = %round.id,
            wagers = summary.wagers,
            total_stake = %total_stake,
            total_payout = %total_payout,
            applied = summary.applied,
            "round settled"
        );
        Ok(summary)
    }

    /// Returns every open stake of `round_id` to its bettor
    pub async fn refund_round(&self, round_id: &RoundId, reason: &str) -> EngineResult<SettlementSummary> {
        let wagers: Vec<Wager> = self
            .store
            .wagers_for_round(round_id)
            .await?
            .into_iter()
            .filter(|w| w.status == WagerStatus::Open)
            .collect();

        let total_stake: Money = wagers.iter().map(|w| w.stake).sum();
        let batch = ResolutionBatch {
            round_id: round_id.clone(),
            resolution: Resolution::Voided,
            postings: wagers
                .iter()
                .map(|w| Posting::new(w.bettor.clone(), EntryKind::Refund, w.stake, w.id))
                .collect(),
            wagers: wagers.iter().map(|w| (w.id, None)).collect(),
            resolved_at: Utc::now(),
        };

        let receipt = self.commit_with_retry(batch).await?;
        let summary = SettlementSummary {
            round_id: round_id.clone(),
            wagers: wagers.len(),
            total_stake,
            total_payout: Money::ZERO,
            applied: matches!(receipt, CommitReceipt::Applied(_)),
            entries: self.announce(receipt),
        };

        warn!(
            round_id = %round_id,
            reason,
            refunded = summary.wagers,
            total_stake = %total_stake,
            applied = summary.applied,
            "round voided"
        );
        Ok(summary)
    }

    async fn commit_with_retry(&self, batch: ResolutionBatch) -> EngineResult<CommitReceipt> {
        let mut rng = StdRng::from_entropy();
        let mut attempt = 1;
        loop {
            match self.store.commit_resolution(batch.clone()).await {
                Ok(receipt) => return Ok(receipt),
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt, &mut rng);
                    warn!(
                        round_id = %batch.round_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "resolution commit failed, retrying"
                    );
                    self.metrics.record_settlement_retry();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Publishes the final balance of every node touched by a commit
    fn announce(&self, receipt: CommitReceipt) -> Vec<LedgerEntry> {
        let entries = match receipt {
            CommitReceipt::Applied(entries) => entries,
            CommitReceipt::AlreadyResolved(_) => return Vec::new(),
        };
        let mut latest: BTreeMap<&NodeId, Money> = BTreeMap::new();
        for entry in &entries {
            latest.insert(&entry.owner, entry.balance_after);
        }
        for (node, balance) in latest {
            self.push.publish(EngineEvent::Balance {
                node: node.clone(),
                balance,
            });
        }
        entries
    }
}
