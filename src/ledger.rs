//! Ownership tree, wagers and the append-only money ledger

use crate::errors::HierarchyError;
use crate::games::types::BetOption;
use crate::money::{Money, Rate};
use crate::round::RoundId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Longest parent chain accepted before the tree is treated as corrupt
pub const MAX_HIERARCHY_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Root,
    Manager,
    Agent,
    Bettor,
}

/// A participant in the ownership tree
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OwnershipNode {
    pub id: NodeId,
    pub role: NodeRole,
    /// `None` only for the platform root
    pub parent: Option<NodeId>,
    pub balance: Money,
    /// Portion of the remaining net a node absorbs for its subtree
    pub share: Rate,
    /// Per-wager cut of the stake, independent of outcome
    pub commission: Rate,
    pub wagering_blocked: bool,
}

impl OwnershipNode {
    pub fn root(id: impl Into<String>) -> Self {
        Self {
            id: NodeId::new(id),
            role: NodeRole::Root,
            parent: None,
            balance: Money::ZERO,
            share: Rate::ZERO,
            commission: Rate::ZERO,
            wagering_blocked: false,
        }
    }

    pub fn child(id: impl Into<String>, role: NodeRole, parent: &NodeId) -> Self {
        Self {
            id: NodeId::new(id),
            role,
            parent: Some(parent.clone()),
            balance: Money::ZERO,
            share: Rate::ZERO,
            commission: Rate::ZERO,
            wagering_blocked: false,
        }
    }

    pub fn with_balance(mut self, balance: Money) -> Self {
        self.balance = balance;
        self
    }

    pub fn with_rates(mut self, share: Rate, commission: Rate) -> Self {
        self.share = share;
        self.commission = commission;
        self
    }

    pub fn blocked(mut self) -> Self {
        self.wagering_blocked = true;
        self
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// Checks that giving `id` the parent `parent` keeps the tree acyclic and
/// within [`MAX_HIERARCHY_DEPTH`]. `parent_of` returns `None` for unknown
/// nodes, `Some(None)` for the root.
pub fn check_parent_chain<F>(id: &NodeId, parent: Option<&NodeId>, mut parent_of: F) -> Result<(), HierarchyError>
where
    F: FnMut(&NodeId) -> Option<Option<NodeId>>,
{
    let mut cursor = match parent {
        Some(p) => p.clone(),
        None => return Ok(()),
    };
    for _ in 0..MAX_HIERARCHY_DEPTH {
        if cursor == *id {
            return Err(HierarchyError::Cycle(id.clone()));
        }
        match parent_of(&cursor) {
            None => return Err(HierarchyError::MissingNode(cursor)),
            Some(None) => return Ok(()),
            Some(Some(next)) => cursor = next,
        }
    }
    Err(HierarchyError::Cycle(id.clone()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WagerId(Uuid);

impl WagerId {
    pub fn new() -> Self {
        WagerId(Uuid::new_v4())
    }
}

impl Default for WagerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WagerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WagerStatus {
    Open,
    Settled,
    Refunded,
}

/// A stake on one option of one round
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Wager {
    pub id: WagerId,
    pub round_id: RoundId,
    pub bettor: NodeId,
    pub option: BetOption,
    pub stake: Money,
    /// Written once, by settlement
    pub payout: Option<Money>,
    pub status: WagerStatus,
    pub placed_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl Wager {
    pub fn new(round_id: RoundId, bettor: NodeId, option: BetOption, stake: Money, placed_at: DateTime<Utc>) -> Self {
        Self {
            id: WagerId::new(),
            round_id,
            bettor,
            option,
            stake,
            payout: None,
            status: WagerStatus::Open,
            placed_at,
            settled_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryKind {
    Wager,
    Win,
    Loss,
    Commission,
    ProfitShare,
    AdminSettlement,
    Refund,
}

impl EntryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryKind::Wager => "WAGER",
            EntryKind::Win => "WIN",
            EntryKind::Loss => "LOSS",
            EntryKind::Commission => "COMMISSION",
            EntryKind::ProfitShare => "PROFIT_SHARE",
            EntryKind::AdminSettlement => "ADMIN_SETTLEMENT",
            EntryKind::Refund => "REFUND",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable balance movement. `balance_after - balance_before` is always
/// `amount + released_stake`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub owner: NodeId,
    pub kind: EntryKind,
    pub amount: Money,
    /// Stake held since the WAGER entry and handed back with the result
    pub released_stake: Money,
    pub balance_before: Money,
    pub balance_after: Money,
    pub round_id: Option<RoundId>,
    pub wager_id: Option<WagerId>,
    pub created_at: DateTime<Utc>,
}

/// A balance movement planned by settlement, before the store stamps it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Posting {
    pub owner: NodeId,
    pub kind: EntryKind,
    pub amount: Money,
    pub released_stake: Money,
    pub wager_id: Option<WagerId>,
}

impl Posting {
    pub fn new(owner: NodeId, kind: EntryKind, amount: Money, wager_id: WagerId) -> Self {
        Self {
            owner,
            kind,
            amount,
            released_stake: Money::ZERO,
            wager_id: Some(wager_id),
        }
    }

    pub fn releasing(mut self, stake: Money) -> Self {
        self.released_stake = stake;
        self
    }

    /// Effect on the owner's balance
    pub fn balance_delta(&self) -> Money {
        self.amount + self.released_stake
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Settled,
    Voided,
}

/// Durable marker written with a round's settlement or refund
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoundResolution {
    pub round_id: RoundId,
    pub resolution: Resolution,
    pub resolved_at: DateTime<Utc>,
}

/// Everything that closes one round, committed atomically
#[derive(Debug, Clone)]
pub struct ResolutionBatch {
    pub round_id: RoundId,
    pub resolution: Resolution,
    pub postings: Vec<Posting>,
    /// Wagers to close, with their payout when settled
    pub wagers: Vec<(WagerId, Option<Money>)>,
    pub resolved_at: DateTime<Utc>,
}

impl ResolutionBatch {
    pub fn marker(&self) -> RoundResolution {
        RoundResolution {
            round_id: self.round_id.clone(),
            resolution: self.resolution,
            resolved_at: self.resolved_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitReceipt {
    Applied(Vec<LedgerEntry>),
    /// The round was closed earlier; nothing was written
    AlreadyResolved(Resolution),
}
