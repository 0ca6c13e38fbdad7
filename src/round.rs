//! Round entity and its phase machine
//!
//! A round only ever moves forward one phase at a time. Starting the next
//! round after COMPLETED is the registry's job and produces a new `Round`.

use crate::errors::TransitionError;
use crate::games::types::{BetOption, CardRole, Outcome, PlacedCard, StakeBook, Variant};
use crate::money::Money;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Waiting,
    Betting,
    Dealing,
    Completed,
}

impl Phase {
    /// The only phase this one may move to
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Waiting => Some(Phase::Betting),
            Phase::Betting => Some(Phase::Dealing),
            Phase::Dealing => Some(Phase::Completed),
            Phase::Completed => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Waiting => "waiting",
            Phase::Betting => "betting",
            Phase::Dealing => "dealing",
            Phase::Completed => "completed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `<variant code>-<UTC yyyymmddHHMMSSmmm>`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoundId(String);

impl RoundId {
    pub fn new(variant: Variant, at: DateTime<Utc>) -> Self {
        RoundId(format!("{}-{}", variant.code(), at.format("%Y%m%d%H%M%S%3f")))
    }

    /// Wraps an id received from outside without checking it
    pub fn from_raw(raw: impl Into<String>) -> Self {
        RoundId(raw.into())
    }

    /// Variant encoded in the id prefix
    pub fn variant(&self) -> Option<Variant> {
        let (code, stamp) = self.0.split_once('-')?;
        if stamp.len() != 17 || !stamp.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Variant::from_code(code)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Round {
    pub id: RoundId,
    pub variant: Variant,
    pub phase: Phase,
    pub phase_started_at: DateTime<Utc>,
    pub phase_deadline: DateTime<Utc>,
    /// Fixed when betting closes, before any card is shown
    pub outcome: Option<Outcome>,
    pub reveal_completed: bool,
    pub created_at: DateTime<Utc>,
}

impl Round {
    pub fn new(id: RoundId, variant: Variant, now: DateTime<Utc>, deadline: DateTime<Utc>) -> Self {
        Self {
            id,
            variant,
            phase: Phase::Waiting,
            phase_started_at: now,
            phase_deadline: deadline,
            outcome: None,
            reveal_completed: false,
            created_at: now,
        }
    }

    /// Moves to `to` if it is the next phase. Entering DEALING needs an
    /// outcome, see [`Round::begin_dealing`].
    pub fn transition(
        &mut self,
        to: Phase,
        now: DateTime<Utc>,
        deadline: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if self.phase.next() != Some(to) {
            return Err(TransitionError::InvalidTransition { from: self.phase, to });
        }
        if to == Phase::Dealing && self.outcome.is_none() {
            return Err(TransitionError::MissingOutcome {
                round_id: self.id.to_string(),
            });
        }
        self.phase = to;
        self.phase_started_at = now;
        self.phase_deadline = deadline;
        Ok(())
    }

    /// Stores the outcome and enters DEALING in one step
    pub fn begin_dealing(
        &mut self,
        outcome: Outcome,
        now: DateTime<Utc>,
        deadline: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if self.phase != Phase::Betting {
            return Err(TransitionError::InvalidTransition {
                from: self.phase,
                to: Phase::Dealing,
            });
        }
        self.outcome = Some(outcome);
        self.transition(Phase::Dealing, now, deadline)
    }

    pub fn accepts_wagers(&self) -> bool {
        self.phase == Phase::Betting
    }

    pub fn winners(&self) -> Option<&BTreeSet<BetOption>> {
        self.outcome.as_ref().map(|o| &o.winners)
    }

    /// What subscribers may see. Cards appear once dealing starts, blind
    /// cards never, winners only once the round is completed.
    pub fn view(&self, stakes: &StakeBook) -> RoundView {
        let dealt = matches!(self.phase, Phase::Dealing | Phase::Completed);
        let cards = match (&self.outcome, dealt) {
            (Some(outcome), true) => outcome
                .layout
                .iter()
                .filter(|p| p.role != CardRole::Blind)
                .copied()
                .collect(),
            _ => Vec::new(),
        };
        let winners = match (&self.outcome, self.phase) {
            (Some(outcome), Phase::Completed) => Some(outcome.winners.clone()),
            _ => None,
        };
        RoundView {
            round_id: self.id.clone(),
            variant: self.variant,
            phase: self.phase,
            phase_started_at: self.phase_started_at,
            phase_deadline: self.phase_deadline,
            cards,
            winners,
            commitment: self.outcome.as_ref().filter(|_| dealt).map(|o| o.commitment.clone()),
            reveal_completed: self.reveal_completed,
            total_staked: stakes.total(),
        }
    }
}

/// Public projection of a live round
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoundView {
    pub round_id: RoundId,
    pub variant: Variant,
    pub phase: Phase,
    pub phase_started_at: DateTime<Utc>,
    pub phase_deadline: DateTime<Utc>,
    pub cards: Vec<PlacedCard>,
    pub winners: Option<BTreeSet<BetOption>>,
    pub commitment: Option<String>,
    pub reveal_completed: bool,
    pub total_staked: Money,
}

/// Crash-recovery copy of a live round, written on every transition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoundSnapshot {
    pub round: Round,
    pub stakes: StakeBook,
    pub saved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RoundStatus {
    Settled,
    Voided { reason: String },
}

/// Archived round
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoundRecord {
    pub round_id: RoundId,
    pub variant: Variant,
    #[serde(flatten)]
    pub status: RoundStatus,
    pub outcome: Option<Outcome>,
    pub total_staked: Money,
    pub wager_count: usize,
    pub created_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}
