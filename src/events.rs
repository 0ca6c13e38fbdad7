//! Events fanned out to subscribers of a variant

use crate::games::types::{BetOption, PlacedCard, Variant};
use crate::ledger::{NodeId, WagerId};
use crate::money::Money;
use crate::round::{RoundId, RoundView};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Emitted after every phase change, once the snapshot is cached
    RoundState { view: RoundView },
    WagerAccepted {
        round_id: RoundId,
        wager_id: WagerId,
        bettor: NodeId,
        option: BetOption,
        stake: Money,
    },
    Balance { node: NodeId, balance: Money },
    RevealStarted {
        round_id: RoundId,
        variant: Variant,
        cards: Vec<PlacedCard>,
        winners: BTreeSet<BetOption>,
        commitment: String,
    },
    RevealComplete { round_id: RoundId, variant: Variant },
    RoundSettled {
        round_id: RoundId,
        variant: Variant,
        winners: BTreeSet<BetOption>,
        wager_count: usize,
    },
    RoundVoided {
        round_id: RoundId,
        variant: Variant,
        refunded: usize,
    },
}

impl EngineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::RoundState { .. } => "round_state",
            EngineEvent::WagerAccepted { .. } => "wager_accepted",
            EngineEvent::Balance { .. } => "balance",
            EngineEvent::RevealStarted { .. } => "reveal_started",
            EngineEvent::RevealComplete { .. } => "reveal_complete",
            EngineEvent::RoundSettled { .. } => "round_settled",
            EngineEvent::RoundVoided { .. } => "round_voided",
        }
    }

    /// Variant the event belongs to, `None` for per-user events
    pub fn variant(&self) -> Option<Variant> {
        match self {
            EngineEvent::RoundState { view } => Some(view.variant),
            EngineEvent::WagerAccepted { round_id, .. } => round_id.variant(),
            EngineEvent::Balance { .. } => None,
            EngineEvent::RevealStarted { variant, .. }
            | EngineEvent::RevealComplete { variant, .. }
            | EngineEvent::RoundSettled { variant, .. }
            | EngineEvent::RoundVoided { variant, .. } => Some(*variant),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tag_matches_kind() {
        let event = EngineEvent::Balance {
            node: NodeId::new("b1"),
            balance: Money::from_cents(4_800),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], event.kind());
        assert_eq!(json["balance"], 4_800);
        assert_eq!(event.variant(), None);
    }
}
