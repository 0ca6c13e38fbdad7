//! Wager acceptance
//!
//! Checks run cheapest first and none of them write. Only the final store
//! call debits the bettor, atomically with recording the wager.

use crate::config::LimitsConfig;
use crate::errors::{EngineResult, WagerError};
use crate::events::EngineEvent;
use crate::games::strategy::OutcomeStrategy;
use crate::games::types::{BetOption, StakeBook};
use crate::ledger::{Wager, WagerStatus};
use crate::money::Money;
use crate::round::{Round, RoundId};
use crate::services::{IdentityProvider, PushChannel};
use crate::storage::LedgerStore;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WagerRequest {
    pub user: String,
    pub round_id: String,
    pub option: BetOption,
    pub stake: Money,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WagerReceipt {
    pub wager: Wager,
    /// Bettor balance after the debit
    pub balance: Money,
}

pub struct WagerLedger {
    store: Arc<dyn LedgerStore>,
    identity: Arc<dyn IdentityProvider>,
    push: Arc<dyn PushChannel>,
    limits: LimitsConfig,
}

impl WagerLedger {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        identity: Arc<dyn IdentityProvider>,
        push: Arc<dyn PushChannel>,
        limits: LimitsConfig,
    ) -> Self {
        Self {
            store,
            identity,
            push,
            limits,
        }
    }

    /// Places a wager on `live`, the variant's current round. The caller
    /// holds the round's lock, so `stakes` cannot change underneath.
    pub async fn place(
        &self,
        request: &WagerRequest,
        live: Option<&Round>,
        strategy: &dyn OutcomeStrategy,
        stakes: &mut StakeBook,
    ) -> EngineResult<WagerReceipt> {
        let round = match live {
            Some(round) if round.id.as_str() == request.round_id && round.accepts_wagers() => round,
            _ => {
                return Err(WagerError::InvalidRound {
                    round_id: request.round_id.clone(),
                }
                .into())
            }
        };

        if !strategy.offers(request.option) {
            return Err(WagerError::InvalidOption {
                option: request.option,
                variant: strategy.variant(),
            }
            .into());
        }

        if request.stake < self.limits.min_stake || request.stake > self.limits.max_stake {
            return Err(WagerError::InvalidStake {
                stake: request.stake,
                min: self.limits.min_stake,
                max: self.limits.max_stake,
            }
            .into());
        }

        let bettor = self.identity.resolve(&request.user).await?;
        if bettor.blocked {
            return Err(WagerError::BlockedBettor {
                user: request.user.clone(),
            }
            .into());
        }

        let wager = Wager::new(round.id.clone(), bettor.node, request.option, request.stake, Utc::now());
        let entry = self.store.record_wager(&wager).await?;
        stakes.add(wager.option, wager.stake);

        info!(
            round_id = %wager.round_id,
            wager_id = %wager.id,
            bettor = %wager.bettor,
            option = %wager.option,
            stake = %wager.stake,
            "wager accepted"
        );

        self.push.publish(EngineEvent::WagerAccepted {
            round_id: wager.round_id.clone(),
            wager_id: wager.id,
            bettor: wager.bettor.clone(),
            option: wager.option,
            stake: wager.stake,
        });
        self.push.publish(EngineEvent::Balance {
            node: wager.bettor.clone(),
            balance: entry.balance_after,
        });

        Ok(WagerReceipt {
            wager,
            balance: entry.balance_after,
        })
    }

    /// Rebuilds a round's aggregate from its durable open wagers
    pub async fn rebuild_stakes(&self, round_id: &RoundId) -> EngineResult<StakeBook> {
        let mut stakes = StakeBook::new();
        let wagers = self.store.wagers_for_round(round_id).await?;
        for wager in wagers.iter().filter(|w| w.status == WagerStatus::Open) {
            stakes.add(wager.option, wager.stake);
        }
        debug!(round_id = %round_id, wagers = wagers.len(), total = %stakes.total(), "rebuilt stakes");
        Ok(stakes)
    }
}
