//! Exposure-minimising outcome selection shared by every variant
//!
//! A strategy only describes its rules: which winner tag sets can occur,
//! how often each occurs in a fair deal, and how to deal cards for one of
//! them. Ranking and fallback live here so all variants behave the same.

use crate::cards::Deck;
use crate::errors::OutcomeError;
use crate::games::types::{BetOption, Outcome, PlacedCard, StakeBook, Variant};
use crate::money::{Money, Rate};
use rand::{Rng, RngCore};
use std::collections::BTreeSet;
use tracing::debug;

/// A winner tag set that a deal can produce
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub winners: BTreeSet<BetOption>,
    /// Number of concrete deals from a full deck that yield these winners
    pub weight: u32,
}

impl Candidate {
    pub fn new(winners: impl IntoIterator<Item = BetOption>, weight: u32) -> Self {
        Self {
            winners: winners.into_iter().collect(),
            weight,
        }
    }
}

/// Rules of one variant
pub trait OutcomeStrategy: Send + Sync {
    fn variant(&self) -> Variant;

    /// Options a bettor may choose
    fn options(&self) -> &'static [BetOption];

    /// Payout multiplier (stake included) for a winning option
    fn multiplier(&self, option: BetOption) -> Option<Rate>;

    /// Every winner tag set this variant can produce
    fn candidates(&self) -> Vec<Candidate>;

    /// Deals cards consistent with `winners`, drawing from `deck`.
    /// `None` when the remaining cards cannot realise them.
    fn deal(
        &self,
        winners: &BTreeSet<BetOption>,
        deck: &mut Deck,
        rng: &mut dyn RngCore,
    ) -> Option<Vec<PlacedCard>>;

    fn offers(&self, option: BetOption) -> bool {
        self.options().contains(&option)
    }
}

/// Orders candidates by ascending stake on their winning tags. Equal stakes
/// are ordered by a weighted random draw (exponential race), so among ties
/// a candidate comes first with probability proportional to its weight.
pub fn rank_candidates(
    candidates: Vec<Candidate>,
    stakes: &StakeBook,
    rng: &mut dyn RngCore,
) -> Vec<Candidate> {
    let mut keyed: Vec<(Money, f64, Candidate)> = candidates
        .into_iter()
        .filter(|c| c.weight > 0)
        .map(|c| {
            let score = stakes.stake_across(&c.winners);
            let u: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
            let key = -u.ln() / c.weight as f64;
            (score, key, c)
        })
        .collect();

    keyed.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.total_cmp(&b.1)));
    keyed.into_iter().map(|(_, _, c)| c).collect()
}

/// Picks the cheapest dealable outcome. Each candidate is tried against a
/// fresh copy of `deck`; a candidate whose cards are no longer available
/// falls through to the next one.
pub fn determine_outcome(
    strategy: &dyn OutcomeStrategy,
    stakes: &StakeBook,
    deck: &Deck,
    rng: &mut dyn RngCore,
) -> Result<Outcome, OutcomeError> {
    let ranked = rank_candidates(strategy.candidates(), stakes, rng);
    let mut attempted = 0;

    for candidate in ranked {
        attempted += 1;
        let mut working = deck.clone();
        match strategy.deal(&candidate.winners, &mut working, rng) {
            Some(layout) => return Ok(Outcome::new(candidate.winners, layout)),
            None => {
                debug!(
                    variant = %strategy.variant(),
                    winners = ?candidate.winners,
                    "cards exhausted for candidate, falling back"
                );
            }
        }
    }

    Err(OutcomeError::Exhausted {
        variant: strategy.variant(),
        attempted,
    })
}
