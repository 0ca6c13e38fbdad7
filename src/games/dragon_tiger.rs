//! Dragon Tiger: one card burned face down, then one card each to Dragon
//! and Tiger. Higher rank wins, ace low. Equal ranks are a tie, which
//! loses both the Dragon and Tiger bets.

use crate::cards::{Card, Deck};
use crate::games::strategy::{Candidate, OutcomeStrategy};
use crate::games::types::{BetOption, CardRole, PlacedCard, Seat, Variant};
use crate::money::Rate;
use rand::seq::SliceRandom;
use rand::RngCore;
use std::collections::BTreeSet;

const OPTIONS: &[BetOption] = &[BetOption::Dragon, BetOption::Tiger, BetOption::Tie];

pub struct DragonTiger;

fn winner_of(dragon: Card, tiger: Card) -> BetOption {
    match dragon.rank.cmp(&tiger.rank) {
        std::cmp::Ordering::Greater => BetOption::Dragon,
        std::cmp::Ordering::Less => BetOption::Tiger,
        std::cmp::Ordering::Equal => BetOption::Tie,
    }
}

impl OutcomeStrategy for DragonTiger {
    fn variant(&self) -> Variant {
        Variant::DragonTiger
    }

    fn options(&self) -> &'static [BetOption] {
        OPTIONS
    }

    fn multiplier(&self, option: BetOption) -> Option<Rate> {
        match option {
            BetOption::Dragon | BetOption::Tiger => Some(Rate::from_bps(19_600)),
            BetOption::Tie => Some(Rate::from_bps(110_000)),
            _ => None,
        }
    }

    fn candidates(&self) -> Vec<Candidate> {
        // Ordered (dragon, tiger) pairs from 52 cards: 13 * 12 * 16 = 2496
        // decisive pairs split evenly, 13 * 12 tied pairs.
        vec![
            Candidate::new([BetOption::Dragon], 1_248),
            Candidate::new([BetOption::Tiger], 1_248),
            Candidate::new([BetOption::Tie], 156),
        ]
    }

    fn deal(
        &self,
        winners: &BTreeSet<BetOption>,
        deck: &mut Deck,
        rng: &mut dyn RngCore,
    ) -> Option<Vec<PlacedCard>> {
        let wanted = *winners.iter().next()?;
        if !self.offers(wanted) {
            return None;
        }

        let blind = deck.draw()?;
        let cards = deck.cards();
        let mut pairs = Vec::new();
        for (i, dragon) in cards.iter().enumerate() {
            for (j, tiger) in cards.iter().enumerate() {
                if i != j && winner_of(*dragon, *tiger) == wanted {
                    pairs.push((*dragon, *tiger));
                }
            }
        }
        let (dragon, tiger) = *pairs.choose(rng)?;
        deck.take(dragon);
        deck.take(tiger);

        Some(vec![
            PlacedCard::new(CardRole::Blind, blind),
            PlacedCard::new(CardRole::Seat(Seat::Dragon), dragon),
            PlacedCard::new(CardRole::Seat(Seat::Tiger), tiger),
        ])
    }
}
