//! Lucky Seven: a single card is dealt. Bets cover its range around seven,
//! rank parity, colour and suit.

use crate::cards::{full_deck, Card, Colour, Deck, Rank, Suit};
use crate::games::strategy::{Candidate, OutcomeStrategy};
use crate::games::types::{BetOption, CardRole, PlacedCard, Variant};
use crate::money::Rate;
use rand::RngCore;
use std::collections::{BTreeMap, BTreeSet};

const OPTIONS: &[BetOption] = &[
    BetOption::Low,
    BetOption::Seven,
    BetOption::High,
    BetOption::Even,
    BetOption::Odd,
    BetOption::Red,
    BetOption::Black,
    BetOption::Spades,
    BetOption::Hearts,
    BetOption::Clubs,
    BetOption::Diamonds,
];

pub struct LuckySeven;

/// Every option a card satisfies
fn tags_for(card: Card) -> BTreeSet<BetOption> {
    let range = match card.rank.cmp(&Rank::SEVEN) {
        std::cmp::Ordering::Less => BetOption::Low,
        std::cmp::Ordering::Equal => BetOption::Seven,
        std::cmp::Ordering::Greater => BetOption::High,
    };
    let parity = if card.rank.is_even() {
        BetOption::Even
    } else {
        BetOption::Odd
    };
    let colour = match card.colour() {
        Colour::Red => BetOption::Red,
        Colour::Black => BetOption::Black,
    };
    let suit = match card.suit {
        Suit::Spades => BetOption::Spades,
        Suit::Hearts => BetOption::Hearts,
        Suit::Clubs => BetOption::Clubs,
        Suit::Diamonds => BetOption::Diamonds,
    };
    [range, parity, colour, suit].into_iter().collect()
}

impl OutcomeStrategy for LuckySeven {
    fn variant(&self) -> Variant {
        Variant::LuckySeven
    }

    fn options(&self) -> &'static [BetOption] {
        OPTIONS
    }

    fn multiplier(&self, option: BetOption) -> Option<Rate> {
        let bps = match option {
            BetOption::Low | BetOption::High => 19_800,
            BetOption::Seven => 110_000,
            BetOption::Even => 21_000,
            BetOption::Odd => 17_900,
            BetOption::Red | BetOption::Black => 19_800,
            BetOption::Spades | BetOption::Hearts | BetOption::Clubs | BetOption::Diamonds => 37_500,
            _ => return None,
        };
        Some(Rate::from_bps(bps))
    }

    fn candidates(&self) -> Vec<Candidate> {
        let mut groups: BTreeMap<BTreeSet<BetOption>, u32> = BTreeMap::new();
        for card in full_deck() {
            *groups.entry(tags_for(card)).or_insert(0) += 1;
        }
        groups
            .into_iter()
            .map(|(winners, weight)| Candidate { winners, weight })
            .collect()
    }

    fn deal(
        &self,
        winners: &BTreeSet<BetOption>,
        deck: &mut Deck,
        rng: &mut dyn RngCore,
    ) -> Option<Vec<PlacedCard>> {
        let card = deck.draw_random_where(rng, |c| tags_for(*c) == *winners)?;
        Some(vec![PlacedCard::new(CardRole::Joker, card)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::games::strategy::determine_outcome;
    use crate::games::types::StakeBook;
    use crate::money::Money;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_candidates_partition_the_deck() {
        let candidates = LuckySeven.candidates();
        let total: u32 = candidates.iter().map(|c| c.weight).sum();
        assert_eq!(total, 52);
        for candidate in &candidates {
            assert_eq!(candidate.winners.len(), 4);
        }
    }

    #[test]
    fn test_tags_for_seven_of_hearts() {
        let tags = tags_for(Card::new(Rank::SEVEN, Suit::Hearts));
        let expected: BTreeSet<_> = [BetOption::Seven, BetOption::Odd, BetOption::Red, BetOption::Hearts]
            .into_iter()
            .collect();
        assert_eq!(tags, expected);
    }

    #[test]
    fn test_dealt_card_carries_every_winning_tag() {
        let mut rng = StdRng::seed_from_u64(77);
        let mut stakes = StakeBook::new();
        stakes.add(BetOption::Seven, Money::from_major(10));
        stakes.add(BetOption::Red, Money::from_major(200));
        stakes.add(BetOption::Spades, Money::from_major(50));

        for _ in 0..20 {
            let deck = Deck::shuffled(&mut rng);
            let outcome = determine_outcome(&LuckySeven, &stakes, &deck, &mut rng).unwrap();
            assert_eq!(outcome.layout.len(), 1);
            let card = outcome.layout[0].card;
            assert_eq!(tags_for(card), outcome.winners);
            // Clubs avoids every staked option
            assert_eq!(card.suit, Suit::Clubs);
            assert_ne!(card.rank, Rank::SEVEN);
        }
    }

    #[test]
    fn test_missing_sevens_fall_back() {
        let mut rng = StdRng::seed_from_u64(12);
        let cards = full_deck().into_iter().filter(|c| c.rank != Rank::SEVEN).collect();
        let deck = Deck::from_cards(cards);

        let mut stakes = StakeBook::new();
        for option in OPTIONS {
            if *option != BetOption::Seven {
                stakes.add(*option, Money::from_major(100));
            }
        }

        let outcome = determine_outcome(&LuckySeven, &stakes, &deck, &mut rng).unwrap();
        assert!(!outcome.is_winner(BetOption::Seven));
    }
}
