//! Andar Bahar: a joker is shown, then cards go alternately to Andar and
//! Bahar (Andar first). The seat that receives the first card of the
//! joker's rank wins.

use crate::cards::{Card, Deck, Rank};
use crate::games::strategy::{Candidate, OutcomeStrategy};
use crate::games::types::{BetOption, CardRole, PlacedCard, Seat, Variant};
use crate::money::Rate;
use rand::seq::SliceRandom;
use rand::RngCore;
use std::collections::{BTreeSet, HashMap};

const OPTIONS: &[BetOption] = &[BetOption::Andar, BetOption::Bahar];
const EVEN_MONEY: Rate = Rate::from_bps(19_600);

/// Reshuffles tried before giving up on the requested seat. Each try hits
/// the wanted seat about half the time.
const MAX_RESHUFFLES: usize = 64;

pub struct AndarBahar;

impl AndarBahar {
    /// Fair-deal frequency of the first match landing on an even (Andar)
    /// or odd (Bahar) position, with 51 cards left and 3 matching the joker.
    /// The first match sits at index `k` in C(50 - k, 2) of the C(51, 3)
    /// arrangements of the matching positions.
    fn seat_weights() -> (u32, u32) {
        let mut andar = 0;
        let mut bahar = 0;
        for k in 0..=48u32 {
            let rest = 50 - k;
            let arrangements = rest * (rest - 1) / 2;
            if k % 2 == 0 {
                andar += arrangements;
            } else {
                bahar += arrangements;
            }
        }
        (andar, bahar)
    }
}

impl OutcomeStrategy for AndarBahar {
    fn variant(&self) -> Variant {
        Variant::AndarBahar
    }

    fn options(&self) -> &'static [BetOption] {
        OPTIONS
    }

    fn multiplier(&self, option: BetOption) -> Option<Rate> {
        self.offers(option).then_some(EVEN_MONEY)
    }

    fn candidates(&self) -> Vec<Candidate> {
        let (andar, bahar) = Self::seat_weights();
        vec![
            Candidate::new([BetOption::Andar], andar),
            Candidate::new([BetOption::Bahar], bahar),
        ]
    }

    fn deal(
        &self,
        winners: &BTreeSet<BetOption>,
        deck: &mut Deck,
        rng: &mut dyn RngCore,
    ) -> Option<Vec<PlacedCard>> {
        let andar_wins = match winners.iter().next()? {
            BetOption::Andar => true,
            BetOption::Bahar => false,
            _ => return None,
        };

        let mut per_rank: HashMap<Rank, usize> = HashMap::new();
        for card in deck.cards() {
            *per_rank.entry(card.rank).or_insert(0) += 1;
        }
        let joker = deck.draw_random_where(rng, |c| per_rank.get(&c.rank).copied().unwrap_or(0) >= 2)?;

        let mut order: Vec<Card> = deck.cards().to_vec();
        for _ in 0..MAX_RESHUFFLES {
            order.shuffle(rng);
            let first_match = order.iter().position(|c| c.rank == joker.rank)?;
            if (first_match % 2 == 0) != andar_wins {
                continue;
            }

            let mut layout = Vec::with_capacity(first_match + 2);
            layout.push(PlacedCard::new(CardRole::Joker, joker));
            for (idx, card) in order[..=first_match].iter().enumerate() {
                let seat = if idx % 2 == 0 { Seat::Andar } else { Seat::Bahar };
                deck.take(*card);
                layout.push(PlacedCard::new(CardRole::Seat(seat), *card));
            }
            return Some(layout);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cards::Suit;
    use crate::games::strategy::determine_outcome;
    use crate::games::types::StakeBook;
    use crate::money::Money;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn winning_seat(layout: &[PlacedCard]) -> Seat {
        let joker = layout[0].card;
        assert_eq!(layout[0].role, CardRole::Joker);
        let last = layout.last().unwrap();
        assert_eq!(last.card.rank, joker.rank);
        for placed in &layout[1..layout.len() - 1] {
            assert_ne!(placed.card.rank, joker.rank, "joker rank dealt before the winner");
        }
        match last.role {
            CardRole::Seat(seat) => seat,
            other => panic!("unexpected role {:?}", other),
        }
    }

    #[test]
    fn test_weights_cover_every_arrangement() {
        let (andar, bahar) = AndarBahar::seat_weights();
        assert_eq!(andar + bahar, 20_825);
        assert!(andar > bahar);
    }

    #[test]
    fn test_layout_matches_requested_seat() {
        let mut rng = StdRng::seed_from_u64(42);
        for (option, seat) in [(BetOption::Andar, Seat::Andar), (BetOption::Bahar, Seat::Bahar)] {
            for _ in 0..25 {
                let mut deck = Deck::shuffled(&mut rng);
                let winners: BTreeSet<_> = [option].into_iter().collect();
                let layout = AndarBahar.deal(&winners, &mut deck, &mut rng).unwrap();
                assert_eq!(winning_seat(&layout), seat);
                assert_eq!(deck.remaining() + layout.len(), 52);
            }
        }
    }

    #[test]
    fn test_seats_alternate_starting_with_andar() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut deck = Deck::shuffled(&mut rng);
        let winners: BTreeSet<_> = [BetOption::Bahar].into_iter().collect();
        let layout = AndarBahar.deal(&winners, &mut deck, &mut rng).unwrap();
        for (idx, placed) in layout[1..].iter().enumerate() {
            let expected = if idx % 2 == 0 { Seat::Andar } else { Seat::Bahar };
            assert_eq!(placed.role, CardRole::Seat(expected));
        }
    }

    #[test]
    fn test_heavier_side_loses() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut stakes = StakeBook::new();
        stakes.add(BetOption::Andar, Money::from_major(100));
        stakes.add(BetOption::Bahar, Money::from_major(40));

        for _ in 0..20 {
            let deck = Deck::shuffled(&mut rng);
            let outcome = determine_outcome(&AndarBahar, &stakes, &deck, &mut rng).unwrap();
            assert!(outcome.is_winner(BetOption::Bahar));
            assert_eq!(winning_seat(&outcome.layout), Seat::Bahar);
        }
    }

    #[test]
    fn test_no_joker_possible_when_every_rank_is_single() {
        let mut rng = StdRng::seed_from_u64(2);
        let cards = Rank::all().map(|r| Card::new(r, Suit::Spades)).collect();
        let mut deck = Deck::from_cards(cards);
        let winners: BTreeSet<_> = [BetOption::Andar].into_iter().collect();
        assert!(AndarBahar.deal(&winners, &mut deck, &mut rng).is_none());
    }
}
