use rand::seq::SliceRandom;
use rand::Rng;

use super::{full_deck, Card};

/// Cards still available to a round. Drawing removes a card, so nothing is
/// dealt twice.
#[derive(Debug, Clone)]
pub struct Deck {
    cards: Vec<Card>,
}

impl Deck {
    /// Full deck in a fresh random order
    pub fn shuffled<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut cards = full_deck();
        cards.shuffle(rng);
        Self { cards }
    }

    /// Deck holding exactly `cards`, in the given order
    pub fn from_cards(cards: Vec<Card>) -> Self {
        Self { cards }
    }

    /// Top card
    pub fn draw(&mut self) -> Option<Card> {
        self.cards.pop()
    }

    /// A uniformly chosen card satisfying `pred`
    pub fn draw_random_where<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        pred: impl Fn(&Card) -> bool,
    ) -> Option<Card> {
        let matching: Vec<usize> = (0..self.cards.len()).filter(|&i| pred(&self.cards[i])).collect();
        let idx = *matching.choose(rng)?;
        Some(self.cards.remove(idx))
    }

    /// Removes a specific card if still present
    pub fn take(&mut self, card: Card) -> bool {
        match self.cards.iter().position(|c| *c == card) {
            Some(idx) => {
                self.cards.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn cards(&self) -> &[Card] {
        &self.cards
    }

    pub fn remaining(&self) -> usize {
        self.cards.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cards::{Rank, Suit};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_draw_removes_cards() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut deck = Deck::shuffled(&mut rng);
        let first = deck.draw().unwrap();
        assert_eq!(deck.remaining(), 51);
        assert!(!deck.take(first));
    }

    #[test]
    fn test_draw_random_where_exhausts() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut deck = Deck::shuffled(&mut rng);
        for _ in 0..4 {
            assert!(deck.draw_random_where(&mut rng, |c| c.rank == Rank::SEVEN).is_some());
        }
        assert!(deck.draw_random_where(&mut rng, |c| c.rank == Rank::SEVEN).is_none());
        assert_eq!(deck.remaining(), 48);
        assert_eq!(deck.cards().iter().filter(|c| c.suit == Suit::Hearts).count(), 12);
    }
}
