use crate::cards::Card;
use crate::money::Money;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Supported game variants
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    AndarBahar,
    DragonTiger,
    LuckySeven,
}

impl Variant {
    pub const ALL: [Variant; 3] = [Variant::AndarBahar, Variant::DragonTiger, Variant::LuckySeven];

    /// Short code used as the round id prefix
    pub fn code(self) -> &'static str {
        match self {
            Variant::AndarBahar => "ab",
            Variant::DragonTiger => "dt",
            Variant::LuckySeven => "l7",
        }
    }

    pub fn from_code(code: &str) -> Option<Variant> {
        Variant::ALL.into_iter().find(|v| v.code() == code)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Variant::AndarBahar => "andar_bahar",
            Variant::DragonTiger => "dragon_tiger",
            Variant::LuckySeven => "lucky_seven",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Variant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Variant::ALL
            .into_iter()
            .find(|v| v.as_str() == s || v.code() == s)
            .ok_or_else(|| format!("unknown variant '{}'", s))
    }
}

/// A wagering choice. Each variant offers a subset.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BetOption {
    Andar,
    Bahar,
    Dragon,
    Tiger,
    Tie,
    Low,
    Seven,
    High,
    Even,
    Odd,
    Red,
    Black,
    Spades,
    Hearts,
    Clubs,
    Diamonds,
}

impl BetOption {
    pub fn as_str(self) -> &'static str {
        match self {
            BetOption::Andar => "andar",
            BetOption::Bahar => "bahar",
            BetOption::Dragon => "dragon",
            BetOption::Tiger => "tiger",
            BetOption::Tie => "tie",
            BetOption::Low => "low",
            BetOption::Seven => "seven",
            BetOption::High => "high",
            BetOption::Even => "even",
            BetOption::Odd => "odd",
            BetOption::Red => "red",
            BetOption::Black => "black",
            BetOption::Spades => "spades",
            BetOption::Hearts => "hearts",
            BetOption::Clubs => "clubs",
            BetOption::Diamonds => "diamonds",
        }
    }
}

impl fmt::Display for BetOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Seats that receive hands
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Seat {
    Andar,
    Bahar,
    Dragon,
    Tiger,
}

/// What a dealt card is for
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CardRole {
    /// Face-up reference card
    Joker,
    /// Burned, face down
    Blind,
    Seat(Seat),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlacedCard {
    pub role: CardRole,
    pub card: Card,
}

impl PlacedCard {
    pub fn new(role: CardRole, card: Card) -> Self {
        Self { role, card }
    }
}

/// Resolved result of a round, fixed before any card is shown
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Outcome {
    pub winners: BTreeSet<BetOption>,
    /// Cards in reveal order
    pub layout: Vec<PlacedCard>,
    /// Hex SHA-256 over winners and layout, announced with the reveal
    pub commitment: String,
}

impl Outcome {
    pub fn new(winners: BTreeSet<BetOption>, layout: Vec<PlacedCard>) -> Self {
        let commitment = commitment_for(&winners, &layout);
        Self {
            winners,
            layout,
            commitment,
        }
    }

    pub fn is_winner(&self, option: BetOption) -> bool {
        self.winners.contains(&option)
    }

    /// Recomputes the commitment and compares
    pub fn verify(&self) -> bool {
        commitment_for(&self.winners, &self.layout) == self.commitment
    }
}

fn commitment_for(winners: &BTreeSet<BetOption>, layout: &[PlacedCard]) -> String {
    let mut hasher = Sha256::new();
    for option in winners {
        hasher.update(option.as_str().as_bytes());
        hasher.update(b"|");
    }
    for placed in layout {
        hasher.update(format!("{:?}:{}", placed.role, placed.card).as_bytes());
        hasher.update(b";");
    }
    hex::encode(hasher.finalize())
}

/// Aggregated stake per option for one round
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StakeBook {
    totals: BTreeMap<BetOption, Money>,
}

impl StakeBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, option: BetOption, stake: Money) {
        *self.totals.entry(option).or_insert(Money::ZERO) += stake;
    }

    pub fn stake_on(&self, option: BetOption) -> Money {
        self.totals.get(&option).copied().unwrap_or(Money::ZERO)
    }

    /// Combined stake across a set of options
    pub fn stake_across<'a>(&self, options: impl IntoIterator<Item = &'a BetOption>) -> Money {
        options.into_iter().map(|o| self.stake_on(*o)).sum()
    }

    pub fn total(&self) -> Money {
        self.totals.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.totals.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (BetOption, Money)> + '_ {
        self.totals.iter().map(|(o, m)| (*o, *m))
    }
}
