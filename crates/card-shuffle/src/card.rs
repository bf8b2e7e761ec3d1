//! card model
//!
//! the canonical index of a card is `suit * 13 + rank`, with ranks ordered
//! two through ace and suits clubs, diamonds, hearts, spades. every peer
//! must use this exact ordering: masked decks carry card indices, so a
//! diverging order would silently deal different cards.

use serde::{Deserialize, Serialize};

/// number of cards in the deck
pub const N_CARDS: usize = 52;
/// number of ranks per suit
pub const N_RANKS: usize = 13;
/// number of suits
pub const N_SUITS: usize = 4;

/// card rank, two through ace
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rank {
    #[serde(rename = "2")]
    Two,
    #[serde(rename = "3")]
    Three,
    #[serde(rename = "4")]
    Four,
    #[serde(rename = "5")]
    Five,
    #[serde(rename = "6")]
    Six,
    #[serde(rename = "7")]
    Seven,
    #[serde(rename = "8")]
    Eight,
    #[serde(rename = "9")]
    Nine,
    #[serde(rename = "10")]
    Ten,
    Jack,
    Queen,
    King,
    Ace,
}

impl Rank {
    /// all ranks in canonical order
    pub const ALL: [Rank; N_RANKS] = [
        Rank::Two,
        Rank::Three,
        Rank::Four,
        Rank::Five,
        Rank::Six,
        Rank::Seven,
        Rank::Eight,
        Rank::Nine,
        Rank::Ten,
        Rank::Jack,
        Rank::Queen,
        Rank::King,
        Rank::Ace,
    ];

    /// position of the rank in canonical order
    pub fn ordinal(self) -> usize {
        self as usize
    }

    /// display character
    pub fn char(self) -> char {
        match self {
            Rank::Two => '2',
            Rank::Three => '3',
            Rank::Four => '4',
            Rank::Five => '5',
            Rank::Six => '6',
            Rank::Seven => '7',
            Rank::Eight => '8',
            Rank::Nine => '9',
            Rank::Ten => 'T',
            Rank::Jack => 'J',
            Rank::Queen => 'Q',
            Rank::King => 'K',
            Rank::Ace => 'A',
        }
    }
}

/// card suit
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Suit {
    Clubs,
    Diamonds,
    Hearts,
    Spades,
}

impl Suit {
    /// all suits in canonical order
    pub const ALL: [Suit; N_SUITS] = [Suit::Clubs, Suit::Diamonds, Suit::Hearts, Suit::Spades];

    /// position of the suit in canonical order
    pub fn ordinal(self) -> usize {
        self as usize
    }

    /// display character
    pub fn char(self) -> char {
        match self {
            Suit::Clubs => '♣',
            Suit::Diamonds => '♦',
            Suit::Hearts => '♥',
            Suit::Spades => '♠',
        }
    }
}

/// a playing card
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Card {
    pub rank: Rank,
    pub suit: Suit,
}

impl Card {
    pub fn new(rank: Rank, suit: Suit) -> Self {
        Self { rank, suit }
    }

    /// card at canonical index 0..52
    pub fn from_index(index: usize) -> Option<Self> {
        if index >= N_CARDS {
            return None;
        }
        Some(Self {
            rank: Rank::ALL[index % N_RANKS],
            suit: Suit::ALL[index / N_RANKS],
        })
    }

    /// canonical index 0..52
    pub fn index(self) -> usize {
        self.suit.ordinal() * N_RANKS + self.rank.ordinal()
    }

    /// the 52 cards in canonical order
    pub fn deck() -> impl Iterator<Item = Card> {
        (0..N_CARDS).filter_map(Card::from_index)
    }
}

impl core::fmt::Display for Card {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}{}", self.rank.char(), self.suit.char())
    }
}
