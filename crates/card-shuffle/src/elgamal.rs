//! elgamal masking over ristretto255
//!
//! a card with canonical index `c` is the point `(c + 1) * G`. the open deck
//! holds those points as trivial ciphertexts `(O, M)`, so every peer derives
//! the identical starting deck without any communication.

use std::sync::OnceLock;

use curve25519_dalek::{
    constants::RISTRETTO_BASEPOINT_POINT as G,
    ristretto::{CompressedRistretto, RistrettoPoint},
    scalar::Scalar,
    traits::Identity,
};

use crate::card::{Card, N_CARDS};

/// elgamal ciphertext over ristretto255
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ciphertext {
    /// c0 = r * G
    pub c0: RistrettoPoint,
    /// c1 = r * PK + M
    pub c1: RistrettoPoint,
}

impl Ciphertext {
    /// unmasked ciphertext carrying `message`
    pub fn open(message: RistrettoPoint) -> Self {
        Self {
            c0: RistrettoPoint::identity(),
            c1: message,
        }
    }

    /// re-randomize under `pk`: (c0 + r*G, c1 + r*PK)
    pub fn remask(&self, pk: &RistrettoPoint, r: &Scalar) -> Self {
        Self {
            c0: self.c0 + r * G,
            c1: self.c1 + r * pk,
        }
    }

    /// decrypt with a full secret key: M = c1 - sk * c0
    pub fn decrypt(&self, sk: &Scalar) -> RistrettoPoint {
        self.c1 - sk * self.c0
    }

    pub fn to_bytes(&self) -> [u8; 64] {
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(self.c0.compress().as_bytes());
        bytes[32..].copy_from_slice(self.c1.compress().as_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; 64]) -> Option<Self> {
        let c0 = CompressedRistretto::from_slice(&bytes[..32]).ok()?.decompress()?;
        let c1 = CompressedRistretto::from_slice(&bytes[32..]).ok()?.decompress()?;
        Some(Self { c0, c1 })
    }
}

/// message point of a card
pub fn card_point(card: Card) -> RistrettoPoint {
    Scalar::from(card.index() as u64 + 1) * G
}

/// card encoded by `point`, if any
pub fn point_card(point: &RistrettoPoint) -> Option<Card> {
    static CODEBOOK: OnceLock<Vec<CompressedRistretto>> = OnceLock::new();
    let codebook = CODEBOOK.get_or_init(|| {
        Card::deck().map(|card| card_point(card).compress()).collect()
    });
    let compressed = point.compress();
    codebook
        .iter()
        .position(|entry| *entry == compressed)
        .and_then(Card::from_index)
}

/// the 52 cards as unmasked ciphertexts in canonical order
pub fn open_deck() -> Vec<Ciphertext> {
    Card::deck().map(|card| Ciphertext::open(card_point(card))).collect()
}

/// encode a deck for the wire
pub fn deck_to_bytes(deck: &[Ciphertext]) -> Vec<[u8; 64]> {
    deck.iter().map(Ciphertext::to_bytes).collect()
}

/// decode a wire deck, which must hold exactly one ciphertext per card
pub fn deck_from_bytes(bytes: &[[u8; 64]]) -> crate::Result<Vec<Ciphertext>> {
    if bytes.len() != N_CARDS {
        return Err(crate::ShuffleError::DeckSizeMismatch {
            expected: N_CARDS,
            got: bytes.len(),
        });
    }
    bytes
        .iter()
        .map(|b| Ciphertext::from_bytes(b).ok_or(crate::ShuffleError::Encoding("ciphertext")))
        .collect()
}
