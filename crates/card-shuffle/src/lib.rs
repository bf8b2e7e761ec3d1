//! card-shuffle: verifiable dealing primitives for mental card games
//!
//! every peer holds a share of a joint elgamal key over ristretto255.
//! the open deck is masked under the joint key, re-encrypted and permuted
//! by each peer in turn (with a cut-and-choose shuffle proof), and a card is
//! opened by combining one proven decryption share from every peer.
//!
//! no trusted setup, DDH-based security. nothing here does I/O: the
//! networking layer moves the byte encodings around.

pub mod card;
pub mod elgamal;
pub mod keys;
pub mod reveal;
pub mod shuffle;
pub mod transcript;

#[cfg(test)]
mod tests;

pub use card::{Card, Rank, Suit, N_CARDS};
pub use elgamal::Ciphertext;
pub use keys::{aggregate_key, KeyProof, KeyShare};
pub use reveal::{reveal_card, unmask, DecryptionShare};
pub use shuffle::{shuffle_deck, Permutation, ShuffleProof, ShuffleWitness};
pub use transcript::Blake2Transcript;

/// errors raised by the dealing primitives
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShuffleError {
    #[error("deck size mismatch: expected {expected}, got {got}")]
    DeckSizeMismatch { expected: usize, got: usize },

    #[error("invalid permutation: not a bijection")]
    InvalidPermutation,

    #[error("malformed encoding: {0}")]
    Encoding(&'static str),

    #[error("witness inconsistent with statement")]
    InconsistentWitness,

    #[error("shuffle proof has {got} rounds, at least {required} required")]
    TooFewRounds { required: usize, got: usize },

    #[error("shuffle proof rejected in round {round}: {reason}")]
    ProofRejected { round: usize, reason: &'static str },
}

pub type Result<T> = core::result::Result<T, ShuffleError>;
