//! end-to-end dealing between simulated peers, no networking

use std::collections::BTreeSet;

use rand::rngs::OsRng;

use crate::{
    aggregate_key,
    card::{Card, N_CARDS},
    elgamal::{open_deck, Ciphertext},
    reveal_card, shuffle_deck, DecryptionShare, KeyShare, ShuffleProof,
};

const ROUNDS: usize = 12;

struct Table {
    keys: Vec<KeyShare>,
    pk: curve25519_dalek::ristretto::RistrettoPoint,
}

impl Table {
    fn new(peers: usize) -> Self {
        let keys: Vec<_> = (0..peers).map(|_| KeyShare::generate(&mut OsRng)).collect();

        let roster = b"table";
        let proofs: Vec<_> = keys
            .iter()
            .map(|k| k.prove_possession(roster, &mut OsRng))
            .collect();
        for (key, proof) in keys.iter().zip(&proofs) {
            assert!(proof.verify(roster, &key.public()));
        }

        let publics: Vec<_> = keys.iter().map(KeyShare::public).collect();
        let pk = aggregate_key(&publics);
        Self { keys, pk }
    }

    /// every peer shuffles in order, every other peer checks the step
    fn shuffle(&self) -> Vec<Ciphertext> {
        let mut deck = open_deck();
        for (step, _) in self.keys.iter().enumerate() {
            let context = format!("step:{step}");
            let (next, witness) = shuffle_deck(&deck, &self.pk, &mut OsRng);
            let proof = ShuffleProof::prove(
                context.as_bytes(),
                &self.pk,
                &deck,
                &next,
                &witness,
                ROUNDS,
                &mut OsRng,
            )
            .unwrap();

            let wire = ShuffleProof::from_bytes(&proof.to_bytes()).unwrap();
            for _verifier in 0..self.keys.len() {
                wire.verify(context.as_bytes(), &self.pk, &deck, &next, ROUNDS)
                    .unwrap();
            }
            deck = next;
        }
        deck
    }

    fn shares(&self, position: usize, ct: &Ciphertext) -> Vec<DecryptionShare> {
        let context = format!("position:{position}");
        self.keys
            .iter()
            .map(|k| {
                let share = k.decryption_share(context.as_bytes(), ct, &mut OsRng);
                assert!(share.verify(context.as_bytes(), &k.public(), ct));
                share
            })
            .collect()
    }
}

#[test]
fn test_four_peers_deal_a_full_deck() {
    let table = Table::new(4);
    let deck = table.shuffle();

    let per_peer = N_CARDS / table.keys.len();
    let mut seen = BTreeSet::new();
    for owner in 0..table.keys.len() {
        for position in owner * per_peer..(owner + 1) * per_peer {
            let shares = table.shares(position, &deck[position]);
            let card = reveal_card(&deck[position], &shares).expect("every position holds a card");
            assert!(seen.insert(card), "card {card} dealt twice");
        }
    }

    // bijection: every card exactly once
    assert_eq!(seen.len(), N_CARDS);
    assert_eq!(seen, Card::deck().collect::<BTreeSet<_>>());
}

#[test]
fn test_shuffled_deck_hides_order() {
    let table = Table::new(2);
    let deck = table.shuffle();
    // no masked position equals its unmasked counterpart
    for (masked, open) in deck.iter().zip(open_deck()) {
        assert_ne!(*masked, open);
    }
}

#[test]
fn test_tampered_step_is_caught_by_verifiers() {
    let table = Table::new(3);
    let input = open_deck();
    let (mut output, witness) = shuffle_deck(&input, &table.pk, &mut OsRng);
    let proof =
        ShuffleProof::prove(b"step:0", &table.pk, &input, &output, &witness, ROUNDS, &mut OsRng)
            .unwrap();

    // duplicate a card after proving
    output[1] = output[0].remask(&table.pk, &curve25519_dalek::scalar::Scalar::random(&mut OsRng));
    assert!(proof
        .verify(b"step:0", &table.pk, &input, &output, ROUNDS)
        .is_err());
}

#[test]
fn test_reveal_needs_every_peer() {
    let table = Table::new(3);
    let deck = table.shuffle();
    let shares = table.shares(0, &deck[0]);
    assert!(reveal_card(&deck[0], &shares).is_some());
    assert!(reveal_card(&deck[0], &shares[1..]).is_none());
}
