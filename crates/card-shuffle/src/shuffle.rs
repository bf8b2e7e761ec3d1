//! re-encryption shuffle with a cut-and-choose proof
//!
//! proves output[i] = input[pi(i)] + (r_i * G, r_i * PK) without revealing
//! pi or {r_i}.
//!
//! for each of t rounds the prover commits to an intermediate shuffle
//! E = shuffle(input, pi_j, rho_j). challenge bits are derived from a
//! transcript binding (context, pk, input, output, every E). on bit 0 the
//! prover opens input -> E, on bit 1 it opens E -> output via
//! sigma = pi_j^-1 . pi and tau_i = r_i - rho_j[sigma(i)]. each opening on
//! its own is a uniformly random permutation, a cheating prover survives
//! with probability 2^-t.

use curve25519_dalek::{ristretto::RistrettoPoint, scalar::Scalar};
use parity_scale_codec::{Decode, Encode};
use rand::Rng;
use rand_core::{CryptoRng, RngCore};

use crate::{elgamal::Ciphertext, transcript::Blake2Transcript, Result, ShuffleError};

/// a permutation of indices 0..n
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Permutation {
    mapping: Vec<usize>,
}

impl Permutation {
    /// validate a mapping as a bijection on 0..n
    pub fn new(mapping: Vec<usize>) -> Result<Self> {
        let n = mapping.len();
        let mut seen = vec![false; n];

        for &idx in &mapping {
            if idx >= n || seen[idx] {
                return Err(ShuffleError::InvalidPermutation);
            }
            seen[idx] = true;
        }

        Ok(Self { mapping })
    }

    pub fn identity(n: usize) -> Self {
        Self {
            mapping: (0..n).collect(),
        }
    }

    /// uniform permutation via fisher-yates
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R, n: usize) -> Self {
        let mut mapping: Vec<usize> = (0..n).collect();
        for i in (1..n).rev() {
            let j = rng.gen_range(0..=i);
            mapping.swap(i, j);
        }
        Self { mapping }
    }

    /// output[i] = input[perm[i]]
    pub fn apply<T: Clone>(&self, input: &[T]) -> Vec<T> {
        self.mapping.iter().map(|&i| input[i].clone()).collect()
    }

    pub fn inverse(&self) -> Self {
        let mut mapping = vec![0; self.mapping.len()];
        for (i, &target) in self.mapping.iter().enumerate() {
            mapping[target] = i;
        }
        Self { mapping }
    }

    /// (self . other)(i) = self(other(i))
    pub fn compose(&self, other: &Self) -> Self {
        Self {
            mapping: other.mapping.iter().map(|&i| self.mapping[i]).collect(),
        }
    }

    pub fn get(&self, i: usize) -> usize {
        self.mapping[i]
    }

    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }

    pub fn mapping(&self) -> &[usize] {
        &self.mapping
    }
}

/// the secrets behind one shuffle step
pub struct ShuffleWitness {
    pub permutation: Permutation,
    pub randomness: Vec<Scalar>,
}

/// permute and re-mask `deck` under `pk`
pub fn shuffle_deck<R: RngCore + CryptoRng>(
    deck: &[Ciphertext],
    pk: &RistrettoPoint,
    rng: &mut R,
) -> (Vec<Ciphertext>, ShuffleWitness) {
    let permutation = Permutation::random(rng, deck.len());
    let randomness: Vec<Scalar> = (0..deck.len()).map(|_| Scalar::random(rng)).collect();
    let output = apply_shuffle(deck, pk, &permutation, &randomness);
    (
        output,
        ShuffleWitness {
            permutation,
            randomness,
        },
    )
}

fn apply_shuffle(
    deck: &[Ciphertext],
    pk: &RistrettoPoint,
    permutation: &Permutation,
    randomness: &[Scalar],
) -> Vec<Ciphertext> {
    permutation
        .mapping()
        .iter()
        .zip(randomness)
        .map(|(&src, r)| deck[src].remask(pk, r))
        .collect()
}

/// which side of an intermediate shuffle a round opens
#[derive(Clone, Debug, PartialEq, Eq)]
enum Side {
    /// input -> intermediate
    Input,
    /// intermediate -> output
    Output,
}

#[derive(Clone, Debug)]
struct Round {
    intermediate: Vec<Ciphertext>,
    side: Side,
    permutation: Permutation,
    randomness: Vec<Scalar>,
}

/// non-interactive proof that one deck is a re-encryption shuffle of another
#[derive(Clone, Debug)]
pub struct ShuffleProof {
    rounds: Vec<Round>,
}

#[derive(Encode, Decode)]
struct RawRound {
    intermediate: Vec<[u8; 64]>,
    opens_output: bool,
    permutation: Vec<u16>,
    randomness: Vec<[u8; 32]>,
}

#[derive(Encode, Decode)]
struct RawProof {
    rounds: Vec<RawRound>,
}

impl ShuffleProof {
    fn challenge(
        context: &[u8],
        pk: &RistrettoPoint,
        input: &[Ciphertext],
        output: &[Ciphertext],
        intermediates: &[&[Ciphertext]],
    ) -> Vec<bool> {
        let mut t = Blake2Transcript::new(b"card-shuffle.shuffle.v1");
        t.append_message(b"context", context);
        t.append_point(b"pk", pk);
        t.append_u64(b"n", input.len() as u64);
        for card in input {
            t.append_message(b"in", &card.to_bytes());
        }
        for card in output {
            t.append_message(b"out", &card.to_bytes());
        }
        t.append_u64(b"rounds", intermediates.len() as u64);
        for deck in intermediates {
            for card in deck.iter() {
                t.append_message(b"mid", &card.to_bytes());
            }
        }
        t.challenge_bits(b"open", intermediates.len())
    }

    /// prove `output` was produced from `input` with `witness`
    pub fn prove<R: RngCore + CryptoRng>(
        context: &[u8],
        pk: &RistrettoPoint,
        input: &[Ciphertext],
        output: &[Ciphertext],
        witness: &ShuffleWitness,
        rounds: usize,
        rng: &mut R,
    ) -> Result<Self> {
        let n = input.len();
        if output.len() != n {
            return Err(ShuffleError::DeckSizeMismatch {
                expected: n,
                got: output.len(),
            });
        }
        if witness.permutation.len() != n || witness.randomness.len() != n {
            return Err(ShuffleError::InconsistentWitness);
        }
        if apply_shuffle(input, pk, &witness.permutation, &witness.randomness) != output {
            return Err(ShuffleError::InconsistentWitness);
        }

        let mut committed = Vec::with_capacity(rounds);
        for _ in 0..rounds {
            let (intermediate, secrets) = shuffle_deck(input, pk, rng);
            committed.push((intermediate, secrets));
        }

        let intermediates: Vec<&[Ciphertext]> =
            committed.iter().map(|(deck, _)| deck.as_slice()).collect();
        let bits = Self::challenge(context, pk, input, output, &intermediates);

        let rounds = committed
            .into_iter()
            .zip(bits)
            .map(|((intermediate, secrets), opens_output)| {
                if opens_output {
                    let sigma = secrets.permutation.inverse().compose(&witness.permutation);
                    let tau = (0..n)
                        .map(|i| witness.randomness[i] - secrets.randomness[sigma.get(i)])
                        .collect();
                    Round {
                        intermediate,
                        side: Side::Output,
                        permutation: sigma,
                        randomness: tau,
                    }
                } else {
                    Round {
                        intermediate,
                        side: Side::Input,
                        permutation: secrets.permutation,
                        randomness: secrets.randomness,
                    }
                }
            })
            .collect();

        Ok(Self { rounds })
    }

    /// check the proof against (context, pk, input, output)
    pub fn verify(
        &self,
        context: &[u8],
        pk: &RistrettoPoint,
        input: &[Ciphertext],
        output: &[Ciphertext],
        min_rounds: usize,
    ) -> Result<()> {
        let n = input.len();
        if output.len() != n {
            return Err(ShuffleError::DeckSizeMismatch {
                expected: n,
                got: output.len(),
            });
        }
        if self.rounds.len() < min_rounds {
            return Err(ShuffleError::TooFewRounds {
                required: min_rounds,
                got: self.rounds.len(),
            });
        }

        let intermediates: Vec<&[Ciphertext]> = self
            .rounds
            .iter()
            .map(|round| round.intermediate.as_slice())
            .collect();
        let bits = Self::challenge(context, pk, input, output, &intermediates);

        for (index, (round, opens_output)) in self.rounds.iter().zip(bits).enumerate() {
            let expected_side = if opens_output { Side::Output } else { Side::Input };
            if round.side != expected_side {
                return Err(ShuffleError::ProofRejected {
                    round: index,
                    reason: "opened the wrong side",
                });
            }
            if round.intermediate.len() != n
                || round.permutation.len() != n
                || round.randomness.len() != n
            {
                return Err(ShuffleError::ProofRejected {
                    round: index,
                    reason: "round size mismatch",
                });
            }
            let (source, target) = match round.side {
                Side::Input => (input, round.intermediate.as_slice()),
                Side::Output => (round.intermediate.as_slice(), output),
            };
            if apply_shuffle(source, pk, &round.permutation, &round.randomness) != target {
                return Err(ShuffleError::ProofRejected {
                    round: index,
                    reason: "opening does not reproduce the committed deck",
                });
            }
        }
        Ok(())
    }

    pub fn rounds(&self) -> usize {
        self.rounds.len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        RawProof {
            rounds: self
                .rounds
                .iter()
                .map(|round| RawRound {
                    intermediate: round.intermediate.iter().map(Ciphertext::to_bytes).collect(),
                    opens_output: round.side == Side::Output,
                    permutation: round.permutation.mapping().iter().map(|&i| i as u16).collect(),
                    randomness: round.randomness.iter().map(Scalar::to_bytes).collect(),
                })
                .collect(),
        }
        .encode()
    }

    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self> {
        let raw = RawProof::decode(&mut bytes).map_err(|_| ShuffleError::Encoding("shuffle proof"))?;
        let rounds = raw
            .rounds
            .into_iter()
            .map(|round| -> Result<Round> {
                let intermediate = round
                    .intermediate
                    .iter()
                    .map(|b| Ciphertext::from_bytes(b).ok_or(ShuffleError::Encoding("ciphertext")))
                    .collect::<Result<Vec<_>>>()?;
                let permutation =
                    Permutation::new(round.permutation.into_iter().map(usize::from).collect())?;
                let randomness = round
                    .randomness
                    .into_iter()
                    .map(|b| {
                        Option::from(Scalar::from_canonical_bytes(b))
                            .ok_or(ShuffleError::Encoding("scalar"))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Round {
                    intermediate,
                    side: if round.opens_output { Side::Output } else { Side::Input },
                    permutation,
                    randomness,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rounds })
    }
}
