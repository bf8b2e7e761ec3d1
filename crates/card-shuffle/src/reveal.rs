//! decryption shares with chaum-pedersen proofs
//!
//! peer `j` unmasks a ciphertext by publishing `S_j = x_j * c0` and proving
//! `log_G(Y_j) = log_c0(S_j)`. once every peer's share is in,
//! `c1 - sum(S_j)` is the card point. the proof is bound to a context
//! (deck digest, position, share owner) so shares cannot be moved between
//! positions or deals.

use curve25519_dalek::{
    constants::RISTRETTO_BASEPOINT_POINT as G,
    ristretto::{CompressedRistretto, RistrettoPoint},
    scalar::Scalar,
};
use rand_core::{CryptoRng, RngCore};

use crate::{
    card::Card,
    elgamal::{point_card, Ciphertext},
    keys::KeyShare,
    transcript::Blake2Transcript,
};

/// one peer's contribution to unmasking a ciphertext
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecryptionShare {
    /// S = x * c0
    pub share: RistrettoPoint,
    /// A = k * G
    pub commitment_g: RistrettoPoint,
    /// B = k * c0
    pub commitment_c: RistrettoPoint,
    /// z = k + e * x
    pub response: Scalar,
}

impl DecryptionShare {
    fn challenge(
        context: &[u8],
        public: &RistrettoPoint,
        ciphertext: &Ciphertext,
        share: &RistrettoPoint,
        commitment_g: &RistrettoPoint,
        commitment_c: &RistrettoPoint,
    ) -> Scalar {
        let mut t = Blake2Transcript::new(b"card-shuffle.decryption-share.v1");
        t.append_message(b"context", context);
        t.append_point(b"Y", public);
        t.append_message(b"ct", &ciphertext.to_bytes());
        t.append_point(b"S", share);
        t.append_point(b"A", commitment_g);
        t.append_point(b"B", commitment_c);
        t.challenge_scalar(b"e")
    }

    /// check z*G = A + e*Y and z*c0 = B + e*S
    pub fn verify(&self, context: &[u8], public: &RistrettoPoint, ciphertext: &Ciphertext) -> bool {
        let e = Self::challenge(
            context,
            public,
            ciphertext,
            &self.share,
            &self.commitment_g,
            &self.commitment_c,
        );
        self.response * G == self.commitment_g + e * public
            && self.response * ciphertext.c0 == self.commitment_c + e * self.share
    }

    pub fn to_bytes(&self) -> [u8; 128] {
        let mut bytes = [0u8; 128];
        bytes[..32].copy_from_slice(self.share.compress().as_bytes());
        bytes[32..64].copy_from_slice(self.commitment_g.compress().as_bytes());
        bytes[64..96].copy_from_slice(self.commitment_c.compress().as_bytes());
        bytes[96..].copy_from_slice(self.response.as_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; 128]) -> Option<Self> {
        let point = |range: core::ops::Range<usize>| {
            CompressedRistretto::from_slice(&bytes[range]).ok()?.decompress()
        };
        let mut response = [0u8; 32];
        response.copy_from_slice(&bytes[96..]);
        Some(Self {
            share: point(0..32)?,
            commitment_g: point(32..64)?,
            commitment_c: point(64..96)?,
            response: Option::from(Scalar::from_canonical_bytes(response))?,
        })
    }
}

impl KeyShare {
    /// this peer's proven share for unmasking `ciphertext`
    pub fn decryption_share<R: RngCore + CryptoRng>(
        &self,
        context: &[u8],
        ciphertext: &Ciphertext,
        rng: &mut R,
    ) -> DecryptionShare {
        let share = self.secret() * ciphertext.c0;
        let k = Scalar::random(rng);
        let commitment_g = k * G;
        let commitment_c = k * ciphertext.c0;
        let e = DecryptionShare::challenge(
            context,
            &self.public(),
            ciphertext,
            &share,
            &commitment_g,
            &commitment_c,
        );
        DecryptionShare {
            share,
            commitment_g,
            commitment_c,
            response: k + e * self.secret(),
        }
    }
}

/// strip every share from the ciphertext, yielding the message point
pub fn unmask<'a, I>(ciphertext: &Ciphertext, shares: I) -> RistrettoPoint
where
    I: IntoIterator<Item = &'a DecryptionShare>,
{
    let stripped: RistrettoPoint = shares.into_iter().map(|s| s.share).sum();
    ciphertext.c1 - stripped
}

/// unmask and decode; `None` when the shares do not yield a card
pub fn reveal_card<'a, I>(ciphertext: &Ciphertext, shares: I) -> Option<Card>
where
    I: IntoIterator<Item = &'a DecryptionShare>,
{
    point_card(&unmask(ciphertext, shares))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{elgamal::card_point, keys::aggregate_key};
    use rand::rngs::OsRng;

    fn masked(card: Card, shares: &[KeyShare]) -> Ciphertext {
        let publics: Vec<_> = shares.iter().map(KeyShare::public).collect();
        let pk = aggregate_key(&publics);
        Ciphertext::open(card_point(card)).remask(&pk, &Scalar::random(&mut OsRng))
    }

    #[test]
    fn test_all_shares_reveal_card() {
        let keys: Vec<_> = (0..3).map(|_| KeyShare::generate(&mut OsRng)).collect();
        let card = Card::from_index(41).unwrap();
        let ct = masked(card, &keys);

        let shares: Vec<_> = keys
            .iter()
            .map(|k| k.decryption_share(b"pos:7", &ct, &mut OsRng))
            .collect();
        for (key, share) in keys.iter().zip(&shares) {
            assert!(share.verify(b"pos:7", &key.public(), &ct));
        }
        assert_eq!(reveal_card(&ct, &shares), Some(card));
    }

    #[test]
    fn test_missing_share_hides_card() {
        let keys: Vec<_> = (0..3).map(|_| KeyShare::generate(&mut OsRng)).collect();
        let card = Card::from_index(9).unwrap();
        let ct = masked(card, &keys);

        let partial: Vec<_> = keys[..2]
            .iter()
            .map(|k| k.decryption_share(b"ctx", &ct, &mut OsRng))
            .collect();
        assert_eq!(reveal_card(&ct, &partial), None);
    }

    #[test]
    fn test_forged_share_rejected() {
        let keys: Vec<_> = (0..2).map(|_| KeyShare::generate(&mut OsRng)).collect();
        let ct = masked(Card::from_index(0).unwrap(), &keys);

        let mut share = keys[0].decryption_share(b"ctx", &ct, &mut OsRng);
        share.share += G;
        assert!(!share.verify(b"ctx", &keys[0].public(), &ct));
    }

    #[test]
    fn test_share_bound_to_context_and_ciphertext() {
        let keys: Vec<_> = (0..2).map(|_| KeyShare::generate(&mut OsRng)).collect();
        let ct = masked(Card::from_index(1).unwrap(), &keys);
        let other = masked(Card::from_index(2).unwrap(), &keys);

        let share = keys[1].decryption_share(b"pos:1", &ct, &mut OsRng);
        assert!(!share.verify(b"pos:2", &keys[1].public(), &ct));
        assert!(!share.verify(b"pos:1", &keys[1].public(), &other));
        assert!(!share.verify(b"pos:1", &keys[0].public(), &ct));
    }

    #[test]
    fn test_share_bytes() {
        let key = KeyShare::generate(&mut OsRng);
        let ct = masked(Card::from_index(30).unwrap(), std::slice::from_ref(&key));
        let share = key.decryption_share(b"ctx", &ct, &mut OsRng);
        let decoded = DecryptionShare::from_bytes(&share.to_bytes()).unwrap();
        assert_eq!(decoded, share);
        assert!(decoded.verify(b"ctx", &key.public(), &ct));
    }
}
