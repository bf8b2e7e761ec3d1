//! per-peer key shares of the joint masking key
//!
//! each peer publishes `Y_i = x_i * G` with a schnorr proof of possession.
//! the proof is bound to a caller-supplied context (the session roster) so a
//! peer cannot replay someone else's share, and verifying it before
//! aggregation rules out rogue-key choices like `Y_j = Y' - sum(others)`.

use curve25519_dalek::{
    constants::RISTRETTO_BASEPOINT_POINT as G,
    ristretto::{CompressedRistretto, RistrettoPoint},
    scalar::Scalar,
};
use rand_core::{CryptoRng, RngCore};

use crate::transcript::Blake2Transcript;

/// a peer's secret share of the joint key
pub struct KeyShare {
    secret: Scalar,
    public: RistrettoPoint,
}

impl KeyShare {
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let secret = Scalar::random(rng);
        Self {
            secret,
            public: secret * G,
        }
    }

    pub fn public(&self) -> RistrettoPoint {
        self.public
    }

    pub(crate) fn secret(&self) -> &Scalar {
        &self.secret
    }

    /// schnorr proof of knowledge of the secret share
    pub fn prove_possession<R: RngCore + CryptoRng>(&self, context: &[u8], rng: &mut R) -> KeyProof {
        let k = Scalar::random(rng);
        let commitment = k * G;
        let c = KeyProof::challenge(context, &self.public, &commitment);
        KeyProof {
            commitment,
            response: k + c * self.secret,
        }
    }
}

impl core::fmt::Debug for KeyShare {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("KeyShare")
            .field("public", &self.public.compress())
            .finish_non_exhaustive()
    }
}

/// proof of possession: R = k*G, z = k + c*x
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyProof {
    pub commitment: RistrettoPoint,
    pub response: Scalar,
}

impl KeyProof {
    fn challenge(context: &[u8], public: &RistrettoPoint, commitment: &RistrettoPoint) -> Scalar {
        let mut t = Blake2Transcript::new(b"card-shuffle.key-possession.v1");
        t.append_message(b"context", context);
        t.append_point(b"Y", public);
        t.append_point(b"R", commitment);
        t.challenge_scalar(b"c")
    }

    /// check z*G = R + c*Y
    pub fn verify(&self, context: &[u8], public: &RistrettoPoint) -> bool {
        let c = Self::challenge(context, public, &self.commitment);
        self.response * G == self.commitment + c * public
    }

    pub fn to_bytes(&self) -> [u8; 64] {
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(self.commitment.compress().as_bytes());
        bytes[32..].copy_from_slice(self.response.as_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; 64]) -> Option<Self> {
        let commitment = CompressedRistretto::from_slice(&bytes[..32]).ok()?.decompress()?;
        let mut response = [0u8; 32];
        response.copy_from_slice(&bytes[32..]);
        let response = Option::from(Scalar::from_canonical_bytes(response))?;
        Some(Self { commitment, response })
    }
}

/// joint public key: the sum of every peer's share
pub fn aggregate_key<'a, I>(shares: I) -> RistrettoPoint
where
    I: IntoIterator<Item = &'a RistrettoPoint>,
{
    shares.into_iter().sum()
}

/// decode a compressed public share
pub fn point_from_bytes(bytes: &[u8; 32]) -> Option<RistrettoPoint> {
    CompressedRistretto(*bytes).decompress()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn test_possession_proof() {
        let share = KeyShare::generate(&mut OsRng);
        let proof = share.prove_possession(b"roster-a", &mut OsRng);
        assert!(proof.verify(b"roster-a", &share.public()));
    }

    #[test]
    fn test_proof_bound_to_context() {
        let share = KeyShare::generate(&mut OsRng);
        let proof = share.prove_possession(b"roster-a", &mut OsRng);
        assert!(!proof.verify(b"roster-b", &share.public()));
    }

    #[test]
    fn test_proof_bound_to_key() {
        let share = KeyShare::generate(&mut OsRng);
        let other = KeyShare::generate(&mut OsRng);
        let proof = share.prove_possession(b"ctx", &mut OsRng);
        assert!(!proof.verify(b"ctx", &other.public()));
    }

    #[test]
    fn test_proof_bytes() {
        let share = KeyShare::generate(&mut OsRng);
        let proof = share.prove_possession(b"ctx", &mut OsRng);
        let decoded = KeyProof::from_bytes(&proof.to_bytes()).unwrap();
        assert_eq!(decoded, proof);
        assert!(decoded.verify(b"ctx", &share.public()));
    }

    #[test]
    fn test_aggregate_decrypts_with_summed_secrets() {
        let shares: Vec<_> = (0..4).map(|_| KeyShare::generate(&mut OsRng)).collect();
        let publics: Vec<_> = shares.iter().map(KeyShare::public).collect();
        let joint = aggregate_key(&publics);
        let secret: Scalar = shares.iter().map(|s| s.secret).sum();
        assert_eq!(joint, secret * G);
    }
}
