//! blake2-based fiat-shamir transcript with a merlin-like api
//!
//! appended data is absorbed into a running blake2b state. challenges are
//! squeezed from a clone of that state and folded back in, so two
//! challenges never repeat even under the same label.

use blake2::{Blake2b512, Digest};
use curve25519_dalek::{ristretto::RistrettoPoint, scalar::Scalar};

#[derive(Clone)]
pub struct Blake2Transcript {
    state: Blake2b512,
    challenges: u64,
}

impl Blake2Transcript {
    /// create new transcript with domain separator
    pub fn new(domain_sep: &[u8]) -> Self {
        let mut state = Blake2b512::new();
        state.update(b"card-shuffle.transcript.v1");
        state.update((domain_sep.len() as u32).to_le_bytes());
        state.update(domain_sep);
        Self {
            state,
            challenges: 0,
        }
    }

    /// append labeled message to transcript
    pub fn append_message(&mut self, label: &[u8], message: &[u8]) {
        self.state.update((label.len() as u32).to_le_bytes());
        self.state.update(label);
        self.state.update((message.len() as u32).to_le_bytes());
        self.state.update(message);
    }

    pub fn append_u64(&mut self, label: &[u8], value: u64) {
        self.append_message(label, &value.to_le_bytes());
    }

    pub fn append_point(&mut self, label: &[u8], point: &RistrettoPoint) {
        self.append_message(label, point.compress().as_bytes());
    }

    /// squeeze 64 challenge bytes
    pub fn challenge_bytes(&mut self, label: &[u8]) -> [u8; 64] {
        let mut fork = self.state.clone();
        fork.update(b"challenge");
        fork.update((label.len() as u32).to_le_bytes());
        fork.update(label);
        fork.update(self.challenges.to_le_bytes());
        self.challenges += 1;

        let mut out = [0u8; 64];
        out.copy_from_slice(&fork.finalize());

        self.state.update(b"challenge_out");
        self.state.update(out);
        out
    }

    /// squeeze a uniformly distributed scalar
    pub fn challenge_scalar(&mut self, label: &[u8]) -> Scalar {
        Scalar::from_bytes_mod_order_wide(&self.challenge_bytes(label))
    }

    /// squeeze `count` independent challenge bits
    pub fn challenge_bits(&mut self, label: &[u8], count: usize) -> Vec<bool> {
        let mut bits = Vec::with_capacity(count);
        while bits.len() < count {
            let block = self.challenge_bytes(label);
            for byte in block {
                for shift in 0..8 {
                    if bits.len() == count {
                        return bits;
                    }
                    bits.push((byte >> shift) & 1 == 1);
                }
            }
        }
        bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_determinism() {
        let mut t1 = Blake2Transcript::new(b"test-domain");
        let mut t2 = Blake2Transcript::new(b"test-domain");

        t1.append_message(b"data", b"hello");
        t2.append_message(b"data", b"hello");

        assert_eq!(t1.challenge_bytes(b"c"), t2.challenge_bytes(b"c"));
    }

    #[test]
    fn test_binding() {
        let mut t1 = Blake2Transcript::new(b"test");
        let mut t2 = Blake2Transcript::new(b"test");

        t1.append_message(b"x", b"a");
        t2.append_message(b"x", b"b");

        assert_ne!(t1.challenge_scalar(b"c"), t2.challenge_scalar(b"c"));
    }

    #[test]
    fn test_domain_separation() {
        let mut t1 = Blake2Transcript::new(b"one");
        let mut t2 = Blake2Transcript::new(b"two");
        assert_ne!(t1.challenge_bytes(b"c"), t2.challenge_bytes(b"c"));
    }

    #[test]
    fn test_repeated_label_differs() {
        let mut t = Blake2Transcript::new(b"test");
        let c1 = t.challenge_bytes(b"same");
        let c2 = t.challenge_bytes(b"same");
        assert_ne!(c1, c2);
    }

    #[test]
    fn test_challenge_bits_length() {
        let mut t = Blake2Transcript::new(b"bits");
        assert_eq!(t.challenge_bits(b"b", 7).len(), 7);
        assert_eq!(t.challenge_bits(b"b", 600).len(), 600);

        // 600 fair coins landing all on one side would be a broken squeeze
        let bits = t.challenge_bits(b"b", 600);
        assert!(bits.iter().any(|b| *b));
        assert!(bits.iter().any(|b| !*b));
    }
}
