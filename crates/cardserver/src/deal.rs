//! a settled deal and the openings verified against it

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use card_shuffle::{reveal_card, Card, Ciphertext, DecryptionShare, N_CARDS};
use curve25519_dalek::ristretto::RistrettoPoint;
use tokio::sync::{watch, Mutex};

use crate::protocol::WireOpening;

/// running digest of one shuffle round; every peer must end on the same value
pub struct ChainDigest(blake3::Hasher);

impl ChainDigest {
    pub fn new(round: u64) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"cardserver.deck.v1");
        hasher.update(&round.to_le_bytes());
        Self(hasher)
    }

    pub fn absorb(&mut self, step: usize, deck: &[[u8; 64]]) {
        self.0.update(&(step as u64).to_le_bytes());
        for card in deck {
            self.0.update(card);
        }
    }

    pub fn finish(&self) -> [u8; 32] {
        *self.0.finalize().as_bytes()
    }
}

/// one card opened with a proven share from every peer, in peer order
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Opening {
    pub position: usize,
    pub card: Card,
    pub shares: Vec<DecryptionShare>,
}

impl Opening {
    pub fn to_wire(&self) -> WireOpening {
        WireOpening {
            position: self.position as u8,
            card: self.card.index() as u8,
            shares: self.shares.iter().map(DecryptionShare::to_bytes).collect(),
        }
    }

    /// decode only; `Deal::verify_opening` does the checking
    pub fn from_wire(wire: &WireOpening) -> Result<Self, &'static str> {
        let card = Card::from_index(wire.card as usize).ok_or("card index out of range")?;
        let shares = wire
            .shares
            .iter()
            .map(|bytes| DecryptionShare::from_bytes(bytes).ok_or("malformed decryption share"))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            position: wire.position as usize,
            card,
            shares,
        })
    }
}

/// positions the local controller allowed the responder to disclose
#[derive(Debug, Default)]
pub struct Grants {
    /// `revealall`: any peer may learn these, directly or relayed
    public: BTreeSet<usize>,
    /// `reveal`: positions one peer may learn, by its order
    private: HashMap<usize, BTreeSet<usize>>,
}

impl Grants {
    pub fn allows(&self, peer: usize, position: usize, relay: bool) -> bool {
        self.public.contains(&position)
            || (!relay && self.private.get(&peer).is_some_and(|p| p.contains(&position)))
    }
}

/// the committed deck of one shuffle round
#[derive(Debug)]
pub struct Deal {
    pub round: u64,
    pub deck: Vec<Ciphertext>,
    pub digest: [u8; 32],
    /// verified openings, filled lazily by draw, reveal and the responder
    openings: Mutex<HashMap<usize, Opening>>,
    grants: watch::Sender<Grants>,
}

impl Deal {
    pub fn new(round: u64, deck: Vec<Ciphertext>, digest: [u8; 32]) -> Self {
        Self {
            round,
            deck,
            digest,
            openings: Mutex::new(HashMap::new()),
            grants: watch::channel(Grants::default()).0,
        }
    }

    /// binds a decryption share to this deal, one position and its producer
    pub fn share_context(&self, position: usize, producer: usize) -> Vec<u8> {
        let mut context = Vec::with_capacity(48);
        context.extend_from_slice(b"cardserver.share.v1");
        context.extend_from_slice(&self.digest);
        context.extend_from_slice(&(position as u16).to_le_bytes());
        context.extend_from_slice(&(producer as u16).to_le_bytes());
        context
    }

    pub fn verify_share(
        &self,
        publics: &[RistrettoPoint],
        position: usize,
        producer: usize,
        share: &DecryptionShare,
    ) -> bool {
        match (self.deck.get(position), publics.get(producer)) {
            (Some(ct), Some(public)) => {
                share.verify(&self.share_context(position, producer), public, ct)
            }
            _ => false,
        }
    }

    /// check every share and that they unmask to the claimed card
    pub fn verify_opening(&self, publics: &[RistrettoPoint], opening: &Opening) -> Result<(), String> {
        if opening.position >= N_CARDS {
            return Err(format!("position {} out of range", opening.position));
        }
        if opening.shares.len() != publics.len() {
            return Err(format!(
                "{} decryption shares, expected {}",
                opening.shares.len(),
                publics.len()
            ));
        }
        for (producer, share) in opening.shares.iter().enumerate() {
            if !self.verify_share(publics, opening.position, producer, share) {
                return Err(format!("decryption share of peer #{producer} does not verify"));
            }
        }
        match reveal_card(&self.deck[opening.position], &opening.shares) {
            Some(card) if card == opening.card => Ok(()),
            Some(card) => Err(format!(
                "claimed {} but the commitment opens to {card}",
                opening.card
            )),
            None => Err("shares do not open the commitment to any card".into()),
        }
    }

    pub async fn opening(&self, position: usize) -> Option<Opening> {
        self.openings.lock().await.get(&position).cloned()
    }

    pub async fn record(&self, opening: Opening) {
        self.openings.lock().await.entry(opening.position).or_insert(opening);
    }

    /// let every peer learn `positions`
    pub fn publish(&self, positions: &[usize]) {
        self.grants.send_modify(|grants| grants.public.extend(positions));
    }

    /// let the peer at `peer` learn `positions`
    pub fn grant(&self, peer: usize, positions: &[usize]) {
        self.grants.send_modify(|grants| {
            grants.private.entry(peer).or_default().extend(positions);
        });
    }

    /// wait until `peer` may learn every position, or hand back the first
    /// one still withheld once `timeout` runs out
    pub async fn granted(
        &self,
        peer: usize,
        positions: &[usize],
        relay: bool,
        timeout: Duration,
    ) -> Result<(), usize> {
        let mut rx = self.grants.subscribe();
        let allowed = async {
            rx.wait_for(|g| positions.iter().all(|&p| g.allows(peer, p, relay)))
                .await
                .map(|_| ())
        };
        if let Ok(Ok(())) = tokio::time::timeout(timeout, allowed).await {
            return Ok(());
        }
        let grants = self.grants.borrow();
        Err(positions
            .iter()
            .copied()
            .find(|&p| !grants.allows(peer, p, relay))
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use card_shuffle::{aggregate_key, elgamal::open_deck, shuffle_deck, KeyShare};
    use rand::rngs::OsRng;

    fn dealt(peers: usize) -> (Vec<KeyShare>, Vec<RistrettoPoint>, Deal) {
        let keys: Vec<_> = (0..peers).map(|_| KeyShare::generate(&mut OsRng)).collect();
        let publics: Vec<_> = keys.iter().map(KeyShare::public).collect();
        let (deck, _) = shuffle_deck(&open_deck(), &aggregate_key(&publics), &mut OsRng);
        (keys, publics, Deal::new(1, deck, [3; 32]))
    }

    fn open(keys: &[KeyShare], deal: &Deal, position: usize) -> Opening {
        let ct = &deal.deck[position];
        let shares: Vec<_> = keys
            .iter()
            .enumerate()
            .map(|(i, k)| k.decryption_share(&deal.share_context(position, i), ct, &mut OsRng))
            .collect();
        let card = reveal_card(ct, &shares).unwrap();
        Opening {
            position,
            card,
            shares,
        }
    }

    #[test]
    fn test_honest_opening_verifies() {
        let (keys, publics, deal) = dealt(2);
        let opening = open(&keys, &deal, 5);
        deal.verify_opening(&publics, &opening).unwrap();

        let wire = opening.to_wire();
        assert_eq!(Opening::from_wire(&wire).unwrap(), opening);
    }

    #[test]
    fn test_substituted_card_rejected() {
        let (keys, publics, deal) = dealt(2);
        let mut opening = open(&keys, &deal, 5);
        opening.card = Card::from_index((opening.card.index() + 1) % N_CARDS).unwrap();
        let err = deal.verify_opening(&publics, &opening).unwrap_err();
        assert!(err.contains("commitment opens to"));
    }

    #[test]
    fn test_share_moved_between_positions_rejected() {
        let (keys, publics, deal) = dealt(2);
        let mut opening = open(&keys, &deal, 5);
        let other = open(&keys, &deal, 6);
        opening.shares[1] = other.shares[1];
        assert!(deal.verify_opening(&publics, &opening).is_err());
    }

    #[test]
    fn test_missing_share_rejected() {
        let (keys, publics, deal) = dealt(3);
        let mut opening = open(&keys, &deal, 0);
        opening.shares.pop();
        assert!(deal.verify_opening(&publics, &opening).is_err());
    }

    #[test]
    fn test_chain_digest_depends_on_every_step() {
        let deck = vec![[1u8; 64]; 3];
        let mut a = ChainDigest::new(1);
        let mut b = ChainDigest::new(1);
        a.absorb(0, &deck);
        b.absorb(0, &deck);
        assert_eq!(a.finish(), b.finish());

        b.absorb(1, &deck);
        assert_ne!(a.finish(), b.finish());
        assert_ne!(ChainDigest::new(1).finish(), ChainDigest::new(2).finish());
    }

    #[tokio::test]
    async fn test_grants() {
        let (_, _, deal) = dealt(4);
        let wait = Duration::from_millis(50);
        assert_eq!(deal.granted(1, &[13, 14], false, wait).await, Err(13));

        deal.grant(1, &[13, 14]);
        assert_eq!(deal.granted(1, &[13, 14], false, wait).await, Ok(()));
        // private grants are never relayed, nor shown to anyone else
        assert_eq!(deal.granted(1, &[13], true, wait).await, Err(13));
        assert_eq!(deal.granted(2, &[14], false, wait).await, Err(14));

        deal.publish(&[14]);
        assert_eq!(deal.granted(2, &[14], true, wait).await, Ok(()));
        assert_eq!(deal.granted(2, &[14, 15], false, wait).await, Err(15));
    }

    #[tokio::test]
    async fn test_granted_waits_for_the_controller() {
        let (_, _, deal) = dealt(2);
        let deal = std::sync::Arc::new(deal);
        let waiting = {
            let deal = deal.clone();
            tokio::spawn(async move { deal.granted(0, &[30], false, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        deal.grant(0, &[30]);
        assert_eq!(waiting.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_record_keeps_first_opening() {
        let (keys, _, deal) = dealt(2);
        let first = open(&keys, &deal, 9);
        deal.record(first.clone()).await;
        deal.record(open(&keys, &deal, 9)).await;
        assert_eq!(deal.opening(9).await, Some(first));
        assert_eq!(deal.opening(10).await, None);
    }
}
