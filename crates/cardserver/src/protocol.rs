//! protocol - peer wire messages
//!
//! everything a peer sends after the handshake is one SCALE-encoded
//! `WireMessage` per sealed frame. pushes drive init and the shuffle
//! barrier; requests and responses are correlated by id and answered by
//! the remote responder without involving its controller.

use parity_scale_codec::{Decode, Encode};

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub enum WireMessage {
    Push(Push),
    Request { id: u64, body: Request },
    Response { id: u64, body: Response },
}

/// broadcast steps of init and shuffle
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub enum Push {
    Announce(Announce),
    Shuffle(ShuffleStep),
    Commit(DeckCommit),
}

/// sent once per session after every channel is ready
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct Announce {
    pub order: u16,
    /// blake3 over every peer's static channel key, by order
    pub roster: [u8; 32],
    /// this peer's share of the joint masking key
    pub key_share: [u8; 32],
    /// proof of possession bound to the roster
    pub proof: [u8; 64],
}

/// one peer's permute-and-remask step
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct ShuffleStep {
    pub round: u64,
    pub deck: Vec<[u8; 64]>,
    /// encoded cut-and-choose proof
    pub proof: Vec<u8>,
}

/// digest of the whole shuffle chain as seen by the sender
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct DeckCommit {
    pub round: u64,
    pub digest: [u8; 32],
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub enum Request {
    /// decryption shares for positions the requester owns
    Shares { round: u64, positions: Vec<u8> },
    /// openings the responder owns, or with `relay` any it can verify
    Reveal {
        round: u64,
        positions: Vec<u8>,
        relay: bool,
    },
}

impl Request {
    pub fn round(&self) -> u64 {
        match self {
            Self::Shares { round, .. } | Self::Reveal { round, .. } => *round,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub enum Response {
    Shares(Vec<WireShare>),
    Openings(Vec<WireOpening>),
    Refused(Refusal),
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct WireShare {
    pub position: u8,
    pub share: [u8; 128],
}

/// a card with one proven decryption share per peer, in peer order
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct WireOpening {
    pub position: u8,
    pub card: u8,
    pub shares: Vec<[u8; 128]>,
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub enum Refusal {
    /// the request names a round older than the responder's deal
    Stale { current: u64 },
    /// no deal settled within the responder's round timeout
    NotDealt,
    /// shares are only handed to the owner of a position
    NotOwner { position: u8 },
    /// position outside 0..52
    BadPosition { position: u8 },
    /// the responder could not obtain the opening itself
    Unavailable { position: u8 },
    /// the responder's controller never allowed this disclosure
    NotGranted { position: u8 },
}

impl std::fmt::Display for Refusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stale { current } => write!(f, "stale round, responder is at round {current}"),
            Self::NotDealt => write!(f, "no settled deal for the requested round"),
            Self::NotOwner { position } => write!(f, "not entitled to position {position}"),
            Self::BadPosition { position } => write!(f, "invalid position {position}"),
            Self::Unavailable { position } => write!(f, "opening for position {position} unavailable"),
            Self::NotGranted { position } => write!(f, "position {position} was not disclosed to this peer"),
        }
    }
}

impl WireMessage {
    pub fn encode_to_vec(&self) -> Vec<u8> {
        self.encode()
    }

    pub fn decode_from_slice(data: &[u8]) -> Result<Self, parity_scale_codec::Error> {
        Self::decode(&mut &data[..])
    }
}
