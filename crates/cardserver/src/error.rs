//! error types for the card server

use thiserror::Error;

use crate::channel::ChannelError;
use crate::engine::Phase;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("authentication with {peer} failed: {reason}")]
    Authentication { peer: String, reason: String },

    #[error("protocol violation by {peer}: {reason}")]
    Protocol { peer: String, reason: String },

    #[error("incomplete shuffle: nothing from {}", missing.join(", "))]
    IncompleteShuffle { missing: Vec<String> },

    #[error("verification of {peer} failed: {reason}")]
    Verification { peer: String, reason: String },

    #[error("inconsistent disclosures at position {position}: {first} vs {second}")]
    Consistency {
        position: usize,
        first: String,
        second: String,
    },

    #[error("invalid state: expected {expected}, engine is {actual}")]
    State { expected: &'static str, actual: Phase },

    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    #[error("invalid position {0}, positions are 0..52")]
    InvalidPosition(usize),

    #[error("transport error with {peer}: {source}")]
    Transport {
        peer: String,
        #[source]
        source: ChannelError,
    },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("engine terminated")]
    Terminated,
}

impl Error {
    /// stable tag reported to control clients
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Authentication { .. } => "authentication",
            Self::Protocol { .. } => "protocol",
            Self::IncompleteShuffle { .. } => "incomplete_shuffle",
            Self::Verification { .. } => "verification",
            Self::Consistency { .. } => "consistency",
            Self::State { .. } => "state",
            Self::UnknownPeer(_) => "unknown_peer",
            Self::InvalidPosition(_) => "invalid_position",
            Self::Transport { .. } => "transport",
            Self::Timeout(_) => "timeout",
            Self::Terminated => "terminated",
        }
    }

    /// attribute a channel failure to a peer, lifting key failures to
    /// authentication errors
    pub fn channel(peer: impl Into<String>, source: ChannelError) -> Self {
        let peer = peer.into();
        match source {
            ChannelError::Authentication(reason) => Self::Authentication { peer, reason },
            source => Self::Transport { peer, source },
        }
    }

    pub fn protocol(peer: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Protocol {
            peer: peer.into(),
            reason: reason.into(),
        }
    }

    pub fn verification(peer: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Verification {
            peer: peer.into(),
            reason: reason.into(),
        }
    }
}
