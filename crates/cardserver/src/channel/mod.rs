//! secure channels between peers
//!
//! one tcp connection per peer pair, authenticated with x25519 static keys
//! and encrypted with chacha20poly1305 under per-direction keys. see
//! `handshake` for key agreement, `frame` for the record layer and `link`
//! for the running channel.

pub mod frame;
pub mod handshake;
pub mod link;

use std::net::SocketAddr;

use thiserror::Error;
use tokio::net::TcpListener;
use x25519_dalek::{PublicKey, StaticSecret};

pub use handshake::Established;
pub use link::{Link, Routes};

/// channel lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Authenticated,
    Ready,
    Closed,
}

impl ChannelState {
    /// forward-only transitions, `Closed` is terminal
    pub fn advance(self, next: ChannelState) -> Result<ChannelState, ChannelError> {
        use ChannelState::*;
        match (self, next) {
            (Connecting, Authenticated) | (Authenticated, Ready) => Ok(next),
            (Connecting | Authenticated | Ready, Closed) => Ok(Closed),
            (from, to) => Err(ChannelError::InvalidTransition { from, to }),
        }
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    Closed,

    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    #[error("frame failed to decrypt")]
    Decrypt,

    #[error("nonce counter exhausted")]
    NonceExhausted,

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("{0}")]
    Authentication(String),

    #[error("invalid channel transition {from:?} -> {to:?}")]
    InvalidTransition { from: ChannelState, to: ChannelState },

    #[error("request timed out")]
    Timeout,
}

/// owns the local static key and the listener peers dial into
///
/// constructed explicitly at startup and handed to the engine; nothing
/// about the transport lives in global state.
pub struct TransportContext {
    secret: StaticSecret,
    public: PublicKey,
    listener: TcpListener,
}

impl TransportContext {
    pub async fn bind(addr: &str, secret: StaticSecret) -> Result<Self, ChannelError> {
        let listener = TcpListener::bind(addr).await?;
        let public = PublicKey::from(&secret);
        Ok(Self {
            secret,
            public,
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ChannelError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    pub(crate) fn listener(&self) -> &TcpListener {
        &self.listener
    }
}
