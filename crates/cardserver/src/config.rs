//! engine settings and key material

use std::path::Path;
use std::time::Duration;

use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{Error, Result};

/// tunables for one engine
#[derive(Clone, Debug)]
pub struct Settings {
    /// cut-and-choose rounds per shuffle proof (soundness 2^-rounds)
    pub shuffle_rounds: usize,
    /// deadline for opening every channel during init
    pub connect_timeout: Duration,
    /// deadline for a barrier (announcements, one shuffle round)
    pub round_timeout: Duration,
    /// deadline for a single share or reveal request
    pub request_timeout: Duration,
    /// how long the responder holds a reveal request for the local
    /// controller to allow it
    pub grant_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            shuffle_rounds: 40,
            connect_timeout: Duration::from_secs(10),
            round_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
            grant_timeout: Duration::from_secs(10),
        }
    }
}

fn decode_key(hex_key: &str, what: &str) -> Result<[u8; 32]> {
    let hex_key = hex_key.trim();
    let hex_key = hex_key.strip_prefix("0x").unwrap_or(hex_key);
    let bytes = hex::decode(hex_key).map_err(|e| Error::Config(format!("{what}: {e}")))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| Error::Config(format!("{what}: expected 32 bytes, got {}", b.len())))
}

/// x25519 secret key from 64 hex characters
pub fn parse_secret_key(hex_key: &str) -> Result<StaticSecret> {
    decode_key(hex_key, "secret key").map(StaticSecret::from)
}

/// x25519 secret key stored as hex in a file
pub fn load_secret_key(path: &Path) -> Result<StaticSecret> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
    parse_secret_key(&contents)
}

/// pinned peer key from a `serverKey` entry
pub fn parse_public_key(hex_key: &str) -> Result<[u8; 32]> {
    decode_key(hex_key, "server key")
}

/// public half of a secret key, hex encoded
pub fn public_key_hex(secret: &StaticSecret) -> String {
    hex::encode(PublicKey::from(secret).as_bytes())
}
