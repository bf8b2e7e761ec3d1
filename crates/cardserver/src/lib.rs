//! peer-to-peer card dealing server
//!
//! N mutually distrusting peers deal a 52 card deck between them over
//! authenticated, encrypted channels. each peer learns only its own cards
//! and every card disclosed later is checked against the committed deck.
//!
//! ```text
//!   controller --(multipart/tcp)--> ControlServer --> Engine
//!                                                       |
//!                                                    Session --(Link per peer)--> other peers
//! ```

pub mod channel;
pub mod config;
pub mod control;
pub mod deal;
pub mod directory;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod session;

pub use channel::TransportContext;
pub use config::Settings;
pub use control::{Command, ControlServer};
pub use directory::PeerEntry;
pub use engine::{Engine, Phase, Slots};
pub use error::{Error, Result};
