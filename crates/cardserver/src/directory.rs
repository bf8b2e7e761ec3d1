//! peer directory - who sits where, how to reach them, which key to expect
//!
//! built once per session from the `init` peer list. order decides turn
//! order in the shuffle and the contiguous block of positions each peer
//! owns. the lower-order peer of every pair dials the higher one, so only
//! peers above us need an endpoint.

use std::collections::HashSet;
use std::ops::Range;

use card_shuffle::N_CARDS;
use serde::Deserialize;

use crate::config::parse_public_key;
use crate::error::{Error, Result};

/// one peer as given to `init`
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct PeerEntry {
    #[serde(alias = "identity")]
    pub id: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    /// hex x25519 key the peer must prove during the handshake
    #[serde(default, rename = "serverKey", alias = "server_key")]
    pub server_key: Option<String>,
}

impl PeerEntry {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoint: None,
            server_key: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_server_key(mut self, key: impl Into<String>) -> Self {
        self.server_key = Some(key.into());
        self
    }
}

/// a remote peer with its agreed order
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Peer {
    pub order: usize,
    pub identity: String,
    pub endpoint: Option<String>,
    pub server_key: Option<[u8; 32]>,
}

#[derive(Clone, Debug)]
pub struct PeerDirectory {
    self_order: usize,
    /// indexed by order, `None` at our own slot
    slots: Vec<Option<Peer>>,
}

impl PeerDirectory {
    /// validate an `init` peer list
    ///
    /// `peers` is either the N-1 remote peers in order, with `order` naming
    /// our slot, or all N slots with `None` standing in for ourselves.
    pub fn initialize(order: Option<usize>, peers: Vec<Option<PeerEntry>>) -> Result<Self> {
        let holes: Vec<usize> = peers
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_none())
            .map(|(i, _)| i)
            .collect();

        let (self_order, n, remotes) = match holes.as_slice() {
            [] => {
                let order = order
                    .ok_or_else(|| Error::Config("order is required when peers omits the local slot".into()))?;
                let n = peers.len() + 1;
                if order >= n {
                    return Err(Error::Config(format!("order {order} out of range [0, {n})")));
                }
                let remotes = peers
                    .into_iter()
                    .flatten()
                    .enumerate()
                    .map(|(e, entry)| (e + usize::from(order <= e), entry))
                    .collect::<Vec<_>>();
                (order, n, remotes)
            }
            [hole] => {
                let hole = *hole;
                let n = peers.len();
                if let Some(order) = order {
                    if order >= n {
                        return Err(Error::Config(format!("order {order} out of range [0, {n})")));
                    }
                    if order != hole {
                        return Err(Error::Config(format!(
                            "order {order} disagrees with the local slot {hole} in peers"
                        )));
                    }
                }
                let remotes = peers
                    .into_iter()
                    .enumerate()
                    .filter_map(|(i, entry)| entry.map(|entry| (i, entry)))
                    .collect::<Vec<_>>();
                (hole, n, remotes)
            }
            _ => return Err(Error::Config("peers may leave only the local slot empty".into())),
        };

        if n < 2 {
            return Err(Error::Config("at least two peers are required".into()));
        }
        if N_CARDS % n != 0 {
            return Err(Error::Config(format!("{n} peers cannot split {N_CARDS} cards evenly")));
        }

        let mut seen = HashSet::new();
        let mut slots = vec![None; n];
        for (slot, entry) in remotes {
            if entry.id.is_empty() {
                return Err(Error::Config(format!("peer at order {slot} has an empty id")));
            }
            if !seen.insert(entry.id.clone()) {
                return Err(Error::Config(format!("duplicate peer id {}", entry.id)));
            }
            let endpoint = entry.endpoint.as_deref().map(normalize_endpoint);
            if slot > self_order && endpoint.is_none() {
                return Err(Error::Config(format!(
                    "no endpoint for {} (order {slot}), which this peer must dial",
                    entry.id
                )));
            }
            let server_key = entry.server_key.as_deref().map(parse_public_key).transpose()?;
            slots[slot] = Some(Peer {
                order: slot,
                identity: entry.id,
                endpoint,
                server_key,
            });
        }

        Ok(Self { self_order, slots })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn self_order(&self) -> usize {
        self.self_order
    }

    /// remote peer at `order`; `None` for ourselves
    pub fn peer(&self, order: usize) -> Option<&Peer> {
        self.slots.get(order).and_then(Option::as_ref)
    }

    pub fn remotes(&self) -> impl Iterator<Item = &Peer> {
        self.slots.iter().flatten()
    }

    pub fn by_identity(&self, identity: &str) -> Option<&Peer> {
        self.remotes().find(|p| p.identity == identity)
    }

    /// display name for any order, ourselves included
    pub fn name(&self, order: usize) -> String {
        match self.peer(order) {
            Some(peer) => peer.identity.clone(),
            None => format!("self#{order}"),
        }
    }

    pub fn hand_size(&self) -> usize {
        N_CARDS / self.len()
    }

    /// half-open block of positions dealt to `order`
    pub fn owned_range(&self, order: usize) -> Range<usize> {
        let size = self.hand_size();
        order * size..(order + 1) * size
    }

    pub fn owner_of(&self, position: usize) -> usize {
        position / self.hand_size()
    }
}

/// accept both `host:port` and `tcp://host:port`
pub fn normalize_endpoint(endpoint: &str) -> String {
    endpoint
        .strip_prefix("tcp://")
        .unwrap_or(endpoint)
        .to_string()
}
