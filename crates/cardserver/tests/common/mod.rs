//! shared table setup for the loopback tests

#![allow(dead_code)]

use std::time::Duration;

use cardserver::{Engine, PeerEntry, Settings, TransportContext};
use x25519_dalek::StaticSecret;

pub fn settings() -> Settings {
    Settings {
        shuffle_rounds: 4,
        connect_timeout: Duration::from_secs(10),
        round_timeout: Duration::from_secs(30),
        request_timeout: Duration::from_secs(30),
        grant_timeout: Duration::from_secs(10),
    }
}

pub fn identity(order: usize) -> String {
    format!("peer{}", order + 1)
}

/// `n` engines on loopback, bound but not initialized
pub async fn table(n: usize, settings: Settings) -> Vec<Engine> {
    let mut engines = Vec::with_capacity(n);
    for i in 0..n {
        let secret = StaticSecret::from([i as u8 + 1; 32]);
        let transport = TransportContext::bind("127.0.0.1:0", secret).await.unwrap();
        engines.push(Engine::new(transport, settings.clone()));
    }
    engines
}

/// the `init` peer list as seen by `order`, with `None` at its own slot
pub fn peer_list(engines: &[Engine], order: usize) -> Vec<Option<PeerEntry>> {
    engines
        .iter()
        .enumerate()
        .map(|(j, engine)| {
            (j != order).then(|| {
                PeerEntry::new(identity(j))
                    .with_endpoint(format!("tcp://{}", engine.local_addr().unwrap()))
                    .with_server_key(hex::encode(engine.public_key()))
            })
        })
        .collect()
}

pub async fn init_all(engines: &[Engine]) {
    let inits = engines
        .iter()
        .enumerate()
        .map(|(i, engine)| engine.init(None, peer_list(engines, i)));
    for result in futures::future::join_all(inits).await {
        result.unwrap();
    }
}

pub async fn shuffle_all(engines: &[Engine]) {
    let shuffles = engines.iter().map(Engine::shuffle);
    for result in futures::future::join_all(shuffles).await {
        result.unwrap();
    }
}
