//! engine - the dealing state machine driven by the control interface
//!
//! phases move Idle -> Initialized -> Shuffled -> (Drawn | Revealing) and
//! end in Terminated. `init` and `shuffle` hold the gate exclusively;
//! draws and reveals share it and lock the positions they touch, in
//! ascending order, so overlapping ranges serialize.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use card_shuffle::{Card, N_CARDS};
use tokio::sync::{watch, Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::channel::TransportContext;
use crate::config::Settings;
use crate::deal::{Deal, Opening};
use crate::directory::{PeerDirectory, PeerEntry};
use crate::error::{Error, Result};
use crate::session::Session;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Initialized,
    Shuffled,
    Drawn,
    Revealing,
    Terminated,
}

impl Phase {
    fn is_dealt(self) -> bool {
        matches!(self, Self::Shuffled | Self::Drawn | Self::Revealing)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "Idle",
            Self::Initialized => "Initialized",
            Self::Shuffled => "Shuffled",
            Self::Drawn => "Drawn",
            Self::Revealing => "Revealing",
            Self::Terminated => "Terminated",
        };
        f.write_str(name)
    }
}

/// one slot per deck position, `None` where nothing was resolved
pub type Slots = Vec<Option<Card>>;

struct Inner {
    transport: TransportContext,
    settings: Settings,
    gate: RwLock<()>,
    phase: std::sync::Mutex<Phase>,
    session: std::sync::Mutex<Option<Arc<Session>>>,
    positions: Vec<Mutex<()>>,
    shutdown: watch::Sender<bool>,
}

/// cheap to clone; every clone drives the same engine
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    pub fn new(transport: TransportContext, settings: Settings) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                transport,
                settings,
                gate: RwLock::new(()),
                phase: std::sync::Mutex::new(Phase::Idle),
                session: std::sync::Mutex::new(None),
                positions: (0..N_CARDS).map(|_| Mutex::new(())).collect(),
                shutdown,
            }),
        }
    }

    pub fn phase(&self) -> Phase {
        *self.inner.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// address peers dial into
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner
            .transport
            .local_addr()
            .map_err(|e| Error::channel("listener", e))
    }

    /// static channel key, what peers pin as `serverKey`
    pub fn public_key(&self) -> [u8; 32] {
        self.inner.transport.public_key()
    }

    pub fn is_terminated(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// resolves once `terminate` has been called
    pub async fn terminated(&self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        let _ = shutdown.wait_for(|stop| *stop).await;
    }

    fn set_phase(&self, next: Phase) {
        let mut phase = self.inner.phase.lock().unwrap_or_else(|e| e.into_inner());
        if *phase != Phase::Terminated {
            debug!(from = %*phase, to = %next, "phase");
            *phase = next;
        }
    }

    fn session(&self) -> Result<Arc<Session>> {
        self.inner
            .session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(Error::Terminated)
    }

    /// run `op` unless terminate fires first
    async fn guarded<T>(&self, op: impl Future<Output = Result<T>>) -> Result<T> {
        let mut shutdown = self.inner.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return Err(Error::Terminated);
        }
        tokio::select! {
            result = op => result,
            _ = shutdown.wait_for(|stop| *stop) => Err(Error::Terminated),
        }
    }

    /// open every channel and agree on the roster and joint key
    ///
    /// `peers` takes either form `PeerDirectory::initialize` accepts. any
    /// failure leaves the engine Idle with no channel open.
    pub async fn init(&self, order: Option<usize>, peers: Vec<Option<PeerEntry>>) -> Result<()> {
        self.guarded(async {
            let _gate = self.inner.gate.write().await;
            let phase = self.phase();
            if phase != Phase::Idle {
                return Err(Error::State {
                    expected: "Idle",
                    actual: phase,
                });
            }

            let directory = PeerDirectory::initialize(order, peers)?;
            info!(
                order = directory.self_order(),
                peers = directory.len(),
                "initializing session"
            );
            let session = Session::establish(
                &self.inner.transport,
                directory,
                self.inner.settings.clone(),
            )
            .await
            .inspect_err(|e| warn!(error = %e, "init failed"))?;

            {
                let mut slot = self.inner.session.lock().unwrap_or_else(|e| e.into_inner());
                if self.is_terminated() {
                    session.close();
                    return Err(Error::Terminated);
                }
                *slot = Some(session);
            }
            self.set_phase(Phase::Initialized);
            info!("session initialized");
            Ok(())
        })
        .await
    }

    /// deal a fresh deck; the previous deal and its openings are dropped
    pub async fn shuffle(&self) -> Result<()> {
        self.guarded(async {
            let _gate = self.inner.gate.write().await;
            let phase = self.phase();
            if phase == Phase::Idle || phase == Phase::Terminated {
                return Err(Error::State {
                    expected: "Initialized",
                    actual: phase,
                });
            }
            let session = self.session()?;
            self.set_phase(Phase::Initialized);

            info!("shuffling");
            match session.shuffle().await {
                Ok(deal) => {
                    info!(round = deal.round, digest = %hex::encode(deal.digest), "shuffle complete");
                    self.set_phase(Phase::Shuffled);
                    Ok(())
                }
                Err(e) => {
                    warn!(error = %e, "shuffle failed");
                    Err(e)
                }
            }
        })
        .await
    }

    fn dealt(&self) -> Result<(Arc<Session>, Arc<Deal>)> {
        let phase = self.phase();
        if !phase.is_dealt() {
            return Err(Error::State {
                expected: "Shuffled",
                actual: phase,
            });
        }
        let session = self.session()?;
        let deal = session.deal().ok_or(Error::State {
            expected: "Shuffled",
            actual: Phase::Initialized,
        })?;
        Ok((session, deal))
    }

    async fn lock_positions(&self, positions: &[usize]) -> Vec<MutexGuard<'_, ()>> {
        let mut guards = Vec::with_capacity(positions.len());
        for &position in positions {
            guards.push(self.inner.positions[position].lock().await);
        }
        guards
    }

    /// open our own cards among `positions`; the rest stay `None`
    pub async fn draw(&self, positions: &[usize]) -> Result<Slots> {
        let positions = normalize(positions)?;
        self.guarded(async {
            let _gate = self.inner.gate.read().await;
            let (session, deal) = self.dealt()?;
            let me = session.directory().self_order();
            let owned: Vec<usize> = positions
                .into_iter()
                .filter(|&p| session.directory().owner_of(p) == me)
                .collect();

            let _locks = self.lock_positions(&owned).await;
            let openings = session.open_owned(&deal, &owned).await?;
            debug!(round = deal.round, count = openings.len(), "drew cards");
            self.advance(Phase::Drawn);
            Ok(slots(&openings))
        })
        .await
    }

    /// exchange cards with `identity` among `positions`
    ///
    /// our own cards in `positions` become visible to `identity`; its cards
    /// in `positions` are requested, verified against the committed deck
    /// and returned. `identity` has to allow them with its own `reveal`
    /// naming us (or a `revealall`), otherwise the call fails.
    pub async fn reveal(&self, identity: &str, positions: &[usize]) -> Result<Slots> {
        let positions = normalize(positions)?;
        self.guarded(async {
            let _gate = self.inner.gate.read().await;
            let (session, deal) = self.dealt()?;
            let directory = session.directory();
            let peer = directory
                .by_identity(identity)
                .ok_or_else(|| Error::UnknownPeer(identity.to_string()))?
                .order;
            let me = directory.self_order();
            let (mine, theirs): (Vec<usize>, Vec<usize>) = positions
                .into_iter()
                .filter(|&p| [me, peer].contains(&directory.owner_of(p)))
                .partition(|&p| directory.owner_of(p) == me);

            if !mine.is_empty() {
                deal.grant(peer, &mine);
                debug!(peer = identity, count = mine.len(), "allowed disclosure");
            }
            let _locks = self.lock_positions(&theirs).await;
            self.advance(Phase::Revealing);
            let openings = session
                .request_openings(&deal, peer, &theirs, false)
                .await
                .inspect_err(|e| warn!(peer = identity, error = %e, "reveal failed"))?;
            info!(peer = identity, round = deal.round, count = openings.len(), "revealed");
            Ok(slots(&openings))
        })
        .await
    }

    /// every peer discloses `positions`; all disclosures must agree
    ///
    /// makes `positions` public on our side too. the call only completes
    /// once every peer has issued `revealall` for the range.
    pub async fn reveal_all(&self, positions: &[usize]) -> Result<Slots> {
        let positions = normalize(positions)?;
        self.guarded(async {
            let _gate = self.inner.gate.read().await;
            let (session, deal) = self.dealt()?;
            deal.publish(&positions);

            let _locks = self.lock_positions(&positions).await;
            self.advance(Phase::Revealing);
            let openings = session
                .reveal_all(&deal, &positions)
                .await
                .inspect_err(|e| warn!(error = %e, "reveal all failed"))?;
            info!(round = deal.round, count = openings.len(), "revealed to all");
            Ok(slots(&openings))
        })
        .await
    }

    /// move between the dealt phases; never back out of them
    fn advance(&self, next: Phase) {
        if self.phase().is_dealt() {
            self.set_phase(next);
        }
    }

    /// interrupt in-flight work, close every channel, stop. idempotent
    pub fn terminate(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        let session = self
            .inner
            .session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(session) = session {
            session.close();
        }
        self.set_phase(Phase::Terminated);
        info!("engine terminated");
    }

    #[cfg(test)]
    pub(crate) fn current_session(&self) -> Option<Arc<Session>> {
        self.session().ok()
    }
}

/// positions sorted and deduplicated; anything past the deck is an error
fn normalize(positions: &[usize]) -> Result<Vec<usize>> {
    let mut unique = BTreeSet::new();
    for &position in positions {
        if position >= N_CARDS {
            return Err(Error::InvalidPosition(position));
        }
        unique.insert(position);
    }
    Ok(unique.into_iter().collect())
}

fn slots(openings: &[Opening]) -> Slots {
    let mut slots = vec![None; N_CARDS];
    for opening in openings {
        slots[opening.position] = Some(opening.card);
    }
    slots
}
