//! session - everything that lives between `init` and `terminate`
//!
//! owns the ready links, this peer's key share, the announced key shares of
//! everyone else and the current deal. the responder task hands decryption
//! shares to the owner of a position on its own, so nobody needs another
//! controller's help to draw. full openings are only disclosed once the
//! local controller has allowed it, with `reveal` naming the requester or
//! with `revealall`.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use card_shuffle::{
    aggregate_key,
    elgamal::{deck_from_bytes, deck_to_bytes, open_deck},
    keys::point_from_bytes,
    reveal_card, shuffle_deck, Card, Ciphertext, DecryptionShare, KeyProof, KeyShare, ShuffleProof,
    N_CARDS,
};
use curve25519_dalek::ristretto::RistrettoPoint;
use futures::future::try_join_all;
use rand::rngs::OsRng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::channel::handshake::{self, Established};
use crate::channel::link::{Inbound, Link, Routes};
use crate::channel::{ChannelError, ChannelState, TransportContext};
use crate::config::Settings;
use crate::deal::{ChainDigest, Deal, Opening};
use crate::directory::{Peer, PeerDirectory};
use crate::error::{Error, Result};
use crate::protocol::{
    Announce, DeckCommit, Push, Refusal, Request, Response, ShuffleStep, WireShare,
};

const QUEUE_DEPTH: usize = 1024;

/// how far ahead of our round a peer may restart the shuffle
const MAX_ROUND_SKEW: u64 = 16;

/// pushes from every link, with room to park messages for the next round
struct Inbox {
    rx: mpsc::Receiver<(usize, Inbound)>,
    /// replayed before anything new at the start of a round
    replay: VecDeque<(usize, Push)>,
    /// parked during this round for the next one
    deferred: Vec<(usize, Push)>,
}

impl Inbox {
    fn new(rx: mpsc::Receiver<(usize, Inbound)>) -> Self {
        Self {
            rx,
            replay: VecDeque::new(),
            deferred: Vec::new(),
        }
    }

    fn begin_round(&mut self) {
        self.replay.extend(self.deferred.drain(..));
    }

    fn defer(&mut self, from: usize, push: Push) {
        self.deferred.push((from, push));
    }

    /// hand `push` out again before anything else
    fn requeue(&mut self, from: usize, push: Push) {
        self.replay.push_front((from, push));
    }

    async fn next(&mut self) -> Option<(usize, Inbound)> {
        if let Some((from, push)) = self.replay.pop_front() {
            return Some((from, Inbound::Push(push)));
        }
        self.rx.recv().await
    }
}

pub struct Session {
    directory: PeerDirectory,
    settings: Settings,
    roster: [u8; 32],
    key: KeyShare,
    /// every peer's key share, by order
    publics: Vec<RistrettoPoint>,
    joint: RistrettoPoint,
    /// by order, `None` at our own slot
    links: Vec<Option<Arc<Link>>>,
    inbox: Mutex<Inbox>,
    deal: watch::Sender<Option<Arc<Deal>>>,
    responder: OnceLock<AbortHandle>,
    /// highest shuffle round this peer has taken part in
    round: AtomicU64,
}

enum RoundEnd {
    Settled(Arc<Deal>),
    /// a peer gave up on our round and started this later one
    Joined(u64),
}

impl Session {
    /// open every channel, agree on the roster and the joint key, start the
    /// responder
    pub async fn establish(
        transport: &TransportContext,
        directory: PeerDirectory,
        settings: Settings,
    ) -> Result<Arc<Self>> {
        let (pushes, pushes_rx) = mpsc::channel(QUEUE_DEPTH);
        let (requests, requests_rx) = mpsc::channel(QUEUE_DEPTH);
        let routes = Routes { pushes, requests };

        let links = connect_all(transport, &directory, &settings, routes).await?;
        let me = directory.self_order();
        info!(peers = directory.len(), order = me, "all channels ready");

        let statics: Vec<[u8; 32]> = links
            .iter()
            .map(|link| match link {
                Some(link) => link.remote_static(),
                None => transport.public_key(),
            })
            .collect();
        let roster = roster_digest(&statics);

        let key = KeyShare::generate(&mut OsRng);
        let proof = key.prove_possession(&roster, &mut OsRng);
        let announce = Push::Announce(Announce {
            order: me as u16,
            roster,
            key_share: key.public().compress().to_bytes(),
            proof: proof.to_bytes(),
        });
        broadcast(&directory, &links, announce).await?;

        let mut inbox = Inbox::new(pushes_rx);
        let deadline = Instant::now() + settings.round_timeout;
        let publics = collect_announces(&directory, &mut inbox, &roster, key.public(), deadline).await?;
        let joint = aggregate_key(&publics);
        debug!(roster = %hex::encode(roster), "joint key agreed");

        let (deal, _) = watch::channel(None);
        let session = Arc::new(Self {
            directory,
            settings,
            roster,
            key,
            publics,
            joint,
            links,
            inbox: Mutex::new(inbox),
            deal,
            responder: OnceLock::new(),
            round: AtomicU64::new(0),
        });

        let responder = tokio::spawn(Arc::clone(&session).serve(requests_rx));
        let _ = session.responder.set(responder.abort_handle());
        Ok(session)
    }

    pub fn directory(&self) -> &PeerDirectory {
        &self.directory
    }

    /// the settled deal, if the last shuffle completed
    pub fn deal(&self) -> Option<Arc<Deal>> {
        self.deal.borrow().clone()
    }

    fn me(&self) -> usize {
        self.directory.self_order()
    }

    fn link(&self, order: usize) -> Option<&Arc<Link>> {
        self.links.get(order).and_then(Option::as_ref)
    }

    fn remote_links(&self) -> impl Iterator<Item = &Arc<Link>> {
        self.links.iter().flatten()
    }

    /// stop the responder and every channel
    pub fn close(&self) {
        if let Some(responder) = self.responder.get() {
            responder.abort();
        }
        for link in self.remote_links() {
            link.close();
        }
        self.deal.send_replace(None);
    }

    // --- shuffle ---

    fn step_context(&self, round: u64, step: usize) -> Vec<u8> {
        let mut context = Vec::with_capacity(64);
        context.extend_from_slice(b"cardserver.shuffle.v1");
        context.extend_from_slice(&self.roster);
        context.extend_from_slice(&round.to_le_bytes());
        context.extend_from_slice(&(step as u16).to_le_bytes());
        context
    }

    /// deal a fresh deck
    ///
    /// peers shuffle in order; each step is checked by everyone before the
    /// next one is applied. a round settles once all N deck commitments are
    /// in and agree. the round number is agreed on the way: a peer that
    /// retried after a failed shuffle is ahead, and everyone who has not
    /// yet committed joins its round.
    pub async fn shuffle(&self) -> Result<Arc<Deal>> {
        self.deal.send_replace(None);
        for link in self.remote_links() {
            if link.state() == ChannelState::Closed {
                return Err(Error::channel(link.peer(), ChannelError::Closed));
            }
        }

        let mut inbox = self.inbox.lock().await;
        inbox.begin_round();
        let mut round = self.round.load(Ordering::SeqCst) + 1;
        loop {
            self.round.fetch_max(round, Ordering::SeqCst);
            match self.run_round(&mut inbox, round).await? {
                RoundEnd::Settled(deal) => return Ok(deal),
                RoundEnd::Joined(later) => {
                    info!(round, later, "a peer restarted the shuffle, joining its round");
                    inbox.begin_round();
                    round = later;
                }
            }
        }
    }

    async fn run_round(&self, inbox: &mut Inbox, round: u64) -> Result<RoundEnd> {
        let n = self.directory.len();
        let me = self.me();
        let deadline = Instant::now() + self.settings.round_timeout;

        let mut current = Arc::new(open_deck());
        let mut chain = ChainDigest::new(round);
        let mut steps: Vec<Option<ShuffleStep>> = vec![None; n];
        let mut stepped = vec![false; n];
        stepped[me] = true;
        let mut commits: Vec<Option<[u8; 32]>> = vec![None; n];
        let mut digest = None;
        let mut next = 0;

        loop {
            while next < n {
                if next == me {
                    let (deck, step) = self.own_step(round, Arc::clone(&current)).await?;
                    broadcast(&self.directory, &self.links, Push::Shuffle(step.clone())).await?;
                    chain.absorb(me, &step.deck);
                    current = Arc::new(deck);
                } else if let Some(step) = steps[next].take() {
                    let deck = self.check_step(round, next, Arc::clone(&current), &step).await?;
                    chain.absorb(next, &step.deck);
                    current = Arc::new(deck);
                } else {
                    break;
                }
                debug!(round, step = next, "shuffle step accepted");
                next += 1;
            }

            if next == n && digest.is_none() {
                let own = chain.finish();
                commits[me] = Some(own);
                digest = Some(own);
                let commit = Push::Commit(DeckCommit { round, digest: own });
                broadcast(&self.directory, &self.links, commit).await?;
            }
            if let Some(own) = digest {
                if commits.iter().all(Option::is_some) {
                    if let Some(order) = commits.iter().position(|c| *c != Some(own)) {
                        return Err(Error::protocol(
                            self.directory.name(order),
                            "deck commitment disagrees, the shuffle chain was equivocated",
                        ));
                    }
                    let deal = Arc::new(Deal::new(round, current.to_vec(), own));
                    self.deal.send_replace(Some(Arc::clone(&deal)));
                    info!(round, digest = %hex::encode(own), "deck committed");
                    return Ok(RoundEnd::Settled(deal));
                }
            }

            let owing = |stepped: &[bool], commits: &[Option<[u8; 32]>]| -> Vec<String> {
                (0..n)
                    .filter(|&o| o != me && (!stepped[o] || commits[o].is_none()))
                    .map(|o| self.directory.name(o))
                    .collect()
            };
            let (from, inbound) = match timeout_at(deadline, inbox.next()).await {
                Ok(Some(received)) => received,
                Ok(None) => return Err(Error::Terminated),
                Err(_) => {
                    return Err(Error::IncompleteShuffle {
                        missing: owing(&stepped, &commits),
                    })
                }
            };
            let peer = self.directory.name(from);

            let push = match inbound {
                Inbound::Push(push) => push,
                Inbound::Closed if !stepped[from] || commits[from].is_none() => {
                    warn!(%peer, round, "channel closed mid-shuffle");
                    return Err(Error::IncompleteShuffle { missing: vec![peer] });
                }
                Inbound::Closed => continue,
            };
            let push_round = match &push {
                Push::Shuffle(step) => step.round,
                Push::Commit(commit) => commit.round,
                Push::Announce(_) => {
                    return Err(Error::protocol(peer, "announcement after init"));
                }
            };
            if push_round < round {
                warn!(%peer, round, push_round, "discarding message from a past round");
                continue;
            }
            if push_round > round {
                if push_round - round > MAX_ROUND_SKEW {
                    return Err(Error::protocol(
                        peer,
                        format!("message for round {push_round} during round {round}"),
                    ));
                }
                if commits[from].is_some() {
                    // the sender settled this round and already moved on
                    inbox.defer(from, push);
                    continue;
                }
                inbox.requeue(from, push);
                return Ok(RoundEnd::Joined(push_round));
            }

            match push {
                Push::Shuffle(step) => {
                    if stepped[from] {
                        return Err(Error::protocol(peer, "second shuffle step in one round"));
                    }
                    stepped[from] = true;
                    steps[from] = Some(step);
                }
                Push::Commit(commit) => {
                    if !stepped[from] {
                        return Err(Error::protocol(peer, "deck commitment before its shuffle step"));
                    }
                    if commits[from].is_some() {
                        return Err(Error::protocol(peer, "second deck commitment in one round"));
                    }
                    commits[from] = Some(commit.digest);
                }
                Push::Announce(_) => {}
            }
        }
    }

    async fn own_step(
        &self,
        round: u64,
        input: Arc<Vec<Ciphertext>>,
    ) -> Result<(Vec<Ciphertext>, ShuffleStep)> {
        let me = self.me();
        let context = self.step_context(round, me);
        let pk = self.joint;
        let rounds = self.settings.shuffle_rounds;

        let proved = tokio::task::spawn_blocking(move || {
            let (output, witness) = shuffle_deck(&input, &pk, &mut OsRng);
            ShuffleProof::prove(&context, &pk, &input, &output, &witness, rounds, &mut OsRng)
                .map(|proof| (output, proof.to_bytes()))
        })
        .await
        .map_err(|e| Error::protocol(self.directory.name(me), format!("shuffle task failed: {e}")))?;
        let (output, proof) =
            proved.map_err(|e| Error::protocol(self.directory.name(me), e.to_string()))?;

        let step = ShuffleStep {
            round,
            deck: deck_to_bytes(&output),
            proof,
        };
        Ok((output, step))
    }

    async fn check_step(
        &self,
        round: u64,
        from: usize,
        input: Arc<Vec<Ciphertext>>,
        step: &ShuffleStep,
    ) -> Result<Vec<Ciphertext>> {
        let peer = self.directory.name(from);
        let reject = |reason: String| Error::verification(&peer, format!("round {round} shuffle: {reason}"));

        let output = deck_from_bytes(&step.deck).map_err(|e| reject(e.to_string()))?;
        let proof = ShuffleProof::from_bytes(&step.proof).map_err(|e| reject(e.to_string()))?;

        let context = self.step_context(round, from);
        let pk = self.joint;
        let min_rounds = self.settings.shuffle_rounds;
        let claimed = output.clone();
        tokio::task::spawn_blocking(move || proof.verify(&context, &pk, &input, &claimed, min_rounds))
            .await
            .map_err(|e| reject(format!("verifier task failed: {e}")))?
            .map_err(|e| {
                warn!(%peer, round, error = %e, "shuffle proof rejected");
                reject(e.to_string())
            })?;
        Ok(output)
    }

    // --- openings ---

    /// open positions we own, fetching one share from every other peer
    pub async fn open_owned(&self, deal: &Deal, positions: &[usize]) -> Result<Vec<Opening>> {
        let me = self.me();
        let mut missing = Vec::new();
        for &position in positions {
            if deal.opening(position).await.is_none() {
                missing.push(position);
            }
        }

        if !missing.is_empty() {
            let wire: Vec<u8> = missing.iter().map(|&p| p as u8).collect();
            let fetches = self.remote_links().map(|link| {
                let wire = wire.clone();
                let missing = &missing;
                async move {
                    let request = Request::Shares {
                        round: deal.round,
                        positions: wire,
                    };
                    let response = link
                        .request(request, self.settings.request_timeout)
                        .await
                        .map_err(|e| Error::channel(link.peer(), e))?;
                    let shares = self.check_shares(deal, link, missing, response)?;
                    Ok::<_, Error>((link.order(), shares))
                }
            });
            let by_peer: HashMap<usize, HashMap<usize, DecryptionShare>> =
                try_join_all(fetches).await?.into_iter().collect();

            for &position in &missing {
                let ct = &deal.deck[position];
                let mut shares = Vec::with_capacity(self.directory.len());
                for producer in 0..self.directory.len() {
                    if producer == me {
                        let context = deal.share_context(position, me);
                        shares.push(self.key.decryption_share(&context, ct, &mut OsRng));
                    } else {
                        let share = by_peer
                            .get(&producer)
                            .and_then(|shares| shares.get(&position))
                            .copied()
                            .ok_or_else(|| {
                                Error::protocol(self.directory.name(producer), "share missing from response")
                            })?;
                        shares.push(share);
                    }
                }
                let card = reveal_card(ct, &shares).ok_or_else(|| {
                    Error::verification(
                        "shuffle chain",
                        format!("position {position} does not open to a card"),
                    )
                })?;
                debug!(round = deal.round, position, "opened owned position");
                deal.record(Opening {
                    position,
                    card,
                    shares,
                })
                .await;
            }
        }

        let mut openings = Vec::with_capacity(positions.len());
        for &position in positions {
            let opening = deal.opening(position).await.ok_or_else(|| {
                Error::protocol(self.directory.name(me), format!("opening for {position} was not recorded"))
            })?;
            openings.push(opening);
        }
        Ok(openings)
    }

    fn check_shares(
        &self,
        deal: &Deal,
        link: &Link,
        expected: &[usize],
        response: Response,
    ) -> Result<HashMap<usize, DecryptionShare>> {
        let shares = match response {
            Response::Shares(shares) => shares,
            Response::Refused(refusal) => {
                return Err(Error::protocol(link.peer(), format!("refused shares: {refusal}")))
            }
            Response::Openings(_) => {
                return Err(Error::protocol(link.peer(), "answered a share request with openings"))
            }
        };

        let mut checked = HashMap::with_capacity(shares.len());
        for WireShare { position, share } in shares {
            let position = position as usize;
            if !expected.contains(&position) || checked.contains_key(&position) {
                return Err(Error::protocol(link.peer(), format!("unrequested share for {position}")));
            }
            let share = DecryptionShare::from_bytes(&share).ok_or_else(|| {
                Error::verification(link.peer(), format!("position {position}: malformed decryption share"))
            })?;
            if !deal.verify_share(&self.publics, position, link.order(), &share) {
                warn!(peer = link.peer(), position, "decryption share rejected");
                return Err(Error::verification(
                    link.peer(),
                    format!("position {position}: decryption share does not verify"),
                ));
            }
            checked.insert(position, share);
        }
        if checked.len() != expected.len() {
            return Err(Error::protocol(link.peer(), "share response is missing positions"));
        }
        Ok(checked)
    }

    /// ask `order` to disclose `positions` and verify every opening
    pub async fn request_openings(
        &self,
        deal: &Deal,
        order: usize,
        positions: &[usize],
        relay: bool,
    ) -> Result<Vec<Opening>> {
        if positions.is_empty() {
            return Ok(Vec::new());
        }
        let link = self
            .link(order)
            .ok_or_else(|| Error::UnknownPeer(self.directory.name(order)))?;
        let request = Request::Reveal {
            round: deal.round,
            positions: positions.iter().map(|&p| p as u8).collect(),
            relay,
        };
        let response = link
            .request(request, self.settings.request_timeout)
            .await
            .map_err(|e| Error::channel(link.peer(), e))?;

        let wire = match response {
            Response::Openings(openings) => openings,
            Response::Refused(refusal) => {
                return Err(Error::protocol(link.peer(), format!("refused to reveal: {refusal}")))
            }
            Response::Shares(_) => {
                return Err(Error::protocol(link.peer(), "answered a reveal request with shares"))
            }
        };

        let mut by_position = BTreeMap::new();
        for wire in &wire {
            let opening = Opening::from_wire(wire).map_err(|reason| {
                Error::verification(link.peer(), format!("position {}: {reason}", wire.position))
            })?;
            if let Err(reason) = deal.verify_opening(&self.publics, &opening) {
                warn!(peer = link.peer(), position = opening.position, %reason, "opening rejected");
                return Err(Error::verification(
                    link.peer(),
                    format!("position {}: {reason}", opening.position),
                ));
            }
            by_position.insert(opening.position, opening);
        }

        let mut openings = Vec::with_capacity(positions.len());
        for &position in positions {
            let opening = by_position.remove(&position).ok_or_else(|| {
                Error::protocol(link.peer(), format!("did not disclose position {position}"))
            })?;
            deal.record(opening.clone()).await;
            openings.push(opening);
        }
        Ok(openings)
    }

    /// verified openings for any positions: our own we open, the rest come
    /// from the cache or from their owners
    pub async fn collect_openings(&self, deal: &Deal, positions: &[usize]) -> Result<Vec<Opening>> {
        let me = self.me();
        let mut by_owner: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        let mut openings = Vec::with_capacity(positions.len());
        for &position in positions {
            let owner = self.directory.owner_of(position);
            match deal.opening(position).await {
                Some(opening) => openings.push(opening),
                None => by_owner.entry(owner).or_default().push(position),
            }
        }

        let fetches = by_owner.into_iter().map(|(owner, owned)| async move {
            if owner == me {
                self.open_owned(deal, &owned).await
            } else {
                self.request_openings(deal, owner, &owned, false).await
            }
        });
        for fetched in try_join_all(fetches).await? {
            openings.extend(fetched);
        }
        openings.sort_by_key(|o| o.position);
        Ok(openings)
    }

    /// every remote peer discloses `positions` (relaying what it does not
    /// own); all of them must agree with what we verified ourselves
    pub async fn reveal_all(&self, deal: &Deal, positions: &[usize]) -> Result<Vec<Opening>> {
        let local = self.collect_openings(deal, positions).await?;
        let remote = try_join_all(self.remote_links().map(|link| async move {
            let openings = self.request_openings(deal, link.order(), positions, true).await?;
            Ok::<_, Error>((link.peer().to_string(), openings))
        }))
        .await?;

        let mine: BTreeMap<usize, Card> = local.iter().map(|o| (o.position, o.card)).collect();
        for (peer, openings) in remote {
            for opening in openings {
                match mine.get(&opening.position) {
                    Some(card) if *card == opening.card => {}
                    Some(card) => {
                        warn!(%peer, position = opening.position, "disclosures disagree");
                        return Err(Error::Consistency {
                            position: opening.position,
                            first: card.to_string(),
                            second: format!("{} from {peer}", opening.card),
                        });
                    }
                    None => {
                        return Err(Error::protocol(
                            peer,
                            format!("disclosed unrequested position {}", opening.position),
                        ))
                    }
                }
            }
        }
        Ok(local)
    }

    // --- responder ---

    async fn serve(self: Arc<Self>, mut requests: mpsc::Receiver<(usize, u64, Request)>) {
        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                next = requests.recv() => match next {
                    Some((from, id, request)) => {
                        let session = Arc::clone(&self);
                        tasks.spawn(async move {
                            let response = session.answer(from, request).await;
                            if let Some(link) = session.link(from) {
                                if let Err(e) = link.respond(id, response).await {
                                    debug!(peer = link.peer(), error = %e, "response not delivered");
                                }
                            }
                        });
                    }
                    None => break,
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            warn!(error = %e, "responder task panicked");
                        }
                    }
                }
            }
        }
        debug!("responder stopped");
    }

    /// the deal for `round`, waiting for our own shuffle to settle
    async fn settled(&self, round: u64) -> std::result::Result<Arc<Deal>, Refusal> {
        let mut rx = self.deal.subscribe();
        let deal = match tokio::time::timeout(
            self.settings.round_timeout,
            rx.wait_for(|deal| deal.as_ref().is_some_and(|d| d.round >= round)),
        )
        .await
        {
            Ok(Ok(deal)) => deal.clone(),
            _ => None,
        };
        match deal {
            Some(deal) if deal.round > round => Err(Refusal::Stale { current: deal.round }),
            Some(deal) => Ok(deal),
            None => Err(Refusal::NotDealt),
        }
    }

    async fn answer(&self, from: usize, request: Request) -> Response {
        let peer = self.directory.name(from);
        let round = request.round();
        let deal = match self.settled(round).await {
            Ok(deal) => deal,
            Err(refusal) => {
                debug!(%peer, round, %refusal, "refusing request");
                return Response::Refused(refusal);
            }
        };

        match request {
            Request::Shares { positions, .. } => {
                let mut shares = Vec::with_capacity(positions.len());
                for position in positions {
                    let index = position as usize;
                    if index >= N_CARDS {
                        return Response::Refused(Refusal::BadPosition { position });
                    }
                    if self.directory.owner_of(index) != from {
                        warn!(%peer, position, "share requested for a position the peer does not own");
                        return Response::Refused(Refusal::NotOwner { position });
                    }
                    let context = deal.share_context(index, self.me());
                    let share = self.key.decryption_share(&context, &deal.deck[index], &mut OsRng);
                    shares.push(WireShare {
                        position,
                        share: share.to_bytes(),
                    });
                }
                debug!(%peer, round, count = shares.len(), "handed out decryption shares");
                Response::Shares(shares)
            }
            Request::Reveal {
                positions, relay, ..
            } => {
                let mut indices = Vec::with_capacity(positions.len());
                for position in positions {
                    let index = position as usize;
                    if index >= N_CARDS {
                        return Response::Refused(Refusal::BadPosition { position });
                    }
                    if !relay && self.directory.owner_of(index) != self.me() {
                        return Response::Refused(Refusal::NotOwner { position });
                    }
                    indices.push(index);
                }
                let indices: Vec<usize> = indices.into_iter().collect::<BTreeSet<_>>().into_iter().collect();

                let wait = self.settings.grant_timeout;
                if let Err(position) = deal.granted(from, &indices, relay, wait).await {
                    warn!(%peer, round, position, relay, "disclosure not allowed by the controller");
                    return Response::Refused(Refusal::NotGranted {
                        position: position as u8,
                    });
                }

                match self.collect_openings(&deal, &indices).await {
                    Ok(openings) => {
                        debug!(%peer, round, relay, count = openings.len(), "disclosed openings");
                        Response::Openings(openings.iter().map(Opening::to_wire).collect())
                    }
                    Err(e) => {
                        warn!(%peer, round, error = %e, "could not disclose openings");
                        let position = indices.first().copied().unwrap_or_default() as u8;
                        Response::Refused(Refusal::Unavailable { position })
                    }
                }
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// blake3 over every static channel key, by order
pub fn roster_digest(statics: &[[u8; 32]]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"cardserver.roster.v1");
    hasher.update(&(statics.len() as u64).to_le_bytes());
    for key in statics {
        hasher.update(key);
    }
    *hasher.finalize().as_bytes()
}

async fn broadcast(directory: &PeerDirectory, links: &[Option<Arc<Link>>], push: Push) -> Result<()> {
    let sends = links.iter().flatten().map(|link| {
        let push = push.clone();
        async move {
            link.push(push)
                .await
                .map_err(|e| Error::channel(directory.name(link.order()), e))
        }
    });
    try_join_all(sends).await.map(|_| ())
}

async fn collect_announces(
    directory: &PeerDirectory,
    inbox: &mut Inbox,
    roster: &[u8; 32],
    own: RistrettoPoint,
    deadline: Instant,
) -> Result<Vec<RistrettoPoint>> {
    let mut publics: Vec<Option<RistrettoPoint>> = vec![None; directory.len()];
    publics[directory.self_order()] = Some(own);

    while publics.iter().any(Option::is_none) {
        let (from, inbound) = match timeout_at(deadline, inbox.next()).await {
            Ok(Some(received)) => received,
            Ok(None) => return Err(Error::Terminated),
            Err(_) => {
                let missing: Vec<String> = publics
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| p.is_none())
                    .map(|(o, _)| directory.name(o))
                    .collect();
                return Err(Error::Timeout(format!("announcements from {}", missing.join(", "))));
            }
        };
        let peer = directory.name(from);
        let announce = match inbound {
            Inbound::Push(Push::Announce(announce)) => announce,
            Inbound::Push(other) => {
                // a fast peer may already be shuffling
                inbox.defer(from, other);
                continue;
            }
            Inbound::Closed => return Err(Error::channel(peer, ChannelError::Closed)),
        };

        if announce.order as usize != from {
            return Err(Error::Config(format!(
                "order disagreement: {peer} announces order {}, expected {from}",
                announce.order
            )));
        }
        if announce.roster != *roster {
            return Err(Error::Config(format!("roster disagreement with {peer}")));
        }
        if publics[from].is_some() {
            return Err(Error::protocol(peer, "second announcement"));
        }
        let share = point_from_bytes(&announce.key_share).ok_or_else(|| Error::Authentication {
            peer: peer.clone(),
            reason: "key share is not a valid point".into(),
        })?;
        let valid = KeyProof::from_bytes(&announce.proof)
            .map(|proof| proof.verify(roster, &share))
            .unwrap_or(false);
        if !valid {
            return Err(Error::Authentication {
                peer,
                reason: "proof of key possession rejected".into(),
            });
        }
        debug!(%peer, "announcement accepted");
        publics[from] = Some(share);
    }

    Ok(publics.into_iter().flatten().collect())
}

async fn connect_all(
    transport: &TransportContext,
    directory: &PeerDirectory,
    settings: &Settings,
    routes: Routes,
) -> Result<Vec<Option<Arc<Link>>>> {
    let deadline = Instant::now() + settings.connect_timeout;
    let me = directory.self_order();

    let dials = directory
        .remotes()
        .filter(|peer| peer.order > me)
        .map(|peer| dial(transport, me, peer, deadline));
    let (dialed, accepted) = tokio::try_join!(try_join_all(dials), accept_lower(transport, directory, deadline))?;

    let mut links = vec![None; directory.len()];
    for (order, established) in dialed.into_iter().chain(accepted) {
        let link = Link::spawn(established, order, directory.name(order), routes.clone());
        links[order] = Some(Arc::new(link));
    }
    Ok(links)
}

fn warn_unpinned(peer: &Peer) {
    if peer.server_key.is_none() {
        warn!(peer = %peer.identity, "no serverKey given, channel is encrypted but the peer is not pinned");
    }
}

async fn dial(
    transport: &TransportContext,
    me: usize,
    peer: &Peer,
    deadline: Instant,
) -> Result<(usize, Established<TcpStream>)> {
    let endpoint = peer
        .endpoint
        .as_deref()
        .ok_or_else(|| Error::Config(format!("no endpoint for {}", peer.identity)))?;

    let mut backoff = Duration::from_millis(50);
    let stream = loop {
        match timeout_at(deadline, TcpStream::connect(endpoint)).await {
            Ok(Ok(stream)) => break stream,
            Ok(Err(e)) if Instant::now() + backoff < deadline => {
                debug!(peer = %peer.identity, %endpoint, error = %e, "connect failed, retrying");
                sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(1));
            }
            Ok(Err(e)) => {
                return Err(Error::Timeout(format!("connecting to {} at {endpoint}: {e}", peer.identity)))
            }
            Err(_) => return Err(Error::Timeout(format!("connecting to {} at {endpoint}", peer.identity))),
        }
    };
    let _ = stream.set_nodelay(true);
    warn_unpinned(peer);

    let established = timeout_at(
        deadline,
        handshake::initiate(stream, transport.secret(), me as u16, peer.order as u16, peer.server_key),
    )
    .await
    .map_err(|_| Error::Timeout(format!("handshake with {}", peer.identity)))?
    .map_err(|e| Error::channel(&peer.identity, e))?;
    debug!(peer = %peer.identity, "dialed channel ready");
    Ok((peer.order, established))
}

/// accept one channel from every peer ordered below us
async fn accept_lower(
    transport: &TransportContext,
    directory: &PeerDirectory,
    deadline: Instant,
) -> Result<Vec<(usize, Established<TcpStream>)>> {
    let me = directory.self_order();
    let mut waiting: BTreeSet<usize> = directory
        .remotes()
        .filter(|peer| peer.order < me)
        .map(|peer| peer.order)
        .collect();
    let mut accepted = Vec::with_capacity(waiting.len());

    while !waiting.is_empty() {
        let pending = || {
            waiting
                .iter()
                .map(|&o| directory.name(o))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let (mut stream, addr) = match timeout_at(deadline, transport.listener().accept()).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                warn!(error = %e, "accept failed");
                continue;
            }
            Err(_) => return Err(Error::Timeout(format!("waiting for {} to connect", pending()))),
        };
        let hello = match timeout_at(deadline, handshake::read_hello(&mut stream)).await {
            Ok(Ok(hello)) => hello,
            Ok(Err(e)) => {
                warn!(%addr, error = %e, "dropping inbound connection");
                continue;
            }
            Err(_) => return Err(Error::Timeout(format!("waiting for {} to connect", pending()))),
        };

        let order = hello.order as usize;
        let peer = match directory.peer(order) {
            Some(peer) if hello.target as usize == me && waiting.contains(&order) => peer,
            _ => {
                warn!(%addr, order, target = hello.target, "dropping unexpected inbound channel");
                continue;
            }
        };
        warn_unpinned(peer);
        let _ = stream.set_nodelay(true);

        let established = timeout_at(
            deadline,
            handshake::respond(stream, transport.secret(), hello, peer.server_key),
        )
        .await
        .map_err(|_| Error::Timeout(format!("handshake with {}", peer.identity)))?
        .map_err(|e| Error::channel(&peer.identity, e))?;
        debug!(peer = %peer.identity, %addr, "accepted channel ready");
        waiting.remove(&order);
        accepted.push((order, established));
    }
    Ok(accepted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::PeerEntry;
    use crate::engine::Engine;
    use futures::future::join_all;
    use x25519_dalek::StaticSecret;

    fn settings() -> Settings {
        Settings {
            shuffle_rounds: 4,
            connect_timeout: Duration::from_secs(10),
            round_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            grant_timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn test_roster_digest_is_order_sensitive() {
        let a = [[1u8; 32], [2u8; 32]];
        let b = [[2u8; 32], [1u8; 32]];
        assert_eq!(roster_digest(&a), roster_digest(&a));
        assert_ne!(roster_digest(&a), roster_digest(&b));
    }

    fn commit(round: u64) -> Push {
        Push::Commit(DeckCommit {
            round,
            digest: [0; 32],
        })
    }

    fn step(round: u64) -> Push {
        Push::Shuffle(ShuffleStep {
            round,
            deck: Vec::new(),
            proof: Vec::new(),
        })
    }

    #[tokio::test]
    async fn test_inbox_defers_until_next_round() {
        let (tx, rx) = mpsc::channel(8);
        let mut inbox = Inbox::new(rx);

        tx.send((1, Inbound::Push(commit(2)))).await.unwrap();
        let (from, inbound) = inbox.next().await.unwrap();
        let Inbound::Push(push) = inbound else {
            panic!("expected a push");
        };
        inbox.defer(from, push);

        // nothing replays within the round
        tx.send((2, Inbound::Push(commit(1)))).await.unwrap();
        let (from, _) = inbox.next().await.unwrap();
        assert_eq!(from, 2);

        inbox.begin_round();
        let (from, inbound) = inbox.next().await.unwrap();
        assert_eq!(from, 1);
        assert!(matches!(inbound, Inbound::Push(p) if p == commit(2)));
    }

    // --- shuffle barrier, one live peer and three scripted ones ---

    /// order 3 of four with no channels; the test speaks for peers 0..3
    /// through the inbox. peer 0 never steps, so nothing gets verified
    fn detached(round_timeout: Duration) -> (Session, mpsc::Sender<(usize, Inbound)>) {
        let remotes = (0..3).map(|j| Some(PeerEntry::new(format!("peer{j}")))).collect();
        let directory = PeerDirectory::initialize(Some(3), remotes).unwrap();
        let key = KeyShare::generate(&mut OsRng);
        let publics: Vec<_> = (0..3)
            .map(|_| KeyShare::generate(&mut OsRng).public())
            .chain([key.public()])
            .collect();
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let session = Session {
            directory,
            settings: Settings {
                round_timeout,
                ..settings()
            },
            roster: [0; 32],
            key,
            joint: aggregate_key(&publics),
            publics,
            links: vec![None; 4],
            inbox: Mutex::new(Inbox::new(rx)),
            deal: watch::channel(None).0,
            responder: OnceLock::new(),
            round: AtomicU64::new(0),
        };
        (session, tx)
    }

    async fn feed(tx: &mpsc::Sender<(usize, Inbound)>, from: usize, pushes: Vec<Push>) {
        for push in pushes {
            tx.send((from, Inbound::Push(push))).await.unwrap();
        }
    }

    fn missing(err: Error) -> Vec<String> {
        match err {
            Error::IncompleteShuffle { missing } => missing,
            other => panic!("unexpected {other}"),
        }
    }

    #[tokio::test]
    async fn test_out_of_order_pushes_are_violations() {
        let announce = Push::Announce(Announce {
            order: 2,
            roster: [0; 32],
            key_share: [0; 32],
            proof: [0; 64],
        });
        let cases = [
            (vec![commit(1)], "deck commitment before its shuffle step"),
            (vec![step(1), step(1)], "second shuffle step"),
            (vec![step(1), commit(1), commit(1)], "second deck commitment"),
            (vec![announce], "announcement after init"),
            (vec![step(2 + MAX_ROUND_SKEW)], "during round 1"),
        ];
        for (pushes, expected) in cases {
            let (session, tx) = detached(Duration::from_secs(5));
            feed(&tx, 2, pushes).await;
            match session.shuffle().await {
                Err(Error::Protocol { peer, reason }) => {
                    assert_eq!(peer, "peer2");
                    assert!(reason.contains(expected), "{reason}");
                }
                other => panic!("expected a violation for {expected:?}, got {:?}", other.err()),
            }
        }
    }

    #[tokio::test]
    async fn test_restarted_peer_is_joined() {
        let (session, tx) = detached(Duration::from_secs(1));
        // peer 2 gave up on round 1; its stale commitment is dropped
        feed(&tx, 2, vec![step(2), commit(1)]).await;

        let err = session.shuffle().await.unwrap_err();
        assert_eq!(missing(err), ["peer0", "peer1", "peer2"]);
        assert_eq!(session.round.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_later_round_from_a_committed_peer_is_parked() {
        let (session, tx) = detached(Duration::from_secs(1));
        feed(&tx, 2, vec![step(1), commit(1), step(2)]).await;

        let err = session.shuffle().await.unwrap_err();
        assert_eq!(missing(err), ["peer0", "peer1"]);
        assert_eq!(session.round.load(Ordering::SeqCst), 1);

        // the parked step belongs to the next shuffle
        let err = session.shuffle().await.unwrap_err();
        assert_eq!(missing(err), ["peer0", "peer1", "peer2"]);
        assert_eq!(session.round.load(Ordering::SeqCst), 2);
    }

    // --- disclosures between live engines ---

    /// `n` engines on loopback, initialized against each other and shuffled
    async fn dealt_table(n: usize, settings: Settings) -> Vec<Engine> {
        let mut engines = Vec::with_capacity(n);
        for i in 0..n {
            let secret = StaticSecret::from([i as u8 + 1; 32]);
            let transport = TransportContext::bind("127.0.0.1:0", secret).await.unwrap();
            engines.push(Engine::new(transport, settings.clone()));
        }
        let inits = engines.iter().enumerate().map(|(i, engine)| {
            let peers = engines
                .iter()
                .enumerate()
                .map(|(j, other)| {
                    (j != i).then(|| {
                        PeerEntry::new(format!("peer{j}"))
                            .with_endpoint(other.local_addr().unwrap().to_string())
                            .with_server_key(hex::encode(other.public_key()))
                    })
                })
                .collect();
            engine.init(None, peers)
        });
        for result in join_all(inits).await {
            result.unwrap();
        }
        for result in join_all(engines.iter().map(Engine::shuffle)).await {
            result.unwrap();
        }
        engines
    }

    fn sessions(engines: &[Engine]) -> Vec<Arc<Session>> {
        engines.iter().map(|e| e.current_session().unwrap()).collect()
    }

    /// correctly shared opening of `position` that claims the wrong card
    fn forged_opening(sessions: &[Arc<Session>], position: usize) -> Opening {
        let deal = sessions[0].deal().unwrap();
        let ct = &deal.deck[position];
        let shares: Vec<_> = sessions
            .iter()
            .map(|s| s.key.decryption_share(&deal.share_context(position, s.me()), ct, &mut OsRng))
            .collect();
        let card = reveal_card(ct, &shares).unwrap();
        Opening {
            position,
            card: Card::from_index((card.index() + 1) % N_CARDS).unwrap(),
            shares,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_withheld_cards_are_refused() {
        let mut quick = settings();
        quick.grant_timeout = Duration::from_secs(1);
        let engines = dealt_table(4, quick).await;
        let hand: Vec<usize> = (13..26).collect();

        // peer 0 asks on its own; nobody has agreed to show anything
        let err = engines[0].reveal("peer1", &hand).await.unwrap_err();
        assert_eq!(err.kind(), "protocol");
        assert!(err.to_string().contains("not disclosed"), "{err}");
        let err = engines[0].reveal_all(&(13..52).collect::<Vec<_>>()).await.unwrap_err();
        assert_eq!(err.kind(), "protocol", "{err}");

        let own = engines[0].draw(&(0..52).collect::<Vec<_>>()).await.unwrap();
        assert!(own[..13].iter().all(Option::is_some));
        assert!(own[13..].iter().all(Option::is_none));

        // nothing beyond its own hand ever reached peer 0
        let deal = engines[0].current_session().unwrap().deal().unwrap();
        for position in 13..52 {
            assert!(deal.opening(position).await.is_none(), "position {position}");
        }

        // once peer 1 agrees the same request goes through
        engines[1].reveal("peer0", &hand).await.unwrap();
        let shown = engines[0].reveal("peer1", &hand).await.unwrap();
        assert!(shown[13..26].iter().all(Option::is_some));
        assert!(deal.opening(26).await.is_none());

        for engine in &engines {
            engine.terminate();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_substituted_card_fails_verification() {
        let engines = dealt_table(2, settings()).await;
        let sessions = sessions(&engines);
        let forged = forged_opening(&sessions, 40);
        sessions[1].deal().unwrap().record(forged).await;

        engines[1].reveal("peer0", &[40]).await.unwrap();
        let err = engines[0].reveal("peer1", &[40]).await.unwrap_err();
        assert!(matches!(err, Error::Verification { ref peer, .. } if peer == "peer1"), "{err}");
        assert_eq!(err.kind(), "verification");

        for engine in &engines {
            engine.terminate();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_forged_opening_fails_at_every_honest_peer() {
        let engines = dealt_table(4, settings()).await;
        let sessions = sessions(&engines);
        let forged = forged_opening(&sessions, 13);
        sessions[1].deal().unwrap().record(forged).await;

        let dummy: Vec<usize> = (13..26).collect();
        let results = join_all(engines.iter().map(|e| e.reveal_all(&dummy))).await;
        for (order, result) in results.into_iter().enumerate() {
            if order == 1 {
                continue;
            }
            match result {
                Err(Error::Verification { peer, reason }) => {
                    assert_eq!(peer, "peer1", "observer {order}");
                    assert!(reason.contains("position 13"), "{reason}");
                }
                other => panic!("observer {order}: expected verification, got {:?}", other.map(|_| ())),
            }
        }

        for engine in &engines {
            engine.terminate();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_disagreeing_disclosures_are_a_consistency_error() {
        let engines = dealt_table(4, settings()).await;
        let sessions = sessions(&engines);
        // peer 0 holds a corrupted copy of a card it never opened itself
        let forged = forged_opening(&sessions, 13);
        let claimed = forged.card;
        sessions[0].deal().unwrap().record(forged).await;

        let dummy: Vec<usize> = (13..26).collect();
        let mut results = join_all(engines.iter().map(|e| e.reveal_all(&dummy))).await;
        match results.remove(0) {
            Err(Error::Consistency {
                position, first, ..
            }) => {
                assert_eq!(position, 13);
                assert_eq!(first, claimed.to_string());
            }
            other => panic!("expected consistency, got {:?}", other.map(|_| ())),
        }

        for engine in &engines {
            engine.terminate();
        }
    }
}
