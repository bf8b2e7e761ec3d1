//! link - a ready channel with its reader and writer tasks
//!
//! the reader decrypts frames in order and routes them: pushes to the
//! engine's inbox, requests to the responder, responses to whichever call
//! is waiting on that id. when the reader stops, every waiting request
//! fails and the engine is told the peer is gone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::frame::{read_frame, write_frame, CipherState};
use super::handshake::Established;
use super::{ChannelError, ChannelState};
use crate::protocol::{Push, Request, Response, WireMessage};

const OUTBOUND_QUEUE: usize = 256;

/// what a link hands to the engine
#[derive(Debug)]
pub enum Inbound {
    Push(Push),
    /// the channel is gone; nothing more will arrive from this peer
    Closed,
}

/// where links deliver inbound traffic, shared by every link of a session
#[derive(Clone)]
pub struct Routes {
    pub pushes: mpsc::Sender<(usize, Inbound)>,
    pub requests: mpsc::Sender<(usize, u64, Request)>,
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>;

pub struct Link {
    order: usize,
    peer: String,
    remote_static: [u8; 32],
    outbound: mpsc::Sender<WireMessage>,
    pending: Pending,
    next_id: AtomicU64,
    state: Arc<watch::Sender<ChannelState>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Link {
    /// start the reader and writer for an established channel
    pub fn spawn<S>(established: Established<S>, order: usize, peer: String, routes: Routes) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let Established {
            stream,
            remote_static,
            send,
            recv,
            state,
        } = established;
        let (reader, writer) = tokio::io::split(stream);
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let state = Arc::new(watch::Sender::new(state));

        let reader_task = tokio::spawn(read_loop(
            reader,
            recv,
            order,
            peer.clone(),
            routes,
            Arc::clone(&pending),
            Arc::clone(&state),
        ));
        let writer_task = tokio::spawn(write_loop(writer, send, outbound_rx, peer.clone()));

        Self {
            order,
            peer,
            remote_static,
            outbound,
            pending,
            next_id: AtomicU64::new(0),
            state,
            tasks: vec![reader_task, writer_task],
        }
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn remote_static(&self) -> [u8; 32] {
        self.remote_static
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub async fn send(&self, message: WireMessage) -> Result<(), ChannelError> {
        if self.state() == ChannelState::Closed {
            return Err(ChannelError::Closed);
        }
        self.outbound
            .send(message)
            .await
            .map_err(|_| ChannelError::Closed)
    }

    pub async fn push(&self, push: Push) -> Result<(), ChannelError> {
        self.send(WireMessage::Push(push)).await
    }

    pub async fn respond(&self, id: u64, body: Response) -> Result<(), ChannelError> {
        self.send(WireMessage::Response { id, body }).await
    }

    /// send a request and wait for the matching response
    pub async fn request(&self, body: Request, timeout: Duration) -> Result<Response, ChannelError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        // the reader marks the link closed before it drains `pending`
        if self.state() == ChannelState::Closed {
            self.pending.lock().await.remove(&id);
            return Err(ChannelError::Closed);
        }
        if let Err(e) = self.send(WireMessage::Request { id, body }).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(ChannelError::Timeout)
            }
        }
    }

    /// stop both tasks; further sends fail with `Closed`
    pub fn close(&self) {
        mark_closed(&self.state);
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.close();
    }
}

fn mark_closed(state: &watch::Sender<ChannelState>) {
    state.send_if_modified(|current| match current.advance(ChannelState::Closed) {
        Ok(next) => {
            *current = next;
            true
        }
        Err(_) => false,
    });
}

async fn read_loop<R>(
    mut reader: R,
    mut recv: CipherState,
    order: usize,
    peer: String,
    routes: Routes,
    pending: Pending,
    state: Arc<watch::Sender<ChannelState>>,
) where
    R: AsyncRead + Unpin,
{
    let reason = loop {
        let frame = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(e) => break e,
        };
        let plain = match recv.open(&frame) {
            Ok(plain) => plain,
            Err(e) => break e,
        };
        let message = match WireMessage::decode_from_slice(&plain) {
            Ok(message) => message,
            Err(e) => break ChannelError::Malformed(e.to_string()),
        };

        match message {
            WireMessage::Push(push) => {
                if routes.pushes.send((order, Inbound::Push(push))).await.is_err() {
                    break ChannelError::Closed;
                }
            }
            WireMessage::Request { id, body } => {
                if routes.requests.send((order, id, body)).await.is_err() {
                    break ChannelError::Closed;
                }
            }
            WireMessage::Response { id, body } => match pending.lock().await.remove(&id) {
                Some(waiter) => {
                    let _ = waiter.send(body);
                }
                None => debug!(%peer, id, "response for no pending request"),
            },
        }
    };

    match reason {
        ChannelError::Closed => debug!(%peer, "channel closed by peer"),
        ref e => warn!(%peer, error = %e, "channel failed"),
    }
    mark_closed(&state);
    pending.lock().await.clear();
    let _ = routes.pushes.send((order, Inbound::Closed)).await;
}

async fn write_loop<W>(
    mut writer: W,
    mut send: CipherState,
    mut outbound: mpsc::Receiver<WireMessage>,
    peer: String,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outbound.recv().await {
        let result = match send.seal(&message.encode_to_vec()) {
            Ok(sealed) => write_frame(&mut writer, &sealed).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(%peer, error = %e, "channel write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}
