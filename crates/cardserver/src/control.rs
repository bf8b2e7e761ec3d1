//! control - the local command endpoint
//!
//! a single controller drives the engine over tcp with multipart messages:
//! a 4-byte big-endian part count, then every part as a 4-byte big-endian
//! length and its bytes. requests are `[command, key, json, key, json..]`;
//! replies are `[success, command, key, json..]` or
//! `[failure, command, error, {kind, message}]`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesOrdered, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::directory::PeerEntry;
use crate::engine::{Engine, Slots};
use crate::error::{Error, Result};

const MAX_PARTS: usize = 64;
const MAX_PART: usize = 1 << 20;
/// how long queued replies may take to settle once terminate is in
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

type Pending = FuturesOrdered<BoxFuture<'static, Vec<Vec<u8>>>>;

pub const SUCCESS: &[u8] = b"success";
pub const FAILURE: &[u8] = b"failure";

/// read one multipart message; `None` on a clean end of stream
pub async fn read_multipart<R>(reader: &mut R) -> std::io::Result<Option<Vec<Vec<u8>>>>
where
    R: AsyncRead + Unpin,
{
    let count = match reader.read_u32().await {
        Ok(count) => count as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    if count == 0 || count > MAX_PARTS {
        return Err(invalid(format!("{count} parts in one message")));
    }

    let mut parts = Vec::with_capacity(count);
    for _ in 0..count {
        let len = reader.read_u32().await? as usize;
        if len > MAX_PART {
            return Err(invalid(format!("part of {len} bytes")));
        }
        let mut part = vec![0u8; len];
        reader.read_exact(&mut part).await?;
        parts.push(part);
    }
    Ok(Some(parts))
}

pub async fn write_multipart<W>(writer: &mut W, parts: &[Vec<u8>]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(4 + parts.iter().map(|p| p.len() + 4).sum::<usize>());
    buf.extend_from_slice(&(parts.len() as u32).to_be_bytes());
    for part in parts {
        buf.extend_from_slice(&(part.len() as u32).to_be_bytes());
        buf.extend_from_slice(part);
    }
    writer.write_all(&buf).await?;
    writer.flush().await
}

fn invalid(message: String) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, message)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Init {
        order: Option<usize>,
        peers: Vec<Option<PeerEntry>>,
    },
    Shuffle,
    Draw {
        cards: Vec<usize>,
    },
    Reveal {
        id: String,
        cards: Vec<usize>,
    },
    RevealAll {
        cards: Vec<usize>,
    },
    Terminate,
}

/// the `key, json` pairs after the command frame
struct Arguments(HashMap<String, Vec<u8>>);

impl Arguments {
    fn parse(frames: &[Vec<u8>]) -> Result<Self> {
        if frames.len() % 2 != 0 {
            return Err(Error::Config("arguments must be key, value pairs".into()));
        }
        let mut args = HashMap::new();
        for pair in frames.chunks_exact(2) {
            let key = std::str::from_utf8(&pair[0])
                .map_err(|_| Error::Config("argument key is not utf-8".into()))?;
            args.insert(key.to_string(), pair[1].clone());
        }
        Ok(Self(args))
    }

    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.0
            .get(key)
            .map(|raw| {
                serde_json::from_slice(raw).map_err(|e| Error::Config(format!("argument {key}: {e}")))
            })
            .transpose()
    }

    fn require<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.get(key)?
            .ok_or_else(|| Error::Config(format!("missing argument {key}")))
    }
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::Shuffle => "shuffle",
            Self::Draw { .. } => "draw",
            Self::Reveal { .. } => "reveal",
            Self::RevealAll { .. } => "revealall",
            Self::Terminate => "terminate",
        }
    }

    pub fn parse(frames: &[Vec<u8>]) -> Result<Self> {
        let (name, rest) = frames
            .split_first()
            .ok_or_else(|| Error::Config("empty command".into()))?;
        let args = Arguments::parse(rest)?;
        match name.as_slice() {
            b"init" => Ok(Self::Init {
                order: args.get("order")?,
                peers: args.require("peers")?,
            }),
            b"shuffle" => Ok(Self::Shuffle),
            b"draw" => Ok(Self::Draw {
                cards: args.require("cards")?,
            }),
            b"reveal" => Ok(Self::Reveal {
                id: args.require("id")?,
                cards: args.require("cards")?,
            }),
            b"revealall" => Ok(Self::RevealAll {
                cards: args.require("cards")?,
            }),
            b"terminate" => Ok(Self::Terminate),
            other => Err(Error::Config(format!(
                "unknown command {}",
                String::from_utf8_lossy(other)
            ))),
        }
    }
}

/// run one command against the engine and build its reply frames
pub async fn execute(engine: &Engine, command: Command) -> Vec<Vec<u8>> {
    let name = command.name();
    let result: Result<Option<Slots>> = match command {
        Command::Init { order, peers } => engine.init(order, peers).await.map(|_| None),
        Command::Shuffle => engine.shuffle().await.map(|_| None),
        Command::Draw { cards } => engine.draw(&cards).await.map(Some),
        Command::Reveal { id, cards } => engine.reveal(&id, &cards).await.map(Some),
        Command::RevealAll { cards } => engine.reveal_all(&cards).await.map(Some),
        Command::Terminate => {
            engine.terminate();
            Ok(None)
        }
    };
    match result {
        Ok(cards) => success(name, cards.as_ref()),
        Err(e) => failure(name, &e),
    }
}

fn success(command: &str, cards: Option<&Slots>) -> Vec<Vec<u8>> {
    let mut frames = vec![SUCCESS.to_vec(), command.as_bytes().to_vec()];
    if let Some(cards) = cards {
        frames.push(b"cards".to_vec());
        frames.push(json!(cards).to_string().into_bytes());
    }
    frames
}

fn failure(command: &str, error: &Error) -> Vec<Vec<u8>> {
    let detail = json!({ "kind": error.kind(), "message": error.to_string() });
    vec![
        FAILURE.to_vec(),
        command.as_bytes().to_vec(),
        b"error".to_vec(),
        detail.to_string().into_bytes(),
    ]
}

/// decode the `cards` field of a reply
pub fn reply_cards(frames: &[Vec<u8>]) -> Option<Slots> {
    let at = frames.iter().position(|f| f == b"cards")?;
    let value: Value = serde_json::from_slice(frames.get(at + 1)?).ok()?;
    serde_json::from_value(value).ok()
}

pub struct ControlServer {
    listener: TcpListener,
    engine: Engine,
}

impl ControlServer {
    pub async fn bind(addr: &str, engine: Engine) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Config(format!("control endpoint {addr}: {e}")))?;
        Ok(Self { listener, engine })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| Error::Config(format!("control endpoint: {e}")))
    }

    /// serve controllers until the engine terminates
    pub async fn run(self) -> Result<()> {
        info!(addr = ?self.listener.local_addr().ok(), "control interface listening");
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!(%addr, "controller connected");
                        tokio::spawn(serve_connection(stream, self.engine.clone()));
                    }
                    Err(e) => warn!(error = %e, "control accept failed"),
                },
                _ = self.engine.terminated() => break,
            }
        }
        info!("control interface stopped");
        Ok(())
    }
}

/// commands run concurrently; replies leave in request order
async fn serve_connection(stream: TcpStream, engine: Engine) {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();
    let (requests, mut incoming) = mpsc::channel::<Vec<Vec<u8>>>(64);

    let read_task = tokio::spawn(async move {
        loop {
            match read_multipart(&mut reader).await {
                Ok(Some(frames)) => {
                    if requests.send(frames).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "malformed control message");
                    break;
                }
            }
        }
    });

    let mut pending: Pending = FuturesOrdered::new();
    let mut reading = true;
    while reading || !pending.is_empty() {
        tokio::select! {
            frames = incoming.recv(), if reading => {
                let Some(frames) = frames else {
                    reading = false;
                    continue;
                };
                match Command::parse(&frames) {
                    Ok(Command::Terminate) => {
                        info!("terminate requested");
                        engine.terminate();
                        flush(&mut pending, &mut writer).await;
                        break;
                    }
                    Ok(command) => {
                        debug!(command = command.name(), "control command");
                        let engine = engine.clone();
                        pending.push_back(async move { execute(&engine, command).await }.boxed());
                    }
                    Err(e) => {
                        let name = frames
                            .first()
                            .map(|f| String::from_utf8_lossy(f).into_owned())
                            .unwrap_or_default();
                        warn!(command = %name, error = %e, "rejected control command");
                        let reply = failure(&name, &e);
                        pending.push_back(async move { reply }.boxed());
                    }
                }
            }
            Some(reply) = pending.next(), if !pending.is_empty() => {
                if let Err(e) = write_multipart(&mut writer, &reply).await {
                    // keep draining so in-flight protocol steps finish
                    debug!(error = %e, "controller went away");
                }
            }
        }
    }
    read_task.abort();
    let _ = writer.shutdown().await;
}

/// write the replies of every command queued before terminate, in order.
/// interrupted commands settle quickly with a `terminated` failure
async fn flush<W>(pending: &mut Pending, writer: &mut W)
where
    W: AsyncWrite + Unpin,
{
    let drain = async {
        while let Some(reply) = pending.next().await {
            if let Err(e) = write_multipart(writer, &reply).await {
                debug!(error = %e, "controller went away");
                break;
            }
        }
    };
    let flushed = tokio::time::timeout(FLUSH_TIMEOUT, drain).await;
    if flushed.is_err() {
        warn!(left = pending.len(), "replies still running at terminate were dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(parts: &[&str]) -> Vec<Vec<u8>> {
        parts.iter().map(|p| p.as_bytes().to_vec()).collect()
    }

    #[test]
    fn test_parse_init_with_local_hole() {
        let command = Command::parse(&frames(&[
            "init",
            "peers",
            r#"[{"identity": "north", "endpoint": "tcp://127.0.0.1:5601"}, null]"#,
        ]))
        .unwrap();
        assert_eq!(
            command,
            Command::Init {
                order: None,
                peers: vec![
                    Some(PeerEntry::new("north").with_endpoint("tcp://127.0.0.1:5601")),
                    None
                ],
            }
        );
    }

    #[test]
    fn test_parse_reveal() {
        let command = Command::parse(&frames(&["reveal", "id", "\"east\"", "cards", "[13, 14]"])).unwrap();
        assert_eq!(
            command,
            Command::Reveal {
                id: "east".into(),
                cards: vec![13, 14],
            }
        );
        assert_eq!(command.name(), "reveal");
    }

    #[test]
    fn test_parse_rejects_bad_requests() {
        let bad = [
            frames(&["deal"]),
            frames(&["draw"]),
            frames(&["draw", "cards"]),
            frames(&["draw", "cards", "[1, -2]"]),
            frames(&["reveal", "cards", "[1]"]),
        ];
        for request in bad {
            let err = Command::parse(&request).unwrap_err();
            assert_eq!(err.kind(), "config", "{request:?}");
        }
        assert!(Command::parse(&[]).is_err());
    }

    #[test]
    fn test_reply_shapes() {
        let mut slots: Slots = vec![None; 52];
        slots[3] = card_shuffle::Card::from_index(3);
        let reply = success("draw", Some(&slots));
        assert_eq!(reply[0], SUCCESS);
        assert_eq!(reply[1], b"draw");
        assert_eq!(reply_cards(&reply), Some(slots));

        let value: Value = serde_json::from_slice(&reply[3]).unwrap();
        assert_eq!(value[3], json!({"rank": "5", "suit": "clubs"}));
        assert_eq!(value[0], Value::Null);

        let reply = failure("shuffle", &Error::InvalidPosition(60));
        assert_eq!(reply[0], FAILURE);
        let detail: Value = serde_json::from_slice(&reply[3]).unwrap();
        assert_eq!(detail["kind"], "invalid_position");
    }

    #[tokio::test]
    async fn test_multipart_framing() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let sent = frames(&["shuffle", "", "x"]);
        write_multipart(&mut a, &sent).await.unwrap();
        assert_eq!(read_multipart(&mut b).await.unwrap(), Some(sent));

        drop(a);
        assert_eq!(read_multipart(&mut b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_terminate_flushes_queued_replies() {
        let secret = x25519_dalek::StaticSecret::from([5; 32]);
        let transport = crate::TransportContext::bind("127.0.0.1:0", secret).await.unwrap();
        let engine = Engine::new(transport, crate::Settings::default());
        let server = ControlServer::bind("127.0.0.1:0", engine.clone()).await.unwrap();
        let mut stream = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
        let running = tokio::spawn(server.run());

        // init keeps dialing a peer that is not there until terminate cuts it off
        let init = frames(&[
            "init",
            "order",
            "0",
            "peers",
            r#"[{"identity": "east", "endpoint": "127.0.0.1:1"}]"#,
        ]);
        write_multipart(&mut stream, &init).await.unwrap();
        write_multipart(&mut stream, &frames(&["terminate"])).await.unwrap();

        let reply = read_multipart(&mut stream).await.unwrap().unwrap();
        assert_eq!(reply[0], FAILURE);
        assert_eq!(reply[1], b"init");
        let detail: Value = serde_json::from_slice(&reply[3]).unwrap();
        assert_eq!(detail["kind"], "terminated");
        assert_eq!(read_multipart(&mut stream).await.unwrap(), None);

        running.await.unwrap().unwrap();
        assert!(engine.is_terminated());
    }

    #[tokio::test]
    async fn test_oversized_part_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let mut raw = 1u32.to_be_bytes().to_vec();
        raw.extend_from_slice(&(MAX_PART as u32 + 1).to_be_bytes());
        a.write_all(&raw).await.unwrap();
        let err = read_multipart(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
