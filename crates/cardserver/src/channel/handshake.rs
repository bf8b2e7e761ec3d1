//! mutual x25519 handshake
//!
//! ```text
//! initiator -> responder : Hello   { version, order, target, static, ephemeral }
//! responder -> initiator : Welcome { version, static, ephemeral }
//! both                   : keys = derive(ee | es | se | ss | h(hello | welcome))
//! initiator -> responder : seal(h)   key confirmation
//! responder -> initiator : seal(h)
//! ```
//!
//! `es` and `ss` can only be computed by the holder of the responder's
//! static secret, `se` and `ss` only by the initiator's, so a matching
//! confirmation proves possession of both static keys.

use parity_scale_codec::{Decode, Encode};
use rand::rngs::OsRng;
use tokio::io::{AsyncRead, AsyncWrite};
use x25519_dalek::{PublicKey, StaticSecret};

use super::frame::{read_frame, write_frame, CipherState};
use super::{ChannelError, ChannelState};

pub const PROTOCOL_VERSION: u16 = 1;

const KDF_INITIATOR: &str = "cardserver channel v1 initiator to responder";
const KDF_RESPONDER: &str = "cardserver channel v1 responder to initiator";

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct Hello {
    pub version: u16,
    /// sender's order in the session
    pub order: u16,
    /// order the sender believes it is dialing
    pub target: u16,
    pub static_key: [u8; 32],
    pub ephemeral: [u8; 32],
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct Welcome {
    pub version: u16,
    pub static_key: [u8; 32],
    pub ephemeral: [u8; 32],
}

/// a channel that finished the handshake
pub struct Established<S> {
    pub stream: S,
    pub remote_static: [u8; 32],
    pub send: CipherState,
    pub recv: CipherState,
    pub state: ChannelState,
}

struct Secrets {
    ee: [u8; 32],
    es: [u8; 32],
    se: [u8; 32],
    ss: [u8; 32],
}

fn transcript_hash(hello: &Hello, welcome: &Welcome) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"cardserver.handshake.v1");
    hasher.update(&hello.encode());
    hasher.update(&welcome.encode());
    *hasher.finalize().as_bytes()
}

/// (initiator -> responder, responder -> initiator) keys
fn derive_keys(secrets: &Secrets, transcript: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let mut material = Vec::with_capacity(160);
    material.extend_from_slice(&secrets.ee);
    material.extend_from_slice(&secrets.es);
    material.extend_from_slice(&secrets.se);
    material.extend_from_slice(&secrets.ss);
    material.extend_from_slice(transcript);
    (
        blake3::derive_key(KDF_INITIATOR, &material),
        blake3::derive_key(KDF_RESPONDER, &material),
    )
}

fn decode<T: Decode>(bytes: &[u8], what: &str) -> Result<T, ChannelError> {
    T::decode(&mut &bytes[..]).map_err(|e| ChannelError::Handshake(format!("{what}: {e}")))
}

fn check_pinned(expected: Option<[u8; 32]>, got: &[u8; 32]) -> Result<(), ChannelError> {
    match expected {
        Some(key) if key != *got => Err(ChannelError::Authentication(format!(
            "static key {} does not match the pinned key {}",
            hex::encode(got),
            hex::encode(key)
        ))),
        _ => Ok(()),
    }
}

async fn confirm_remote<S>(
    stream: &mut S,
    recv: &mut CipherState,
    transcript: &[u8; 32],
) -> Result<(), ChannelError>
where
    S: AsyncRead + Unpin,
{
    let frame = match read_frame(stream).await {
        Ok(frame) => frame,
        Err(ChannelError::Closed) => {
            return Err(ChannelError::Authentication(
                "peer closed the channel during key confirmation".into(),
            ))
        }
        Err(e) => return Err(e),
    };
    match recv.open(&frame) {
        Ok(plain) if plain == transcript => Ok(()),
        _ => Err(ChannelError::Authentication("key confirmation failed".into())),
    }
}

/// dial side: send hello, expect `expected` (if pinned) as the responder key
pub async fn initiate<S>(
    mut stream: S,
    local: &StaticSecret,
    order: u16,
    target: u16,
    expected: Option<[u8; 32]>,
) -> Result<Established<S>, ChannelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut state = ChannelState::Connecting;
    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let hello = Hello {
        version: PROTOCOL_VERSION,
        order,
        target,
        static_key: PublicKey::from(local).to_bytes(),
        ephemeral: PublicKey::from(&ephemeral).to_bytes(),
    };
    write_frame(&mut stream, &hello.encode()).await?;

    let welcome: Welcome = decode(&read_frame(&mut stream).await?, "welcome")?;
    if welcome.version != PROTOCOL_VERSION {
        return Err(ChannelError::Handshake(format!(
            "version {} not supported",
            welcome.version
        )));
    }
    check_pinned(expected, &welcome.static_key)?;

    let remote_static = PublicKey::from(welcome.static_key);
    let remote_ephemeral = PublicKey::from(welcome.ephemeral);
    let secrets = Secrets {
        ee: ephemeral.diffie_hellman(&remote_ephemeral).to_bytes(),
        es: ephemeral.diffie_hellman(&remote_static).to_bytes(),
        se: local.diffie_hellman(&remote_ephemeral).to_bytes(),
        ss: local.diffie_hellman(&remote_static).to_bytes(),
    };
    let transcript = transcript_hash(&hello, &welcome);
    let (to_responder, to_initiator) = derive_keys(&secrets, &transcript);
    let mut send = CipherState::new(to_responder);
    let mut recv = CipherState::new(to_initiator);
    state = state.advance(ChannelState::Authenticated)?;

    write_frame(&mut stream, &send.seal(&transcript)?).await?;
    confirm_remote(&mut stream, &mut recv, &transcript).await?;
    state = state.advance(ChannelState::Ready)?;

    Ok(Established {
        stream,
        remote_static: welcome.static_key,
        send,
        recv,
        state,
    })
}

/// accept side, first half: read the dialer's hello so the caller can look
/// up which key to expect
pub async fn read_hello<S>(stream: &mut S) -> Result<Hello, ChannelError>
where
    S: AsyncRead + Unpin,
{
    let hello: Hello = decode(&read_frame(stream).await?, "hello")?;
    if hello.version != PROTOCOL_VERSION {
        return Err(ChannelError::Handshake(format!(
            "version {} not supported",
            hello.version
        )));
    }
    Ok(hello)
}

/// accept side, second half
pub async fn respond<S>(
    mut stream: S,
    local: &StaticSecret,
    hello: Hello,
    expected: Option<[u8; 32]>,
) -> Result<Established<S>, ChannelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut state = ChannelState::Connecting;
    check_pinned(expected, &hello.static_key)?;

    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let welcome = Welcome {
        version: PROTOCOL_VERSION,
        static_key: PublicKey::from(local).to_bytes(),
        ephemeral: PublicKey::from(&ephemeral).to_bytes(),
    };
    write_frame(&mut stream, &welcome.encode()).await?;

    let remote_static = PublicKey::from(hello.static_key);
    let remote_ephemeral = PublicKey::from(hello.ephemeral);
    let secrets = Secrets {
        ee: ephemeral.diffie_hellman(&remote_ephemeral).to_bytes(),
        es: local.diffie_hellman(&remote_ephemeral).to_bytes(),
        se: ephemeral.diffie_hellman(&remote_static).to_bytes(),
        ss: local.diffie_hellman(&remote_static).to_bytes(),
    };
    let transcript = transcript_hash(&hello, &welcome);
    let (to_responder, to_initiator) = derive_keys(&secrets, &transcript);
    let mut send = CipherState::new(to_initiator);
    let mut recv = CipherState::new(to_responder);
    state = state.advance(ChannelState::Authenticated)?;

    confirm_remote(&mut stream, &mut recv, &transcript).await?;
    write_frame(&mut stream, &send.seal(&transcript)?).await?;
    state = state.advance(ChannelState::Ready)?;

    Ok(Established {
        stream,
        remote_static: hello.static_key,
        send,
        recv,
        state,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> StaticSecret {
        StaticSecret::from([byte; 32])
    }

    fn public(secret: &StaticSecret) -> [u8; 32] {
        PublicKey::from(secret).to_bytes()
    }

    #[tokio::test]
    async fn test_handshake_agrees_on_keys() {
        let (a, mut b) = tokio::io::duplex(4096);
        let alice = key(1);
        let bob = key(2);
        let bob_public = public(&bob);
        let alice_public = public(&alice);

        let initiator = tokio::spawn(async move { initiate(a, &alice, 0, 1, Some(bob_public)).await });
        let hello = read_hello(&mut b).await.unwrap();
        assert_eq!(hello.order, 0);
        assert_eq!(hello.target, 1);
        assert_eq!(hello.static_key, alice_public);

        let mut responder = respond(b, &bob, hello, Some(alice_public)).await.unwrap();
        let mut initiator = initiator.await.unwrap().unwrap();

        assert_eq!(initiator.state, ChannelState::Ready);
        assert_eq!(responder.state, ChannelState::Ready);
        assert_eq!(initiator.remote_static, bob_public);
        assert_eq!(responder.remote_static, alice_public);

        let sealed = initiator.send.seal(b"ping").unwrap();
        assert_eq!(responder.recv.open(&sealed).unwrap(), b"ping");
        let sealed = responder.send.seal(b"pong").unwrap();
        assert_eq!(initiator.recv.open(&sealed).unwrap(), b"pong");
    }

    #[tokio::test]
    async fn test_initiator_rejects_unexpected_responder() {
        let (a, mut b) = tokio::io::duplex(4096);
        let alice = key(1);
        let wrong = public(&key(3));

        let initiator = tokio::spawn(async move { initiate(a, &alice, 0, 1, Some(wrong)).await });
        let hello = read_hello(&mut b).await.unwrap();
        let responder = tokio::spawn(async move { respond(b, &key(2), hello, None).await });

        assert!(matches!(
            initiator.await.unwrap(),
            Err(ChannelError::Authentication(_))
        ));
        // the responder sees the dialer hang up before confirming
        assert!(responder.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_responder_rejects_unexpected_initiator() {
        let (a, mut b) = tokio::io::duplex(4096);
        let initiator = tokio::spawn(async move { initiate(a, &key(1), 0, 1, None).await });
        let hello = read_hello(&mut b).await.unwrap();

        let result = respond(b, &key(2), hello, Some(public(&key(4)))).await;
        assert!(matches!(result, Err(ChannelError::Authentication(_))));
        assert!(initiator.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_impostor_without_secret_fails_confirmation() {
        // the impostor announces bob's public key but holds another secret
        let (a, mut b) = tokio::io::duplex(4096);
        let alice = key(1);
        let bob_public = public(&key(2));

        let initiator = tokio::spawn(async move { initiate(a, &alice, 0, 1, Some(bob_public)).await });
        let hello = read_hello(&mut b).await.unwrap();

        let impostor = key(5);
        let ephemeral = StaticSecret::random_from_rng(OsRng);
        let welcome = Welcome {
            version: PROTOCOL_VERSION,
            static_key: bob_public,
            ephemeral: public(&ephemeral),
        };
        write_frame(&mut b, &welcome.encode()).await.unwrap();

        // best effort at keys without bob's secret
        let secrets = Secrets {
            ee: ephemeral.diffie_hellman(&PublicKey::from(hello.ephemeral)).to_bytes(),
            es: impostor.diffie_hellman(&PublicKey::from(hello.ephemeral)).to_bytes(),
            se: ephemeral.diffie_hellman(&PublicKey::from(hello.static_key)).to_bytes(),
            ss: impostor.diffie_hellman(&PublicKey::from(hello.static_key)).to_bytes(),
        };
        let transcript = transcript_hash(&hello, &welcome);
        let (_, to_initiator) = derive_keys(&secrets, &transcript);
        let _ = read_frame(&mut b).await.unwrap();
        let mut send = CipherState::new(to_initiator);
        write_frame(&mut b, &send.seal(&transcript).unwrap()).await.unwrap();

        assert!(matches!(
            initiator.await.unwrap(),
            Err(ChannelError::Authentication(_))
        ));
    }

    #[tokio::test]
    async fn test_version_mismatch() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let hello = Hello {
            version: PROTOCOL_VERSION + 1,
            order: 0,
            target: 1,
            static_key: [0; 32],
            ephemeral: [0; 32],
        };
        write_frame(&mut a, &hello.encode()).await.unwrap();
        assert!(matches!(
            read_hello(&mut b).await,
            Err(ChannelError::Handshake(_))
        ));
    }
}
