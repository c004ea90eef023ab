//! One authenticated, encrypted duplex stream to a peer.
//!
//! A `SecureChannel` owns a split TCP stream behind two independent locks:
//! at most one send and at most one receive may be in progress at a time.
//! Parallelism toward a peer comes from multiple channels, never from
//! multiplexing one.
//!
//! Every frame is encrypted under the current `(key, nonce)` pair of the
//! direction's [`FrameCipher`], and the pair is rolled after the frame has
//! crossed the wire. A frame that fails to decrypt means the key streams
//! are out of lockstep and the channel is declared broken.
//!
//! Channels this node dialed carry a reconnector: after a transport error
//! the owner re-dials, re-runs the handshake and resets both key streams.
//! Accepted channels never self-reconnect; their failure tears down the
//! owning peer entry.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use rsa::RsaPublicKey;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::crypto::{FrameCipher, NodeIdentity};
use crate::error::ChannelError;
use crate::frame::{read_frame, write_frame, write_revert, Frame};
use crate::handshake;
use crate::transaction::decode_catalogue;

/// What a receive produced.
#[derive(Debug)]
pub enum Inbound {
    /// A decrypted frame body.
    Frame(Vec<u8>),
    /// The peer granted this side request capability.
    Reverted,
}

struct SendHalf {
    writer: OwnedWriteHalf,
    cipher: FrameCipher,
}

struct RecvHalf {
    reader: OwnedReadHalf,
    cipher: FrameCipher,
}

/// Dial-side state needed to re-establish the channel.
struct Reconnector {
    addr: String,
    identity: Arc<NodeIdentity>,
    peer_key: RsaPublicKey,
}

pub struct SecureChannel {
    peer: String,
    can_request: AtomicBool,
    /// Bumped on every successful reconnect so concurrent workers can tell
    /// whether somebody else already restored the channel.
    generation: AtomicU64,
    send: Mutex<SendHalf>,
    recv: Mutex<RecvHalf>,
    reconnect: Option<Reconnector>,
}

impl SecureChannel {
    /// Dial `addr`, run the handshake as initiator, and read the peer's
    /// catalogue frame. Returns the channel (request-capable) and the
    /// service names the peer advertised.
    pub async fn connect(
        addr: &str,
        peer: &str,
        identity: Arc<NodeIdentity>,
        peer_key: RsaPublicKey,
    ) -> Result<(Self, Vec<String>), ChannelError> {
        let (send, mut recv) = dial(addr, &identity, &peer_key).await?;
        let catalogue = recv_catalogue(&mut recv).await?;

        let channel = Self {
            peer: peer.to_string(),
            can_request: AtomicBool::new(true),
            generation: AtomicU64::new(0),
            send: Mutex::new(send),
            recv: Mutex::new(recv),
            reconnect: Some(Reconnector {
                addr: addr.to_string(),
                identity,
                peer_key,
            }),
        };
        Ok((channel, catalogue))
    }

    /// Wrap a stream this node accepted, after a completed handshake.
    /// Accepted channels start without request capability.
    pub fn accepted(stream: TcpStream, seed: &[u8], peer: &str) -> Self {
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        Self {
            peer: peer.to_string(),
            can_request: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            send: Mutex::new(SendHalf {
                writer,
                cipher: FrameCipher::new(seed),
            }),
            recv: Mutex::new(RecvHalf {
                reader,
                cipher: FrameCipher::new(seed),
            }),
            reconnect: None,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Whether this side may issue requests on this channel.
    pub fn can_request(&self) -> bool {
        self.can_request.load(Ordering::Acquire)
    }

    /// True for channels this node dialed.
    pub fn is_client_originated(&self) -> bool {
        self.reconnect.is_some()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Encrypt and send one frame, rolling the send key on success.
    pub async fn send(&self, plaintext: &[u8]) -> Result<(), ChannelError> {
        let mut half = self.send.lock().await;
        let sealed = half.cipher.seal(plaintext).map_err(|_| ChannelError::Broken)?;
        write_frame(&mut half.writer, &sealed).await?;
        half.cipher.roll();
        Ok(())
    }

    /// Send the single-byte role-reversal signal. The signal travels in
    /// plaintext and does not roll the key stream.
    pub async fn send_revert(&self) -> Result<(), ChannelError> {
        let mut half = self.send.lock().await;
        write_revert(&mut half.writer).await
    }

    /// Receive one frame, rolling the receive key on success.
    ///
    /// A role-reversal signal flips this side's request capability and is
    /// surfaced as [`Inbound::Reverted`].
    pub async fn recv(&self) -> Result<Inbound, ChannelError> {
        let mut half = self.recv.lock().await;
        match read_frame(&mut half.reader).await? {
            Frame::Revert => {
                self.can_request.store(true, Ordering::Release);
                tracing::debug!(peer = %self.peer, "channel reverted by peer");
                Ok(Inbound::Reverted)
            }
            Frame::Body(sealed) => {
                let plaintext = half.cipher.open(&sealed).map_err(|_| ChannelError::Broken)?;
                half.cipher.roll();
                Ok(Inbound::Frame(plaintext))
            }
        }
    }

    /// One reconnect attempt, skipped if another worker already succeeded.
    ///
    /// `seen_generation` is the generation the caller observed when its
    /// operation failed. If the channel has moved past it, the attempt is a
    /// no-op returning `Ok(None)`. On an actual reconnect the handshake is
    /// re-run, both key streams reset, and the peer's fresh catalogue frame
    /// is returned for the owner to merge.
    pub async fn reconnect_if_stale(
        &self,
        seen_generation: u64,
    ) -> Result<Option<Vec<String>>, ChannelError> {
        let rec = self.reconnect.as_ref().ok_or(ChannelError::NotReconnectable)?;

        // Lock order: send before recv, everywhere.
        let mut send = self.send.lock().await;
        let mut recv = self.recv.lock().await;
        if self.generation.load(Ordering::Acquire) != seen_generation {
            return Ok(None);
        }

        let (new_send, mut new_recv) = dial(&rec.addr, &rec.identity, &rec.peer_key).await?;
        let catalogue = recv_catalogue(&mut new_recv).await?;

        *send = new_send;
        *recv = new_recv;
        self.generation.fetch_add(1, Ordering::AcqRel);
        tracing::info!(peer = %self.peer, addr = %rec.addr, "channel re-established");
        Ok(Some(catalogue))
    }
}

/// Dial and handshake, producing fresh halves with reset key streams.
async fn dial(
    addr: &str,
    identity: &NodeIdentity,
    peer_key: &RsaPublicKey,
) -> Result<(SendHalf, RecvHalf), ChannelError> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    let seed = handshake::initiate(&mut stream, identity, peer_key).await?;
    let (reader, writer) = stream.into_split();
    Ok((
        SendHalf {
            writer,
            cipher: FrameCipher::new(&seed),
        },
        RecvHalf {
            reader,
            cipher: FrameCipher::new(&seed),
        },
    ))
}

/// Read the catalogue frame an acceptor sends right after the handshake.
async fn recv_catalogue(half: &mut RecvHalf) -> Result<Vec<String>, ChannelError> {
    match read_frame(&mut half.reader).await? {
        Frame::Revert => Err(ChannelError::Protocol(
            "expected catalogue frame, got role-reversal signal".into(),
        )),
        Frame::Body(sealed) => {
            let plaintext = half.cipher.open(&sealed).map_err(|_| ChannelError::Broken)?;
            half.cipher.roll();
            decode_catalogue(&plaintext)
                .map_err(|e| ChannelError::Protocol(format!("undecodable catalogue: {e}")))
        }
    }
}
