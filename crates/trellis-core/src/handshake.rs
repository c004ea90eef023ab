//! Mutual key exchange over a framed stream.
//!
//! The connecting side generates a random seed, signs it, and sends
//! `{seed, public key, signature}` encrypted to the acceptor's public key.
//! The acceptor decrypts, verifies the signature against the claimed key,
//! and resolves the key in the trusted key store — which must hold it
//! exactly once. Both sides then share the seed that drives the channel's
//! symmetric key schedule.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite};
use zeroize::Zeroizing;

use crate::crypto::{
    generate_seed, oaep_encrypt, public_key_from_der, verify_signature, NodeIdentity, SEED_LEN,
};
use crate::error::{ChannelError, HandshakeError};
use crate::frame::{read_frame, write_frame, Frame};
use crate::keystore::TrustedKeyStore;
use rsa::RsaPublicKey;

/// The handshake body, bincode-encoded then OAEP-encrypted to the acceptor.
#[derive(Serialize, Deserialize)]
struct HelloToken {
    seed: Vec<u8>,
    /// Initiator public key, PKCS#1 DER.
    public_key: Vec<u8>,
    /// PKCS#1 v1.5 SHA-256 signature over the seed.
    signature: Vec<u8>,
}

/// What the acceptor learns from a successful handshake.
pub struct Accepted {
    pub seed: Zeroizing<Vec<u8>>,
    /// Friendly name resolved from the trusted key store.
    pub peer_name: String,
    pub peer_key: RsaPublicKey,
}

/// Run the handshake as the connecting side. Returns the shared seed.
pub async fn initiate<S>(
    stream: &mut S,
    identity: &NodeIdentity,
    responder: &RsaPublicKey,
) -> Result<Zeroizing<Vec<u8>>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let seed = generate_seed();
    let token = HelloToken {
        seed: seed.to_vec(),
        public_key: identity.public_der().map_err(bad)?,
        signature: identity.sign(&seed),
    };
    let plaintext = Zeroizing::new(bincode::serialize(&token).map_err(bad)?);
    let ciphertext = oaep_encrypt(responder, &plaintext).map_err(bad)?;
    write_frame(stream, &ciphertext).await.map_err(channel_err)?;
    Ok(seed)
}

/// Run the handshake as the accepting side.
pub async fn accept<S>(
    stream: &mut S,
    identity: &NodeIdentity,
    store: &TrustedKeyStore,
) -> Result<Accepted, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = read_frame(stream).await.map_err(channel_err)?;
    let ciphertext = match frame {
        Frame::Body(bytes) => bytes,
        Frame::Revert => {
            return Err(HandshakeError::Bad(
                "unexpected role-reversal signal before authentication".into(),
            ))
        }
    };

    let plaintext = identity.decrypt(&ciphertext).map_err(bad)?;
    let token: HelloToken = bincode::deserialize(&plaintext).map_err(bad)?;

    if token.seed.len() < SEED_LEN {
        return Err(HandshakeError::Bad(format!(
            "seed of {} bytes is below the {SEED_LEN} byte minimum",
            token.seed.len()
        )));
    }

    let peer_key = public_key_from_der(&token.public_key).map_err(bad)?;
    verify_signature(&peer_key, &token.seed, &token.signature).map_err(bad)?;

    // Exactly-once lookup: zero matches → UntrustedPeer, several → AmbiguousPeer.
    let peer_name = store.name_of(&peer_key)?;

    let fingerprint = Sha256::digest(&token.public_key);
    tracing::debug!(
        peer = %peer_name,
        key = %hex::encode(&fingerprint[..8]),
        "handshake accepted"
    );
    Ok(Accepted {
        seed: Zeroizing::new(token.seed),
        peer_name,
        peer_key,
    })
}

fn bad(e: impl std::fmt::Display) -> HandshakeError {
    HandshakeError::Bad(e.to_string())
}

fn channel_err(e: ChannelError) -> HandshakeError {
    match e {
        ChannelError::Io(io) => HandshakeError::Io(io),
        other => HandshakeError::Bad(other.to_string()),
    }
}
