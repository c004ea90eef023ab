//! Cryptographic primitives for Trellis.
//!
//! Three pieces:
//!   1. `NodeIdentity` — the node's long-term RSA key pair (PKCS#1 public,
//!      PKCS#8 private, generated to disk on first run).
//!   2. Chunked RSA-OAEP-SHA256 encryption and PKCS#1 v1.5 SHA-256
//!      signatures for the handshake token.
//!   3. `KeyStream` / `FrameCipher` — the deterministic per-frame key
//!      schedule and the XChaCha20-Poly1305 frame cipher it feeds.
//!
//! Seed and frame-key material is zeroized on drop. There is no unsafe
//! code in this module.

use std::path::Path;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Length of the handshake seed in bytes.
pub const SEED_LEN: usize = 32;

/// OAEP-SHA256 overhead per RSA block: 2 * hash_len + 2.
const OAEP_OVERHEAD: usize = 2 * 32 + 2;

// ── Node identity ─────────────────────────────────────────────────────────────

/// The local node's long-term RSA key pair.
pub struct NodeIdentity {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl NodeIdentity {
    /// Generate a fresh key pair. 8192 bits in production; tests use 2048.
    pub fn generate(bits: usize) -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::new(&mut OsRng, bits).map_err(CryptoError::Rsa)?;
        let public = private.to_public_key();
        Ok(Self { private, public })
    }

    /// Load the key pair from disk, generating and persisting one if the
    /// private key file does not exist. The public key is written alongside
    /// (PKCS#1 PEM) so it can be handed to peers for their trusted stores.
    pub fn load_or_generate(
        public_path: &Path,
        private_path: &Path,
        bits: usize,
    ) -> Result<Self, CryptoError> {
        if private_path.exists() {
            let pem = std::fs::read_to_string(private_path)
                .map_err(|e| CryptoError::KeyFile(private_path.display().to_string(), e))?;
            let private = RsaPrivateKey::from_pkcs8_pem(&pem).map_err(CryptoError::Pkcs8)?;
            let public = private.to_public_key();
            let identity = Self { private, public };
            if !public_path.exists() {
                identity.write_public(public_path)?;
            }
            return Ok(identity);
        }

        let identity = Self::generate(bits)?;
        if let Some(parent) = private_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CryptoError::KeyFile(private_path.display().to_string(), e))?;
        }
        let pem: Zeroizing<String> = identity
            .private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(CryptoError::Pkcs8)?;
        std::fs::write(private_path, pem.as_bytes())
            .map_err(|e| CryptoError::KeyFile(private_path.display().to_string(), e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(private_path, std::fs::Permissions::from_mode(0o600));
        }
        identity.write_public(public_path)?;
        Ok(identity)
    }

    fn write_public(&self, path: &Path) -> Result<(), CryptoError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CryptoError::KeyFile(path.display().to_string(), e))?;
        }
        let pem = self
            .public
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(CryptoError::Pkcs1)?;
        std::fs::write(path, pem.as_bytes())
            .map_err(|e| CryptoError::KeyFile(path.display().to_string(), e))?;
        Ok(())
    }

    pub fn public(&self) -> &RsaPublicKey {
        &self.public
    }

    /// The public key as PKCS#1 DER, the form carried in handshake tokens
    /// and trusted key stores.
    pub fn public_der(&self) -> Result<Vec<u8>, CryptoError> {
        public_key_der(&self.public)
    }

    /// PKCS#1 v1.5 SHA-256 signature over `data`.
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        let signing = SigningKey::<Sha256>::new(self.private.clone());
        signing.sign(data).to_vec()
    }

    /// Chunk-wise OAEP decryption with the private key.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let block = self.private.size();
        if ciphertext.is_empty() || ciphertext.len() % block != 0 {
            return Err(CryptoError::BadCiphertextLength(ciphertext.len()));
        }
        let mut plaintext = Vec::with_capacity(ciphertext.len());
        for chunk in ciphertext.chunks(block) {
            let part = self
                .private
                .decrypt(Oaep::new::<Sha256>(), chunk)
                .map_err(CryptoError::Rsa)?;
            plaintext.extend_from_slice(&part);
        }
        Ok(Zeroizing::new(plaintext))
    }
}

/// Encode a public key as PKCS#1 DER.
pub fn public_key_der(key: &RsaPublicKey) -> Result<Vec<u8>, CryptoError> {
    Ok(key.to_pkcs1_der().map_err(CryptoError::Pkcs1)?.as_bytes().to_vec())
}

/// Decode a public key from PKCS#1 DER.
pub fn public_key_from_der(der: &[u8]) -> Result<RsaPublicKey, CryptoError> {
    RsaPublicKey::from_pkcs1_der(der).map_err(CryptoError::Pkcs1)
}

/// Chunk-wise OAEP-SHA256 encryption to a peer's public key.
///
/// A handshake token for an 8192-bit pair runs past two kilobytes, well
/// beyond one OAEP block, so the plaintext is split into maximal blocks
/// and each is encrypted separately. Output length is a multiple of the
/// modulus size.
pub fn oaep_encrypt(to: &RsaPublicKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let block = to.size() - OAEP_OVERHEAD;
    let mut ciphertext = Vec::with_capacity(plaintext.len() + to.size());
    for chunk in plaintext.chunks(block.max(1)) {
        let part = to
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), chunk)
            .map_err(CryptoError::Rsa)?;
        ciphertext.extend_from_slice(&part);
    }
    Ok(ciphertext)
}

/// Verify a PKCS#1 v1.5 SHA-256 signature.
pub fn verify_signature(
    signer: &RsaPublicKey,
    data: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    let verifying = VerifyingKey::<Sha256>::new(signer.clone());
    let signature = Signature::try_from(signature).map_err(|_| CryptoError::BadSignature)?;
    verifying
        .verify(data, &signature)
        .map_err(|_| CryptoError::BadSignature)
}

/// Generate a cryptographically random handshake seed.
pub fn generate_seed() -> Zeroizing<Vec<u8>> {
    let mut seed = vec![0u8; SEED_LEN];
    OsRng.fill_bytes(&mut seed);
    Zeroizing::new(seed)
}

// ── Deterministic key stream ──────────────────────────────────────────────────

/// Symmetric material for one frame: a 256-bit key and a 192-bit nonce.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct FrameKey {
    key: [u8; 32],
    nonce: [u8; 24],
}

/// Deterministic generator of `(key, nonce)` pairs, seeded identically on
/// both ends of a channel from the handshake seed.
///
/// Both sides draw the first pair at channel construction and advance by
/// exactly one pair per successful send (sender) or receive (receiver).
/// The underlying stream is ordered and reliable, so the two generators
/// stay in lockstep for as long as every frame decrypts.
pub struct KeyStream {
    rng: ChaCha20Rng,
}

impl KeyStream {
    /// Seed a stream from the shared handshake seed.
    pub fn new(seed: &[u8]) -> Self {
        let digest: [u8; 32] = Sha256::digest(seed).into();
        Self {
            rng: ChaCha20Rng::from_seed(digest),
        }
    }

    /// Draw the next `(key, nonce)` pair.
    pub fn next_key(&mut self) -> FrameKey {
        let mut key = [0u8; 32];
        let mut nonce = [0u8; 24];
        self.rng.fill_bytes(&mut key);
        self.rng.fill_bytes(&mut nonce);
        FrameKey { key, nonce }
    }
}

// ── Frame cipher ──────────────────────────────────────────────────────────────

/// One direction of a channel's symmetric encryption.
///
/// Holds the current frame key. The owner calls [`FrameCipher::roll`] after
/// the frame has actually crossed the wire — never after a failed write,
/// and never after a failed decrypt (the channel is already desynchronized
/// and must be torn down).
pub struct FrameCipher {
    stream: KeyStream,
    current: FrameKey,
}

impl FrameCipher {
    pub fn new(seed: &[u8]) -> Self {
        let mut stream = KeyStream::new(seed);
        let current = stream.next_key();
        Self { stream, current }
    }

    /// Encrypt one frame body under the current key.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&self.current.key));
        cipher
            .encrypt(XNonce::from_slice(&self.current.nonce), plaintext)
            .map_err(|_| CryptoError::Seal)
    }

    /// Decrypt one frame body under the current key.
    pub fn open(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&self.current.key));
        cipher
            .decrypt(XNonce::from_slice(&self.current.nonce), ciphertext)
            .map_err(|_| CryptoError::Open)
    }

    /// Advance to the next `(key, nonce)` pair.
    pub fn roll(&mut self) {
        self.current = self.stream.next_key();
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("RSA operation failed: {0}")]
    Rsa(rsa::Error),

    #[error("PKCS#1 encoding error: {0}")]
    Pkcs1(rsa::pkcs1::Error),

    #[error("PKCS#8 encoding error: {0}")]
    Pkcs8(rsa::pkcs8::Error),

    #[error("key file {0}: {1}")]
    KeyFile(String, std::io::Error),

    #[error("ciphertext length {0} is not a whole number of RSA blocks")]
    BadCiphertextLength(usize),

    #[error("signature verification failed")]
    BadSignature,

    #[error("frame encryption failed")]
    Seal,

    #[error("frame decryption failed")]
    Open,
}
