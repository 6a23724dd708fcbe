//! Authenticated encryption for credential material at rest.
//!
//! Uses ChaCha20-Poly1305 AEAD. Every sealed value carries a fresh random
//! nonce and a 128-bit tag, and callers bind it to its slot through the
//! associated data, so tampering, slot swaps and wrong keys are all rejected
//! before any plaintext is produced. Key bytes are zeroed on drop.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use ring::aead::{
    Aad, BoundKey, Nonce, NonceSequence, OpeningKey, SealingKey, UnboundKey, CHACHA20_POLY1305,
};
use ring::error::Unspecified;
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Size of ChaCha20-Poly1305 key in bytes (256 bits)
pub const KEY_LEN: usize = 32;

/// Size of nonce in bytes (96 bits)
const NONCE_LEN: usize = 12;

/// Size of authentication tag appended to ciphertext (128 bits)
const TAG_LEN: usize = 16;

// ---------------------------------------------------------------------------
// Error Types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("failed to generate random bytes")]
    RandomGeneration,
    #[error("encryption failed")]
    Encryption,
    /// Wrong key, wrong associated data, or modified ciphertext.
    #[error("decryption failed: authentication tag mismatch")]
    Decryption,
    #[error("invalid format: {0}")]
    InvalidFormat(String),
}

// ---------------------------------------------------------------------------
// Key Management
// ---------------------------------------------------------------------------

/// A cryptographic key that is automatically zeroed from memory when dropped.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    bytes: [u8; KEY_LEN],
}

impl EncryptionKey {
    /// Generate a new random encryption key using system entropy.
    pub fn generate() -> Result<Self, CryptoError> {
        let rng = SystemRandom::new();
        let mut bytes = [0u8; KEY_LEN];
        rng.fill(&mut bytes)
            .map_err(|_| CryptoError::RandomGeneration)?;
        Ok(Self { bytes })
    }

    /// Create an encryption key from existing bytes (exactly 32).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_LEN {
            return Err(CryptoError::InvalidFormat(format!(
                "key must be {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            )));
        }
        let mut key_bytes = [0u8; KEY_LEN];
        key_bytes.copy_from_slice(bytes);
        Ok(Self { bytes: key_bytes })
    }

    /// Parse the textual form: URL-safe base64 of the 32 key bytes.
    pub fn from_encoded(encoded: &str) -> Result<Self, CryptoError> {
        let decoded = Zeroizing::new(
            URL_SAFE
                .decode(encoded.trim())
                .map_err(|e| CryptoError::InvalidFormat(format!("key is not base64: {e}")))?,
        );
        Self::from_bytes(&decoded)
    }

    /// Textual form accepted by [`EncryptionKey::from_encoded`].
    pub fn to_encoded(&self) -> Zeroizing<String> {
        Zeroizing::new(URL_SAFE.encode(self.bytes))
    }

    fn unbound(&self) -> Result<UnboundKey, Unspecified> {
        UnboundKey::new(&CHACHA20_POLY1305, &self.bytes)
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

// ---------------------------------------------------------------------------
// Nonce Management
// ---------------------------------------------------------------------------

/// A nonce sequence that yields exactly one nonce.
struct OneNonceSequence {
    nonce: Option<Nonce>,
}

impl OneNonceSequence {
    fn new(nonce: Nonce) -> Self {
        Self { nonce: Some(nonce) }
    }
}

impl NonceSequence for OneNonceSequence {
    fn advance(&mut self) -> Result<Nonce, Unspecified> {
        self.nonce.take().ok_or(Unspecified)
    }
}

// ---------------------------------------------------------------------------
// Encryption/Decryption
// ---------------------------------------------------------------------------

/// Seal `plaintext`, authenticating `aad` alongside it.
///
/// Returns `nonce (12) || ciphertext || tag (16)`.
pub fn encrypt(key: &EncryptionKey, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let rng = SystemRandom::new();

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rng.fill(&mut nonce_bytes)
        .map_err(|_| CryptoError::RandomGeneration)?;
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let unbound_key = key.unbound().map_err(|_| CryptoError::Encryption)?;
    let mut sealing_key = SealingKey::new(unbound_key, OneNonceSequence::new(nonce));

    let mut in_out = plaintext.to_vec();
    sealing_key
        .seal_in_place_append_tag(Aad::from(aad), &mut in_out)
        .map_err(|_| CryptoError::Encryption)?;

    let mut result = Vec::with_capacity(NONCE_LEN + in_out.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&in_out);
    in_out.zeroize();

    Ok(result)
}

/// Open a value produced by [`encrypt`] with the same key and `aad`.
///
/// The returned buffer is zeroed when dropped.
pub fn decrypt(
    key: &EncryptionKey,
    sealed: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::InvalidFormat(format!(
            "ciphertext too short: expected at least {} bytes, got {}",
            NONCE_LEN + TAG_LEN,
            sealed.len()
        )));
    }

    let (nonce_bytes, body) = sealed.split_at(NONCE_LEN);
    let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
        .map_err(|_| CryptoError::InvalidFormat("failed to extract nonce".into()))?;

    let unbound_key = key.unbound().map_err(|_| CryptoError::Decryption)?;
    let mut opening_key = OpeningKey::new(unbound_key, OneNonceSequence::new(nonce));

    let mut in_out = Zeroizing::new(body.to_vec());
    let plaintext_len = opening_key
        .open_in_place(Aad::from(aad), &mut in_out)
        .map_err(|_| CryptoError::Decryption)?
        .len();
    in_out.truncate(plaintext_len);

    Ok(in_out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
