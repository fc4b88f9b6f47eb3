//! Community-key encryption for signaler frames.
//!
//! Every websocket frame between a mesh adapter and the signaler is sealed
//! with AES-256-GCM under a key derived from the community password. The
//! signaler itself never holds the key; it relays opaque ciphertext.
//!
//! Key derivation is a wire contract shared with other implementations:
//! the 28-byte SHA-224 digest of the raw password bytes is copied into a
//! zero-initialized 32-byte buffer, leaving four trailing zero bytes.
//! Sealed output is `nonce || ciphertext||tag` with a fresh random
//! 12-byte nonce per sealing.

use aes_gcm::aead::Aead;
use aes_gcm::aead::OsRng;
use aes_gcm::AeadCore;
use aes_gcm::Aes256Gcm;
use aes_gcm::KeyInit;
use aes_gcm::Nonce;
use sha2::Digest;
use sha2::Sha224;

use crate::error::Error;
use crate::error::Result;

/// Nonce size of AES-GCM (96 bits).
const NONCE_SIZE: usize = 12;

/// Derive the 32-byte community key from the shared ASCII password.
pub fn derive_key(password: &str) -> [u8; 32] {
    let digest = Sha224::digest(password.as_bytes());
    let mut key = [0u8; 32];
    key[..digest.len()].copy_from_slice(&digest);
    key
}

/// Seal `plaintext` under the key derived from `password`.
pub fn seal(plaintext: &[u8], password: &str) -> Result<Vec<u8>> {
    let key = derive_key(password);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| Error::BadCiphertext)?;

    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| Error::BadCiphertext)?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a sealed frame. Fails with [Error::BadCiphertext] when the input is
/// shorter than the nonce or authentication fails.
pub fn open(sealed: &[u8], password: &str) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_SIZE {
        return Err(Error::BadCiphertext);
    }

    let key = derive_key(password);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| Error::BadCiphertext)?;

    let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::BadCiphertext)
}
