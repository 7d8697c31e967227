//! AEAD primitives: AES-256-GCM and ChaCha20-Poly1305.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use chacha20poly1305::ChaCha20Poly1305;
use getrandom::getrandom;

use crate::error::{DecryptError, EncryptError};

/// AEAD nonce length. Both ciphers use 96-bit nonces.
pub const NONCE_LEN: usize = 12;

/// Generate a random 12-byte nonce. Used during sealing only.
pub fn nonce() -> Result<[u8; NONCE_LEN], EncryptError> {
    let mut n = [0u8; NONCE_LEN];
    getrandom(&mut n).map_err(|_| EncryptError::Failure)?;
    Ok(n)
}

pub fn seal_aes256gcm(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, EncryptError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| EncryptError::Failure)?;
    let nonce = Nonce::from_slice(nonce);
    let payload = Payload { msg: plaintext, aad };
    cipher.encrypt(nonce, payload).map_err(|_| EncryptError::Failure)
}

pub fn open_aes256gcm(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, DecryptError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| DecryptError)?;
    let nonce = Nonce::from_slice(nonce);
    let payload = Payload { msg: ciphertext, aad };
    cipher.decrypt(nonce, payload).map_err(|_| DecryptError)
}

pub fn seal_chacha20poly1305(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, EncryptError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| EncryptError::Failure)?;
    let nonce = chacha20poly1305::Nonce::from_slice(nonce);
    let payload = Payload { msg: plaintext, aad };
    cipher.encrypt(nonce, payload).map_err(|_| EncryptError::Failure)
}

pub fn open_chacha20poly1305(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, DecryptError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| DecryptError)?;
    let nonce = chacha20poly1305::Nonce::from_slice(nonce);
    let payload = Payload { msg: ciphertext, aad };
    cipher.decrypt(nonce, payload).map_err(|_| DecryptError)
}
