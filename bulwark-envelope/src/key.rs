//! A named key's material: 32 random bytes plus an algorithm tag.

use getrandom::getrandom;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::cipher;
use crate::ciphertext::{Ciphertext, WireAlgorithm, IV_LEN};
use crate::context::Context;
use crate::error::{DecryptError, EncryptError};

/// Key material length. All keys are 256-bit.
pub const KEY_LEN: usize = 32;

/// Per-message plaintext limit: 1 MiB.
pub const MAX_SEAL_LEN: usize = 1 << 20;

/// Domain separator for [`SecretKey::hmac`], keeping subkey derivation
/// disjoint from the sealing-key derivation (which MACs a raw 16-byte salt).
const HMAC_DOMAIN: &[u8] = b"bulwark/derive/v1";

type HmacSha256 = Hmac<Sha256>;

// ---------------------------------------------------------------------------
// Algorithm
// ---------------------------------------------------------------------------

/// AEAD algorithm bound to a key at creation time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    #[serde(rename = "AES-256-GCM-HMAC-SHA256")]
    Aes256Gcm,
    #[serde(rename = "ChaCha20Poly1305")]
    ChaCha20Poly1305,
}

impl Algorithm {
    /// The preferred algorithm for this build target: AES-256-GCM where
    /// constant-time AES is the norm, ChaCha20-Poly1305 everywhere else.
    pub fn native() -> Self {
        #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
        {
            Algorithm::Aes256Gcm
        }
        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        {
            Algorithm::ChaCha20Poly1305
        }
    }

    /// Canonical wire identifier.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Aes256Gcm => "AES-256-GCM-HMAC-SHA256",
            Algorithm::ChaCha20Poly1305 => "ChaCha20Poly1305",
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// SecretKey
// ---------------------------------------------------------------------------

/// 32 bytes of key material tagged with its AEAD algorithm.
///
/// The material is zeroed on drop. Cloning is permitted; the cache layer
/// hands out clones to concurrent requests.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey {
    bytes: [u8; KEY_LEN],
    #[zeroize(skip)]
    algorithm: Algorithm,
}

impl SecretKey {
    /// Generate a fresh key from the system random source.
    pub fn generate(algorithm: Algorithm) -> Result<Self, EncryptError> {
        let mut bytes = [0u8; KEY_LEN];
        getrandom(&mut bytes).map_err(|_| EncryptError::Failure)?;
        Ok(Self { bytes, algorithm })
    }

    /// Construct from existing material, e.g. an imported key.
    pub fn new(bytes: [u8; KEY_LEN], algorithm: Algorithm) -> Self {
        Self { bytes, algorithm }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Raw material, for persistence by the key store layer only.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }

    /// AEAD-seal `plaintext` with `context` as associated data.
    pub fn seal(&self, plaintext: &[u8], context: &Context) -> Result<Ciphertext, EncryptError> {
        if plaintext.len() > MAX_SEAL_LEN {
            return Err(EncryptError::TooLarge(plaintext.len()));
        }
        let aad = context.to_aad();
        let nonce = cipher::nonce()?;
        match self.algorithm {
            Algorithm::Aes256Gcm => {
                let mut iv = [0u8; IV_LEN];
                getrandom(&mut iv).map_err(|_| EncryptError::Failure)?;
                let sealing = self.sealing_key(&iv);
                let bytes = cipher::seal_aes256gcm(&sealing, &nonce, plaintext, &aad)?;
                Ok(Ciphertext {
                    algorithm: self.algorithm.as_str().into(),
                    iv: Some(iv),
                    nonce,
                    bytes,
                })
            }
            Algorithm::ChaCha20Poly1305 => {
                let bytes = cipher::seal_chacha20poly1305(&self.bytes, &nonce, plaintext, &aad)?;
                Ok(Ciphertext {
                    algorithm: self.algorithm.as_str().into(),
                    iv: None,
                    nonce,
                    bytes,
                })
            }
        }
    }

    /// Open a sealed container. The container's algorithm must match this
    /// key's; `context` must equal the sealing context.
    pub fn open(&self, sealed: &Ciphertext, context: &Context) -> Result<Vec<u8>, DecryptError> {
        let wire = WireAlgorithm::parse(&sealed.algorithm).ok_or(DecryptError)?;
        let aad = context.to_aad();
        match (self.algorithm, wire) {
            (Algorithm::Aes256Gcm, WireAlgorithm::Aes256GcmHmacSha256) => {
                let iv = sealed.iv.ok_or(DecryptError)?;
                let sealing = self.sealing_key(&iv);
                cipher::open_aes256gcm(&sealing, &sealed.nonce, &sealed.bytes, &aad)
            }
            (Algorithm::Aes256Gcm, WireAlgorithm::Aes256GcmDirect) => {
                cipher::open_aes256gcm(&self.bytes, &sealed.nonce, &sealed.bytes, &aad)
            }
            (Algorithm::ChaCha20Poly1305, WireAlgorithm::ChaCha20Poly1305) => {
                cipher::open_chacha20poly1305(&self.bytes, &sealed.nonce, &sealed.bytes, &aad)
            }
            _ => Err(DecryptError),
        }
    }

    /// Keyed MAC over `data`, for deterministic subkey derivation.
    pub fn hmac(&self, data: &[u8]) -> [u8; 32] {
        // HmacSha256 accepts keys of any length.
        let mut mac = HmacSha256::new_from_slice(&self.bytes).expect("HMAC accepts 32-byte keys");
        mac.update(HMAC_DOMAIN);
        mac.update(data);
        mac.finalize().into_bytes().into()
    }

    /// Per-message AES sealing key: HMAC-SHA-256(key, iv).
    fn sealing_key(&self, iv: &[u8; IV_LEN]) -> [u8; KEY_LEN] {
        let mut mac = HmacSha256::new_from_slice(&self.bytes).expect("HMAC accepts 32-byte keys");
        mac.update(iv);
        mac.finalize().into_bytes().into()
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.debug_struct("SecretKey")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}
