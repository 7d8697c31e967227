//! The self-describing ciphertext container.
//!
//! Compact JSON on the wire:
//!
//! ```json
//! {"alg":"AES-256-GCM-HMAC-SHA256","iv":"...","nonce":"...","bytes":"..."}
//! {"alg":"ChaCha20Poly1305","nonce":"...","bytes":"..."}
//! ```
//!
//! `iv` is the 16-byte sealing-key salt of the AES variant. The reader also
//! accepts the legacy algorithm aliases `AES-256-GCM` (no salt, direct key)
//! and `C20P1305`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::cipher::NONCE_LEN;
use crate::error::DecryptError;

/// Length of the sealing-key salt carried by the AES variant.
pub const IV_LEN: usize = 16;

/// How the sealing key relates to the stored key material.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WireAlgorithm {
    /// Canonical AES form: per-message key derived as HMAC-SHA-256(key, iv).
    Aes256GcmHmacSha256,
    /// Legacy AES form: the stored key is used directly.
    Aes256GcmDirect,
    /// ChaCha20-Poly1305 with the stored key used directly.
    ChaCha20Poly1305,
}

impl WireAlgorithm {
    pub(crate) fn parse(s: &str) -> Option<Self> {
        match s {
            "AES-256-GCM-HMAC-SHA256" => Some(Self::Aes256GcmHmacSha256),
            "AES-256-GCM" => Some(Self::Aes256GcmDirect),
            "ChaCha20Poly1305" | "C20P1305" => Some(Self::ChaCha20Poly1305),
            _ => None,
        }
    }
}

/// A sealed payload together with everything needed to open it again.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Ciphertext {
    /// Algorithm identifier, e.g. `AES-256-GCM-HMAC-SHA256`.
    #[serde(rename = "alg")]
    pub algorithm: String,
    /// Sealing-key salt (AES variant only).
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "b64_opt_iv"
    )]
    pub iv: Option<[u8; IV_LEN]>,
    /// 96-bit AEAD nonce.
    #[serde(with = "b64_nonce")]
    pub nonce: [u8; NONCE_LEN],
    /// Ciphertext plus authentication tag.
    #[serde(with = "b64_bytes")]
    pub bytes: Vec<u8>,
}

impl Ciphertext {
    /// Parse a container from raw JSON. Any defect is a [`DecryptError`].
    pub fn from_slice(data: &[u8]) -> Result<Self, DecryptError> {
        serde_json::from_slice(data).map_err(|_| DecryptError)
    }

    /// Canonical JSON encoding.
    pub fn to_vec(&self) -> Vec<u8> {
        // Serialization of this shape cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Base64 field codecs
// ---------------------------------------------------------------------------

mod b64_bytes {
    use super::*;
    use serde::de::Error as _;

    pub fn serialize<S: Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64.encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        BASE64.decode(s).map_err(D::Error::custom)
    }
}

mod b64_nonce {
    use super::*;
    use serde::de::Error as _;

    pub fn serialize<S: Serializer>(v: &[u8; NONCE_LEN], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64.encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; NONCE_LEN], D::Error> {
        let s = String::deserialize(d)?;
        let raw = BASE64.decode(s).map_err(D::Error::custom)?;
        raw.try_into()
            .map_err(|_| D::Error::custom("nonce must be 12 bytes"))
    }
}

mod b64_opt_iv {
    use super::*;
    use serde::de::Error as _;

    pub fn serialize<S: Serializer>(
        v: &Option<[u8; IV_LEN]>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        match v {
            Some(iv) => s.serialize_str(&BASE64.encode(iv)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<[u8; IV_LEN]>, D::Error> {
        let s = Option::<String>::deserialize(d)?;
        match s {
            None => Ok(None),
            Some(s) => {
                let raw = BASE64.decode(s).map_err(D::Error::custom)?;
                let iv = raw
                    .try_into()
                    .map_err(|_| D::Error::custom("iv must be 16 bytes"))?;
                Ok(Some(iv))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_legacy_aliases() {
        assert_eq!(
            WireAlgorithm::parse("AES-256-GCM"),
            Some(WireAlgorithm::Aes256GcmDirect)
        );
        assert_eq!(
            WireAlgorithm::parse("C20P1305"),
            Some(WireAlgorithm::ChaCha20Poly1305)
        );
        assert_eq!(WireAlgorithm::parse("AES-128-GCM"), None);
    }

    #[test]
    fn rejects_bad_nonce_length() {
        let json = format!(
            r#"{{"alg":"ChaCha20Poly1305","nonce":"{}","bytes":"{}"}}"#,
            BASE64.encode([0u8; 8]),
            BASE64.encode([0u8; 16]),
        );
        assert!(Ciphertext::from_slice(json.as_bytes()).is_err());
    }

    #[test]
    fn iv_is_omitted_when_absent() {
        let ct = Ciphertext {
            algorithm: "ChaCha20Poly1305".into(),
            iv: None,
            nonce: [0u8; NONCE_LEN],
            bytes: vec![1, 2, 3],
        };
        let json = String::from_utf8(ct.to_vec()).unwrap();
        assert!(!json.contains("iv"));
    }
}
