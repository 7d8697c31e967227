//! The serialized form of a stored key: what actually lives in a backend.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bulwark_envelope::{Algorithm, SecretKey, KEY_LEN};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::identity::Identity;

/// A named key as persisted: material plus creation metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyRecord {
    /// Base64 of the 32-byte key material.
    pub bytes: String,
    pub algorithm: Algorithm,
    pub created_at: DateTime<Utc>,
    pub created_by: Identity,
}

impl KeyRecord {
    pub fn new(key: &SecretKey, created_by: Identity) -> Self {
        Self {
            bytes: BASE64.encode(key.as_bytes()),
            algorithm: key.algorithm(),
            created_at: Utc::now(),
            created_by,
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, StoreError> {
        serde_json::from_slice(data)
            .map_err(|e| StoreError::Backend(format!("corrupt key record: {}", e)))
    }

    /// Reconstruct the usable key.
    pub fn key(&self) -> Result<SecretKey, StoreError> {
        let raw = BASE64
            .decode(&self.bytes)
            .map_err(|e| StoreError::Backend(format!("corrupt key material: {}", e)))?;
        let bytes: [u8; KEY_LEN] = raw
            .try_into()
            .map_err(|_| StoreError::Backend("key material is not 32 bytes".into()))?;
        Ok(SecretKey::new(bytes, self.algorithm))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_roundtrip() {
        let key = SecretKey::generate(Algorithm::ChaCha20Poly1305).unwrap();
        let record = KeyRecord::new(&key, Identity::unknown());
        let parsed = KeyRecord::from_slice(&record.to_vec()).unwrap();
        let restored = parsed.key().unwrap();
        assert_eq!(restored.as_bytes(), key.as_bytes());
        assert_eq!(restored.algorithm(), key.algorithm());
    }

    #[test]
    fn truncated_material_is_rejected() {
        let mut record = KeyRecord::new(
            &SecretKey::generate(Algorithm::Aes256Gcm).unwrap(),
            Identity::unknown(),
        );
        record.bytes = BASE64.encode([0u8; 16]);
        assert!(record.key().is_err());
    }
}
