//! Identities and the identity → policy index.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;

use crate::error::KesError;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// An opaque, case-sensitive identity string.
///
/// Canonically the lowercase hex SHA-256 of a client certificate's DER
/// `SubjectPublicKeyInfo`. The distinguished value [`Identity::unknown`]
/// marks a peer that presented no usable certificate; it never passes
/// authorization.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity(String);

const UNKNOWN: &str = "unknown";

impl Identity {
    /// Wrap a raw identity string. Rejects empty and non-printable input.
    pub fn new(s: impl Into<String>) -> Result<Self, KesError> {
        let s = s.into();
        if s.is_empty() || !s.chars().all(|c| c.is_ascii_graphic()) {
            return Err(KesError::InvalidName(s));
        }
        Ok(Self(s))
    }

    /// The "no identity" marker.
    pub fn unknown() -> Self {
        Self(UNKNOWN.into())
    }

    pub fn is_unknown(&self) -> bool {
        self.0 == UNKNOWN
    }

    /// Derive an identity from the DER encoding of a certificate's
    /// `SubjectPublicKeyInfo`.
    pub fn from_spki_der(der: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(der)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Identity index
// ---------------------------------------------------------------------------

/// In-memory mapping of identities to policy names.
///
/// Writers take the lock exclusively; reads see a consistent snapshot and
/// never a half-applied write.
#[derive(Default)]
pub struct IdentityIndex {
    map: RwLock<HashMap<Identity, String>>,
}

impl IdentityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `identity` to `policy`.
    ///
    /// Idempotent for an identical binding; rebinding to a different policy
    /// fails until the identity is forgotten first.
    pub fn assign(&self, policy: &str, identity: Identity) -> Result<(), KesError> {
        let mut map = self.map.write();
        match map.get(&identity) {
            Some(bound) if bound == policy => Ok(()),
            Some(bound) => Err(KesError::IdentityBound {
                identity: identity.to_string(),
                policy: bound.clone(),
            }),
            None => {
                map.insert(identity, policy.to_string());
                Ok(())
            }
        }
    }

    /// The policy bound to `identity`, if any.
    pub fn get(&self, identity: &Identity) -> Option<String> {
        self.map.read().get(identity).cloned()
    }

    /// Drop the binding for `identity`. Absence is not an error.
    pub fn forget(&self, identity: &Identity) {
        self.map.write().remove(identity);
    }

    /// Drop every binding that points at `policy`.
    pub fn forget_policy(&self, policy: &str) {
        self.map.write().retain(|_, bound| bound != policy);
    }

    /// Snapshot of all bound identities.
    pub fn list(&self) -> Vec<Identity> {
        self.map.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> Identity {
        Identity::new(s).unwrap()
    }

    #[test]
    fn assign_get_forget() {
        let index = IdentityIndex::new();
        index.assign("ro", id("abc")).unwrap();
        assert_eq!(index.get(&id("abc")).as_deref(), Some("ro"));
        index.forget(&id("abc"));
        assert_eq!(index.get(&id("abc")), None);
    }

    #[test]
    fn assign_is_idempotent_for_same_policy() {
        let index = IdentityIndex::new();
        index.assign("ro", id("abc")).unwrap();
        index.assign("ro", id("abc")).unwrap();
    }

    #[test]
    fn rebinding_requires_forget() {
        let index = IdentityIndex::new();
        index.assign("ro", id("abc")).unwrap();
        assert!(matches!(
            index.assign("rw", id("abc")),
            Err(KesError::IdentityBound { .. })
        ));
        index.forget(&id("abc"));
        index.assign("rw", id("abc")).unwrap();
    }

    #[test]
    fn forget_policy_unbinds_all() {
        let index = IdentityIndex::new();
        index.assign("ro", id("a")).unwrap();
        index.assign("ro", id("b")).unwrap();
        index.assign("rw", id("c")).unwrap();
        index.forget_policy("ro");
        assert_eq!(index.get(&id("a")), None);
        assert_eq!(index.get(&id("b")), None);
        assert_eq!(index.get(&id("c")).as_deref(), Some("rw"));
    }

    #[test]
    fn identity_validation() {
        assert!(Identity::new("").is_err());
        assert!(Identity::new("has space").is_err());
        assert!(Identity::new("0a1b2c").is_ok());
        assert!(Identity::unknown().is_unknown());
    }

    #[test]
    fn spki_digest_is_lowercase_hex() {
        let identity = Identity::from_spki_der(b"fake spki");
        assert_eq!(identity.as_str().len(), 64);
        assert!(identity
            .as_str()
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
