//! Error types for the keystore.

use std::fmt;

// ---------------------------------------------------------------------------
// Backend errors
// ---------------------------------------------------------------------------

/// Failure reported by a key-store backend.
///
/// Clonable so a single-flight fetch can hand the same error to every
/// waiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No entry under this name.
    NotFound(String),
    /// An entry under this name already exists.
    Exists(String),
    /// The backend did not answer within its deadline, or the transport
    /// failed outright.
    Unreachable(String),
    /// Any other backend-side failure.
    Backend(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(name) => write!(f, "key not found: {}", name),
            Self::Exists(name) => write!(f, "key already exists: {}", name),
            Self::Unreachable(msg) => write!(f, "key store unreachable: {}", msg),
            Self::Backend(msg) => write!(f, "key store error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

// ---------------------------------------------------------------------------
// Top-level enclave error
// ---------------------------------------------------------------------------

/// Every failure an enclave operation can surface. The API layer maps each
/// variant to a stable HTTP status.
#[derive(Debug)]
pub enum KesError {
    /// A name failed boundary validation.
    InvalidName(String),
    /// A glob pattern in a policy is unusable.
    InvalidPattern(String),
    /// The caller is not permitted to perform this request. Also returned
    /// when the target object does not exist, so callers cannot probe for
    /// names.
    NotAuthorized,
    /// Create hit an existing key.
    KeyExists(String),
    KeyNotFound(String),
    PolicyNotFound(String),
    /// The identity is already bound to a different policy.
    IdentityBound { identity: String, policy: String },
    /// An identity may not assign a policy to itself.
    SelfAssign,
    /// Ciphertext failed to open: forged, malformed, or wrong context.
    Decrypt,
    /// Random generation or sealing failed.
    Crypto,
    /// The backend is unreachable and no offline entry applies.
    Unavailable(String),
    /// Unclassifiable backend failure.
    Store(String),
}

impl fmt::Display for KesError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidName(name) => write!(f, "invalid name: {}", name),
            Self::InvalidPattern(pat) => write!(f, "invalid pattern: {}", pat),
            Self::NotAuthorized => write!(f, "not authorized"),
            Self::KeyExists(name) => write!(f, "key already exists: {}", name),
            Self::KeyNotFound(name) => write!(f, "key does not exist: {}", name),
            Self::PolicyNotFound(name) => write!(f, "policy does not exist: {}", name),
            Self::IdentityBound { identity, policy } => {
                write!(f, "identity {} is already assigned to policy {}", identity, policy)
            }
            Self::SelfAssign => write!(f, "identity cannot assign policy to itself"),
            Self::Decrypt => write!(f, "decryption failed: ciphertext is not authentic"),
            Self::Crypto => write!(f, "encryption failed"),
            Self::Unavailable(msg) => write!(f, "key store unavailable: {}", msg),
            Self::Store(msg) => write!(f, "key store error: {}", msg),
        }
    }
}

impl std::error::Error for KesError {}

impl From<StoreError> for KesError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(name) => Self::KeyNotFound(name),
            StoreError::Exists(name) => Self::KeyExists(name),
            StoreError::Unreachable(msg) => Self::Unavailable(msg),
            StoreError::Backend(msg) => Self::Store(msg),
        }
    }
}

impl From<bulwark_envelope::DecryptError> for KesError {
    fn from(_: bulwark_envelope::DecryptError) -> Self {
        Self::Decrypt
    }
}

impl From<bulwark_envelope::EncryptError> for KesError {
    fn from(_: bulwark_envelope::EncryptError) -> Self {
        Self::Crypto
    }
}
