//! Error types for sealing and opening.

use std::fmt;

/// Sealing failed before any ciphertext was produced.
#[derive(Debug)]
pub enum EncryptError {
    /// Plaintext exceeds the per-message limit. Carries the offending size.
    TooLarge(usize),
    /// The system random source or the cipher itself failed.
    Failure,
}

impl fmt::Display for EncryptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooLarge(n) => write!(f, "plaintext of {} bytes exceeds limit", n),
            Self::Failure => write!(f, "encryption failed"),
        }
    }
}

impl std::error::Error for EncryptError {}

/// Opening failed.
///
/// Deliberately opaque: a forged tag, a mismatched algorithm, a wrong
/// context and a malformed container are all indistinguishable to the
/// caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecryptError;

impl fmt::Display for DecryptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "decryption failed: ciphertext is not authentic")
    }
}

impl std::error::Error for DecryptError {}
