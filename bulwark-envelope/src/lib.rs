//! # Bulwark Envelope
//!
//! The sealed-secret primitive of the Bulwark key service.
//!
//! A [`SecretKey`] is 32 bytes of random material tagged with an AEAD
//! [`Algorithm`]. It seals plaintexts into self-describing [`Ciphertext`]
//! containers and opens them again, binding an optional caller-supplied
//! [`Context`] as associated data.
//!
//! ## Quick Start
//!
//! ```
//! use bulwark_envelope::{Algorithm, Context, SecretKey};
//!
//! let key = SecretKey::generate(Algorithm::native()).unwrap();
//!
//! let mut ctx = Context::new();
//! ctx.insert("tenant", "acme");
//!
//! let sealed = key.seal(b"data encryption key", &ctx).unwrap();
//! let plaintext = key.open(&sealed, &ctx).unwrap();
//! assert_eq!(plaintext, b"data encryption key");
//! ```

pub mod cipher;
pub mod ciphertext;
pub mod context;
pub mod error;
pub mod key;

pub use ciphertext::Ciphertext;
pub use context::Context;
pub use error::{DecryptError, EncryptError};
pub use key::{Algorithm, SecretKey, KEY_LEN, MAX_SEAL_LEN};

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
