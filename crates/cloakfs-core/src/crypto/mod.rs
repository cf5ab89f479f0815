//! Cryptographic primitives: AEAD backends, subkey derivation, EME.

pub mod core;
pub mod eme;

#[cfg(feature = "openssl")]
mod openssl_gcm;

use thiserror::Error;

/// Errors from the cryptographic primitives.
///
/// [`CryptoError::Auth`] is the only variant an attacker can trigger at will;
/// everything else indicates misuse or teardown.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// AEAD authentication failed: the ciphertext, nonce, or associated data
    /// does not match what was written. Surfaced to the kernel as EIO.
    #[error("ciphertext authentication failed")]
    Auth,

    /// The key material was wiped; this instance is permanently unusable.
    #[error("cipher was wiped, key material is gone")]
    Wiped,

    /// The selected backend is not compiled in or cannot satisfy the request.
    #[error("not supported: {0}")]
    NotSupported(&'static str),

    /// Nonce length does not match the instance configuration.
    #[error("invalid IV length: expected {expected} bytes, got {actual}")]
    InvalidIvLength { expected: usize, actual: usize },

    /// Key material has the wrong size.
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Malformed input to a primitive (e.g. EME block count out of range).
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
}

pub use self::core::{AeadBackend, CryptoCore, MasterKey, KEY_LEN};
pub use self::eme::{EmeCipher, EME_BLOCK_SIZE};
