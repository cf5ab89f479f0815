//! CryptoCore: owns the content AEAD and the EME name cipher.
//!
//! One instance is created per mount from the unwrapped master key and is
//! shared read-only until unmount, when [`CryptoCore::wipe`] destroys the
//! key material.

use std::fs::File;
use std::io::Read;
use std::sync::{Arc, RwLock};

use aead::{Aead, KeyInit, Payload};
use aes::cipher::consts::{U12, U16};
use aes::Aes256;
use aes_gcm::{AesGcm, Key, Nonce};
use aes_siv::Aes256SivAead;
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use tracing::{debug, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::crypto::eme::EmeCipher;
use crate::crypto::CryptoError;

/// Master key length in bytes.
pub const KEY_LEN: usize = 32;

/// AEAD tag length in bytes, identical for all backends.
pub const TAG_LEN: usize = 16;

/// HKDF info strings. These are part of the on-disk format: changing them
/// changes every derived subkey.
const HKDF_INFO_GCM_CONTENT: &[u8] = b"AES-GCM file content encryption";
const HKDF_INFO_SIV_CONTENT: &[u8] = b"AES-SIV file content encryption";
const HKDF_INFO_EME_NAMES: &[u8] = b"EME filename encryption";

type Gcm96 = AesGcm<Aes256, U12>;
type Gcm128 = AesGcm<Aes256, U16>;

/// A 256-bit master key. Zeroized on drop; `Debug` never prints the bytes.
#[derive(Clone)]
pub struct MasterKey {
    bytes: [u8; KEY_LEN],
}

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        MasterKey { bytes }
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; KEY_LEN] =
            slice
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: KEY_LEN,
                    actual: slice.len(),
                })?;
        Ok(MasterKey { bytes })
    }

    /// Generate a fresh random master key from the process CSPRNG.
    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::rng().fill_bytes(&mut bytes);
        MasterKey { bytes }
    }

    /// Generate a master key by reading `/dev/random` directly. Only used
    /// when the user explicitly asks for it at filesystem creation.
    pub fn random_from_dev_random() -> std::io::Result<Self> {
        let mut f = File::open("/dev/random")?;
        let mut bytes = [0u8; KEY_LEN];
        f.read_exact(&mut bytes)?;
        Ok(MasterKey { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Closed set of AEAD implementations for file content and key wrapping.
///
/// `AesGcm` and `OpensslGcm` are two implementations of the same
/// construction and produce interchangeable ciphertext. `AesSiv512` is a
/// different construction, selected by the `AESSIV` feature flag at
/// filesystem creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AeadBackend {
    /// AES-256-GCM via the RustCrypto `aes-gcm` crate.
    AesGcm,
    /// AES-256-GCM via libcrypto (cargo feature `openssl`).
    OpensslGcm,
    /// AES-SIV with a 512-bit key (RFC 5297).
    AesSiv512,
}

impl AeadBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            AeadBackend::AesGcm => "AES-GCM-256",
            AeadBackend::OpensslGcm => "AES-GCM-256-OpenSSL",
            AeadBackend::AesSiv512 => "AES-SIV-512",
        }
    }
}

enum ContentCipher {
    Gcm96(Box<Gcm96>),
    Gcm128(Box<Gcm128>),
    Siv(Box<Aes256SivAead>),
    #[cfg(feature = "openssl")]
    Openssl { key: Zeroizing<[u8; KEY_LEN]> },
}

/// The per-mount cryptographic state: content AEAD, EME name cipher and the
/// RNG frontend. Cheap to share behind an `Arc`; all operations take `&self`.
pub struct CryptoCore {
    backend: AeadBackend,
    iv_len: usize,
    use_hkdf: bool,
    force_decode: bool,
    aead: RwLock<Option<ContentCipher>>,
    eme: Arc<EmeCipher>,
}

impl CryptoCore {
    /// Build a core from a 32-byte key.
    ///
    /// `iv_bits` must be 96 or 128 (AES-SIV requires 128). With `use_hkdf`
    /// the key is expanded into independent subkeys for content and names;
    /// without it the raw key feeds both (legacy format). `force_decode`
    /// is only available on the OpenSSL backend.
    pub fn new(
        key: &MasterKey,
        backend: AeadBackend,
        iv_bits: usize,
        use_hkdf: bool,
        force_decode: bool,
    ) -> Result<Self, CryptoError> {
        let iv_len = match iv_bits {
            96 => 12,
            128 => 16,
            _ => {
                return Err(CryptoError::InvalidIvLength {
                    expected: 16,
                    actual: iv_bits / 8,
                })
            }
        };
        if backend == AeadBackend::AesSiv512 && iv_len != 16 {
            return Err(CryptoError::NotSupported("AES-SIV requires 128-bit IVs"));
        }
        if force_decode && backend != AeadBackend::OpensslGcm {
            return Err(CryptoError::NotSupported(
                "forced decoding requires the OpenSSL backend",
            ));
        }

        // Filename subkey. Without HKDF the raw master key doubles as the
        // EME key, matching filesystems created before the HKDF flag.
        let eme_key: Zeroizing<[u8; KEY_LEN]> = if use_hkdf {
            hkdf_expand::<KEY_LEN>(key.as_bytes(), HKDF_INFO_EME_NAMES)?
        } else {
            Zeroizing::new(*key.as_bytes())
        };
        let eme = Arc::new(EmeCipher::new(&eme_key));

        let aead = match backend {
            AeadBackend::AesGcm => {
                let content_key: Zeroizing<[u8; KEY_LEN]> = if use_hkdf {
                    hkdf_expand::<KEY_LEN>(key.as_bytes(), HKDF_INFO_GCM_CONTENT)?
                } else {
                    Zeroizing::new(*key.as_bytes())
                };
                let gcm_key = Key::<Gcm128>::from_slice(&content_key[..]);
                if iv_len == 16 {
                    ContentCipher::Gcm128(Box::new(Gcm128::new(gcm_key)))
                } else {
                    ContentCipher::Gcm96(Box::new(Gcm96::new(gcm_key)))
                }
            }
            AeadBackend::AesSiv512 => {
                // SIV splits its key into a MAC half and an encryption half,
                // so it needs 64 bytes. Without HKDF the key is doubled.
                let siv_key: Zeroizing<[u8; 64]> = if use_hkdf {
                    hkdf_expand::<64>(key.as_bytes(), HKDF_INFO_SIV_CONTENT)?
                } else {
                    let mut doubled = Zeroizing::new([0u8; 64]);
                    doubled[..KEY_LEN].copy_from_slice(key.as_bytes());
                    doubled[KEY_LEN..].copy_from_slice(key.as_bytes());
                    doubled
                };
                let cipher = Aes256SivAead::new_from_slice(&siv_key[..]).map_err(|_| {
                    CryptoError::InvalidKeyLength {
                        expected: 64,
                        actual: siv_key.len(),
                    }
                })?;
                ContentCipher::Siv(Box::new(cipher))
            }
            AeadBackend::OpensslGcm => {
                #[cfg(feature = "openssl")]
                {
                    let content_key: Zeroizing<[u8; KEY_LEN]> = if use_hkdf {
                        hkdf_expand::<KEY_LEN>(key.as_bytes(), HKDF_INFO_GCM_CONTENT)?
                    } else {
                        Zeroizing::new(*key.as_bytes())
                    };
                    ContentCipher::Openssl { key: content_key }
                }
                #[cfg(not(feature = "openssl"))]
                {
                    return Err(CryptoError::NotSupported(
                        "built without the openssl feature",
                    ));
                }
            }
        };

        debug!(
            backend = backend.as_str(),
            iv_bits,
            use_hkdf,
            force_decode,
            "crypto core initialized"
        );

        Ok(CryptoCore {
            backend,
            iv_len,
            use_hkdf,
            force_decode,
            aead: RwLock::new(Some(aead)),
            eme,
        })
    }

    pub fn backend(&self) -> AeadBackend {
        self.backend
    }

    /// Nonce length in bytes (12 or 16).
    pub fn iv_len(&self) -> usize {
        self.iv_len
    }

    pub fn use_hkdf(&self) -> bool {
        self.use_hkdf
    }

    pub fn force_decode(&self) -> bool {
        self.force_decode
    }

    /// The shared EME cipher for filename encryption.
    pub fn eme(&self) -> Arc<EmeCipher> {
        Arc::clone(&self.eme)
    }

    /// Fill a buffer from the process CSPRNG.
    pub fn rand_bytes(buf: &mut [u8]) {
        rand::rng().fill_bytes(buf);
    }

    /// A fresh random nonce of the configured width. The all-zero value is
    /// reserved as the hole marker and is never returned.
    pub fn fresh_nonce(&self) -> Vec<u8> {
        let mut nonce = vec![0u8; self.iv_len];
        loop {
            rand::rng().fill_bytes(&mut nonce);
            if nonce.iter().any(|&b| b != 0) {
                return nonce;
            }
            // Statistically unreachable; loop anyway rather than hand an
            // all-zero nonce to the block layer.
            warn!("RNG returned an all-zero nonce, retrying");
        }
    }

    /// AEAD-encrypt one block: `|ciphertext| = |plaintext| + 16`.
    pub fn encrypt_block(
        &self,
        plaintext: &[u8],
        nonce: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if nonce.len() != self.iv_len {
            return Err(CryptoError::InvalidIvLength {
                expected: self.iv_len,
                actual: nonce.len(),
            });
        }
        let guard = self.aead.read().map_err(|_| CryptoError::Wiped)?;
        let cipher = guard.as_ref().ok_or(CryptoError::Wiped)?;
        let payload = Payload {
            msg: plaintext,
            aad,
        };
        match cipher {
            ContentCipher::Gcm96(gcm) => gcm
                .encrypt(Nonce::from_slice(nonce), payload)
                .map_err(|_| CryptoError::Auth),
            ContentCipher::Gcm128(gcm) => gcm
                .encrypt(Nonce::from_slice(nonce), payload)
                .map_err(|_| CryptoError::Auth),
            ContentCipher::Siv(siv) => siv
                .encrypt(Nonce::from_slice(nonce), payload)
                .map_err(|_| CryptoError::Auth),
            #[cfg(feature = "openssl")]
            ContentCipher::Openssl { key } => {
                crate::crypto::openssl_gcm::encrypt(&key[..], nonce, aad, plaintext)
            }
        }
    }

    /// AEAD-decrypt one block. Fails with [`CryptoError::Auth`] on any
    /// tag/nonce/AAD mismatch; with `force_decode` (OpenSSL backend only)
    /// the unauthenticated plaintext is returned and a warning logged.
    pub fn decrypt_block(
        &self,
        ciphertext: &[u8],
        nonce: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if nonce.len() != self.iv_len {
            return Err(CryptoError::InvalidIvLength {
                expected: self.iv_len,
                actual: nonce.len(),
            });
        }
        let guard = self.aead.read().map_err(|_| CryptoError::Wiped)?;
        let cipher = guard.as_ref().ok_or(CryptoError::Wiped)?;
        let payload = Payload {
            msg: ciphertext,
            aad,
        };
        match cipher {
            ContentCipher::Gcm96(gcm) => gcm
                .decrypt(Nonce::from_slice(nonce), payload)
                .map_err(|_| CryptoError::Auth),
            ContentCipher::Gcm128(gcm) => gcm
                .decrypt(Nonce::from_slice(nonce), payload)
                .map_err(|_| CryptoError::Auth),
            ContentCipher::Siv(siv) => siv
                .decrypt(Nonce::from_slice(nonce), payload)
                .map_err(|_| CryptoError::Auth),
            #[cfg(feature = "openssl")]
            ContentCipher::Openssl { key } => crate::crypto::openssl_gcm::decrypt(
                &key[..],
                nonce,
                aad,
                ciphertext,
                self.force_decode,
            ),
        }
    }

    /// Destroy all key material. Every later operation on this core or on
    /// the shared EME cipher fails with [`CryptoError::Wiped`].
    pub fn wipe(&self) {
        let mut guard = self.aead.write().unwrap_or_else(|e| e.into_inner());
        *guard = None;
        self.eme.wipe();
        debug!("crypto core wiped");
    }
}

impl std::fmt::Debug for CryptoCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoCore")
            .field("backend", &self.backend)
            .field("iv_len", &self.iv_len)
            .field("use_hkdf", &self.use_hkdf)
            .field("force_decode", &self.force_decode)
            .finish()
    }
}

/// HKDF-SHA256 with an empty salt, as fixed by the on-disk format.
fn hkdf_expand<const N: usize>(
    ikm: &[u8; KEY_LEN],
    info: &[u8],
) -> Result<Zeroizing<[u8; N]>, CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = Zeroizing::new([0u8; N]);
    hk.expand(info, &mut okm[..])
        .map_err(|_| CryptoError::InvalidInput("HKDF output length out of range"))?;
    Ok(okm)
}
