//! Filename encryption: PKCS#7 pad, EME under the directory IV, base64.
//!
//! Encrypted names that exceed the 255-byte filesystem limit are stored
//! under a SHA-256 hash alias (`gocryptfs.longname.<hash>`) with a `.name`
//! sidecar holding the full ciphertext name.

use std::fs::OpenOptions;
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Arc;

use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::crypto::eme::{EmeCipher, EME_BLOCK_SIZE};
use crate::crypto::CryptoError;

/// Maximum bytes for an on-disk name, as on ext4.
pub const NAME_MAX: usize = 255;

/// Prefix of hashed long names and their sidecar files.
pub const LONGNAME_PREFIX: &str = "gocryptfs.longname.";

/// Suffix of the sidecar file holding the full ciphertext name.
pub const LONGNAME_SUFFIX: &str = ".name";

/// Marker appended to entries recovered through badname matching.
pub const BADNAME_SUFFIX: &str = " GOCRYPTFS_BAD_NAME";

#[derive(Error, Debug)]
pub enum NameError {
    /// Name decryption failed. Deliberately carries no detail: bad base64,
    /// bad padding, embedded NUL or slash, and `.`/`..` all look identical
    /// so the error channel cannot act as a padding oracle.
    #[error("invalid encrypted name")]
    BadMessage,

    /// Encrypted name exceeds [`NAME_MAX`] and long names are disabled.
    #[error("encrypted name is {len} bytes, limit is 255")]
    NameTooLong { len: usize },

    /// Plaintext name rejected before encryption.
    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Encrypts and decrypts directory entry names.
///
/// Holds only the shared EME cipher; the directory IV is passed per call
/// because it differs for every directory.
pub struct NameTransform {
    eme: Arc<EmeCipher>,
    long_names: bool,
    raw64: bool,
    badname_patterns: Vec<glob::Pattern>,
}

impl NameTransform {
    pub fn new(eme: Arc<EmeCipher>, long_names: bool, raw64: bool) -> Self {
        NameTransform {
            eme,
            long_names,
            raw64,
            badname_patterns: Vec::new(),
        }
    }

    /// Register a glob pattern for badname recovery. Patterns only affect
    /// the decrypt path and are strictly opt-in.
    pub fn add_badname_pattern(&mut self, pattern: &str) -> Result<(), glob::PatternError> {
        let compiled = glob::Pattern::new(pattern)?;
        self.badname_patterns.push(compiled);
        Ok(())
    }

    pub fn have_badname_patterns(&self) -> bool {
        !self.badname_patterns.is_empty()
    }

    fn b64_encode(&self, data: &[u8]) -> String {
        if self.raw64 {
            URL_SAFE_NO_PAD.encode(data)
        } else {
            URL_SAFE.encode(data)
        }
    }

    fn b64_decode(&self, s: &str) -> Result<Vec<u8>, NameError> {
        let result = if self.raw64 {
            URL_SAFE_NO_PAD.decode(s)
        } else {
            URL_SAFE.decode(s)
        };
        result.map_err(|_| NameError::BadMessage)
    }

    fn b64_encoded_len(&self, n: usize) -> usize {
        if self.raw64 {
            (n * 4).div_ceil(3)
        } else {
            n.div_ceil(3) * 4
        }
    }

    /// Encrypt a plaintext name under the directory IV.
    ///
    /// Validity of the plaintext (no `/`, no NUL, not `.`/`..`) is the
    /// caller's contract; see [`is_valid_plain_name`].
    pub fn encrypt_name(&self, plain_name: &str, iv: &[u8; 16]) -> Result<String, NameError> {
        let padded = pad16(plain_name.as_bytes());
        let encrypted = self.eme.encrypt(iv, &padded)?;
        Ok(self.b64_encode(&encrypted))
    }

    /// Encrypt a name and, when the result exceeds [`NAME_MAX`], replace it
    /// with its long-name hash. The caller must then persist the sidecar
    /// via [`write_long_name`](Self::write_long_name).
    pub fn encrypt_and_hash_name(
        &self,
        plain_name: &str,
        iv: &[u8; 16],
    ) -> Result<String, NameError> {
        let cipher_name = self.encrypt_name(plain_name, iv)?;
        if cipher_name.len() > NAME_MAX {
            if !self.long_names {
                return Err(NameError::NameTooLong {
                    len: cipher_name.len(),
                });
            }
            return Ok(self.hash_long_name(&cipher_name));
        }
        Ok(cipher_name)
    }

    /// `gocryptfs.longname.<b64(sha256(cipher_name))>`.
    pub fn hash_long_name(&self, cipher_name: &str) -> String {
        let digest = Sha256::digest(cipher_name.as_bytes());
        format!("{LONGNAME_PREFIX}{}", self.b64_encode(&digest))
    }

    /// Decrypt a base64 ciphertext name under the directory IV.
    ///
    /// Long-name hashes must be resolved through their sidecar first; this
    /// only handles pure encrypted names. If decryption fails and the name
    /// matches a configured badname pattern, the longest decryptable prefix
    /// is recovered and the result marked with [`BADNAME_SUFFIX`].
    pub fn decrypt_name(&self, cipher_name: &str, iv: &[u8; 16]) -> Result<String, NameError> {
        match self.decrypt_name_inner(cipher_name, iv) {
            Ok(name) => Ok(name),
            Err(NameError::BadMessage) if self.matches_badname(cipher_name) => {
                Ok(self.recover_badname(cipher_name, iv))
            }
            Err(e) => Err(e),
        }
    }

    fn decrypt_name_inner(&self, cipher_name: &str, iv: &[u8; 16]) -> Result<String, NameError> {
        let bin = self.b64_decode(cipher_name)?;
        if bin.is_empty() || bin.len() % EME_BLOCK_SIZE != 0 {
            debug!(
                len = bin.len(),
                "decoded name length is not a positive multiple of 16"
            );
            return Err(NameError::BadMessage);
        }
        let padded = match self.eme.decrypt(iv, &bin) {
            Ok(p) => p,
            Err(CryptoError::Wiped) => return Err(CryptoError::Wiped.into()),
            Err(_) => return Err(NameError::BadMessage),
        };
        // All failure classes below collapse into BadMessage on purpose.
        let plain = unpad16(&padded).ok_or(NameError::BadMessage)?;
        if plain.contains(&0) || plain.contains(&b'/') {
            return Err(NameError::BadMessage);
        }
        if plain == b"." || plain == b".." {
            return Err(NameError::BadMessage);
        }
        String::from_utf8(plain.to_vec()).map_err(|_| NameError::BadMessage)
    }

    fn matches_badname(&self, cipher_name: &str) -> bool {
        self.badname_patterns
            .iter()
            .any(|p| p.matches(cipher_name))
    }

    /// Find the longest decryptable prefix of a corrupted name so the entry
    /// stays visible in listings instead of silently disappearing.
    fn recover_badname(&self, cipher_name: &str, iv: &[u8; 16]) -> String {
        let name_min = self.b64_encoded_len(EME_BLOCK_SIZE);
        for charpos in (name_min..cipher_name.len()).rev() {
            if !cipher_name.is_char_boundary(charpos) {
                continue;
            }
            if let Ok(prefix) = self.decrypt_name_inner(&cipher_name[..charpos], iv) {
                warn!(cipher_name, charpos, "recovered badname prefix");
                return format!("{prefix}{}{BADNAME_SUFFIX}", &cipher_name[charpos..]);
            }
        }
        format!("{cipher_name}{BADNAME_SUFFIX}")
    }

    /// Persist the sidecar file `<hash_name>.name` holding the full
    /// ciphertext name of a long-named entry.
    pub fn write_long_name(
        &self,
        dir: &Path,
        hash_name: &str,
        cipher_name: &str,
    ) -> io::Result<()> {
        let path = dir.join(format!("{hash_name}{LONGNAME_SUFFIX}"));
        let mut f = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)?;
        f.write_all(cipher_name.as_bytes())
    }

    /// Read back the full ciphertext name of a long-named entry.
    pub fn read_long_name(&self, dir: &Path, hash_name: &str) -> io::Result<String> {
        let path = dir.join(format!("{hash_name}{LONGNAME_SUFFIX}"));
        let mut content = String::new();
        std::fs::File::open(path)?.read_to_string(&mut content)?;
        Ok(content)
    }
}

impl std::fmt::Debug for NameTransform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NameTransform")
            .field("long_names", &self.long_names)
            .field("raw64", &self.raw64)
            .field("badname_patterns", &self.badname_patterns.len())
            .finish()
    }
}

/// True for names of the form `gocryptfs.longname.<hash>` (but not the
/// `.name` sidecars themselves).
pub fn is_long_name(name: &str) -> bool {
    name.starts_with(LONGNAME_PREFIX) && !name.ends_with(LONGNAME_SUFFIX)
}

/// Reject plaintext names the kernel must never see encrypted: empty,
/// `.`/`..`, embedded `/` or NUL, or longer than [`NAME_MAX`] bytes.
pub fn is_valid_plain_name(name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::InvalidName("empty name".into()));
    }
    if name == "." || name == ".." {
        return Err(NameError::InvalidName(format!("reserved name {name:?}")));
    }
    if name.contains('/') || name.contains('\0') {
        return Err(NameError::InvalidName(
            "name contains '/' or NUL".into(),
        ));
    }
    if name.len() > NAME_MAX {
        return Err(NameError::NameTooLong { len: name.len() });
    }
    Ok(())
}

/// PKCS#7 padding to the next multiple of 16. Input that is already a
/// multiple gains a full extra block so the pad length is never zero.
fn pad16(data: &[u8]) -> Vec<u8> {
    let pad_len = EME_BLOCK_SIZE - data.len() % EME_BLOCK_SIZE;
    let mut padded = Vec::with_capacity(data.len() + pad_len);
    padded.extend_from_slice(data);
    padded.resize(data.len() + pad_len, pad_len as u8);
    padded
}

/// Strip PKCS#7 padding. Returns `None` on any inconsistency; callers
/// translate that into the generic [`NameError::BadMessage`].
fn unpad16(data: &[u8]) -> Option<&[u8]> {
    let len = data.len();
    if len == 0 || len % EME_BLOCK_SIZE != 0 {
        return None;
    }
    let pad_len = data[len - 1] as usize;
    if pad_len == 0 || pad_len > EME_BLOCK_SIZE || pad_len > len {
        return None;
    }
    if !data[len - pad_len..].iter().all(|&b| b as usize == pad_len) {
        return None;
    }
    Some(&data[..len - pad_len])
}
