//! cloakfs-core: the cryptographic core of an encrypted-at-rest filesystem.
//!
//! Ciphertext lives in a backing directory using the gocryptfs on-disk
//! format; a FUSE frontend (out of tree) presents the plaintext view. This
//! crate covers everything cryptographic:
//!
//! - [`config`]: the JSON config file holding the scrypt-wrapped master key
//!   and the feature flags that govern the format.
//! - [`crypto`]: AEAD backend selection, HKDF subkey expansion, the EME
//!   wide-block cipher, and key lifecycle (creation to wipe).
//! - [`content`]: the 4 KiB authenticated block format and its offset
//!   algebra; [`fs::file`] does read-modify-write I/O on top of it.
//! - [`fs::name`]: filename encryption with per-directory IVs ([`fs::diriv`]),
//!   base64 encoding and the long-name escape hatch.
//! - [`exitcodes`]: the stable numeric exit codes.
//!
//! ```no_run
//! use std::sync::Arc;
//! use cloakfs_core::config::{self, CreateOpts};
//! use cloakfs_core::content::ContentEnc;
//! use cloakfs_core::crypto::{AeadBackend, CryptoCore};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let conf_path = std::path::Path::new("/tmp/cipherdir/gocryptfs.conf");
//! config::create(&CreateOpts {
//!     path: conf_path,
//!     password: b"correct horse",
//!     log_n: config::DEFAULT_LOG_N,
//!     creator: "cloakfs 0.4",
//!     plaintext_names: false,
//!     aessiv: false,
//!     devrandom: false,
//!     fido2: None,
//! })?;
//!
//! let (key, _conf) = config::load_and_decrypt(conf_path, b"correct horse")?;
//! let core = CryptoCore::new(&key.unwrap(), AeadBackend::AesGcm, 128, true, false)?;
//! let content = ContentEnc::new(Arc::new(core));
//! # let _ = content;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod content;
pub mod crypto;
pub mod exitcodes;
pub mod fs;
pub mod stdfds;

pub use config::{ConfFile, ConfigError, CreateOpts, FeatureFlag, CONF_NAME};
pub use content::{ContentEnc, ContentError, FileHeader, FileId};
pub use crypto::{AeadBackend, CryptoCore, CryptoError, EmeCipher, MasterKey};
pub use fs::{DirIvCache, EncryptedFile, NameError, NameTransform};
