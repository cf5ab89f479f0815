//! The on-disk configuration file: `gocryptfs.conf`.
//!
//! A JSON record holding the scrypt parameters, the wrapped master key and
//! the feature flags that govern the on-disk format. The master key is
//! wrapped with the content block primitive (block 0, empty AAD) keyed by
//! the scrypt-derived KEK.

pub mod kdf;

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretBox};
use serde::{Deserialize, Serialize};
use serde_with::base64::Base64;
use serde_with::serde_as;
use thiserror::Error;
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use crate::content::ContentEnc;
use crate::crypto::{AeadBackend, CryptoCore, CryptoError, MasterKey, KEY_LEN};
use crate::exitcodes;

pub use kdf::{ScryptKdf, DEFAULT_LOG_N, MAX_LOG_N, MIN_LOG_N};

/// Default configuration file name. The dot is not part of the base64url
/// alphabet, so this can never collide with an encrypted name.
pub const CONF_NAME: &str = "gocryptfs.conf";

/// Configuration file name in reverse mode, stored next to the plaintext.
pub const CONF_REVERSE_NAME: &str = ".gocryptfs.reverse.conf";

/// Current on-disk format version.
pub const CURRENT_VERSION: u16 = 2;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file is empty")]
    Empty,

    #[error("unsupported on-disk format version {0}")]
    Version(u16),

    #[error("unknown feature flag {0:?}")]
    UnknownFlag(String),

    /// Required flags are missing: the filesystem was created by a version
    /// too old for this implementation to mount.
    #[error("deprecated filesystem: missing required feature flags {missing:?}")]
    DeprecatedFs { missing: Vec<String> },

    /// Mutually exclusive flags are both set (or both absent).
    #[error("exactly one of PlaintextNames and EMENames must be set")]
    FlagConflict,

    /// Deliberately the same for a truncated file, a wrong salt and a tag
    /// mismatch: the user only learns that unlocking failed.
    #[error("password incorrect")]
    PasswordIncorrect,

    #[error("invalid scrypt parameters: {0}")]
    ScryptParams(String),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Content(#[from] crate::content::ContentError),
}

impl ConfigError {
    /// The stable process exit code for this failure (see [`exitcodes`]).
    pub fn exit_code(&self) -> i32 {
        match self {
            ConfigError::PasswordIncorrect => exitcodes::PASSWORD_INCORRECT,
            ConfigError::DeprecatedFs { .. } => exitcodes::DEPRECATED_FS,
            _ => exitcodes::LOAD_CONF,
        }
    }
}

/// The closed set of feature flags. Anything outside this set makes the
/// config unloadable: flags gate format changes, exactly like filesystem
/// superblock feature bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureFlag {
    /// 128-bit content nonces (96-bit before).
    GcmIv128,
    /// HKDF subkey derivation from the master key.
    Hkdf,
    /// Filenames are stored unencrypted.
    PlaintextNames,
    /// Per-directory IV files.
    DirIv,
    /// EME filename encryption.
    EmeNames,
    /// Long names stored under hash aliases.
    LongNames,
    /// Custom long-name threshold.
    LongNameMax,
    /// Unpadded base64 for names.
    Raw64,
    /// AES-SIV content encryption.
    AesSiv,
    /// Master key protected by a FIDO2 token.
    Fido2,
}

impl FeatureFlag {
    pub const ALL: [FeatureFlag; 10] = [
        FeatureFlag::GcmIv128,
        FeatureFlag::Hkdf,
        FeatureFlag::PlaintextNames,
        FeatureFlag::DirIv,
        FeatureFlag::EmeNames,
        FeatureFlag::LongNames,
        FeatureFlag::LongNameMax,
        FeatureFlag::Raw64,
        FeatureFlag::AesSiv,
        FeatureFlag::Fido2,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureFlag::GcmIv128 => "GCMIV128",
            FeatureFlag::Hkdf => "HKDF",
            FeatureFlag::PlaintextNames => "PlaintextNames",
            FeatureFlag::DirIv => "DirIV",
            FeatureFlag::EmeNames => "EMENames",
            FeatureFlag::LongNames => "LongNames",
            FeatureFlag::LongNameMax => "LongNameMax",
            FeatureFlag::Raw64 => "Raw64",
            FeatureFlag::AesSiv => "AESSIV",
            FeatureFlag::Fido2 => "FIDO2",
        }
    }
}

impl FromStr for FeatureFlag {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FeatureFlag::ALL
            .iter()
            .find(|f| f.as_str() == s)
            .copied()
            .ok_or(())
    }
}

impl fmt::Display for FeatureFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Required in every loadable filesystem.
const REQUIRED_FLAGS_COMMON: [FeatureFlag; 2] = [FeatureFlag::GcmIv128, FeatureFlag::Hkdf];

/// Additionally required unless `PlaintextNames` is set.
const REQUIRED_FLAGS_NORMAL: [FeatureFlag; 4] = [
    FeatureFlag::DirIv,
    FeatureFlag::EmeNames,
    FeatureFlag::LongNames,
    FeatureFlag::Raw64,
];

/// FIDO2 credential parameters, persisted when the master key password is
/// provided by a hardware token.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fido2Params {
    #[serde_as(as = "Base64")]
    #[serde(rename = "CredentialID")]
    pub credential_id: Vec<u8>,
    #[serde_as(as = "Base64")]
    #[serde(rename = "HMACSalt")]
    pub hmac_salt: Vec<u8>,
}

/// Options for creating a new filesystem configuration.
#[derive(Debug)]
pub struct CreateOpts<'a> {
    /// Target path of the config file.
    pub path: &'a Path,
    /// Password that wraps the master key.
    pub password: &'a [u8],
    /// Scrypt cost, log2(N).
    pub log_n: u8,
    /// Human-readable version string of the creating program.
    pub creator: &'a str,
    /// Store filenames unencrypted.
    pub plaintext_names: bool,
    /// Use AES-SIV for file content.
    pub aessiv: bool,
    /// Draw the master key from /dev/random instead of the CSPRNG.
    pub devrandom: bool,
    /// Optional FIDO2 parameters.
    pub fido2: Option<Fido2Params>,
}

/// The parsed content of a config file.
#[serde_as]
#[derive(Debug, Serialize, Deserialize)]
pub struct ConfFile {
    /// Free-form version string of the creating program; purely
    /// informational, the technical truth lives in `FeatureFlags`.
    #[serde(rename = "Creator")]
    pub creator: String,

    /// The master key, AEAD-encrypted with the scrypt-derived KEK.
    #[serde_as(as = "Base64")]
    #[serde(rename = "EncryptedKey")]
    pub encrypted_key: Vec<u8>,

    #[serde(rename = "ScryptObject")]
    pub scrypt_object: ScryptKdf,

    /// On-disk format version.
    #[serde(rename = "Version")]
    pub version: u16,

    #[serde(rename = "FeatureFlags")]
    pub feature_flags: Vec<String>,

    #[serde(rename = "FIDO2", skip_serializing_if = "Option::is_none", default)]
    pub fido2: Option<Fido2Params>,

    /// Where this config was loaded from; not serialized.
    #[serde(skip)]
    filename: PathBuf,
}

/// Create a new config file with a fresh random master key wrapped by
/// `opts.password`, and print the one-time recovery reminder.
pub fn create(opts: &CreateOpts<'_>) -> Result<(), ConfigError> {
    let mut flags: Vec<FeatureFlag> = vec![FeatureFlag::GcmIv128, FeatureFlag::Hkdf];
    if opts.plaintext_names {
        flags.push(FeatureFlag::PlaintextNames);
    } else {
        flags.extend(REQUIRED_FLAGS_NORMAL);
    }
    if opts.aessiv {
        flags.push(FeatureFlag::AesSiv);
    }
    if opts.fido2.is_some() {
        flags.push(FeatureFlag::Fido2);
    }

    let mut cf = ConfFile {
        creator: opts.creator.to_string(),
        encrypted_key: Vec::new(),
        scrypt_object: ScryptKdf::new(opts.log_n)?,
        version: CURRENT_VERSION,
        feature_flags: flags.iter().map(|f| f.as_str().to_string()).collect(),
        fido2: opts.fido2.clone(),
        filename: opts.path.to_path_buf(),
    };

    let key = if opts.devrandom {
        MasterKey::random_from_dev_random()?
    } else {
        MasterKey::random()
    };
    // The only place the master key is ever shown: without the password or
    // an intact config file, this reminder is the last way back in.
    eprintln!("{}", masterkey_reminder(&key));

    cf.encrypt_key(&key, opts.password)?;
    cf.write()?;
    info!(path = %opts.path.display(), "created filesystem configuration");
    Ok(())
}

/// Load and validate a config file, without touching the key.
pub fn load(path: &Path) -> Result<ConfFile, ConfigError> {
    let raw = std::fs::read(path)?;
    if raw.is_empty() {
        return Err(ConfigError::Empty);
    }
    let mut cf: ConfFile = serde_json::from_slice(&raw)?;
    cf.filename = path.to_path_buf();

    if cf.version != CURRENT_VERSION {
        return Err(ConfigError::Version(cf.version));
    }
    cf.validate_flags()?;
    Ok(cf)
}

/// Load a config file and unwrap the master key with `password`.
///
/// An empty password validates the file but skips decryption, returning
/// `None` for the key (used by `info`-style inspection).
pub fn load_and_decrypt(
    path: &Path,
    password: &[u8],
) -> Result<(Option<MasterKey>, ConfFile), ConfigError> {
    let cf = load(path)?;
    if password.is_empty() {
        return Ok((None, cf));
    }
    let key = cf.decrypt_master_key(password)?;
    Ok((Some(key), cf))
}

/// Re-wrap the master key under a new password. The rewrite is atomic: a
/// crash leaves the old file (and old password) intact.
pub fn change_password(
    path: &Path,
    old_password: &[u8],
    new_password: &[u8],
) -> Result<(), ConfigError> {
    let mut cf = load(path)?;
    let key = cf.decrypt_master_key(old_password)?;
    cf.encrypt_key(&key, new_password)?;
    cf.write()?;
    info!(path = %path.display(), "password changed");
    Ok(())
}

impl ConfFile {
    pub fn is_flag_set(&self, flag: FeatureFlag) -> bool {
        self.feature_flags.iter().any(|f| f == flag.as_str())
    }

    /// Enforce the flag invariants: every flag known, exactly one naming
    /// scheme, and all required flags present.
    fn validate_flags(&self) -> Result<(), ConfigError> {
        for flag in &self.feature_flags {
            if FeatureFlag::from_str(flag).is_err() {
                return Err(ConfigError::UnknownFlag(flag.clone()));
            }
        }
        let plaintext = self.is_flag_set(FeatureFlag::PlaintextNames);
        if plaintext && self.is_flag_set(FeatureFlag::EmeNames) {
            return Err(ConfigError::FlagConflict);
        }

        let mut required: Vec<FeatureFlag> = REQUIRED_FLAGS_COMMON.to_vec();
        if !plaintext {
            required.extend(REQUIRED_FLAGS_NORMAL);
        }
        let missing: Vec<String> = required
            .iter()
            .filter(|f| !self.is_flag_set(**f))
            .map(|f| f.as_str().to_string())
            .collect();
        if !missing.is_empty() {
            warn!(?missing, "filesystem lacks required feature flags");
            return Err(ConfigError::DeprecatedFs { missing });
        }
        Ok(())
    }

    /// Unwrap the master key. Every failure mode reads as a wrong password.
    pub fn decrypt_master_key(&self, password: &[u8]) -> Result<MasterKey, ConfigError> {
        let kek = self.scrypt_object.derive_key(password)?;
        let enc = self.key_encrypter(&kek)?;
        drop(kek); // zeroized by SecretBox

        let result = enc.decrypt_block(&self.encrypted_key, 0, &[]);
        enc.core().wipe();

        let mut key_bytes = match result {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!("master key unwrap failed: {e}");
                return Err(ConfigError::PasswordIncorrect);
            }
        };
        let key = MasterKey::from_slice(&key_bytes).map_err(|_| {
            debug!("unwrapped key has the wrong length");
            ConfigError::PasswordIncorrect
        });
        key_bytes.zeroize();
        key
    }

    /// Wrap `key` under `password`, refreshing the scrypt salt. Keeps the
    /// previous cost parameter.
    pub fn encrypt_key(&mut self, key: &MasterKey, password: &[u8]) -> Result<(), ConfigError> {
        let log_n = self.scrypt_object.validate()?;
        self.scrypt_object = ScryptKdf::new(log_n)?;
        let kek = self.scrypt_object.derive_key(password)?;
        let enc = self.key_encrypter(&kek)?;
        drop(kek);

        self.encrypted_key = enc.encrypt_block(key.as_bytes(), 0, &[])?;
        enc.core().wipe();
        Ok(())
    }

    /// Build the mount-time [`CryptoCore`] according to this filesystem's
    /// feature flags: backend, nonce width and subkey derivation all follow
    /// the flags, never the command line. `force_decode` selects the
    /// OpenSSL backend, the only one able to honor it.
    pub fn crypto_core(
        &self,
        key: &MasterKey,
        force_decode: bool,
    ) -> Result<CryptoCore, ConfigError> {
        let backend = if self.is_flag_set(FeatureFlag::AesSiv) {
            AeadBackend::AesSiv512
        } else if force_decode {
            AeadBackend::OpensslGcm
        } else {
            AeadBackend::AesGcm
        };
        let iv_bits = if self.is_flag_set(FeatureFlag::GcmIv128) {
            128
        } else {
            96
        };
        let use_hkdf = self.is_flag_set(FeatureFlag::Hkdf);
        Ok(CryptoCore::new(key, backend, iv_bits, use_hkdf, force_decode)?)
    }

    /// The AEAD used for key wrapping: same construction as file content,
    /// at block 0 with empty AAD. Nonce width follows the HKDF flag, which
    /// is how pre-HKDF filesystems stay readable.
    fn key_encrypter(&self, kek: &SecretBox<[u8; KEY_LEN]>) -> Result<ContentEnc, ConfigError> {
        let use_hkdf = self.is_flag_set(FeatureFlag::Hkdf);
        let iv_bits = if use_hkdf { 128 } else { 96 };
        let kek_key = MasterKey::from_bytes(*kek.expose_secret());
        let core = CryptoCore::new(&kek_key, AeadBackend::AesGcm, iv_bits, use_hkdf, false)?;
        Ok(ContentEnc::new(Arc::new(core)))
    }

    /// Serialize to the canonical on-disk form: tab-indented JSON with a
    /// trailing newline.
    pub fn to_json(&self) -> Result<Vec<u8>, ConfigError> {
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
        let mut buf = Vec::new();
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.serialize(&mut ser)?;
        buf.push(b'\n');
        Ok(buf)
    }

    /// Write to `<filename>.tmp`, fsync, then rename over the original, so
    /// a password change either happens completely or not at all.
    pub fn write(&self) -> Result<(), ConfigError> {
        let mut tmp_name = self.filename.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        // 0400: the config should be kept secret and is never edited in place.
        let mut fd = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o400)
            .open(&tmp)?;
        fd.write_all(&self.to_json()?)?;
        if let Err(e) = fd.sync_all() {
            // Some network filesystems reject fsync; fall back to a global
            // sync rather than failing the rewrite.
            warn!("fsync on config failed: {e}, falling back to sync(2)");
            unsafe { libc::sync() };
        }
        drop(fd);
        std::fs::rename(&tmp, &self.filename)?;
        Ok(())
    }
}

/// Format the master key for the one-time creation reminder: hex in groups
/// of eight, the only representation the key ever has outside memory.
pub fn masterkey_reminder(key: &MasterKey) -> String {
    let hex: String = key
        .as_bytes()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect();
    let grouped: Vec<&str> = (0..hex.len())
        .step_by(8)
        .map(|i| &hex[i..i + 8])
        .collect();
    format!(
        "Your master key is:\n\n    {}\n\nIf the {} file becomes corrupted or you ever forget your password,\nthere is only one hope for recovery: the master key. Print it to a piece of\npaper and store it in a drawer. This message is only printed once.",
        grouped.join("-"),
        CONF_NAME,
    )
}
