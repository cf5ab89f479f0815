//! Scrypt key derivation for the config file's key encryption key.

#[cfg(test)]
use secrecy::ExposeSecret;
use secrecy::SecretBox;
use serde::{Deserialize, Serialize};
use serde_with::base64::Base64;
use serde_with::serde_as;
use unicode_normalization::UnicodeNormalization;
use zeroize::Zeroizing;

use crate::config::ConfigError;
use crate::crypto::KEY_LEN;

/// Scrypt salt length in bytes.
pub const SALT_LEN: usize = 32;

/// Smallest permitted cost parameter: N = 2^10.
pub const MIN_LOG_N: u8 = 10;

/// Largest permitted cost parameter: N = 2^28.
pub const MAX_LOG_N: u8 = 28;

/// Default cost parameter for new filesystems: N = 2^16.
pub const DEFAULT_LOG_N: u8 = 16;

const DEFAULT_R: u32 = 8;
const DEFAULT_P: u32 = 1;

/// Persisted scrypt parameters (the `ScryptObject` in the config file).
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScryptKdf {
    #[serde_as(as = "Base64")]
    #[serde(rename = "Salt")]
    pub salt: Vec<u8>,
    #[serde(rename = "N")]
    pub n: u64,
    #[serde(rename = "R")]
    pub r: u32,
    #[serde(rename = "P")]
    pub p: u32,
    #[serde(rename = "KeyLen")]
    pub key_len: u32,
}

impl ScryptKdf {
    /// Fresh parameters with a random salt and cost `N = 2^log_n`.
    pub fn new(log_n: u8) -> Result<Self, ConfigError> {
        if !(MIN_LOG_N..=MAX_LOG_N).contains(&log_n) {
            return Err(ConfigError::ScryptParams(format!(
                "log2(N)={log_n} outside [{MIN_LOG_N}, {MAX_LOG_N}]"
            )));
        }
        let mut salt = vec![0u8; SALT_LEN];
        crate::crypto::CryptoCore::rand_bytes(&mut salt);
        Ok(ScryptKdf {
            salt,
            n: 1u64 << log_n,
            r: DEFAULT_R,
            p: DEFAULT_P,
            key_len: KEY_LEN as u32,
        })
    }

    /// Reject parameters an attacker may have weakened in a tampered config:
    /// a short salt or a low N would make the KEK cheap to brute-force.
    pub fn validate(&self) -> Result<u8, ConfigError> {
        if self.salt.len() < SALT_LEN {
            return Err(ConfigError::ScryptParams(format!(
                "salt is {} bytes, need at least {SALT_LEN}",
                self.salt.len()
            )));
        }
        if !self.n.is_power_of_two() {
            return Err(ConfigError::ScryptParams(format!(
                "N={} is not a power of two",
                self.n
            )));
        }
        let log_n = self.n.trailing_zeros() as u8;
        if !(MIN_LOG_N..=MAX_LOG_N).contains(&log_n) {
            return Err(ConfigError::ScryptParams(format!(
                "N=2^{log_n} outside [2^{MIN_LOG_N}, 2^{MAX_LOG_N}]"
            )));
        }
        if self.r == 0 || self.p == 0 {
            return Err(ConfigError::ScryptParams(format!(
                "R={} / P={} must be positive",
                self.r, self.p
            )));
        }
        if self.key_len as usize != KEY_LEN {
            return Err(ConfigError::ScryptParams(format!(
                "KeyLen={} is not {KEY_LEN}",
                self.key_len
            )));
        }
        Ok(log_n)
    }

    /// Derive the key encryption key from the password.
    ///
    /// UTF-8 passwords are NFC-normalized first so that composed and
    /// decomposed input unlock the same filesystem; raw byte passwords are
    /// used as-is.
    pub fn derive_key(&self, password: &[u8]) -> Result<SecretBox<[u8; KEY_LEN]>, ConfigError> {
        let log_n = self.validate()?;
        let params = scrypt::Params::new(log_n, self.r, self.p, KEY_LEN)
            .map_err(|e| ConfigError::ScryptParams(e.to_string()))?;

        let normalized: Zeroizing<Vec<u8>> = match std::str::from_utf8(password) {
            Ok(s) => Zeroizing::new(s.nfc().collect::<String>().into_bytes()),
            Err(_) => Zeroizing::new(password.to_vec()),
        };

        let mut kek = Zeroizing::new([0u8; KEY_LEN]);
        scrypt::scrypt(&normalized, &self.salt, &params, &mut kek[..])
            .map_err(|e| ConfigError::ScryptParams(e.to_string()))?;
        Ok(SecretBox::new(Box::new(*kek)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_has_sane_defaults() {
        let kdf = ScryptKdf::new(MIN_LOG_N).unwrap();
        assert_eq!(kdf.salt.len(), SALT_LEN);
        assert_eq!(kdf.n, 1024);
        assert_eq!(kdf.r, 8);
        assert_eq!(kdf.p, 1);
        assert_eq!(kdf.key_len, 32);
        assert_eq!(kdf.validate().unwrap(), MIN_LOG_N);
    }

    #[test]
    fn test_log_n_bounds() {
        assert!(ScryptKdf::new(9).is_err());
        assert!(ScryptKdf::new(29).is_err());
        assert!(ScryptKdf::new(10).is_ok());
    }

    #[test]
    fn test_salts_are_random() {
        let a = ScryptKdf::new(10).unwrap();
        let b = ScryptKdf::new(10).unwrap();
        assert_ne!(a.salt, b.salt);
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let kdf = ScryptKdf::new(10).unwrap();
        let k1 = kdf.derive_key(b"password").unwrap();
        let k2 = kdf.derive_key(b"password").unwrap();
        assert_eq!(k1.expose_secret(), k2.expose_secret());
        let k3 = kdf.derive_key(b"other password").unwrap();
        assert_ne!(k1.expose_secret(), k3.expose_secret());
    }

    #[test]
    fn test_salt_matters() {
        let mut kdf = ScryptKdf::new(10).unwrap();
        let k1 = kdf.derive_key(b"password").unwrap();
        kdf.salt[0] ^= 1;
        let k2 = kdf.derive_key(b"password").unwrap();
        assert_ne!(k1.expose_secret(), k2.expose_secret());
    }

    #[test]
    fn test_nfc_normalization() {
        let kdf = ScryptKdf::new(10).unwrap();
        // "é" composed vs decomposed.
        let composed = kdf.derive_key("\u{00e9}".as_bytes()).unwrap();
        let decomposed = kdf.derive_key("e\u{0301}".as_bytes()).unwrap();
        assert_eq!(composed.expose_secret(), decomposed.expose_secret());
    }

    #[test]
    fn test_validate_rejects_weakened_params() {
        let good = ScryptKdf::new(10).unwrap();

        let mut short_salt = good.clone();
        short_salt.salt.truncate(8);
        assert!(short_salt.validate().is_err());

        let mut low_n = good.clone();
        low_n.n = 512;
        assert!(low_n.validate().is_err());

        let mut not_pow2 = good.clone();
        not_pow2.n = 1025;
        assert!(not_pow2.validate().is_err());

        let mut zero_r = good.clone();
        zero_r.r = 0;
        assert!(zero_r.validate().is_err());

        let mut bad_keylen = good;
        bad_keylen.key_len = 16;
        assert!(bad_keylen.validate().is_err());
    }
}
