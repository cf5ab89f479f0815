//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use cloakfs_core::config::{self, ConfFile, CreateOpts, MIN_LOG_N};
use cloakfs_core::content::ContentEnc;
use cloakfs_core::crypto::{CryptoCore, MasterKey};

pub const TEST_PASSWORD: &[u8] = b"test";

/// Create a filesystem config in `cipher_dir` with fast scrypt parameters.
pub fn create_fs(cipher_dir: &Path, aessiv: bool) {
    config::create(&CreateOpts {
        path: &cipher_dir.join(config::CONF_NAME),
        password: TEST_PASSWORD,
        log_n: MIN_LOG_N,
        creator: "cloakfs integration tests",
        plaintext_names: false,
        aessiv,
        devrandom: false,
        fido2: None,
    })
    .expect("config creation failed");
}

/// Unlock the filesystem in `cipher_dir`: the full mount path from config
/// file to master key.
pub fn unlock_fs(cipher_dir: &Path) -> (MasterKey, ConfFile) {
    let (key, conf) =
        config::load_and_decrypt(&cipher_dir.join(config::CONF_NAME), TEST_PASSWORD)
            .expect("unlock failed");
    (key.expect("no key returned"), conf)
}

/// Unlock and build the content encryptor, as a mount would.
pub fn unlock_content_enc(cipher_dir: &Path) -> (Arc<CryptoCore>, Arc<ContentEnc>) {
    let (key, conf) = unlock_fs(cipher_dir);
    let core = Arc::new(conf.crypto_core(&key, false).expect("crypto core"));
    let enc = Arc::new(ContentEnc::new(Arc::clone(&core)));
    (core, enc)
}
