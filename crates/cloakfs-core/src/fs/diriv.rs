//! Per-directory IVs: the EME tweak for every name in a directory.
//!
//! Each ciphertext directory holds a `gocryptfs.diriv` file with 16 random
//! bytes, created together with the directory and read on every name lookup.
//! A small LRU cache avoids re-reading it for hot directories; correctness
//! never depends on the cache being enabled.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::num::NonZeroUsize;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use lru::LruCache;
use thiserror::Error;
use tracing::{debug, warn};

use crate::crypto::CryptoCore;

/// Name of the per-directory IV file.
pub const DIRIV_NAME: &str = "gocryptfs.diriv";

/// Length of a directory IV in bytes.
pub const DIRIV_LEN: usize = 16;

/// Default capacity of the per-mount IV cache.
const CACHE_CAPACITY: usize = 100;

pub type DirIv = [u8; DIRIV_LEN];

#[derive(Error, Debug)]
pub enum DirIvError {
    /// The IV file does not hold exactly 16 bytes.
    #[error("diriv {path:?} holds {len} bytes, expected exactly 16")]
    WrongSize { path: PathBuf, len: usize },

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Read `<dir>/gocryptfs.diriv`, requiring exactly 16 bytes.
pub fn read_diriv(dir: &Path) -> Result<DirIv, DirIvError> {
    let path = dir.join(DIRIV_NAME);
    let wrap_io = |source: io::Error| DirIvError::Io {
        path: path.clone(),
        source,
    };
    let mut f = File::open(&path).map_err(wrap_io)?;
    // Read one byte more than expected so an oversized file is detected.
    let mut buf = [0u8; DIRIV_LEN + 1];
    let mut len = 0;
    loop {
        let n = f.read(&mut buf[len..]).map_err(wrap_io)?;
        if n == 0 {
            break;
        }
        len += n;
        if len > DIRIV_LEN {
            break;
        }
    }
    if len != DIRIV_LEN {
        warn!(path = %path.display(), len, "malformed diriv file");
        return Err(DirIvError::WrongSize { path, len });
    }
    let mut iv = [0u8; DIRIV_LEN];
    iv.copy_from_slice(&buf[..DIRIV_LEN]);
    Ok(iv)
}

/// Create `<dir>/gocryptfs.diriv` with fresh random bytes.
///
/// Created exclusively (`O_CREAT|O_EXCL`) with mode 0400: the IV is written
/// once at directory creation and never rewritten.
pub fn create_diriv(dir: &Path) -> Result<DirIv, DirIvError> {
    let path = dir.join(DIRIV_NAME);
    let wrap_io = |source: io::Error| DirIvError::Io {
        path: path.clone(),
        source,
    };
    let mut iv = [0u8; DIRIV_LEN];
    CryptoCore::rand_bytes(&mut iv);
    let mut f = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o400)
        .open(&path)
        .map_err(wrap_io)?;
    f.write_all(&iv).map_err(wrap_io)?;
    debug!(path = %path.display(), "created diriv");
    Ok(iv)
}

/// LRU cache of `(directory path -> IV)`, owned per mount.
///
/// Entries are immutable once inserted; renames and deletions invalidate by
/// path. Shared-storage setups construct it disabled so every lookup hits
/// the disk, since another host may have replaced the directory.
#[derive(Debug)]
pub struct DirIvCache {
    cache: Option<Mutex<LruCache<PathBuf, DirIv>>>,
}

impl DirIvCache {
    pub fn new() -> Self {
        let capacity = NonZeroUsize::new(CACHE_CAPACITY).expect("capacity is non-zero");
        DirIvCache {
            cache: Some(Mutex::new(LruCache::new(capacity))),
        }
    }

    /// A cache that never stores anything (shared-storage mode).
    pub fn disabled() -> Self {
        DirIvCache { cache: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.cache.is_some()
    }

    /// The IV for `dir`, from cache or disk.
    pub fn get(&self, dir: &Path) -> Result<DirIv, DirIvError> {
        if let Some(cache) = &self.cache {
            let mut guard = cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(iv) = guard.get(dir) {
                return Ok(*iv);
            }
        }
        let iv = read_diriv(dir)?;
        if let Some(cache) = &self.cache {
            let mut guard = cache.lock().unwrap_or_else(|e| e.into_inner());
            guard.put(dir.to_path_buf(), iv);
        }
        Ok(iv)
    }

    /// Drop the entry for `dir`, if any. Called on rename and delete.
    pub fn invalidate(&self, dir: &Path) {
        if let Some(cache) = &self.cache {
            let mut guard = cache.lock().unwrap_or_else(|e| e.into_inner());
            guard.pop(dir);
        }
    }

    /// Drop everything (e.g. after fsck repairs).
    pub fn clear(&self) {
        if let Some(cache) = &self.cache {
            let mut guard = cache.lock().unwrap_or_else(|e| e.into_inner());
            guard.clear();
        }
    }
}

impl Default for DirIvCache {
    fn default() -> Self {
        Self::new()
    }
}
