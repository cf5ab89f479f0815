//! Content block encryption: the ciphertext file format.
//!
//! Every non-empty ciphertext file starts with an 18-byte header (2-byte
//! big-endian version, 16-byte random file ID) followed by fixed-size
//! authenticated blocks:
//!
//! ```text
//! [ 2-byte BE version = 2 ][ 16-byte file ID ]
//! [ IV | 4096 bytes ciphertext | 16-byte tag ] x N
//! [ IV | <=4096 bytes ciphertext | 16-byte tag ]   (final short block)
//! ```
//!
//! Each block carries AAD `be64(block_no) || file_id`, so blocks cannot be
//! reordered within a file or transplanted between files. Empty plaintext
//! files are empty on disk; there is no header until the first write.

use std::io;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::crypto::core::TAG_LEN;
use crate::crypto::{CryptoCore, CryptoError};

/// Plaintext block size in bytes.
pub const DEFAULT_PLAIN_BS: u64 = 4096;

/// File header length: 2-byte version plus 16-byte file ID.
pub const HEADER_LEN: u64 = 18;

/// On-disk format version stored in every file header.
pub const HEADER_CURRENT_VERSION: u16 = 2;

/// Length of the random per-file ID.
pub const FILE_ID_LEN: usize = 16;

/// The random per-file identifier bound into every block's AAD.
pub type FileId = [u8; FILE_ID_LEN];

#[derive(Error, Debug)]
pub enum ContentError {
    /// Header missing, truncated, or carrying an unknown version.
    #[error("corrupt file header: {reason}")]
    HeaderCorrupt { reason: String },

    /// Ciphertext size that no well-formed file can have.
    #[error("ciphertext size {cipher_size} does not map to a plaintext size")]
    InvalidSize { cipher_size: u64 },

    /// A ciphertext block shorter than nonce + tag.
    #[error("block {block_no} is too short: {len} bytes")]
    BlockTooShort { block_no: u64, len: usize },

    /// Authentication failure on one block. Surfaced to the kernel as EIO.
    #[error("block {block_no} failed authentication")]
    Auth { block_no: u64 },

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Parsed file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub file_id: FileId,
}

impl FileHeader {
    /// A fresh header with a random file ID, created on first write.
    pub fn random() -> Self {
        let mut file_id = [0u8; FILE_ID_LEN];
        CryptoCore::rand_bytes(&mut file_id);
        FileHeader { file_id }
    }

    /// Serialize to the 18-byte on-disk form.
    pub fn pack(&self) -> [u8; HEADER_LEN as usize] {
        let mut out = [0u8; HEADER_LEN as usize];
        out[..2].copy_from_slice(&HEADER_CURRENT_VERSION.to_be_bytes());
        out[2..].copy_from_slice(&self.file_id);
        out
    }

    /// Parse the first 18 bytes of a ciphertext file.
    pub fn parse(bytes: &[u8]) -> Result<Self, ContentError> {
        if bytes.len() < HEADER_LEN as usize {
            return Err(ContentError::HeaderCorrupt {
                reason: format!("got {} bytes, header needs {}", bytes.len(), HEADER_LEN),
            });
        }
        let version = u16::from_be_bytes([bytes[0], bytes[1]]);
        if version != HEADER_CURRENT_VERSION {
            return Err(ContentError::HeaderCorrupt {
                reason: format!(
                    "version {version}, expected {HEADER_CURRENT_VERSION}"
                ),
            });
        }
        let mut file_id = [0u8; FILE_ID_LEN];
        file_id.copy_from_slice(&bytes[2..HEADER_LEN as usize]);
        Ok(FileHeader { file_id })
    }
}

/// One block's share of a plaintext byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntraBlock {
    /// Block number.
    pub block_no: u64,
    /// Bytes to skip at the start of the block.
    pub skip: u64,
    /// Bytes of this block that belong to the range.
    pub length: u64,
}

impl IntraBlock {
    /// True unless the range covers this block completely.
    pub fn is_partial(&self, plain_bs: u64) -> bool {
        self.skip > 0 || self.length < plain_bs
    }
}

/// Translates between plaintext files and the authenticated block format.
///
/// Pure except for nonce generation; all disk I/O lives in
/// [`crate::fs::file`]. Shared behind an `Arc` across open file handles.
#[derive(Debug)]
pub struct ContentEnc {
    core: Arc<CryptoCore>,
    plain_bs: u64,
}

impl ContentEnc {
    pub fn new(core: Arc<CryptoCore>) -> Self {
        ContentEnc {
            core,
            plain_bs: DEFAULT_PLAIN_BS,
        }
    }

    pub fn core(&self) -> &Arc<CryptoCore> {
        &self.core
    }

    pub fn plain_bs(&self) -> u64 {
        self.plain_bs
    }

    /// Per-block overhead: nonce plus tag.
    pub fn block_overhead(&self) -> u64 {
        self.core.iv_len() as u64 + TAG_LEN as u64
    }

    /// Ciphertext block size for a full plaintext block.
    pub fn cipher_bs(&self) -> u64 {
        self.plain_bs + self.block_overhead()
    }

    /// Block number containing a plaintext offset.
    pub fn block_no(&self, plain_off: u64) -> u64 {
        plain_off / self.plain_bs
    }

    /// Offset within its block of a plaintext offset.
    pub fn block_offset(&self, plain_off: u64) -> u64 {
        plain_off % self.plain_bs
    }

    /// Ciphertext file offset where a block starts.
    pub fn block_cipher_offset(&self, block_no: u64) -> u64 {
        HEADER_LEN + block_no * self.cipher_bs()
    }

    /// Plaintext file offset where a block starts.
    pub fn block_plain_offset(&self, block_no: u64) -> u64 {
        block_no * self.plain_bs
    }

    /// Map a ciphertext file size to the plaintext size it represents.
    pub fn plain_size(&self, cipher_size: u64) -> Result<u64, ContentError> {
        if cipher_size == 0 {
            return Ok(0);
        }
        if cipher_size < HEADER_LEN {
            return Err(ContentError::HeaderCorrupt {
                reason: format!("file size {cipher_size} is smaller than the header"),
            });
        }
        let content = cipher_size - HEADER_LEN;
        if content == 0 {
            return Ok(0);
        }
        let blocks = content.div_ceil(self.cipher_bs());
        let overhead = blocks * self.block_overhead();
        // The final block must hold at least one byte of payload.
        let last_block = content - (blocks - 1) * self.cipher_bs();
        if last_block <= self.block_overhead() {
            return Err(ContentError::InvalidSize { cipher_size });
        }
        Ok(content - overhead)
    }

    /// Map a plaintext size to the exact ciphertext file size.
    pub fn cipher_size(&self, plain_size: u64) -> u64 {
        if plain_size == 0 {
            return 0;
        }
        let blocks = plain_size.div_ceil(self.plain_bs);
        HEADER_LEN + plain_size + blocks * self.block_overhead()
    }

    /// Decompose a plaintext byte range into its covering blocks.
    pub fn split_range(&self, offset: u64, length: u64) -> Vec<IntraBlock> {
        let mut out = Vec::new();
        let mut off = offset;
        let mut remaining = length;
        while remaining > 0 {
            let block_no = self.block_no(off);
            let skip = self.block_offset(off);
            let len = remaining.min(self.plain_bs - skip);
            out.push(IntraBlock {
                block_no,
                skip,
                length: len,
            });
            off += len;
            remaining -= len;
        }
        out
    }

    /// Encrypt one plaintext block. Output: `nonce || ciphertext || tag`.
    /// An empty block encrypts to nothing (end of file).
    pub fn encrypt_block(
        &self,
        plaintext: &[u8],
        block_no: u64,
        file_id: &[u8],
    ) -> Result<Vec<u8>, ContentError> {
        if plaintext.is_empty() {
            return Ok(Vec::new());
        }
        let nonce = self.core.fresh_nonce();
        let aad = build_aad(block_no, file_id);
        let ct = self.core.encrypt_block(plaintext, &nonce, &aad)?;
        let mut out = Vec::with_capacity(nonce.len() + ct.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ct);
        Ok(out)
    }

    /// Decrypt one ciphertext block (`nonce || ciphertext || tag`).
    ///
    /// An all-zero block of full size is a hole punched into the ciphertext
    /// file by a sparse writer and decrypts to an all-zero plaintext block.
    /// An all-zero nonce anywhere else marks corruption and is rejected
    /// before touching the AEAD.
    pub fn decrypt_block(
        &self,
        ciphertext: &[u8],
        block_no: u64,
        file_id: &[u8],
    ) -> Result<Vec<u8>, ContentError> {
        if ciphertext.is_empty() {
            return Ok(Vec::new());
        }
        if ciphertext.len() as u64 == self.cipher_bs() && ciphertext.iter().all(|&b| b == 0) {
            debug!(block_no, "all-zero block, passing through as a hole");
            return Ok(vec![0u8; self.plain_bs as usize]);
        }
        let iv_len = self.core.iv_len();
        if ciphertext.len() <= iv_len + TAG_LEN {
            return Err(ContentError::BlockTooShort {
                block_no,
                len: ciphertext.len(),
            });
        }
        let (nonce, data) = ciphertext.split_at(iv_len);
        if nonce.iter().all(|&b| b == 0) {
            warn!(block_no, "all-zero nonce in a non-zero block");
            return Err(ContentError::Auth { block_no });
        }
        let aad = build_aad(block_no, file_id);
        match self.core.decrypt_block(data, nonce, &aad) {
            Ok(plain) => Ok(plain),
            Err(CryptoError::Auth) => {
                debug!(block_no, "block authentication failed");
                Err(ContentError::Auth { block_no })
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// AAD layout: `be64(block_no) || file_id`. `file_id` is empty for the
/// master-key wrap in the config file.
fn build_aad(block_no: u64, file_id: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(8 + file_id.len());
    aad.extend_from_slice(&block_no.to_be_bytes());
    aad.extend_from_slice(file_id);
    aad
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{AeadBackend, MasterKey};

    fn test_enc() -> ContentEnc {
        let key = MasterKey::from_bytes([7u8; 32]);
        let core = CryptoCore::new(&key, AeadBackend::AesGcm, 128, true, false).unwrap();
        ContentEnc::new(Arc::new(core))
    }

    #[test]
    fn test_size_mapping() {
        let enc = test_enc();
        // "hello\n" = 6 bytes -> 18 + (16 + 6 + 16)
        assert_eq!(enc.cipher_size(6), 56);
        assert_eq!(enc.plain_size(56).unwrap(), 6);
        // 4097 bytes -> 18 + (16+4096+16) + (16+1+16)
        assert_eq!(enc.cipher_size(4097), 4179);
        assert_eq!(enc.plain_size(4179).unwrap(), 4097);
        // Exact block boundary.
        assert_eq!(enc.cipher_size(4096), 18 + 16 + 4096 + 16);
        assert_eq!(enc.plain_size(18 + 16 + 4096 + 16).unwrap(), 4096);
        // Empty files stay empty.
        assert_eq!(enc.cipher_size(0), 0);
        assert_eq!(enc.plain_size(0).unwrap(), 0);
        // Header-only file holds zero bytes.
        assert_eq!(enc.plain_size(HEADER_LEN).unwrap(), 0);
    }

    #[test]
    fn test_size_roundtrip_sweep() {
        let enc = test_enc();
        for plain in [1u64, 5, 4095, 4096, 4097, 8192, 100_000] {
            let cipher = enc.cipher_size(plain);
            assert_eq!(enc.plain_size(cipher).unwrap(), plain, "plain={plain}");
        }
    }

    #[test]
    fn test_undersized_file_is_header_corrupt() {
        let enc = test_enc();
        for size in 1..HEADER_LEN {
            assert!(
                matches!(
                    enc.plain_size(size),
                    Err(ContentError::HeaderCorrupt { .. })
                ),
                "size={size}"
            );
        }
        // A block that is pure overhead cannot exist.
        assert!(enc.plain_size(HEADER_LEN + 32).is_err());
    }

    #[test]
    fn test_split_range() {
        let enc = test_enc();
        // Spans the first block boundary: [4095, 4098).
        let parts = enc.split_range(4095, 3);
        assert_eq!(
            parts,
            vec![
                IntraBlock { block_no: 0, skip: 4095, length: 1 },
                IntraBlock { block_no: 1, skip: 0, length: 2 },
            ]
        );
        assert!(parts[0].is_partial(4096));
        assert!(parts[1].is_partial(4096));

        let whole = enc.split_range(4096, 4096);
        assert_eq!(whole.len(), 1);
        assert!(!whole[0].is_partial(4096));

        assert!(enc.split_range(123, 0).is_empty());
    }

    #[test]
    fn test_block_roundtrip() {
        let enc = test_enc();
        let id = [0xABu8; FILE_ID_LEN];
        for len in [1usize, 15, 4095, 4096] {
            let plain: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
            let block = enc.encrypt_block(&plain, 3, &id).unwrap();
            assert_eq!(block.len(), len + 32);
            assert_eq!(enc.decrypt_block(&block, 3, &id).unwrap(), plain);
        }
    }

    #[test]
    fn test_empty_block_is_empty() {
        let enc = test_enc();
        assert!(enc.encrypt_block(&[], 0, &[0u8; 16]).unwrap().is_empty());
        assert!(enc.decrypt_block(&[], 0, &[0u8; 16]).unwrap().is_empty());
    }

    #[test]
    fn test_block_number_is_bound() {
        let enc = test_enc();
        let id = [1u8; FILE_ID_LEN];
        let block = enc.encrypt_block(b"block data", 0, &id).unwrap();
        assert!(matches!(
            enc.decrypt_block(&block, 1, &id),
            Err(ContentError::Auth { block_no: 1 })
        ));
    }

    #[test]
    fn test_file_id_is_bound() {
        let enc = test_enc();
        let block = enc.encrypt_block(b"block data", 0, &[1u8; 16]).unwrap();
        assert!(enc.decrypt_block(&block, 0, &[2u8; 16]).is_err());
    }

    #[test]
    fn test_tamper_any_byte_fails() {
        let enc = test_enc();
        let id = [9u8; FILE_ID_LEN];
        let block = enc.encrypt_block(b"sensitive", 0, &id).unwrap();
        for i in 0..block.len() {
            let mut tampered = block.clone();
            tampered[i] ^= 0x01;
            assert!(
                enc.decrypt_block(&tampered, 0, &id).is_err(),
                "flip at {i} not detected"
            );
        }
    }

    #[test]
    fn test_hole_block_reads_as_zeros() {
        let enc = test_enc();
        let hole = vec![0u8; enc.cipher_bs() as usize];
        let plain = enc.decrypt_block(&hole, 5, &[1u8; 16]).unwrap();
        assert_eq!(plain, vec![0u8; 4096]);
    }

    #[test]
    fn test_zero_nonce_rejected() {
        let enc = test_enc();
        let id = [1u8; FILE_ID_LEN];
        let mut block = enc.encrypt_block(b"data", 0, &id).unwrap();
        for b in block.iter_mut().take(16) {
            *b = 0;
        }
        assert!(matches!(
            enc.decrypt_block(&block, 0, &id),
            Err(ContentError::Auth { .. })
        ));
    }

    #[test]
    fn test_header_pack_parse() {
        let header = FileHeader::random();
        let packed = header.pack();
        assert_eq!(packed.len(), 18);
        assert_eq!(&packed[..2], &[0, 2]);
        assert_eq!(FileHeader::parse(&packed).unwrap(), header);

        let mut bad_version = packed;
        bad_version[1] = 1;
        assert!(matches!(
            FileHeader::parse(&bad_version),
            Err(ContentError::HeaderCorrupt { .. })
        ));
        assert!(FileHeader::parse(&packed[..17]).is_err());
    }

    #[test]
    fn test_headers_are_unique() {
        assert_ne!(FileHeader::random().file_id, FileHeader::random().file_id);
    }
}
