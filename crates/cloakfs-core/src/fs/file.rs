//! Random-access I/O on one ciphertext file.
//!
//! Translates plaintext offsets into the block format: reads decrypt the
//! covering blocks and slice out the requested window; writes read-modify-
//! write partial head and tail blocks and write whole blocks untouched.
//!
//! Concurrent reads on one handle are safe. Concurrent writes (and
//! write/truncate races) must be serialized by the caller; the handle takes
//! no locks of its own.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::{Arc, RwLock};

use tracing::{debug, instrument, trace};

use crate::content::{ContentEnc, ContentError, FileHeader, FileId, HEADER_LEN};

/// An open ciphertext file plus the shared content encryptor.
#[derive(Debug)]
pub struct EncryptedFile {
    file: File,
    enc: Arc<ContentEnc>,
    /// File ID from the header, cached after the first read or write.
    /// Cleared by truncate-to-zero, which removes the header itself.
    file_id: RwLock<Option<FileId>>,
}

impl EncryptedFile {
    /// Open an existing ciphertext file for reading and writing.
    pub fn open(path: &Path, enc: Arc<ContentEnc>) -> Result<Self, ContentError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self::from_file(file, enc))
    }

    /// Open a ciphertext file, creating it empty if missing.
    pub fn create(path: &Path, enc: Arc<ContentEnc>) -> Result<Self, ContentError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self::from_file(file, enc))
    }

    /// Wrap an already-open backing file (the frontend controls open flags).
    pub fn from_file(file: File, enc: Arc<ContentEnc>) -> Self {
        EncryptedFile {
            file,
            enc,
            file_id: RwLock::new(None),
        }
    }

    /// Current plaintext size, derived from the ciphertext size on disk.
    pub fn plain_size(&self) -> Result<u64, ContentError> {
        let cipher_size = self.file.metadata()?.len();
        self.enc.plain_size(cipher_size)
    }

    /// The file ID, or `None` for an empty file that has no header yet.
    pub fn file_id(&self) -> Result<Option<FileId>, ContentError> {
        if let Some(id) = *self.file_id.read().unwrap_or_else(|e| e.into_inner()) {
            return Ok(Some(id));
        }
        let cipher_size = self.file.metadata()?.len();
        if cipher_size == 0 {
            return Ok(None);
        }
        let mut buf = [0u8; HEADER_LEN as usize];
        self.file.read_exact_at(&mut buf, 0).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                ContentError::HeaderCorrupt {
                    reason: format!("file size {cipher_size} is smaller than the header"),
                }
            } else {
                ContentError::Io(e)
            }
        })?;
        let header = FileHeader::parse(&buf)?;
        *self.file_id.write().unwrap_or_else(|e| e.into_inner()) = Some(header.file_id);
        Ok(Some(header.file_id))
    }

    /// The file ID, creating and persisting a header first if the file is
    /// still empty.
    fn ensure_file_id(&self) -> Result<FileId, ContentError> {
        if let Some(id) = self.file_id()? {
            return Ok(id);
        }
        let header = FileHeader::random();
        self.file.write_all_at(&header.pack(), 0)?;
        *self.file_id.write().unwrap_or_else(|e| e.into_inner()) = Some(header.file_id);
        debug!("created file header");
        Ok(header.file_id)
    }

    /// Read up to `length` plaintext bytes at `offset`. Returns fewer bytes
    /// at end of file, and nothing past it.
    #[instrument(level = "trace", skip(self))]
    pub fn read_at(&self, offset: u64, length: usize) -> Result<Vec<u8>, ContentError> {
        if length == 0 {
            return Ok(Vec::new());
        }
        let plain_size = self.plain_size()?;
        if offset >= plain_size {
            return Ok(Vec::new());
        }
        let length = (length as u64).min(plain_size - offset);
        let file_id = match self.file_id()? {
            Some(id) => id,
            None => return Ok(Vec::new()),
        };

        let mut out = Vec::with_capacity(length as usize);
        for part in self.enc.split_range(offset, length) {
            let block_plain = self.read_block(part.block_no, &file_id)?;
            if (block_plain.len() as u64) <= part.skip {
                break; // concurrent shrink; treat as end of file
            }
            let end = (part.skip + part.length).min(block_plain.len() as u64);
            out.extend_from_slice(&block_plain[part.skip as usize..end as usize]);
            if end < part.skip + part.length {
                break;
            }
        }
        trace!(requested = length, returned = out.len(), "read");
        Ok(out)
    }

    /// Write `data` at plaintext `offset`, zero-filling any hole between
    /// the current end of file and `offset`. Returns the number of bytes
    /// written (always all of `data`).
    #[instrument(level = "trace", skip(self, data), fields(len = data.len()))]
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize, ContentError> {
        if data.is_empty() {
            return Ok(0);
        }
        let plain_size = self.plain_size()?;
        if offset > plain_size {
            self.fill_zeros(plain_size, offset)?;
        }
        self.write_range(offset, data)?;
        Ok(data.len())
    }

    /// Truncate to `new_size` plaintext bytes. Growing zero-fills; shrinking
    /// into the middle of a block rewrites that block's tail.
    #[instrument(level = "debug", skip(self))]
    pub fn truncate(&self, new_size: u64) -> Result<(), ContentError> {
        let cur_size = self.plain_size()?;
        if new_size == cur_size {
            return Ok(());
        }
        if new_size == 0 {
            self.file.set_len(0)?;
            // The header is gone with the data; the next write creates a
            // fresh one.
            *self.file_id.write().unwrap_or_else(|e| e.into_inner()) = None;
            return Ok(());
        }
        if new_size > cur_size {
            return self.fill_zeros(cur_size, new_size);
        }

        let file_id = self.ensure_file_id()?;
        let last_block = self.enc.block_no(new_size - 1);
        let cut = self.enc.block_offset(new_size);
        if cut == 0 {
            // Block-aligned: drop whole blocks.
            self.file.set_len(self.enc.block_cipher_offset(new_size / self.enc.plain_bs()))?;
            return Ok(());
        }
        let mut block_plain = self.read_block(last_block, &file_id)?;
        block_plain.truncate(cut as usize);
        self.file.set_len(self.enc.block_cipher_offset(last_block))?;
        self.write_block(last_block, &block_plain, &file_id)
    }

    /// Flush file data to stable storage.
    pub fn sync(&self) -> Result<(), ContentError> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Zero-fill plaintext range `[from, to)` using the write path, so the
    /// hole reads back as zeros even on filesystems without sparse support.
    fn fill_zeros(&self, from: u64, to: u64) -> Result<(), ContentError> {
        let zeros = vec![0u8; self.enc.plain_bs() as usize];
        let mut pos = from;
        while pos < to {
            let chunk = (to - pos).min(self.enc.plain_bs() - self.enc.block_offset(pos));
            self.write_range(pos, &zeros[..chunk as usize])?;
            pos += chunk;
        }
        Ok(())
    }

    /// Write a contiguous range that starts at or before the current end of
    /// file. Partial blocks are read-modify-written; whole blocks go out
    /// directly.
    fn write_range(&self, offset: u64, data: &[u8]) -> Result<(), ContentError> {
        let file_id = self.ensure_file_id()?;
        let plain_bs = self.enc.plain_bs();
        let mut consumed = 0usize;
        for part in self.enc.split_range(offset, data.len() as u64) {
            let chunk = &data[consumed..consumed + part.length as usize];
            if part.is_partial(plain_bs) {
                let mut block_plain = self.read_block(part.block_no, &file_id)?;
                let skip = part.skip as usize;
                let end = skip + chunk.len();
                if block_plain.len() < end {
                    block_plain.resize(end, 0);
                }
                block_plain[skip..end].copy_from_slice(chunk);
                self.write_block(part.block_no, &block_plain, &file_id)?;
            } else {
                self.write_block(part.block_no, chunk, &file_id)?;
            }
            consumed += part.length as usize;
        }
        Ok(())
    }

    /// Read and decrypt one block. Returns an empty vector past the end of
    /// the ciphertext file.
    fn read_block(&self, block_no: u64, file_id: &FileId) -> Result<Vec<u8>, ContentError> {
        let offset = self.enc.block_cipher_offset(block_no);
        let mut buf = vec![0u8; self.enc.cipher_bs() as usize];
        let mut filled = 0usize;
        while filled < buf.len() {
            let n = self.file.read_at(&mut buf[filled..], offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        self.enc.decrypt_block(&buf, block_no, file_id)
    }

    /// Encrypt and write one block at its ciphertext offset.
    fn write_block(
        &self,
        block_no: u64,
        plain: &[u8],
        file_id: &FileId,
    ) -> Result<(), ContentError> {
        let block = self.enc.encrypt_block(plain, block_no, file_id)?;
        self.file
            .write_all_at(&block, self.enc.block_cipher_offset(block_no))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::HEADER_LEN;
    use crate::crypto::{AeadBackend, CryptoCore, MasterKey};

    fn test_enc() -> Arc<ContentEnc> {
        let key = MasterKey::from_bytes([0x33u8; 32]);
        let core = CryptoCore::new(&key, AeadBackend::AesGcm, 128, true, false).unwrap();
        Arc::new(ContentEnc::new(Arc::new(core)))
    }

    fn temp_file(enc: &Arc<ContentEnc>) -> (tempfile::TempDir, EncryptedFile) {
        let dir = tempfile::tempdir().unwrap();
        let f = EncryptedFile::create(&dir.path().join("data"), Arc::clone(enc)).unwrap();
        (dir, f)
    }

    #[test]
    fn test_small_write_read() {
        let enc = test_enc();
        let (_dir, f) = temp_file(&enc);
        f.write_at(0, b"hello\n").unwrap();
        assert_eq!(f.plain_size().unwrap(), 6);
        assert_eq!(f.read_at(0, 100).unwrap(), b"hello\n");
        assert_eq!(f.read_at(2, 3).unwrap(), b"llo");
    }

    #[test]
    fn test_on_disk_size_of_small_file() {
        let enc = test_enc();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        let f = EncryptedFile::create(&path, Arc::clone(&enc)).unwrap();
        f.write_at(0, b"hello\n").unwrap();
        drop(f);
        // 18 header + 16 IV + 6 payload + 16 tag
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 56);
    }

    #[test]
    fn test_empty_file_has_no_header() {
        let enc = test_enc();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        let f = EncryptedFile::create(&path, Arc::clone(&enc)).unwrap();
        assert_eq!(f.plain_size().unwrap(), 0);
        assert!(f.file_id().unwrap().is_none());
        assert!(f.read_at(0, 10).unwrap().is_empty());
        drop(f);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn test_block_boundary_write() {
        let enc = test_enc();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        let f = EncryptedFile::create(&path, Arc::clone(&enc)).unwrap();
        f.write_at(0, &vec![0xAAu8; 4097]).unwrap();
        assert_eq!(f.plain_size().unwrap(), 4097);
        // 18 + (16+4096+16) + (16+1+16)
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4179);
        assert_eq!(f.read_at(4095, 3).unwrap(), vec![0xAA, 0xAA, 0xAA]);
    }

    #[test]
    fn test_multi_block_roundtrip() {
        let enc = test_enc();
        let (_dir, f) = temp_file(&enc);
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 256) as u8).collect();
        f.write_at(0, &data).unwrap();
        assert_eq!(f.read_at(0, 20_000).unwrap(), data);
        // Window crossing two block boundaries.
        assert_eq!(f.read_at(4090, 4110).unwrap(), data[4090..8200]);
    }

    #[test]
    fn test_overwrite_middle() {
        let enc = test_enc();
        let (_dir, f) = temp_file(&enc);
        f.write_at(0, &vec![1u8; 10_000]).unwrap();
        f.write_at(4000, &vec![2u8; 200]).unwrap();
        let back = f.read_at(0, 10_000).unwrap();
        assert_eq!(&back[..4000], &vec![1u8; 4000][..]);
        assert_eq!(&back[4000..4200], &vec![2u8; 200][..]);
        assert_eq!(&back[4200..], &vec![1u8; 5800][..]);
        assert_eq!(f.plain_size().unwrap(), 10_000);
    }

    #[test]
    fn test_sparse_write_reads_zeros() {
        let enc = test_enc();
        let (_dir, f) = temp_file(&enc);
        f.write_at(0, b"start").unwrap();
        f.write_at(10_000, b"end").unwrap();
        assert_eq!(f.plain_size().unwrap(), 10_003);
        let back = f.read_at(0, 10_003).unwrap();
        assert_eq!(&back[..5], b"start");
        assert!(back[5..10_000].iter().all(|&b| b == 0));
        assert_eq!(&back[10_000..], b"end");
    }

    #[test]
    fn test_read_past_eof() {
        let enc = test_enc();
        let (_dir, f) = temp_file(&enc);
        f.write_at(0, b"abc").unwrap();
        assert!(f.read_at(3, 10).unwrap().is_empty());
        assert!(f.read_at(100, 10).unwrap().is_empty());
        assert_eq!(f.read_at(1, 100).unwrap(), b"bc");
    }

    #[test]
    fn test_truncate_shrink_into_block() {
        let enc = test_enc();
        let (_dir, f) = temp_file(&enc);
        let data: Vec<u8> = (0..9000u32).map(|i| (i % 251) as u8).collect();
        f.write_at(0, &data).unwrap();
        f.truncate(5000).unwrap();
        assert_eq!(f.plain_size().unwrap(), 5000);
        assert_eq!(f.read_at(0, 9000).unwrap(), data[..5000]);
    }

    #[test]
    fn test_truncate_block_aligned() {
        let enc = test_enc();
        let (_dir, f) = temp_file(&enc);
        f.write_at(0, &vec![7u8; 9000]).unwrap();
        f.truncate(4096).unwrap();
        assert_eq!(f.plain_size().unwrap(), 4096);
        assert_eq!(f.read_at(0, 9000).unwrap(), vec![7u8; 4096]);
    }

    #[test]
    fn test_truncate_to_zero_then_rewrite() {
        let enc = test_enc();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        let f = EncryptedFile::create(&path, Arc::clone(&enc)).unwrap();
        f.write_at(0, b"first life").unwrap();
        f.truncate(0).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
        assert!(f.read_at(0, 10).unwrap().is_empty());

        f.write_at(0, b"second").unwrap();
        assert_eq!(f.read_at(0, 10).unwrap(), b"second");
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 56);
    }

    #[test]
    fn test_truncate_grow() {
        let enc = test_enc();
        let (_dir, f) = temp_file(&enc);
        f.write_at(0, b"tiny").unwrap();
        f.truncate(8192).unwrap();
        assert_eq!(f.plain_size().unwrap(), 8192);
        let back = f.read_at(0, 8192).unwrap();
        assert_eq!(&back[..4], b"tiny");
        assert!(back[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_file_id_is_stable_across_writes() {
        let enc = test_enc();
        let (_dir, f) = temp_file(&enc);
        f.write_at(0, b"a").unwrap();
        let id1 = f.file_id().unwrap().unwrap();
        f.write_at(5000, b"b").unwrap();
        assert_eq!(f.file_id().unwrap().unwrap(), id1);
    }

    #[test]
    fn test_reopen_reads_same_data() {
        let enc = test_enc();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        {
            let f = EncryptedFile::create(&path, Arc::clone(&enc)).unwrap();
            f.write_at(0, &vec![0x5Au8; 6000]).unwrap();
            f.sync().unwrap();
        }
        let f = EncryptedFile::open(&path, Arc::clone(&enc)).unwrap();
        assert_eq!(f.read_at(0, 6000).unwrap(), vec![0x5Au8; 6000]);
    }

    #[test]
    fn test_swapped_blocks_fail_auth() {
        let enc = test_enc();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        let f = EncryptedFile::create(&path, Arc::clone(&enc)).unwrap();
        f.write_at(0, &vec![9u8; 8192]).unwrap();
        drop(f);

        // Swap ciphertext blocks 0 and 1 on disk.
        let mut raw = std::fs::read(&path).unwrap();
        let bs = enc.cipher_bs() as usize;
        let h = HEADER_LEN as usize;
        let (a, b) = raw.split_at_mut(h + bs);
        a[h..h + bs].swap_with_slice(&mut b[..bs]);
        std::fs::write(&path, &raw).unwrap();

        let f = EncryptedFile::open(&path, Arc::clone(&enc)).unwrap();
        assert!(matches!(
            f.read_at(0, 1),
            Err(ContentError::Auth { block_no: 0 })
        ));
        assert!(matches!(
            f.read_at(4096, 1),
            Err(ContentError::Auth { block_no: 1 })
        ));
    }

    #[test]
    fn test_foreign_file_id_fails_auth() {
        let enc = test_enc();
        let dir = tempfile::tempdir().unwrap();
        let path_a = dir.path().join("a");
        let path_b = dir.path().join("b");
        for path in [&path_a, &path_b] {
            let f = EncryptedFile::create(path, Arc::clone(&enc)).unwrap();
            f.write_at(0, b"same plaintext").unwrap();
        }

        // Transplant b's header onto a.
        let header_b = &std::fs::read(&path_b).unwrap()[..HEADER_LEN as usize];
        let mut raw_a = std::fs::read(&path_a).unwrap();
        raw_a[..HEADER_LEN as usize].copy_from_slice(header_b);
        std::fs::write(&path_a, &raw_a).unwrap();

        let f = EncryptedFile::open(&path_a, Arc::clone(&enc)).unwrap();
        assert!(matches!(f.read_at(0, 14), Err(ContentError::Auth { .. })));
    }

    #[test]
    fn test_short_ciphertext_file_is_header_corrupt() {
        let enc = test_enc();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, [1u8; 10]).unwrap();
        let f = EncryptedFile::open(&path, Arc::clone(&enc)).unwrap();
        assert!(matches!(
            f.read_at(0, 1),
            Err(ContentError::HeaderCorrupt { .. })
        ));
    }

    #[test]
    fn test_wrong_header_version() {
        let enc = test_enc();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        let f = EncryptedFile::create(&path, Arc::clone(&enc)).unwrap();
        f.write_at(0, b"data").unwrap();
        drop(f);

        let mut raw = std::fs::read(&path).unwrap();
        raw[1] = 9; // bogus version
        std::fs::write(&path, &raw).unwrap();

        let f = EncryptedFile::open(&path, Arc::clone(&enc)).unwrap();
        assert!(matches!(
            f.read_at(0, 4),
            Err(ContentError::HeaderCorrupt { .. })
        ));
    }
}
