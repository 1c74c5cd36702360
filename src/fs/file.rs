//! Open files: block-wise read, read-modify-write and truncate
//!
//! Every open handle on the same backing inode shares one content lock from
//! the [`OpenFileTable`]. Reads take it shared, writes and truncates take it
//! exclusive, so two handles never interleave read-modify-write cycles on
//! the same block.

use super::inomap::QIno;
use super::root::RootState;
use crate::crypto::{
    ContentEnc, FileHeader, FileId, CIPHER_BLOCK_SIZE, HEADER_LEN, MAX_FILE_SIZE,
    PLAIN_BLOCK_SIZE,
};
use crate::error::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Zero-fill writes are issued in pieces of this size
const ZERO_FILL_CHUNK: usize = 64 * PLAIN_BLOCK_SIZE;

/// Shared state of one open backing inode
pub struct OpenFileEntry {
    content_lock: RwLock<()>,
}

/// Backing inode -> shared state, refcounted by open handles
#[derive(Default)]
pub struct OpenFileTable {
    entries: Mutex<HashMap<QIno, (Arc<OpenFileEntry>, usize)>>,
}

impl OpenFileTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an open handle on a backing inode
    pub fn register(&self, q: QIno) -> Arc<OpenFileEntry> {
        let mut entries = self.entries.lock();
        let slot = entries.entry(q).or_insert_with(|| {
            (
                Arc::new(OpenFileEntry {
                    content_lock: RwLock::new(()),
                }),
                0,
            )
        });
        slot.1 += 1;
        Arc::clone(&slot.0)
    }

    /// Unregister an open handle
    pub fn unregister(&self, q: QIno) {
        let mut entries = self.entries.lock();
        if let Some(slot) = entries.get_mut(&q) {
            slot.1 -= 1;
            if slot.1 == 0 {
                entries.remove(&q);
            }
        }
    }

    /// Number of backing inodes with at least one open handle
    pub fn count(&self) -> usize {
        self.entries.lock().len()
    }
}

/// An open regular file of the plaintext tree
pub struct OpenFile {
    file: File,
    qino: QIno,
    entry: Arc<OpenFileEntry>,
    root: Arc<RootState>,
}

impl fmt::Debug for OpenFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenFile")
            .field("qino", &self.qino)
            .finish_non_exhaustive()
    }
}

/// Reject plaintext ranges ending past the last addressable block
fn check_end(offset: u64, len: u64) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= MAX_FILE_SIZE => Ok(()),
        Some(end) => Err(Error::FileTooLarge(end)),
        None => Err(Error::FileTooLarge(offset)),
    }
}

impl OpenFile {
    pub(crate) fn new(root: Arc<RootState>, file: File) -> Result<Self> {
        let qino = QIno::from_metadata(&file.metadata()?);
        let entry = root.open_files().register(qino);
        Ok(OpenFile {
            file,
            qino,
            entry,
            root,
        })
    }

    /// Backing inode of this handle
    pub fn qino(&self) -> QIno {
        self.qino
    }

    fn content(&self) -> &ContentEnc {
        self.root.content()
    }

    fn cipher_size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Plaintext size
    pub fn size(&self) -> Result<u64> {
        let _guard = self.entry.content_lock.read();
        Ok(ContentEnc::cipher_size_to_plain_size(self.cipher_size()?))
    }

    fn read_header(&self) -> Result<FileHeader> {
        let mut buf = [0u8; HEADER_LEN];
        let n = read_at_full(&self.file, &mut buf, 0)?;
        FileHeader::unpack(&buf[..n])
    }

    /// Header of the file, creating it when the backing file is empty
    fn header_for_write(&self) -> Result<FileHeader> {
        if self.cipher_size()? > 0 {
            return self.read_header();
        }
        let header = FileHeader::random();
        self.file.write_all_at(&header.pack(), 0)?;
        debug!(file_id = %hex::encode(header.id), "wrote new file header");
        Ok(header)
    }

    /// Read up to `length` plaintext bytes at `offset`
    pub fn read(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let _guard = self.entry.content_lock.read();
        if self.cipher_size()? == 0 {
            return Ok(Vec::new());
        }
        let header = self.read_header()?;
        self.read_locked(&header.id, offset, length)
    }

    fn read_locked(&self, id: &FileId, offset: u64, length: usize) -> Result<Vec<u8>> {
        let ranges = ContentEnc::explode_plain_range(offset, length);
        let (Some(first), Some(last)) = (ranges.first(), ranges.last()) else {
            return Ok(Vec::new());
        };

        let count = (last.block_no - first.block_no + 1) as usize;
        let mut cipher = vec![0u8; count * CIPHER_BLOCK_SIZE];
        let n = read_at_full(&self.file, &mut cipher, first.cipher_offset())?;
        cipher.truncate(n);

        let plain = self.content().decrypt_blocks(&cipher, first.block_no, id)?;
        if first.skip >= plain.len() {
            return Ok(Vec::new());
        }
        let end = plain.len().min(first.skip + length);
        Ok(plain[first.skip..end].to_vec())
    }

    /// Write `data` at plaintext `offset`, returns the number of bytes written
    ///
    /// Partial blocks are read, decrypted, merged and re-encrypted. Writing
    /// past the end zero-fills the gap first.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        check_end(offset, data.len() as u64)?;
        let _guard = self.entry.content_lock.write();
        let header = self.header_for_write()?;
        let plain_size = ContentEnc::cipher_size_to_plain_size(self.cipher_size()?);
        if offset > plain_size {
            self.zero_fill_locked(&header.id, plain_size, offset)?;
        }
        self.write_locked(&header.id, offset, data)?;
        Ok(data.len())
    }

    fn zero_fill_locked(&self, id: &FileId, from: u64, to: u64) -> Result<()> {
        debug!(from, to, "zero-filling gap");
        let mut pos = from;
        while pos < to {
            let len = ((to - pos) as usize).min(ZERO_FILL_CHUNK);
            self.write_locked(id, pos, &vec![0u8; len])?;
            pos += len as u64;
        }
        Ok(())
    }

    fn write_locked(&self, id: &FileId, offset: u64, data: &[u8]) -> Result<()> {
        let ranges = ContentEnc::explode_plain_range(offset, data.len());
        let Some(first) = ranges.first() else {
            return Ok(());
        };

        let mut cipher = Vec::with_capacity(ranges.len() * CIPHER_BLOCK_SIZE);
        let mut consumed = 0;
        for range in &ranges {
            let piece = &data[consumed..consumed + range.length];
            consumed += range.length;

            let block = if range.is_partial() {
                let old = self.read_block_locked(id, range.block_no)?;
                ContentEnc::merge_blocks(&old, piece, range.skip)
            } else {
                piece.to_vec()
            };
            cipher.extend_from_slice(&self.content().encrypt_block(&block, range.block_no, id)?);
        }

        self.file.write_all_at(&cipher, first.cipher_offset())?;
        Ok(())
    }

    /// Decrypted content of one block, empty if it lies past the end
    fn read_block_locked(&self, id: &FileId, block_no: u64) -> Result<Vec<u8>> {
        let mut cipher = vec![0u8; CIPHER_BLOCK_SIZE];
        let n = read_at_full(
            &self.file,
            &mut cipher,
            ContentEnc::block_no_to_cipher_off(block_no),
        )?;
        cipher.truncate(n);
        self.content().decrypt_block(&cipher, block_no, id)
    }

    /// Change the plaintext size
    ///
    /// Truncating to zero removes the header, so the next write starts the
    /// file over with a fresh file id.
    pub fn truncate(&self, size: u64) -> Result<()> {
        check_end(size, 0)?;
        let _guard = self.entry.content_lock.write();
        let cipher_size = self.cipher_size()?;
        let plain_size = ContentEnc::cipher_size_to_plain_size(cipher_size);
        if size == plain_size && (size > 0 || cipher_size == 0) {
            return Ok(());
        }
        if size == 0 {
            self.file.set_len(0)?;
            return Ok(());
        }

        let header = self.header_for_write()?;
        if size > plain_size {
            return self.zero_fill_locked(&header.id, plain_size, size);
        }

        let last = ContentEnc::plain_off_to_block_no(size - 1);
        let keep = (size - last * PLAIN_BLOCK_SIZE as u64) as usize;
        if keep == PLAIN_BLOCK_SIZE {
            self.file.set_len(ContentEnc::plain_size_to_cipher_size(size))?;
            return Ok(());
        }

        let mut block = self.read_block_locked(&header.id, last)?;
        block.truncate(keep);
        let cipher = self.content().encrypt_block(&block, last, &header.id)?;
        let off = ContentEnc::block_no_to_cipher_off(last);
        self.file.write_all_at(&cipher, off)?;
        self.file.set_len(off + cipher.len() as u64)?;
        Ok(())
    }

    /// Flush backing data to stable storage
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all().map_err(Error::Io)
    }
}

impl Drop for OpenFile {
    fn drop(&mut self) {
        self.root.open_files().unregister(self.qino);
    }
}

/// `pread` until `buf` is full or EOF; returns the bytes read
fn read_at_full(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match file.read_at(&mut buf[total..], offset + total as u64) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("backing read failed: {}", e);
                return Err(e);
            }
        }
    }
    Ok(total)
}
