//! File content encryption
//!
//! A backing file is a [`FileHeader`] followed by a sequence of independently
//! authenticated blocks. Each block encrypts up to [`PLAIN_BLOCK_SIZE`]
//! plaintext bytes; only the last block of a file may be shorter.
//!
//! On-disk block layout:
//!
//! ```text
//! nonce (12) = block index (u32 BE) || 8 random bytes
//! ciphertext (len of plaintext)
//! GCM tag (16)
//! ```
//!
//! Every file gets its own AES-256-GCM key, expanded with HKDF from the
//! master key and the random file id in the header, so a (key, nonce) pair
//! can only repeat if both the file id and the 64 random nonce bits repeat.
//! The block index is part of both the nonce and the additional data, which
//! pins every block to its position inside its own file.

use super::{random_array, MasterKey, HKDF_INFO_CONTENT};
use crate::error::{Error, Result};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::hkdf;
use tracing::warn;

/// Plaintext bytes per block
pub const PLAIN_BLOCK_SIZE: usize = 4096;

/// Per-block nonce length
pub const NONCE_LEN: usize = 12;

/// GCM authentication tag length
pub const TAG_LEN: usize = 16;

/// Bytes a block grows by when encrypted
pub const BLOCK_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Size of a full ciphertext block
pub const CIPHER_BLOCK_SIZE: usize = PLAIN_BLOCK_SIZE + BLOCK_OVERHEAD;

/// Length of the random file id
pub const FILE_ID_LEN: usize = 16;

/// Current header version
pub const HEADER_VERSION: u16 = 2;

/// Header length: version (u16 BE) + file id
pub const HEADER_LEN: usize = 2 + FILE_ID_LEN;

/// Highest block index that fits into the nonce
const MAX_BLOCK_NO: u64 = u32::MAX as u64;

/// Largest plaintext size a file can grow to
pub const MAX_FILE_SIZE: u64 = (MAX_BLOCK_NO + 1) * PLAIN_BLOCK_SIZE as u64;

/// Random per-file identifier
pub type FileId = [u8; FILE_ID_LEN];

/// Header at the start of every non-empty backing file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// Format version
    pub version: u16,
    /// Random file id, input to key derivation and block AAD
    pub id: FileId,
}

impl FileHeader {
    /// Create a header with a fresh random file id
    pub fn random() -> Self {
        FileHeader {
            version: HEADER_VERSION,
            id: random_array(),
        }
    }

    /// Serialize to the on-disk representation
    pub fn pack(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[..2].copy_from_slice(&self.version.to_be_bytes());
        buf[2..].copy_from_slice(&self.id);
        buf
    }

    /// Parse the on-disk representation
    pub fn unpack(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::CorruptHeader(format!(
                "header is {} bytes, need {}",
                buf.len(),
                HEADER_LEN
            )));
        }
        let version = u16::from_be_bytes([buf[0], buf[1]]);
        if version != HEADER_VERSION {
            return Err(Error::CorruptHeader(format!(
                "unsupported header version {}",
                version
            )));
        }
        let mut id = [0u8; FILE_ID_LEN];
        id.copy_from_slice(&buf[2..HEADER_LEN]);
        if id == [0u8; FILE_ID_LEN] {
            return Err(Error::CorruptHeader("all-zero file id".to_string()));
        }
        Ok(FileHeader { version, id })
    }
}

/// The part of one plaintext block touched by a byte range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    /// Block index
    pub block_no: u64,
    /// Bytes to skip at the start of the block
    pub skip: usize,
    /// Bytes touched inside the block
    pub length: usize,
}

impl BlockRange {
    /// Whether the range covers less than a full block (RMW required on write)
    pub fn is_partial(&self) -> bool {
        self.length < PLAIN_BLOCK_SIZE
    }

    /// Plaintext offset of the block start
    pub fn plain_offset(&self) -> u64 {
        self.block_no * PLAIN_BLOCK_SIZE as u64
    }

    /// Ciphertext offset of the block start (includes the header)
    pub fn cipher_offset(&self) -> u64 {
        ContentEnc::block_no_to_cipher_off(self.block_no)
    }
}

/// Content encryption engine
pub struct ContentEnc {
    prk: hkdf::Prk,
}

impl ContentEnc {
    /// Create the engine from the master key
    pub fn new(key: &MasterKey) -> Self {
        ContentEnc { prk: key.prk() }
    }

    /// AEAD key for one file
    fn file_key(&self, id: &FileId) -> Result<LessSafeKey> {
        let info = [HKDF_INFO_CONTENT, id.as_slice()];
        let okm = self
            .prk
            .expand(&info, &AES_256_GCM)
            .map_err(|_| Error::Internal("HKDF expand failed".to_string()))?;
        Ok(LessSafeKey::new(UnboundKey::from(okm)))
    }

    /// Nonce for a block: index in the high 4 bytes, random tail
    ///
    /// Distinct block indices always yield distinct nonces, independent of
    /// the random tail.
    pub fn block_nonce(block_no: u64, tail: [u8; 8]) -> Result<[u8; NONCE_LEN]> {
        if block_no > MAX_BLOCK_NO {
            return Err(Error::FileTooLarge(block_no * PLAIN_BLOCK_SIZE as u64));
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..4].copy_from_slice(&(block_no as u32).to_be_bytes());
        nonce[4..].copy_from_slice(&tail);
        Ok(nonce)
    }

    fn block_aad(block_no: u64, id: &FileId) -> [u8; 8 + FILE_ID_LEN] {
        let mut aad = [0u8; 8 + FILE_ID_LEN];
        aad[..8].copy_from_slice(&block_no.to_be_bytes());
        aad[8..].copy_from_slice(id);
        aad
    }

    fn seal(key: &LessSafeKey, plain: &[u8], block_no: u64, id: &FileId) -> Result<Vec<u8>> {
        if plain.len() > PLAIN_BLOCK_SIZE {
            return Err(Error::Internal(format!(
                "block of {} bytes exceeds block size",
                plain.len()
            )));
        }
        let nonce = Self::block_nonce(block_no, random_array())?;
        let mut body = plain.to_vec();
        key.seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce),
            Aad::from(Self::block_aad(block_no, id)),
            &mut body,
        )
        .map_err(|_| Error::Internal("AEAD seal failed".to_string()))?;
        let mut out = Vec::with_capacity(NONCE_LEN + body.len());
        out.extend_from_slice(&nonce);
        out.append(&mut body);
        Ok(out)
    }

    fn open(key: &LessSafeKey, cipher: &[u8], block_no: u64, id: &FileId) -> Result<Vec<u8>> {
        if cipher.len() < BLOCK_OVERHEAD {
            warn!(block_no, len = cipher.len(), "ciphertext block too short");
            return Err(Error::AuthenticationFailed);
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&cipher[..NONCE_LEN]);
        if block_no > MAX_BLOCK_NO || nonce[..4] != (block_no as u32).to_be_bytes() {
            warn!(block_no, "block nonce does not match its position");
            return Err(Error::AuthenticationFailed);
        }
        let mut body = cipher[NONCE_LEN..].to_vec();
        let plain_len = key
            .open_in_place(
                Nonce::assume_unique_for_key(nonce),
                Aad::from(Self::block_aad(block_no, id)),
                &mut body,
            )
            .map_err(|_| {
                warn!(block_no, file_id = %hex::encode(id), "block authentication failed");
                Error::AuthenticationFailed
            })?
            .len();
        body.truncate(plain_len);
        Ok(body)
    }

    /// Encrypt one plaintext block
    pub fn encrypt_block(&self, plain: &[u8], block_no: u64, id: &FileId) -> Result<Vec<u8>> {
        let key = self.file_key(id)?;
        Self::seal(&key, plain, block_no, id)
    }

    /// Decrypt and authenticate one ciphertext block
    ///
    /// The empty ciphertext decrypts to the empty plaintext without touching
    /// the cipher. Anything else either authenticates completely or returns
    /// [`Error::AuthenticationFailed`] without releasing plaintext.
    pub fn decrypt_block(&self, cipher: &[u8], block_no: u64, id: &FileId) -> Result<Vec<u8>> {
        if cipher.is_empty() {
            return Ok(Vec::new());
        }
        let key = self.file_key(id)?;
        Self::open(&key, cipher, block_no, id)
    }

    /// Encrypt consecutive plaintext blocks starting at `first_block`
    pub fn encrypt_blocks(&self, plain: &[u8], first_block: u64, id: &FileId) -> Result<Vec<u8>> {
        if plain.is_empty() {
            return Ok(Vec::new());
        }
        let key = self.file_key(id)?;
        let blocks = plain.len().div_ceil(PLAIN_BLOCK_SIZE);
        let mut out = Vec::with_capacity(plain.len() + blocks * BLOCK_OVERHEAD);
        for (i, block) in plain.chunks(PLAIN_BLOCK_SIZE).enumerate() {
            out.extend_from_slice(&Self::seal(&key, block, first_block + i as u64, id)?);
        }
        Ok(out)
    }

    /// Decrypt consecutive ciphertext blocks starting at `first_block`
    pub fn decrypt_blocks(&self, cipher: &[u8], first_block: u64, id: &FileId) -> Result<Vec<u8>> {
        if cipher.is_empty() {
            return Ok(Vec::new());
        }
        let key = self.file_key(id)?;
        let mut out = Vec::with_capacity(cipher.len());
        for (i, block) in cipher.chunks(CIPHER_BLOCK_SIZE).enumerate() {
            out.extend_from_slice(&Self::open(&key, block, first_block + i as u64, id)?);
        }
        Ok(out)
    }

    /// Encrypt a standalone value (symlink target, key check): a random file
    /// id followed by block 0 under that id
    pub fn encrypt_standalone(&self, plain: &[u8]) -> Result<Vec<u8>> {
        let id: FileId = random_array();
        let mut out = id.to_vec();
        out.extend_from_slice(&self.encrypt_block(plain, 0, &id)?);
        Ok(out)
    }

    /// Inverse of [`ContentEnc::encrypt_standalone`]
    pub fn decrypt_standalone(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        if data.len() < FILE_ID_LEN + BLOCK_OVERHEAD {
            return Err(Error::AuthenticationFailed);
        }
        let mut id = [0u8; FILE_ID_LEN];
        id.copy_from_slice(&data[..FILE_ID_LEN]);
        self.decrypt_block(&data[FILE_ID_LEN..], 0, &id)
    }

    /// Block index containing a plaintext offset
    pub fn plain_off_to_block_no(offset: u64) -> u64 {
        offset / PLAIN_BLOCK_SIZE as u64
    }

    /// Ciphertext offset of a block
    pub fn block_no_to_cipher_off(block_no: u64) -> u64 {
        HEADER_LEN as u64 + block_no * CIPHER_BLOCK_SIZE as u64
    }

    /// Plaintext size of a backing file of `cipher_size` bytes
    pub fn cipher_size_to_plain_size(cipher_size: u64) -> u64 {
        if cipher_size == 0 {
            return 0;
        }
        if cipher_size < HEADER_LEN as u64 {
            warn!(cipher_size, "backing file shorter than its header");
            return 0;
        }
        let payload = cipher_size - HEADER_LEN as u64;
        let full_blocks = payload / CIPHER_BLOCK_SIZE as u64;
        let fragment = payload % CIPHER_BLOCK_SIZE as u64;
        full_blocks * PLAIN_BLOCK_SIZE as u64 + fragment.saturating_sub(BLOCK_OVERHEAD as u64)
    }

    /// Backing file size for a plaintext size
    pub fn plain_size_to_cipher_size(plain_size: u64) -> u64 {
        if plain_size == 0 {
            return 0;
        }
        let blocks = plain_size.div_ceil(PLAIN_BLOCK_SIZE as u64);
        HEADER_LEN as u64 + plain_size + blocks * BLOCK_OVERHEAD as u64
    }

    /// Split a plaintext byte range into per-block pieces
    pub fn explode_plain_range(offset: u64, length: usize) -> Vec<BlockRange> {
        let mut ranges = Vec::new();
        let mut offset = offset;
        let mut remaining = length;
        while remaining > 0 {
            let skip = (offset % PLAIN_BLOCK_SIZE as u64) as usize;
            let len = remaining.min(PLAIN_BLOCK_SIZE - skip);
            ranges.push(BlockRange {
                block_no: Self::plain_off_to_block_no(offset),
                skip,
                length: len,
            });
            offset += len as u64;
            remaining -= len;
        }
        ranges
    }

    /// Splice `new` into `old` at `skip`, zero-filling any gap
    pub fn merge_blocks(old: &[u8], new: &[u8], skip: usize) -> Vec<u8> {
        let end = skip + new.len();
        let mut out = old.to_vec();
        if out.len() < end {
            out.resize(end, 0);
        }
        out[skip..end].copy_from_slice(new);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn engine() -> ContentEnc {
        ContentEnc::new(&MasterKey::generate())
    }

    #[test]
    fn test_block_roundtrip() {
        let enc = engine();
        let id = FileHeader::random().id;
        for (i, len) in [1usize, 100, PLAIN_BLOCK_SIZE - 1, PLAIN_BLOCK_SIZE].iter().enumerate() {
            let plain: Vec<u8> = (0..*len).map(|b| (b * 7 + i) as u8).collect();
            let cipher = enc.encrypt_block(&plain, i as u64, &id).unwrap();
            assert_eq!(cipher.len(), plain.len() + BLOCK_OVERHEAD);
            assert_eq!(enc.decrypt_block(&cipher, i as u64, &id).unwrap(), plain);
        }
    }

    #[test]
    fn test_empty_ciphertext_is_empty_plaintext() {
        let enc = engine();
        let id = FileHeader::random().id;
        assert!(enc.decrypt_block(&[], 5, &id).unwrap().is_empty());
    }

    #[test]
    fn test_any_flipped_byte_fails_authentication() {
        let enc = engine();
        let id = FileHeader::random().id;
        let plain = vec![0x5au8; 300];
        let cipher = enc.encrypt_block(&plain, 3, &id).unwrap();
        for pos in 0..cipher.len() {
            let mut bad = cipher.clone();
            bad[pos] ^= 0x01;
            assert!(matches!(
                enc.decrypt_block(&bad, 3, &id),
                Err(Error::AuthenticationFailed)
            ));
        }
    }

    #[test]
    fn test_block_bound_to_position_and_file() {
        let enc = engine();
        let id = FileHeader::random().id;
        let other = FileHeader::random().id;
        let cipher = enc.encrypt_block(b"hello", 1, &id).unwrap();
        assert!(enc.decrypt_block(&cipher, 2, &id).is_err());
        assert!(enc.decrypt_block(&cipher, 1, &other).is_err());
    }

    #[test]
    fn test_truncated_block_fails() {
        let enc = engine();
        let id = FileHeader::random().id;
        let cipher = enc.encrypt_block(b"hello world", 0, &id).unwrap();
        assert!(enc.decrypt_block(&cipher[..cipher.len() - 1], 0, &id).is_err());
        assert!(enc.decrypt_block(&cipher[..10], 0, &id).is_err());
    }

    #[test]
    fn test_nonces_distinct_per_block_index() {
        let tail = [0xffu8; 8];
        let nonces: HashSet<_> = (0..10_000u64)
            .map(|i| ContentEnc::block_nonce(i, tail).unwrap())
            .collect();
        assert_eq!(nonces.len(), 10_000);
        assert!(ContentEnc::block_nonce(MAX_BLOCK_NO + 1, tail).is_err());
    }

    #[test]
    fn test_rewrites_use_fresh_nonces() {
        let enc = engine();
        let id = FileHeader::random().id;
        let a = enc.encrypt_block(b"same", 0, &id).unwrap();
        let b = enc.encrypt_block(b"same", 0, &id).unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_multi_block_roundtrip() {
        let enc = engine();
        let id = FileHeader::random().id;
        let plain: Vec<u8> = (0..PLAIN_BLOCK_SIZE * 2 + 123).map(|i| i as u8).collect();
        let cipher = enc.encrypt_blocks(&plain, 4, &id).unwrap();
        assert_eq!(cipher.len(), plain.len() + 3 * BLOCK_OVERHEAD);
        assert_eq!(enc.decrypt_blocks(&cipher, 4, &id).unwrap(), plain);
        assert!(enc.decrypt_blocks(&cipher, 0, &id).is_err());
    }

    #[test]
    fn test_standalone_roundtrip() {
        let enc = engine();
        let a = enc.encrypt_standalone(b"../target").unwrap();
        let b = enc.encrypt_standalone(b"../target").unwrap();
        assert_ne!(a, b);
        assert_eq!(enc.decrypt_standalone(&a).unwrap(), b"../target");
        assert!(enc.decrypt_standalone(&[]).unwrap().is_empty());
        assert!(enc.decrypt_standalone(&a[..20]).is_err());
    }

    #[test]
    fn test_header_pack_unpack() {
        let header = FileHeader::random();
        let packed = header.pack();
        assert_eq!(FileHeader::unpack(&packed).unwrap(), header);
        assert!(FileHeader::unpack(&packed[..HEADER_LEN - 1]).is_err());

        let mut bad_version = packed;
        bad_version[1] = 9;
        assert!(FileHeader::unpack(&bad_version).is_err());

        let mut zero_id = packed;
        zero_id[2..].fill(0);
        assert!(FileHeader::unpack(&zero_id).is_err());
    }

    #[test]
    fn test_size_conversions() {
        for plain in [0u64, 1, 4095, 4096, 4097, 8192, 10_000, 1 << 20] {
            let cipher = ContentEnc::plain_size_to_cipher_size(plain);
            assert_eq!(ContentEnc::cipher_size_to_plain_size(cipher), plain);
        }
        assert_eq!(ContentEnc::cipher_size_to_plain_size(HEADER_LEN as u64), 0);
        assert_eq!(ContentEnc::cipher_size_to_plain_size(5), 0);
    }

    #[test]
    fn test_explode_plain_range() {
        assert!(ContentEnc::explode_plain_range(0, 0).is_empty());

        let ranges = ContentEnc::explode_plain_range(4000, 5000);
        assert_eq!(
            ranges,
            vec![
                BlockRange { block_no: 0, skip: 4000, length: 96 },
                BlockRange { block_no: 1, skip: 0, length: 4096 },
                BlockRange { block_no: 2, skip: 0, length: 808 },
            ]
        );
        assert!(ranges[0].is_partial());
        assert!(!ranges[1].is_partial());
        assert_eq!(ranges[2].plain_offset(), 8192);
        assert_eq!(
            ranges[1].cipher_offset(),
            HEADER_LEN as u64 + CIPHER_BLOCK_SIZE as u64
        );
    }

    #[test]
    fn test_merge_blocks() {
        assert_eq!(ContentEnc::merge_blocks(b"hello world", b"WORLD", 6), b"hello WORLD");
        assert_eq!(ContentEnc::merge_blocks(b"ab", b"cd", 4), b"ab\0\0cd");
        assert_eq!(ContentEnc::merge_blocks(b"", b"xyz", 0), b"xyz");
    }
}
